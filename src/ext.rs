use bytes::Buf;

use crate::error::{Result, TunnelError};

/// Bounds-checked big-endian reads for header decoding.
pub trait BufExt: Buf {
    fn ensure(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(TunnelError::HeaderTooShort);
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.get_u8())
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.get_u16())
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.get_u32())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let mut buf = [0u8; N];
        self.copy_to_slice(&mut buf);
        Ok(buf)
    }

    fn read_string(&mut self, n: usize) -> Result<String> {
        let bytes = self.read_bytes(n)?;
        String::from_utf8(bytes).map_err(|_| TunnelError::InvalidDomain)
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.ensure(n)?;
        let mut buffer = vec![0u8; n];
        self.copy_to_slice(&mut buffer);
        Ok(buffer)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.advance(n);
        Ok(())
    }
}

impl<B: Buf + ?Sized> BufExt for B {}
