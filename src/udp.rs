//! DNS over the tunnel: u16 big-endian length, then the DNS message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::dns::DohClient;
use crate::error::{Result, TunnelError};
use crate::protocol::ResponseHeader;
use crate::websocket::ClientSink;

/// Reassembles length-prefixed frames from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < 2 {
            return None;
        }
        let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if self.buffer.len() < 2 + length {
            return None;
        }
        self.buffer.advance(2);
        Some(self.buffer.split_to(length).freeze())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

pub fn encode_frame(message: &[u8], dst: &mut BytesMut) -> Result<()> {
    let length =
        u16::try_from(message.len()).map_err(|_| TunnelError::FrameTooLarge(message.len()))?;
    dst.reserve(2 + message.len());
    dst.put_u16(length);
    dst.put_slice(message);
    Ok(())
}

/// UDP session state: every query frame is answered through DoH.
pub struct DnsRelay {
    decoder: FrameDecoder,
    response: Option<ResponseHeader>,
}

impl DnsRelay {
    pub fn new(response: ResponseHeader) -> Self {
        Self {
            decoder: FrameDecoder::default(),
            response: Some(response),
        }
    }

    pub async fn relay<D: DohClient, W: ClientSink>(
        &mut self,
        chunk: &[u8],
        doh: &D,
        client: &W,
    ) -> Result<()> {
        self.decoder.extend(chunk);

        while let Some(query) = self.decoder.next_frame() {
            let answer = match doh.exchange(&query).await {
                Ok(answer) => answer,
                Err(e) => {
                    warn!("dropping DNS query of {} bytes: {e}", query.len());
                    continue;
                }
            };
            if answer.is_empty() {
                continue;
            }
            if !client.is_open() {
                debug!("client gone, discarding DNS answer");
                continue;
            }

            let mut frame = BytesMut::with_capacity(4 + answer.len());
            if let Some(header) = self.response {
                frame.put_slice(&header);
            }
            if let Err(e) = encode_frame(&answer, &mut frame) {
                warn!("{e}");
                continue;
            }
            client.send(&frame)?;
            self.response = None;
            debug!("DNS answer relayed, {} bytes", answer.len());
        }

        if self.decoder.pending() > 0 {
            debug!("{} bytes of a partial DNS frame buffered", self.decoder.pending());
        }
        Ok(())
    }
}
