use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use crate::dns::DohClient;
use crate::error::{Result, TunnelError};
use crate::outbound::Connector;
use crate::websocket::ClientSink;

pub const CREDENTIAL: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";
pub const USER_ID: [u8; 16] = [
    0xd3, 0x42, 0xd1, 0x1e, 0xd4, 0x24, 0x45, 0x83, 0xb3, 0x6e, 0x52, 0x4a, 0xb1, 0xf0, 0xaf, 0xa4,
];

/// Version 0 request with no options; `address` starts with the type byte.
pub fn request(command: u8, port: u16, address: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0];
    buf.extend_from_slice(&USER_ID);
    buf.push(0);
    buf.push(command);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(address);
    buf.extend_from_slice(payload);
    buf
}

/// Inbound client stream fed through a channel. Dropping every sender
/// ends the stream like a client close.
pub fn inbound() -> (
    mpsc::UnboundedSender<Result<Bytes>>,
    impl Stream<Item = Result<Bytes>> + Unpin,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (tx, Box::pin(stream))
}

/// Hands out in-memory sockets for hosts registered with `listen`; every
/// other host refuses.
#[derive(Default)]
pub struct MockConnector {
    peers: RefCell<HashMap<String, DuplexStream>>,
    attempts: RefCell<Vec<String>>,
}

impl MockConnector {
    /// Returns the remote end of the socket a later connect to `host` gets.
    pub fn listen(&self, host: &str) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        self.peers.borrow_mut().insert(host.to_owned(), local);
        remote
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.borrow().clone()
    }
}

impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self, host: &str, _port: u16) -> io::Result<DuplexStream> {
        self.attempts.borrow_mut().push(host.to_owned());
        self.peers
            .borrow_mut()
            .remove(host)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, host.to_owned()))
    }
}

/// Connects everywhere, then fails every read with a reset.
#[derive(Default)]
pub struct BrokenConnector {
    shut_down: Rc<Cell<bool>>,
}

impl BrokenConnector {
    pub fn shut_down(&self) -> bool {
        self.shut_down.get()
    }
}

impl Connector for BrokenConnector {
    type Stream = BrokenStream;

    async fn connect(&self, _host: &str, _port: u16) -> io::Result<BrokenStream> {
        Ok(BrokenStream {
            shut_down: self.shut_down.clone(),
        })
    }
}

pub struct BrokenStream {
    shut_down: Rc<Cell<bool>>,
}

impl AsyncRead for BrokenStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

impl AsyncWrite for BrokenStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shut_down.set(true);
        Poll::Ready(Ok(()))
    }
}

/// Answers `A` queries from a fixed table. Wire queries are answered with
/// `re:` + query, except those starting with `fail`.
#[derive(Default)]
pub struct MockDoh {
    records: HashMap<String, String>,
    a_queries: Cell<usize>,
    exchanges: RefCell<Vec<Vec<u8>>>,
}

impl MockDoh {
    pub fn with_a_record(mut self, domain: &str, ip: &str) -> Self {
        self.records.insert(domain.to_owned(), ip.to_owned());
        self
    }

    pub fn a_queries(&self) -> usize {
        self.a_queries.get()
    }

    pub fn exchanges(&self) -> Vec<Vec<u8>> {
        self.exchanges.borrow().clone()
    }
}

impl DohClient for MockDoh {
    async fn query_a(&self, domain: &str) -> Result<Option<String>> {
        self.a_queries.set(self.a_queries.get() + 1);
        Ok(self.records.get(domain).cloned())
    }

    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        self.exchanges.borrow_mut().push(query.to_vec());
        if query.starts_with(b"fail") {
            return Err(TunnelError::Doh("upstream said no".into()));
        }
        Ok([&b"re:"[..], query].concat())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: RefCell<Vec<Vec<u8>>>,
    closed: RefCell<Option<(u16, String)>>,
    broken: bool,
}

impl RecordingSink {
    /// A sink whose every send fails as if the client vanished.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.borrow().clone()
    }

    pub fn closed(&self) -> Option<(u16, String)> {
        self.closed.borrow().clone()
    }
}

impl ClientSink for RecordingSink {
    fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone").into());
        }
        if self.is_open() {
            self.sent.borrow_mut().push(data.to_vec());
        }
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let mut closed = self.closed.borrow_mut();
        if closed.is_none() {
            *closed = Some((code, reason.to_owned()));
        }
    }
}
