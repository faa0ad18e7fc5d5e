//! Per-connection tunnel session.
//!
//! A session starts in [`Phase::AwaitingHeader`]. The first inbound chunk is
//! decoded as the request header, the outbound leg is set up and the session
//! moves to [`Phase::Relaying`] for the rest of its life. Everything is driven
//! by one loop consuming [`Event`]s.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::dns::{DnsCache, DohClient};
use crate::error::{Result, TunnelError};
use crate::nat64::{Nat64Prefix, Nat64Resolver};
use crate::outbound::{self, Connector};
use crate::protocol::{Command, DNS_PORT, Header, ResponseHeader};
use crate::udp::DnsRelay;
use crate::websocket::{CLOSE_ABNORMAL, CLOSE_NORMAL, ClientSink};

const READ_BUFFER_SIZE: usize = 16 * 1024;

pub struct Gateway<C, D, K> {
    pub credential: String,
    pub nat64: Nat64Prefix,
    pub connector: C,
    pub doh: D,
    pub cache: K,
}

impl<C, D, K> Gateway<C, D, K>
where
    C: Connector,
    D: DohClient,
    K: DnsCache,
{
    pub fn new(config: &TunnelConfig, connector: C, doh: D, cache: K) -> Self {
        Self {
            credential: config.credential.clone(),
            nat64: config.nat64_prefix,
            connector,
            doh,
            cache,
        }
    }

    fn resolver(&self) -> Nat64Resolver<'_, D, K> {
        Nat64Resolver::new(&self.doh, &self.cache, self.nat64)
    }
}

enum Event {
    Data(Bytes),
    Reply(Bytes),
    RemoteClosed,
    ClientClosed,
    Error(TunnelError),
}

impl Event {
    fn from_client(item: Option<Result<Bytes>>) -> Self {
        match item {
            Some(Ok(chunk)) => Event::Data(chunk),
            Some(Err(e)) => Event::Error(e),
            None => Event::ClientClosed,
        }
    }
}

enum Phase<S> {
    AwaitingHeader,
    Relaying(Relay<S>),
}

enum Relay<S> {
    Tcp(TcpRelay<S>),
    Dns(DnsRelay),
}

struct TcpRelay<S> {
    reader: ReadHalf<S>,
    // single writer: the session loop
    writer: WriteHalf<S>,
    response: Option<ResponseHeader>,
    buf: Box<[u8]>,
}

impl<S: AsyncRead + AsyncWrite> TcpRelay<S> {
    // replies keep flowing to the client while the remote applies backpressure
    async fn write_chunk<W: ClientSink>(&mut self, chunk: &[u8], client: &W) -> Result<bool> {
        let TcpRelay {
            reader,
            writer,
            response,
            buf,
        } = self;
        let write = async {
            writer.write_all(chunk).await?;
            writer.flush().await
        };
        tokio::pin!(write);

        let mut remote_eof = false;
        loop {
            tokio::select! {
                done = &mut write => {
                    done?;
                    return Ok(remote_eof);
                }
                read = reader.read(&mut buf[..]), if !remote_eof => match read {
                    Ok(0) => remote_eof = true,
                    Ok(n) => send_reply(response, &buf[..n], client)?,
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }
}

/// The response header goes out once, glued to the first reply.
fn send_reply<W: ClientSink>(
    response: &mut Option<ResponseHeader>,
    chunk: &[u8],
    client: &W,
) -> Result<()> {
    match response.take() {
        Some(header) => {
            let mut message = BytesMut::with_capacity(header.len() + chunk.len());
            message.put_slice(&header);
            message.put_slice(chunk);
            client.send(&message)
        }
        None => client.send(chunk),
    }
}

pub struct Session<'a, C: Connector, D, K, W> {
    gateway: &'a Gateway<C, D, K>,
    client: &'a W,
    phase: Phase<C::Stream>,
}

impl<'a, C, D, K, W> Session<'a, C, D, K, W>
where
    C: Connector,
    D: DohClient,
    K: DnsCache,
    W: ClientSink,
{
    pub fn new(gateway: &'a Gateway<C, D, K>, client: &'a W) -> Self {
        Self {
            gateway,
            client,
            phase: Phase::AwaitingHeader,
        }
    }

    pub async fn serve<S>(mut self, inbound: S)
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        match self.run(inbound).await {
            Ok(()) => debug!("session finished"),
            Err(e) => {
                warn!("session aborted: {e}");
                self.shutdown_remote().await;
                self.client.close(CLOSE_ABNORMAL, &e.to_string());
            }
        }
    }

    async fn run<S>(&mut self, mut inbound: S) -> Result<()>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        loop {
            match self.next_event(&mut inbound).await {
                Event::Data(chunk) => {
                    if self.on_data(chunk).await? {
                        self.remote_closed().await;
                        return Ok(());
                    }
                }
                Event::Reply(chunk) => self.on_reply(chunk)?,
                Event::RemoteClosed => {
                    self.remote_closed().await;
                    return Ok(());
                }
                Event::ClientClosed => {
                    debug!("client closed");
                    self.shutdown_remote().await;
                    return Ok(());
                }
                Event::Error(e) => return Err(e),
            }
        }
    }

    async fn next_event<S>(&mut self, inbound: &mut S) -> Event
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let Phase::Relaying(Relay::Tcp(tcp)) = &mut self.phase else {
            return Event::from_client(inbound.next().await);
        };

        tokio::select! {
            item = inbound.next() => Event::from_client(item),
            read = tcp.reader.read(&mut tcp.buf) => match read {
                Ok(0) => Event::RemoteClosed,
                Ok(n) => Event::Reply(Bytes::copy_from_slice(&tcp.buf[..n])),
                Err(e) => Event::Error(e.into()),
            },
        }
    }

    /// Returns true when the remote hung up while the chunk was being written.
    async fn on_data(&mut self, chunk: Bytes) -> Result<bool> {
        match &mut self.phase {
            Phase::AwaitingHeader => self.establish(chunk).await.map(|()| false),
            Phase::Relaying(Relay::Tcp(tcp)) => tcp.write_chunk(&chunk, self.client).await,
            Phase::Relaying(Relay::Dns(dns)) => dns
                .relay(&chunk, &self.gateway.doh, self.client)
                .await
                .map(|()| false),
        }
    }

    async fn establish(&mut self, chunk: Bytes) -> Result<()> {
        let header = Header::parse(&chunk, &self.gateway.credential)?;
        let payload = chunk.slice(header.payload_offset..);

        match header.command {
            Command::Udp => {
                if header.port != DNS_PORT {
                    return Err(TunnelError::UnsupportedUdpPort(header.port));
                }
                info!("DNS relay to {}:{}", header.address, header.port);
                let mut dns = DnsRelay::new(header.response());
                dns.relay(&payload, &self.gateway.doh, self.client).await?;
                self.phase = Phase::Relaying(Relay::Dns(dns));
            }
            Command::Tcp => {
                info!("TCP relay to {}:{}", header.address, header.port);
                let stream = outbound::connect_with_fallback(
                    &self.gateway.connector,
                    &self.gateway.resolver(),
                    &header.address,
                    header.port,
                    &payload,
                )
                .await?;
                let (reader, writer) = tokio::io::split(stream);
                self.phase = Phase::Relaying(Relay::Tcp(TcpRelay {
                    reader,
                    writer,
                    response: Some(header.response()),
                    buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
                }));
            }
        }
        Ok(())
    }

    fn on_reply(&mut self, chunk: Bytes) -> Result<()> {
        let Phase::Relaying(Relay::Tcp(tcp)) = &mut self.phase else {
            return Ok(());
        };
        send_reply(&mut tcp.response, &chunk, self.client)
    }

    async fn remote_closed(&mut self) {
        debug!("remote closed");
        self.shutdown_remote().await;
        self.client.close(CLOSE_NORMAL, "normal closure");
    }

    async fn shutdown_remote(&mut self) {
        if let Phase::Relaying(Relay::Tcp(tcp)) = &mut self.phase {
            if let Err(e) = tcp.writer.shutdown().await {
                debug!("remote shutdown failed: {e}");
            }
        }
    }
}
