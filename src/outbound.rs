use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use worker::Socket;

use crate::dns::{DnsCache, DohClient};
use crate::error::{Result, TunnelError};
use crate::nat64::Nat64Resolver;
use crate::protocol::Address;

#[allow(async_fn_in_trait)]
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    /// Opens a TCP connection. `host` is a domain, dotted quad or bare
    /// colon-form IPv6 address.
    async fn connect(&self, host: &str, port: u16) -> io::Result<Self::Stream>;
}

/// Outbound TCP through the Workers `connect()` API.
pub struct SocketConnector;

impl Connector for SocketConnector {
    type Stream = Socket;

    async fn connect(&self, host: &str, port: u16) -> io::Result<Socket> {
        let hostname = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.to_owned()
        };
        let socket = Socket::builder()
            .connect(hostname, port)
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        socket
            .opened()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(socket)
    }
}

/// Connects to the destination directly, falling back to its NAT64 address.
/// The first payload slice is written before the stream is returned.
pub async fn connect_with_fallback<C, D, K>(
    connector: &C,
    resolver: &Nat64Resolver<'_, D, K>,
    address: &Address,
    port: u16,
    payload: &[u8],
) -> Result<C::Stream>
where
    C: Connector,
    D: DohClient,
    K: DnsCache,
{
    let direct = address.to_string();
    match connect_and_write(connector, &direct, port, payload).await {
        Ok(stream) => {
            info!("connected to {direct}:{port}");
            return Ok(stream);
        }
        Err(e) => warn!("direct connection to {direct}:{port} failed: {e}"),
    }

    let unreachable = || TunnelError::DestinationUnreachable(format!("{direct}:{port}"));
    let nat64 = resolver.target_for(address).await.map_err(|e| {
        warn!("no NAT64 route to {direct}: {e}");
        unreachable()
    })?;

    let host = nat64.to_string();
    match connect_and_write(connector, &host, port, payload).await {
        Ok(stream) => {
            info!("connected to {direct}:{port} via NAT64 {host}");
            Ok(stream)
        }
        Err(e) => {
            warn!("NAT64 connection to [{host}]:{port} failed: {e}");
            Err(unreachable())
        }
    }
}

async fn connect_and_write<C: Connector>(
    connector: &C,
    host: &str,
    port: u16,
    payload: &[u8],
) -> io::Result<C::Stream> {
    let mut stream = connector.connect(host, port).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
        stream.flush().await?;
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::dns::MemoryDnsCache;
    use crate::nat64::Nat64Prefix;
    use crate::test_util::{MockConnector, MockDoh};

    #[tokio::test]
    async fn direct_connection_skips_nat64() {
        let connector = MockConnector::default();
        let mut remote = connector.listen("192.0.2.1");
        let doh = MockDoh::default();
        let cache = MemoryDnsCache::default();
        let resolver = Nat64Resolver::new(&doh, &cache, Nat64Prefix::default());

        let address = Address::Ipv4(Ipv4Addr::new(192, 0, 2, 1));
        let _stream = connect_with_fallback(&connector, &resolver, &address, 80, b"hello")
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(connector.attempts(), vec!["192.0.2.1"]);
        assert_eq!(doh.a_queries(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_nat64_for_ipv4() {
        let connector = MockConnector::default();
        let mut remote = connector.listen("2001:67c:2960:6464::c000:201");
        let doh = MockDoh::default();
        let cache = MemoryDnsCache::default();
        let resolver = Nat64Resolver::new(&doh, &cache, Nat64Prefix::default());

        let address = Address::Ipv4(Ipv4Addr::new(192, 0, 2, 1));
        let _stream = connect_with_fallback(&connector, &resolver, &address, 443, b"hi")
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(
            connector.attempts(),
            vec!["192.0.2.1", "2001:67c:2960:6464::c000:201"]
        );
    }

    #[tokio::test]
    async fn resolves_domain_before_nat64_fallback() {
        let connector = MockConnector::default();
        let _remote = connector.listen("2001:67c:2960:6464::5db8:d822");
        let doh = MockDoh::default().with_a_record("example.com", "93.184.216.34");
        let cache = MemoryDnsCache::default();
        let resolver = Nat64Resolver::new(&doh, &cache, Nat64Prefix::default());

        let address = Address::Domain("example.com".into());
        connect_with_fallback(&connector, &resolver, &address, 443, b"")
            .await
            .unwrap();

        assert_eq!(
            connector.attempts(),
            vec!["example.com", "2001:67c:2960:6464::5db8:d822"]
        );
        assert_eq!(cache.get("example.com"), Some(Ipv4Addr::new(93, 184, 216, 34)));
    }

    #[tokio::test]
    async fn unreachable_when_both_routes_fail() {
        let connector = MockConnector::default();
        let doh = MockDoh::default();
        let cache = MemoryDnsCache::default();
        let resolver = Nat64Resolver::new(&doh, &cache, Nat64Prefix::default());

        let address = Address::Ipv4(Ipv4Addr::new(198, 51, 100, 7));
        let err = connect_with_fallback(&connector, &resolver, &address, 22, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DestinationUnreachable(ref t) if t == "198.51.100.7:22"));
        assert_eq!(connector.attempts().len(), 2);
    }

    #[tokio::test]
    async fn ipv6_destination_has_no_nat64_route() {
        let connector = MockConnector::default();
        let doh = MockDoh::default();
        let cache = MemoryDnsCache::default();
        let resolver = Nat64Resolver::new(&doh, &cache, Nat64Prefix::default());

        let address = Address::Ipv6("2001:db8::1".parse().unwrap());
        let err = connect_with_fallback(&connector, &resolver, &address, 443, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DestinationUnreachable(_)));
        assert_eq!(connector.attempts(), vec!["2001:db8:0:0:0:0:0:1"]);
    }
}
