//! Domain lookups for the NAT64 path and DNS-over-HTTPS relaying.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{LazyLock, Mutex, PoisonError};

use serde::Deserialize;
use tracing::debug;
use worker::{Fetch, Headers, Method, Request, RequestInit, Url, js_sys::Uint8Array};

use crate::error::{Result, TunnelError};

pub const DEFAULT_DOH_URL: &str = "https://1.1.1.1/dns-query";
const DNS_JSON: &str = "application/dns-json";
const DNS_MESSAGE: &str = "application/dns-message";
const RECORD_TYPE_A: u16 = 1;

/// Domain to IPv4 lookup table consulted before any DoH query.
pub trait DnsCache {
    fn get(&self, domain: &str) -> Option<Ipv4Addr>;
    fn put(&self, domain: &str, addr: Ipv4Addr);
}

impl<T: DnsCache + ?Sized> DnsCache for &T {
    fn get(&self, domain: &str) -> Option<Ipv4Addr> {
        (**self).get(domain)
    }

    fn put(&self, domain: &str, addr: Ipv4Addr) {
        (**self).put(domain, addr)
    }
}

/// Unbounded in-memory cache. Entries live as long as the isolate.
#[derive(Debug, Default)]
pub struct MemoryDnsCache {
    entries: Mutex<HashMap<String, Ipv4Addr>>,
}

impl MemoryDnsCache {
    /// The cache shared by every session in this isolate.
    pub fn shared() -> &'static MemoryDnsCache {
        static SHARED: LazyLock<MemoryDnsCache> = LazyLock::new(MemoryDnsCache::default);
        &SHARED
    }
}

impl DnsCache for MemoryDnsCache {
    fn get(&self, domain: &str) -> Option<Ipv4Addr> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .copied()
    }

    fn put(&self, domain: &str, addr: Ipv4Addr) {
        // concurrent first lookups of one domain race benignly, last write wins
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain.to_owned(), addr);
    }
}

#[allow(async_fn_in_trait)]
pub trait DohClient {
    async fn query_a(&self, domain: &str) -> Result<Option<String>>;

    /// Sends a wire-format DNS query and returns the wire-format answer.
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    #[serde(rename = "Answer", default)]
    answer: Vec<JsonRecord>,
}

#[derive(Debug, Deserialize)]
struct JsonRecord {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// Extracts the first `A` record from a `application/dns-json` body.
pub fn first_a_record(body: &[u8]) -> Result<Option<String>> {
    let answer: JsonAnswer =
        serde_json::from_slice(body).map_err(|e| TunnelError::Doh(e.to_string()))?;
    Ok(answer
        .answer
        .into_iter()
        .find(|record| record.record_type == RECORD_TYPE_A)
        .map(|record| record.data))
}

pub struct FetchDohClient {
    endpoint: Url,
}

impl FetchDohClient {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }

    async fn send(&self, url: &Url, init: &RequestInit) -> Result<Vec<u8>> {
        let request = Request::new_with_init(url.as_str(), init)?;
        let mut response = Fetch::Request(request).send().await?;
        let status = response.status_code();
        if status != 200 {
            return Err(TunnelError::Doh(format!("{} answered {status}", self.endpoint)));
        }
        Ok(response.bytes().await?)
    }
}

impl DohClient for FetchDohClient {
    async fn query_a(&self, domain: &str) -> Result<Option<String>> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("name", domain)
            .append_pair("type", "A");

        let mut headers = Headers::new();
        headers.set("Accept", DNS_JSON)?;
        let mut init = RequestInit::new();
        init.method = Method::Get;
        init.headers = headers;

        debug!("resolving {domain} via {}", self.endpoint);
        let body = self.send(&url, &init).await?;
        first_a_record(&body)
    }

    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let mut headers = Headers::new();
        headers.set("Content-Type", DNS_MESSAGE)?;
        headers.set("Accept", DNS_MESSAGE)?;
        let mut init = RequestInit::new();
        init.method = Method::Post;
        init.headers = headers;
        init.body = Some(Uint8Array::from(query).into());

        self.send(&self.endpoint, &init).await
    }
}
