use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use worker::{Env, Url};

use crate::dns::DEFAULT_DOH_URL;
use crate::error::{Result, TunnelError};
use crate::nat64::Nat64Prefix;
use crate::protocol::normalize_credential;

pub struct TunnelConfig {
    /// Lowercase hyphenated UUID clients must present.
    pub credential: String,
    pub nat64_prefix: Nat64Prefix,
    pub doh_endpoint: Url,
    pub show_uri: bool,
    pub log_level: LevelFilter,
}

impl TunnelConfig {
    pub fn from_env(env: &Env) -> Result<Self> {
        let var = |name: &str| {
            env.var(name)
                .ok()
                .map(|v| v.to_string())
                .filter(|v| !v.trim().is_empty())
        };

        let user_id = var("UUID").ok_or_else(|| TunnelError::Config("UUID is not set".into()))?;
        Self::from_vars(
            &user_id,
            var("NAT64_PREFIX").as_deref(),
            var("DOH_URL").as_deref(),
            var("SHOW_URI").as_deref(),
            var("LOG_LEVEL").as_deref(),
        )
    }

    fn from_vars(
        user_id: &str,
        nat64_prefix: Option<&str>,
        doh_url: Option<&str>,
        show_uri: Option<&str>,
        log_level: Option<&str>,
    ) -> Result<Self> {
        let credential = normalize_credential(user_id)
            .ok_or_else(|| TunnelError::Config(format!("UUID {user_id} is not a valid UUID")))?;

        let nat64_prefix = nat64_prefix
            .map(Nat64Prefix::from_str)
            .transpose()?
            .unwrap_or_default();

        let doh_endpoint = Url::parse(doh_url.unwrap_or(DEFAULT_DOH_URL))
            .map_err(|e| TunnelError::Config(format!("DOH_URL: {e}")))?;

        Ok(Self {
            credential,
            nat64_prefix,
            doh_endpoint,
            show_uri: show_uri.and_then(|v| v.trim().parse().ok()).unwrap_or(true),
            log_level: log_level
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(LevelFilter::INFO),
        })
    }

    /// Whether `path` asks for the share URI. UUIDs match in any case.
    pub fn is_share_path(&self, path: &str) -> bool {
        self.show_uri
            && path
                .trim_start_matches('/')
                .eq_ignore_ascii_case(&self.credential)
    }
}

/// Client import link for this deployment.
pub fn share_uri(credential: &str, host: &str) -> String {
    format!(
        "vless://{credential}@{host}:443?encryption=none&security=tls&sni={host}&type=ws&host={host}&path=/#{host}"
    )
}
