mod config;
mod dns;
mod error;
mod ext;
mod logging;
mod nat64;
mod outbound;
mod protocol;
mod proxy;
mod udp;
mod websocket;

#[cfg(test)]
mod test_util;

use crate::config::{TunnelConfig, share_uri};
use crate::dns::{FetchDohClient, MemoryDnsCache};
use crate::outbound::SocketConnector;
use crate::proxy::{Gateway, Session};
use crate::websocket::{CLOSE_ABNORMAL, WebSocketSink, WebSocketStream, parse_early_data};
use worker::*;

#[event(fetch)]
async fn main(req: Request, env: Env, _: Context) -> Result<Response> {
    console_error_panic_hook::set_once();

    let config = match TunnelConfig::from_env(&env) {
        Ok(config) => config,
        Err(err) => {
            console_error!("{}", err);
            return Response::error(err.to_string(), 500);
        }
    };
    logging::init(config.log_level);

    let is_websocket = req
        .headers()
        .get("Upgrade")?
        .map(|up| up.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_websocket {
        return handle_http(&req, &config);
    }

    // ready early data
    let early_data = parse_early_data(req.headers().get("sec-websocket-protocol")?);

    let pair = WebSocketPair::new()?;
    let server = pair.server;
    server.accept()?;

    wasm_bindgen_futures::spawn_local(async move {
        let events = match server.events() {
            Ok(events) => events,
            Err(err) => {
                console_error!("websocket event stream failed: {}", err);
                _ = server.close(Some(CLOSE_ABNORMAL), Some("internal error"));
                return;
            }
        };
        let inbound = WebSocketStream::new(events, early_data);
        let sink = WebSocketSink::new(&server);

        let doh = FetchDohClient::new(config.doh_endpoint.clone());
        let gateway = Gateway::new(&config, SocketConnector, doh, MemoryDnsCache::shared());
        Session::new(&gateway, &sink).serve(inbound).await;
    });

    Response::from_websocket(pair.client)
}

fn handle_http(req: &Request, config: &TunnelConfig) -> Result<Response> {
    let url = req.url()?;
    let path = url.path();

    if path.trim_start_matches('/').is_empty() {
        return Response::ok("VLESS Proxy Server");
    }

    if config.is_share_path(path) {
        let host = match req.headers().get("Host")? {
            Some(host) => host,
            None => url.host_str().ok_or("Invalid host")?.to_string(),
        };
        return Response::ok(share_uri(&config.credential, &host));
    }

    Response::error("Not Found", 404)
}
