use std::cell::Cell;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures_util::Stream;
use pin_project::pin_project;
use tracing::{debug, warn};
use worker::{EventStream, WebSocket, WebsocketEvent};

use crate::error::Result;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1011;

// close frames carry at most 123 bytes of reason
const MAX_CLOSE_REASON: usize = 123;

/// Decodes early data smuggled in `sec-websocket-protocol`.
///
/// A value that fails to decode is logged and ignored.
pub fn parse_early_data(data: Option<String>) -> Option<Bytes> {
    let data = data.filter(|d| !d.is_empty())?;
    let s = data.replace('+', "-").replace('/', "_").replace('=', "");
    match URL_SAFE_NO_PAD.decode(s) {
        Ok(decoded) => Some(Bytes::from(decoded)),
        Err(e) => {
            warn!("ignoring undecodable early data: {e}");
            None
        }
    }
}

/// Early data, if any, is yielded first.
#[pin_project]
pub struct WebSocketStream<'a> {
    #[pin]
    events: EventStream<'a>,
    early_data: Option<Bytes>,
    closed: bool,
}

impl<'a> WebSocketStream<'a> {
    pub fn new(events: EventStream<'a>, early_data: Option<Bytes>) -> Self {
        Self {
            events,
            early_data,
            closed: false,
        }
    }
}

impl Stream for WebSocketStream<'_> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if let Some(data) = this.early_data.take() {
            return Poll::Ready(Some(Ok(data)));
        }

        loop {
            if *this.closed {
                return Poll::Ready(None);
            }

            match ready!(this.events.as_mut().poll_next(cx)) {
                Some(Ok(WebsocketEvent::Message(msg))) => {
                    if let Some(data) = msg.bytes() {
                        return Poll::Ready(Some(Ok(Bytes::from(data))));
                    }
                }
                Some(Ok(WebsocketEvent::Close(event))) => {
                    debug!("client closed websocket with code {}", event.code());
                    *this.closed = true;
                }
                Some(Err(e)) => {
                    *this.closed = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                None => *this.closed = true,
            }
        }
    }
}

pub trait ClientSink {
    fn is_open(&self) -> bool;

    /// Sends one binary message. Silently dropped once closed.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Closes the connection. Only the first call has an effect.
    fn close(&self, code: u16, reason: &str);
}

pub struct WebSocketSink<'a> {
    ws: &'a WebSocket,
    open: Cell<bool>,
}

impl<'a> WebSocketSink<'a> {
    pub fn new(ws: &'a WebSocket) -> Self {
        Self {
            ws,
            open: Cell::new(true),
        }
    }
}

impl ClientSink for WebSocketSink<'_> {
    fn is_open(&self) -> bool {
        self.open.get()
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if !self.open.get() {
            return Ok(());
        }
        self.ws.send_with_bytes(data).map_err(|e| {
            self.open.set(false);
            e.into()
        })
    }

    fn close(&self, code: u16, reason: &str) {
        if !self.open.replace(false) {
            return;
        }
        if let Err(e) = self.ws.close(Some(code), Some(truncate_reason(reason))) {
            debug!("websocket close failed: {e}");
        }
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
