use std::path::PathBuf;
use std::pin::pin;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// What a GET is fetching. Retry counters are kept per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Manifest,
    Init,
    Video,
}

/// One outgoing GET, tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub unit_id: String,
    pub kind: MediaKind,
    pub url: Url,
    /// Where the completed body ends up on disk.
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The origin answered with something other than 200.
    Status(u16),
    /// Connection or body stream failure.
    Transport(String),
}

/// Receives the transport callbacks of a [`HttpRequester`].
pub trait ResponseHandler: Send + Sync {
    /// Called for every body chunk in order. `is_last` is set on exactly one call per body.
    fn on_chunk(&self, request: &SegmentRequest, chunk: Bytes, is_last: bool);

    fn on_failure(&self, request: &SegmentRequest, failure: FetchFailure);
}

/// Fire-and-forget HTTP GET issuer. Results come back through a [`ResponseHandler`].
pub trait HttpRequester: Send + Sync {
    fn send_get(&self, request: SegmentRequest);
}

/// [`HttpRequester`] on top of `reqwest`. Each request runs on its own task and is dropped as soon
/// as the session's cancellation token fires.
pub struct ReqwestRequester {
    client: Client,
    handler: Weak<dyn ResponseHandler>,
    cancel: CancellationToken,
}

impl ReqwestRequester {
    pub fn new(client: Client, handler: Weak<dyn ResponseHandler>, cancel: CancellationToken) -> Self {
        Self {
            client,
            handler,
            cancel,
        }
    }
}

impl HttpRequester for ReqwestRequester {
    fn send_get(&self, request: SegmentRequest) {
        let client = self.client.clone();
        let handler = self.handler.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("({}) GET {} cancelled", request.unit_id, request.url);
                }
                _ = fetch(&client, &request, &handler) => {}
            }
        });
    }
}

async fn fetch(client: &Client, request: &SegmentRequest, handler: &Weak<dyn ResponseHandler>) {
    trace!("({}) GET {}", request.unit_id, request.url);

    let response = match client.get(request.url.clone()).send().await {
        Ok(response) => response,
        Err(e) => {
            deliver_failure(handler, request, FetchFailure::Transport(e.to_string()));
            return;
        }
    };

    let status = response.status();
    if status != StatusCode::OK {
        debug!("({}) GET {} -> {}", request.unit_id, request.url, status);
        deliver_failure(handler, request, FetchFailure::Status(status.as_u16()));
        return;
    }

    // One chunk of lookahead tells us which chunk closes the body.
    let mut stream = pin!(response.bytes_stream().peekable());
    let mut delivered = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                let is_last = stream.as_mut().peek().await.is_none();
                let Some(handler) = handler.upgrade() else {
                    return;
                };
                handler.on_chunk(request, chunk, is_last);
                delivered = true;
            }
            Err(e) => {
                deliver_failure(handler, request, FetchFailure::Transport(e.to_string()));
                return;
            }
        }
    }

    if !delivered {
        if let Some(handler) = handler.upgrade() {
            handler.on_chunk(request, Bytes::new(), true);
        }
    }
}

fn deliver_failure(handler: &Weak<dyn ResponseHandler>, request: &SegmentRequest, failure: FetchFailure) {
    if let Some(handler) = handler.upgrade() {
        handler.on_failure(request, failure);
    }
}

/// Upcast helper for wiring a concrete handler into a requester.
pub fn downgrade_handler<H: ResponseHandler + 'static>(handler: &Arc<H>) -> Weak<dyn ResponseHandler> {
    let handler: Arc<dyn ResponseHandler> = handler.clone();
    Arc::downgrade(&handler)
}
