// handlers/control.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use shared_utils::codec::{
    CodecError, ControlMessage, MessageBody, StreamingResponse, StreamingStartRequest,
    StreamingStopRequest,
};
use shared_utils::types::{current_timestamp, ResponseType, SequenceCounter};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{BackendConfig, DASH_POSTFIX};
use crate::services::session_registry::{LiveStream, SessionRegistry, StreamType};
use crate::services::transcoder::Transcoder;
use crate::services::whitelist::Whitelist;

#[derive(Error, Debug)]
pub enum ControlError {
    /// A peer refused our own start request. Not recoverable.
    #[error("upstream rejected streaming start: {status_code} {reason}")]
    UpstreamRejected { status_code: u16, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Session id for a source and stream uri: `{sourceIp}:{uri without extension}`.
pub fn dash_unit_id(source_ip: &str, uri: &str) -> String {
    format!("{}:{}", source_ip, strip_extension(uri))
}

fn normalize_uri(uri: &str) -> &str {
    uri.strip_prefix('/').unwrap_or(uri)
}

fn strip_extension(uri: &str) -> &str {
    let uri = normalize_uri(uri);
    let name_start = uri.rfind('/').map_or(0, |i| i + 1);
    match uri[name_start..].rfind('.') {
        Some(dot) if dot > 0 => &uri[..name_start + dot],
        _ => uri,
    }
}

/// `{media_base}/{uri}/{uri file stem}.mpd`
pub fn mpd_output_path(media_base: &Path, uri: &str) -> PathBuf {
    let uri = normalize_uri(uri);
    let stem = Path::new(uri)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| uri.to_owned());
    media_base.join(uri).join(format!("{stem}{DASH_POSTFIX}"))
}

/// Terminates the control protocol: one datagram in, at most one datagram out.
pub struct ControlHandler {
    registry: Arc<SessionRegistry>,
    whitelist: Whitelist,
    backend: BackendConfig,
    media_base: PathBuf,
    transcoder: Arc<dyn Transcoder>,
    sequence: Arc<SequenceCounter>,
}

impl ControlHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        whitelist: Whitelist,
        backend: BackendConfig,
        media_base: PathBuf,
        transcoder: Arc<dyn Transcoder>,
        sequence: Arc<SequenceCounter>,
    ) -> Self {
        Self {
            registry,
            whitelist,
            backend,
            media_base,
            transcoder,
            sequence,
        }
    }

    /// Handles one datagram and returns the encoded response, if the message calls for one.
    ///
    /// Noise yields `Ok(None)`. Malformed frames yield [`ControlError::Codec`] and must not be
    /// answered.
    #[instrument(skip_all)]
    pub async fn handle_datagram(&self, data: &[u8]) -> Result<Option<Bytes>, ControlError> {
        let Some(message) = ControlMessage::decode(data)? else {
            return Ok(None);
        };
        debug!("RECV {:?}", message);

        let response = match message.body {
            MessageBody::StartRequest(request) => {
                MessageBody::StartResponse(StreamingResponse::new(self.handle_start_request(&request).await))
            }
            MessageBody::StopRequest(request) => {
                MessageBody::StopResponse(StreamingResponse::new(self.handle_stop_request(&request).await))
            }
            MessageBody::StartResponse(response) => {
                if !response.is_success() {
                    return Err(ControlError::UpstreamRejected {
                        status_code: response.status_code,
                        reason: response.reason,
                    });
                }
                debug!("Upstream accepted streaming start");
                return Ok(None);
            }
            MessageBody::StopResponse(response) => {
                debug!("Upstream answered streaming stop: {} {}", response.status_code, response.reason);
                return Ok(None);
            }
        };

        let response = ControlMessage::new(self.sequence.next(), current_timestamp(), response)?;
        debug!("SEND {:?}", response);
        Ok(Some(response.encode()?))
    }

    async fn handle_start_request(&self, request: &StreamingStartRequest) -> ResponseType {
        if !self.whitelist.contains(&request.uri) {
            debug!("Stream {} is not in the media list", request.uri);
            return ResponseType::NotFound;
        }

        let id = dash_unit_id(&request.source_ip, &request.uri);
        let Some(unit) = self
            .registry
            .add_dash_unit(StreamType::Dynamic, &id, request.expires)
        else {
            warn!("({}) Refusing streaming start, session exists or registry is full", id);
            return ResponseType::Forbidden;
        };

        let Some(network_path) = self.backend.network_path() else {
            warn!("({}) No streaming backend configured", id);
            self.registry.release(&unit);
            return ResponseType::NotFound;
        };

        let uri = normalize_uri(&request.uri);
        let input_uri = format!("{}/{}", network_path, uri);
        let output_path = mpd_output_path(&self.media_base, uri);

        match self.transcoder.launch(&id, &input_uri, &output_path).await {
            Ok(process) => {
                let stream = LiveStream {
                    input_uri,
                    output_path,
                    process,
                };
                if unit.attach(stream).await {
                    info!("({}) Streaming started", id);
                    ResponseType::Success
                } else {
                    warn!("({}) Session was stopped during launch", id);
                    ResponseType::NotFound
                }
            }
            Err(e) => {
                warn!("({}) Failed to launch transcoder: {}", id, e);
                self.registry.release(&unit);
                ResponseType::NotFound
            }
        }
    }

    async fn handle_stop_request(&self, request: &StreamingStopRequest) -> ResponseType {
        let id = dash_unit_id(&request.source_ip, &request.uri);
        if self.registry.delete_dash_unit(&id).await {
            info!("({}) Streaming stopped", id);
            ResponseType::Success
        } else {
            warn!("({}) DashUnit does not exist", id);
            ResponseType::NotFound
        }
    }
}
