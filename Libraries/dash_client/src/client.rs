use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DashClientError, DashClientResult};
use crate::mpd::MpdManager;
use crate::segment::fetcher::{HttpRequester, MediaKind, SegmentRequest};
use crate::segment::writer::SegmentWriter;

pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Wait before retrying the manifest, which has no segment duration to pace on yet.
pub const MANIFEST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// State machine payload for one download session.
///
/// Only ever touched through its state unit, so every access is serialized by the unit lock.
pub struct DashClient {
    unit_id: String,
    manifest_url: Url,
    target_base: PathBuf,
    mpd: Option<MpdManager>,
    retry_counts: HashMap<MediaKind, u32>,
    retry_limit: u32,
    stopped: bool,
    requester: Arc<dyn HttpRequester>,
    writer: Arc<dyn SegmentWriter>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DashClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashClient")
            .field("unit_id", &self.unit_id)
            .field("manifest_url", &self.manifest_url.as_str())
            .field("target_base", &self.target_base)
            .field("mpd", &self.mpd)
            .field("retry_counts", &self.retry_counts)
            .field("retry_limit", &self.retry_limit)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl DashClient {
    pub fn new(
        unit_id: &str,
        manifest_url: &str,
        target_base: impl Into<PathBuf>,
        retry_limit: u32,
        requester: Arc<dyn HttpRequester>,
        writer: Arc<dyn SegmentWriter>,
        cancel: CancellationToken,
    ) -> DashClientResult<Self> {
        let manifest_url =
            Url::parse(manifest_url).map_err(|_| DashClientError::InvalidUrl(manifest_url.to_owned()))?;
        if manifest_url.cannot_be_a_base() {
            return Err(DashClientError::InvalidUrl(manifest_url.to_string()));
        }

        Ok(Self {
            unit_id: unit_id.to_owned(),
            manifest_url,
            target_base: target_base.into(),
            mpd: None,
            retry_counts: HashMap::new(),
            retry_limit,
            stopped: false,
            requester,
            writer,
            cancel,
        })
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn target_base(&self) -> &Path {
        &self.target_base
    }

    pub fn mpd(&self) -> Option<&MpdManager> {
        self.mpd.as_ref()
    }

    pub fn mpd_mut(&mut self) -> Option<&mut MpdManager> {
        self.mpd.as_mut()
    }

    /// Installs the oracle for a freshly parsed manifest. Any previous one is discarded.
    pub fn set_mpd(&mut self, mpd: MpdManager) {
        self.mpd = Some(mpd);
    }

    pub fn writer(&self) -> Arc<dyn SegmentWriter> {
        self.writer.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Marks the session stopped and aborts in-flight requests and pacing waits.
    pub fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.cancel.cancel();
            debug!("({}) DashClient stopped", self.unit_id);
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn retry_count(&self, kind: MediaKind) -> u32 {
        self.retry_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Counts one more failure for `kind`. Counters never reset while the session lives.
    pub fn inc_and_get_retry_count(&mut self, kind: MediaKind) -> u32 {
        let count = self.retry_counts.entry(kind).or_insert(0);
        *count += 1;
        *count
    }

    pub fn manifest_request(&self) -> SegmentRequest {
        let name = self
            .manifest_url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("manifest.mpd");

        SegmentRequest {
            unit_id: self.unit_id.clone(),
            kind: MediaKind::Manifest,
            url: self.manifest_url.clone(),
            target: self.target_base.join(name),
        }
    }

    /// Request for the init segment, if the manifest is known.
    pub fn init_request(&self) -> DashClientResult<Option<SegmentRequest>> {
        let Some(mpd) = &self.mpd else {
            return Ok(None);
        };
        self.segment_request(MediaKind::Init, mpd.video_init_segment_name())
            .map(Some)
    }

    /// Request for the media segment at the oracle's current sequence number.
    pub fn media_request(&self) -> DashClientResult<Option<SegmentRequest>> {
        let Some(mpd) = &self.mpd else {
            return Ok(None);
        };
        self.segment_request(MediaKind::Video, &mpd.video_media_segment_name())
            .map(Some)
    }

    /// Rebuilds the request for the given kind from the current oracle state.
    pub fn request_for(&self, kind: MediaKind) -> DashClientResult<Option<SegmentRequest>> {
        match kind {
            MediaKind::Manifest => Ok(Some(self.manifest_request())),
            MediaKind::Init => self.init_request(),
            MediaKind::Video => self.media_request(),
        }
    }

    fn segment_request(&self, kind: MediaKind, name: &str) -> DashClientResult<SegmentRequest> {
        let url = self
            .manifest_url
            .join(name)
            .map_err(|_| DashClientError::InvalidUrl(name.to_owned()))?;
        Ok(SegmentRequest {
            unit_id: self.unit_id.clone(),
            kind,
            url,
            target: self.target_base.join(name),
        })
    }

    /// Issues `request` after `delay_us` microseconds, or right away when the delay is not
    /// positive. The wait runs on its own task and is abandoned when the session stops.
    pub fn schedule_get(&self, request: SegmentRequest, delay_us: i64) {
        let requester = self.requester.clone();
        if delay_us <= 0 {
            requester.send_get(request);
            return;
        }

        let cancel = self.cancel.clone();
        let delay = Duration::from_micros(delay_us.unsigned_abs());
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("({}) Pending GET {} dropped", request.unit_id, request.url);
                }
                _ = tokio::time::sleep(delay) => requester.send_get(request),
            }
        });
    }
}
