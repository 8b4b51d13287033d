// session_registry.rs

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::services::transcoder::TranscodeHandle;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Static,
    Dynamic,
}

/// Source, output and process of a session once streaming runs.
#[derive(Debug)]
pub struct LiveStream {
    pub input_uri: String,
    pub output_path: PathBuf,
    pub process: TranscodeHandle,
}

#[derive(Debug, Default)]
struct LiveSlot {
    stream: Option<LiveStream>,
    // Set once the session is stopped; nothing may be attached afterwards.
    closed: bool,
}

/// Bookkeeping for one live session.
#[derive(Debug)]
pub struct DashUnit {
    id: String,
    stream_type: StreamType,
    expires_at: Option<Instant>,
    live: Mutex<LiveSlot>,
}

impl DashUnit {
    fn new(id: &str, stream_type: StreamType, expires: u64) -> Self {
        Self {
            id: id.to_owned(),
            stream_type,
            expires_at: (expires > 0).then(|| Instant::now() + Duration::from_secs(expires)),
            live: Mutex::new(LiveSlot::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Hands the running transcode to the session.
    ///
    /// Returns false if the session was stopped in the meantime; the transcoder is then stopped
    /// right away.
    pub async fn attach(&self, mut stream: LiveStream) -> bool {
        let mut live = self.live.lock().await;
        if live.closed {
            drop(live);
            debug!("({}) Session stopped while the transcoder was launching", self.id);
            if let Err(e) = stream.process.stop().await {
                warn!("({}) Failed to stop transcoder: {}", self.id, e);
            }
            return false;
        }
        live.stream = Some(stream);
        true
    }

    /// Stops the transcoder, if one is attached, and closes the session for good.
    pub async fn stop_streaming(&self) {
        let stream = {
            let mut live = self.live.lock().await;
            live.closed = true;
            live.stream.take()
        };
        if let Some(mut stream) = stream {
            if let Err(e) = stream.process.stop().await {
                warn!("({}) Failed to stop transcoder: {}", self.id, e);
            }
        }
    }

    pub async fn info(&self) -> SessionInfo {
        let slot = self.live.lock().await;
        let live = &slot.stream;
        SessionInfo {
            id: self.id.clone(),
            stream_type: self.stream_type,
            input_uri: live.as_ref().map(|s| s.input_uri.clone()),
            output_path: live.as_ref().map(|s| s.output_path.display().to_string()),
            expires_in_secs: self
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub stream_type: StreamType,
    pub input_uri: Option<String>,
    pub output_path: Option<String>,
    pub expires_in_secs: Option<u64>,
}

/// Live sessions by id. At most one record per id and at most `capacity` records overall.
#[derive(Debug)]
pub struct SessionRegistry {
    units: DashMap<String, Arc<DashUnit>>,
    capacity: usize,
    reserved: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            units: DashMap::new(),
            capacity,
            reserved: AtomicUsize::new(0),
        }
    }

    /// Creates the record for `id`.
    ///
    /// Returns `None` if the id is already live or the registry is full. An existing record is
    /// never replaced.
    pub fn add_dash_unit(&self, stream_type: StreamType, id: &str, expires: u64) -> Option<Arc<DashUnit>> {
        if self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_err()
        {
            debug!("({}) Registry is full ({})", id, self.capacity);
            return None;
        }

        match self.units.entry(id.to_owned()) {
            Entry::Occupied(_) => {
                self.reserved.fetch_sub(1, Ordering::SeqCst);
                debug!("({}) DashUnit already exists", id);
                None
            }
            Entry::Vacant(entry) => {
                let unit = Arc::new(DashUnit::new(id, stream_type, expires));
                entry.insert(unit.clone());
                info!("({}) DashUnit added (type={:?}, expires={}s)", id, stream_type, expires);
                Some(unit)
            }
        }
    }

    pub fn get_dash_unit(&self, id: &str) -> Option<Arc<DashUnit>> {
        self.units.get(id).map(|unit| unit.value().clone())
    }

    /// Stops the session's transcoder, then drops the record.
    ///
    /// Returns false if there was no record for `id`.
    pub async fn delete_dash_unit(&self, id: &str) -> bool {
        let Some(unit) = self.get_dash_unit(id) else {
            return false;
        };

        unit.stop_streaming().await;
        self.release(&unit)
    }

    /// Drops a record without touching its transcoder. Used when the launch itself failed.
    pub fn release(&self, unit: &Arc<DashUnit>) -> bool {
        let removed = self
            .units
            .remove_if(unit.id(), |_, registered| Arc::ptr_eq(registered, unit))
            .is_some();
        if removed {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
            info!("({}) DashUnit deleted", unit.id());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<DashUnit>> {
        self.units.iter().map(|entry| entry.value().clone()).collect()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();
        for unit in self.snapshot() {
            sessions.push(unit.info().await);
        }
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Deletes every record whose expiry has passed. Returns how many went away.
    pub async fn delete_expired(&self, now: Instant) -> usize {
        let mut deleted = 0;
        for unit in self.snapshot().into_iter().filter(|unit| unit.is_expired(now)) {
            info!("({}) DashUnit expired", unit.id());
            unit.stop_streaming().await;
            if self.release(&unit) {
                deleted += 1;
            }
        }
        deleted
    }

    pub async fn delete_all(&self) {
        for unit in self.snapshot() {
            unit.stop_streaming().await;
            self.release(&unit);
        }
    }
}

/// Periodically deletes expired sessions until `shutdown` fires.
#[instrument(skip_all)]
pub async fn run_expiry_sweeper(registry: Arc<SessionRegistry>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let deleted = registry.delete_expired(Instant::now()).await;
                if deleted > 0 {
                    debug!("Expired {} session(s), {} left", deleted, registry.len());
                }
            }
        }
    }
}
