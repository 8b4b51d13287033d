use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use shared_utils::fsm::{lock_unit, StateManager, StateUnitRef};
use tracing::{debug, error, instrument, warn};

use crate::client::{DashClient, MANIFEST_RETRY_DELAY};
use crate::mpd::MpdManager;
use crate::segment::fetcher::{FetchFailure, MediaKind, ResponseHandler, SegmentRequest};
use crate::state::{
    DASH_CLIENT_STATE, GET_INIT_SEG, GET_MEDIA_SEG, GET_MPD_DONE, IDLE, INIT_SEG_DONE,
    MEDIA_SEG_LOOP, MPD_DONE, STOP,
};

/// Turns HTTP completions into state machine events.
///
/// Bodies are buffered per session until their last chunk arrives. What the body means depends on
/// the state the session is in at that moment.
pub struct ResponseRouter {
    manager: Arc<StateManager<DashClient>>,
    buffers: DashMap<String, BytesMut>,
}

impl ResponseRouter {
    pub fn new(manager: Arc<StateManager<DashClient>>) -> Self {
        Self {
            manager,
            buffers: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &Arc<StateManager<DashClient>> {
        &self.manager
    }

    /// Stores a completed body and picks the event it stands for.
    fn complete(&self, unit: &StateUnitRef<DashClient>, request: &SegmentRequest, body: &[u8]) -> Option<&'static str> {
        let mut guard = lock_unit(unit);
        let state = guard.cur_state().to_owned();
        let client = guard.data_mut();
        if client.is_stopped() {
            return None;
        }

        match (state.as_str(), request.kind) {
            (IDLE, MediaKind::Manifest) => {
                let xml = String::from_utf8_lossy(body);
                let mpd = match MpdManager::parse(&xml, client.writer()) {
                    Ok(mpd) => mpd,
                    Err(e) => {
                        error!("({}) Unusable manifest from {}: {}", client.unit_id(), request.url, e);
                        return Some(STOP);
                    }
                };
                if let Err(e) = client.writer().write_segment(&request.target, body) {
                    error!("({}) Failed to write manifest {}: {}", client.unit_id(), request.target.display(), e);
                    return Some(STOP);
                }
                client.set_mpd(mpd);
                Some(GET_MPD_DONE)
            }
            (MPD_DONE, MediaKind::Init) => {
                let written = client
                    .mpd()
                    .map(|mpd| mpd.make_init_segment(&request.target, body));
                persisted(client, request, written, GET_INIT_SEG)
            }
            (INIT_SEG_DONE | MEDIA_SEG_LOOP, MediaKind::Video) => {
                let written = client
                    .mpd()
                    .map(|mpd| mpd.make_media_segment(&request.target, body));
                persisted(client, request, written, GET_MEDIA_SEG)
            }
            (state, kind) => {
                debug!(
                    "({}) Ignoring {:?} body {} in state {}",
                    client.unit_id(),
                    kind,
                    request.url,
                    state
                );
                None
            }
        }
    }
}

fn persisted(
    client: &DashClient,
    request: &SegmentRequest,
    written: Option<std::io::Result<()>>,
    event: &'static str,
) -> Option<&'static str> {
    match written {
        Some(Ok(())) => Some(event),
        Some(Err(e)) => {
            error!("({}) Failed to write {}: {}", client.unit_id(), request.target.display(), e);
            Some(STOP)
        }
        None => {
            warn!("({}) Segment body without a manifest", client.unit_id());
            None
        }
    }
}

impl ResponseHandler for ResponseRouter {
    #[instrument(skip_all)]
    fn on_chunk(&self, request: &SegmentRequest, chunk: Bytes, is_last: bool) {
        if !is_last {
            self.buffers
                .entry(request.unit_id.clone())
                .or_default()
                .extend_from_slice(&chunk);
            return;
        }

        let body = match self.buffers.remove(&request.unit_id) {
            Some((_, mut buffered)) => {
                buffered.extend_from_slice(&chunk);
                buffered.freeze()
            }
            None => chunk,
        };

        let Some(unit) = self.manager.get_unit(&request.unit_id) else {
            debug!("({}) Session is gone, dropping {}", request.unit_id, request.url);
            return;
        };

        if let Some(event) = self.complete(&unit, request, &body) {
            self.manager.fire(DASH_CLIENT_STATE, event, &unit);
        }
    }

    #[instrument(skip_all)]
    fn on_failure(&self, request: &SegmentRequest, failure: FetchFailure) {
        self.buffers.remove(&request.unit_id);

        let Some(unit) = self.manager.get_unit(&request.unit_id) else {
            return;
        };

        let give_up = {
            let mut guard = lock_unit(&unit);
            let client = guard.data_mut();
            if client.is_stopped() {
                return;
            }

            let count = client.inc_and_get_retry_count(request.kind);
            if count > client.retry_limit() {
                warn!(
                    "({}) [{:?}] {:?} for {}, retry limit {} exceeded. Stopping.",
                    client.unit_id(),
                    request.kind,
                    failure,
                    request.url,
                    client.retry_limit()
                );
                true
            } else {
                let delay = match (request.kind, client.mpd()) {
                    (MediaKind::Manifest, _) | (_, None) => MANIFEST_RETRY_DELAY.as_micros() as i64,
                    (_, Some(mpd)) => mpd.video_segment_duration(false) / 2,
                };
                warn!(
                    "({}) [{:?}] {:?} for {}, retrying ({}/{}) in {}us",
                    client.unit_id(),
                    request.kind,
                    failure,
                    request.url,
                    count,
                    client.retry_limit(),
                    delay
                );
                client.schedule_get(request.clone(), delay);
                false
            }
        };

        if give_up {
            self.manager.fire(DASH_CLIENT_STATE, STOP, &unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{client, RecordingRequester};
    use crate::state::{register_dash_client_state, STOPPED};
    use std::time::Duration;

    const MPD: &str = r#"<MPD minBufferTime="PT0S"><Period><AdaptationSet contentType="video">
        <SegmentTemplate timescale="1" duration="2" initialization="init.m4s" media="seg-$Number$.m4s" startNumber="1"/>
        <Representation id="0" bandwidth="1"/>
    </AdaptationSet></Period></MPD>"#;

    fn setup() -> (ResponseRouter, Arc<RecordingRequester>, StateUnitRef<DashClient>) {
        let manager = Arc::new(StateManager::new());
        register_dash_client_state(&manager).unwrap();
        let requester = Arc::new(RecordingRequester::default());
        let unit = manager
            .create_unit("unit-1", DASH_CLIENT_STATE, client(requester.clone()), IDLE)
            .unwrap();
        (ResponseRouter::new(manager), requester, unit)
    }

    fn state(unit: &StateUnitRef<DashClient>) -> String {
        lock_unit(unit).cur_state().to_owned()
    }

    #[tokio::test]
    async fn only_the_last_chunk_moves_the_state() {
        let (router, _requester, unit) = setup();
        let request = lock_unit(&unit).data().manifest_request();

        let (head, tail) = MPD.split_at(40);
        router.on_chunk(&request, Bytes::from(head.to_owned()), false);
        assert_eq!(state(&unit), IDLE);
        assert!(lock_unit(&unit).data().mpd().is_none());

        router.on_chunk(&request, Bytes::from(tail.to_owned()), true);
        assert_eq!(state(&unit), MPD_DONE);
        assert_eq!(
            lock_unit(&unit).data().mpd().unwrap().video_segment_duration(false),
            2_000_000
        );
    }

    #[tokio::test]
    async fn unparseable_manifest_stops_the_session() {
        let (router, _requester, unit) = setup();
        let request = lock_unit(&unit).data().manifest_request();

        router.on_chunk(&request, Bytes::from_static(b"<MPD></MPD>"), true);
        assert_eq!(state(&unit), STOPPED);
        assert!(router.manager().get_unit("unit-1").is_none());
    }

    #[tokio::test]
    async fn bodies_that_do_not_match_the_state_are_ignored() {
        let (router, requester, unit) = setup();
        let mut request = lock_unit(&unit).data().manifest_request();
        request.kind = MediaKind::Video;

        router.on_chunk(&request, Bytes::from_static(b"moof"), true);
        assert_eq!(state(&unit), IDLE);
        assert!(requester.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_limit_trips_on_the_attempt_after_the_limit() {
        let (router, requester, unit) = setup();
        let manifest = lock_unit(&unit).data().manifest_request();
        router.on_chunk(&manifest, Bytes::from_static(MPD.as_bytes()), true);
        assert_eq!(state(&unit), MPD_DONE);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let init = requester.sent().pop().unwrap();
        router.on_chunk(&init, Bytes::from_static(b"ftyp"), true);
        assert_eq!(state(&unit), INIT_SEG_DONE);
        let media = requester.sent().pop().unwrap();
        assert_eq!(media.kind, MediaKind::Video);

        let limit = lock_unit(&unit).data().retry_limit();
        for attempt in 1..=limit {
            let before = requester.sent().len();
            router.on_failure(&media, FetchFailure::Status(404));
            assert_eq!(state(&unit), INIT_SEG_DONE, "attempt {attempt}");

            // Half a segment later the very same request goes out again.
            tokio::time::sleep(Duration::from_millis(1001)).await;
            let sent = requester.sent();
            assert_eq!(sent.len(), before + 1);
            assert_eq!(sent.last(), Some(&media));
        }

        router.on_failure(&media, FetchFailure::Transport("connection reset".to_owned()));
        assert_eq!(state(&unit), STOPPED);
        assert!(lock_unit(&unit).data().is_stopped());
        assert!(router.manager().get_unit("unit-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bodies_do_not_leak_into_the_retry() {
        let (router, requester, unit) = setup();
        let manifest = lock_unit(&unit).data().manifest_request();

        router.on_chunk(&manifest, Bytes::from_static(b"garbage"), false);
        router.on_failure(&manifest, FetchFailure::Transport("eof".to_owned()));
        tokio::time::sleep(MANIFEST_RETRY_DELAY + Duration::from_millis(1)).await;
        assert_eq!(requester.sent(), vec![manifest.clone()]);

        router.on_chunk(&manifest, Bytes::from_static(MPD.as_bytes()), true);
        assert_eq!(state(&unit), MPD_DONE);
    }

    #[tokio::test]
    async fn zero_duration_retries_at_once_and_still_counts() {
        let (router, requester, unit) = setup();
        let manifest = lock_unit(&unit).data().manifest_request();
        let unpaced = r#"<MPD><Period><AdaptationSet contentType="video">
            <SegmentTemplate initialization="init.m4s" media="seg-$Number$.m4s" startNumber="1"/>
            <Representation id="0" bandwidth="1"/>
        </AdaptationSet></Period></MPD>"#;
        router.on_chunk(&manifest, Bytes::from_static(unpaced.as_bytes()), true);
        assert_eq!(state(&unit), MPD_DONE);

        let init = requester.sent().pop().unwrap();
        assert_eq!(init.kind, MediaKind::Init);
        router.on_chunk(&init, Bytes::from_static(b"ftyp"), true);
        let media = requester.sent().pop().unwrap();
        router.on_chunk(&media, Bytes::from_static(b"moof"), true);
        assert_eq!(state(&unit), MEDIA_SEG_LOOP);
        let next = requester.sent().pop().unwrap();
        assert!(next.url.as_str().ends_with("/seg-2.m4s"));

        let limit = lock_unit(&unit).data().retry_limit();
        for attempt in 1..=limit {
            router.on_failure(&next, FetchFailure::Status(503));
            assert_eq!(requester.sent().last(), Some(&next), "attempt {attempt}");
            assert_eq!(lock_unit(&unit).data().retry_count(MediaKind::Video), attempt);
        }
        router.on_failure(&next, FetchFailure::Status(503));
        assert_eq!(state(&unit), STOPPED);
    }
}
