use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Client;
use shared_utils::fsm::{lock_unit, StateManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::client::DashClient;
use crate::error::DashClientResult;
use crate::router::ResponseRouter;
use crate::segment::fetcher::{downgrade_handler, ReqwestRequester};
use crate::segment::writer::{FileSegmentWriter, SegmentWriter};
use crate::state::{register_dash_client_state, DASH_CLIENT_STATE, IDLE, STOP};

/// Entry point for download sessions.
///
/// Owns the state machine engine, the response router and the HTTP client shared by every
/// session started through it.
pub struct DashPlayer {
    manager: Arc<StateManager<DashClient>>,
    router: Arc<ResponseRouter>,
    http: Client,
    writer: Arc<dyn SegmentWriter>,
    retry_limit: u32,
}

impl DashPlayer {
    pub fn new(retry_limit: u32) -> DashClientResult<Self> {
        Self::with_writer(retry_limit, Arc::new(FileSegmentWriter))
    }

    pub fn with_writer(retry_limit: u32, writer: Arc<dyn SegmentWriter>) -> DashClientResult<Self> {
        let manager = Arc::new(StateManager::new());
        register_dash_client_state(&manager)?;
        let router = Arc::new(ResponseRouter::new(manager.clone()));

        Ok(Self {
            manager,
            router,
            http: Client::new(),
            writer,
            retry_limit,
        })
    }

    /// Starts downloading `manifest_url` into `target_dir`.
    ///
    /// The returned token is cancelled once the session stops, whatever the reason.
    #[instrument(skip_all)]
    pub fn start(
        &self,
        unit_id: &str,
        manifest_url: &str,
        target_dir: impl Into<PathBuf>,
    ) -> DashClientResult<CancellationToken> {
        let cancel = CancellationToken::new();
        let requester = Arc::new(ReqwestRequester::new(
            self.http.clone(),
            downgrade_handler(&self.router),
            cancel.clone(),
        ));
        let client = DashClient::new(
            unit_id,
            manifest_url,
            target_dir,
            self.retry_limit,
            requester,
            self.writer.clone(),
            cancel.clone(),
        )?;

        let unit = self.manager.create_unit(unit_id, DASH_CLIENT_STATE, client, IDLE)?;
        let guard = lock_unit(&unit);
        let request = guard.data().manifest_request();
        info!("({}) Downloading {} into {}", unit_id, request.url, guard.data().target_base().display());
        guard.data().schedule_get(request, 0);

        Ok(cancel)
    }

    /// Stops a running session. Returns false if there is nothing to stop.
    pub fn stop(&self, unit_id: &str) -> bool {
        match self.manager.get_unit(unit_id) {
            Some(unit) => self.manager.fire(DASH_CLIENT_STATE, STOP, &unit).is_some(),
            None => false,
        }
    }

    /// Current state of a live session.
    pub fn state(&self, unit_id: &str) -> Option<String> {
        self.manager
            .get_unit(unit_id)
            .map(|unit| lock_unit(&unit).cur_state().to_owned())
    }

    pub fn session_count(&self) -> usize {
        self.manager.unit_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DashClientError;
    use shared_utils::fsm::FsmError;

    #[tokio::test]
    async fn session_ids_are_unique() {
        let player = DashPlayer::new(3).unwrap();
        let dir = tempfile::tempdir().unwrap();

        // Nothing listens on port 9, the session just retries in the background.
        let first = player.start("s1", "http://127.0.0.1:9/live/a.mpd", dir.path()).unwrap();
        assert!(matches!(
            player.start("s1", "http://127.0.0.1:9/live/a.mpd", dir.path()),
            Err(DashClientError::Fsm(FsmError::DuplicateUnit(_)))
        ));
        assert_eq!(player.session_count(), 1);

        assert!(player.stop("s1"));
        assert!(first.is_cancelled());
        assert!(!player.stop("s1"));
        assert_eq!(player.state("s1"), None);
    }

    #[tokio::test]
    async fn bad_manifest_url_creates_nothing() {
        let player = DashPlayer::new(3).unwrap();
        assert!(matches!(
            player.start("s1", "mailto:nobody", "/tmp"),
            Err(DashClientError::InvalidUrl(_))
        ));
        assert_eq!(player.session_count(), 0);
    }
}
