//! Download state machine, expressed as data for the generic engine.
//!
//! ```text
//! IDLE --GET_MPD_DONE--> MPD_DONE --GET_INIT_SEG--> INIT_SEG_DONE --GET_MEDIA_SEG--> MEDIA_SEG_LOOP
//!                                                                                    |  ^
//!                                                                                    +--+ GET_MEDIA_SEG
//! any --STOP--> STOPPED
//! ```

use shared_utils::fsm::{FsmResult, StateManager, StateUnit};
use tracing::{debug, warn};

use crate::client::DashClient;
use crate::segment::fetcher::SegmentRequest;

pub const DASH_CLIENT_STATE: &str = "DashClientState";

pub const IDLE: &str = "IDLE";
pub const MPD_DONE: &str = "MPD_DONE";
pub const INIT_SEG_DONE: &str = "INIT_SEG_DONE";
pub const MEDIA_SEG_LOOP: &str = "MEDIA_SEG_LOOP";
pub const STOPPED: &str = "STOPPED";

pub const GET_MPD_DONE: &str = "GET_MPD_DONE";
pub const GET_INIT_SEG: &str = "GET_INIT_SEG";
pub const GET_MEDIA_SEG: &str = "GET_MEDIA_SEG";
pub const STOP: &str = "STOP";

/// Registers the `DashClientState` handler with its states and transitions.
pub fn register_dash_client_state(manager: &StateManager<DashClient>) -> FsmResult<()> {
    manager.add_state_handler(DASH_CLIENT_STATE)?;

    manager.register_state(DASH_CLIENT_STATE, IDLE, true, false)?;
    manager.register_state(DASH_CLIENT_STATE, MPD_DONE, false, false)?;
    manager.register_state(DASH_CLIENT_STATE, INIT_SEG_DONE, false, false)?;
    manager.register_state(DASH_CLIENT_STATE, MEDIA_SEG_LOOP, false, false)?;
    manager.register_state(DASH_CLIENT_STATE, STOPPED, false, true)?;

    manager.register_callback(DASH_CLIENT_STATE, IDLE, GET_MPD_DONE, on_mpd_done)?;
    manager.register_callback(DASH_CLIENT_STATE, MPD_DONE, GET_INIT_SEG, on_init_segment)?;
    manager.register_callback(DASH_CLIENT_STATE, INIT_SEG_DONE, GET_MEDIA_SEG, on_media_segment)?;
    manager.register_callback(DASH_CLIENT_STATE, MEDIA_SEG_LOOP, GET_MEDIA_SEG, on_media_segment)?;

    for state in [IDLE, MPD_DONE, INIT_SEG_DONE, MEDIA_SEG_LOOP] {
        manager.register_callback(DASH_CLIENT_STATE, state, STOP, on_stop)?;
    }

    Ok(())
}

/// Manifest parsed: wait one (padded) segment duration, then fetch the init segment.
fn on_mpd_done(unit: &mut StateUnit<DashClient>) -> Option<String> {
    let client = unit.data();
    let Some(mpd) = client.mpd() else {
        warn!("({}) GET_MPD_DONE without a parsed manifest", client.unit_id());
        return None;
    };
    let delay = mpd.video_segment_duration(true);

    let request = client_request(client, client.init_request())?;
    debug!("({}) Init segment {} in {}us", client.unit_id(), request.url, delay);
    client.schedule_get(request, delay);
    Some(MPD_DONE.to_owned())
}

/// Init segment stored: fetch the first media segment right away.
fn on_init_segment(unit: &mut StateUnit<DashClient>) -> Option<String> {
    let client = unit.data();
    let request = client_request(client, client.media_request())?;
    debug!("({}) First media segment {}", client.unit_id(), request.url);
    client.schedule_get(request, 0);
    Some(INIT_SEG_DONE.to_owned())
}

/// Media segment stored: advance the sequence number and fetch the next one a segment later.
fn on_media_segment(unit: &mut StateUnit<DashClient>) -> Option<String> {
    let client = unit.data_mut();
    let unit_id = client.unit_id().to_owned();
    let Some(mpd) = client.mpd_mut() else {
        warn!("({}) GET_MEDIA_SEG without a parsed manifest", unit_id);
        return None;
    };
    let Some(seq) = mpd.inc_and_get_video_segment_seq_num() else {
        warn!("({}) Media sequence numbers exhausted. Stopping.", unit_id);
        client.stop();
        return Some(STOPPED.to_owned());
    };
    let delay = mpd.video_segment_duration(false);

    let client = unit.data();
    let request = client_request(client, client.media_request())?;
    debug!("({}) Media segment #{} {} in {}us", unit_id, seq, request.url, delay);
    client.schedule_get(request, delay);
    Some(MEDIA_SEG_LOOP.to_owned())
}

fn on_stop(unit: &mut StateUnit<DashClient>) -> Option<String> {
    unit.data_mut().stop();
    Some(STOPPED.to_owned())
}

fn client_request(
    client: &DashClient,
    request: crate::error::DashClientResult<Option<SegmentRequest>>,
) -> Option<SegmentRequest> {
    match request {
        Ok(Some(request)) => Some(request),
        Ok(None) => {
            warn!("({}) No manifest to build the request from", client.unit_id());
            None
        }
        Err(e) => {
            warn!("({}) Failed to build request: {}", client.unit_id(), e);
            None
        }
    }
}
