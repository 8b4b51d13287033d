//! Live DASH download client.
//!
//! A [`DashPlayer`] runs download sessions. Each session is a unit of the `DashClientState`
//! machine that walks from the manifest to the init segment and then loops over media segments.

pub mod client;
pub mod error;
pub mod mpd;
pub mod player;
pub mod router;
pub mod segment;
pub mod state;

pub use client::{DashClient, DEFAULT_RETRY_LIMIT};
pub use error::{DashClientError, DashClientResult};
pub use mpd::MpdManager;
pub use player::DashPlayer;
