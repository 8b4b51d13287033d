// config.rs

use clap::ValueEnum;

pub const RTMP_PREFIX: &str = "rtmp://";
pub const HTTP_PREFIX: &str = "http://";
pub const DASH_POSTFIX: &str = ".mpd";

/// Where live sources are pulled from when a session starts.
#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum StreamingBackend {
    /// Pull from an RTMP publish endpoint.
    Rtmp,
    /// Pull from an HTTP (DASH re-encode) endpoint.
    Dash,
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub streaming: Option<StreamingBackend>,
    pub rtmp_publish_ip: String,
    pub rtmp_publish_port: u16,
    pub http_target_ip: String,
    pub http_target_port: u16,
}

impl BackendConfig {
    /// Base network address of the configured backend, e.g. `rtmp://127.0.0.1:1940`.
    ///
    /// `None` if no backend is selected or the selected one has no host.
    pub fn network_path(&self) -> Option<String> {
        match self.streaming? {
            StreamingBackend::Rtmp if !self.rtmp_publish_ip.is_empty() => Some(format!(
                "{}{}:{}",
                RTMP_PREFIX, self.rtmp_publish_ip, self.rtmp_publish_port
            )),
            StreamingBackend::Dash if !self.http_target_ip.is_empty() => Some(format!(
                "{}{}:{}",
                HTTP_PREFIX, self.http_target_ip, self.http_target_port
            )),
            _ => None,
        }
    }
}
