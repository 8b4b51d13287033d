// File: args.rs
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use dash_client::DEFAULT_RETRY_LIMIT;
use tracing::level_filters::LevelFilter;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogLevel {
    Trace = 0, // Designates very fine-grained informational events, extremely verbose.
    Debug = 1, // Designates fine-grained informational events.
    Info = 2, // Designates informational messages.
    Warn = 3, // Designates hazardous situations.
    Error = 4, // Designates very serious errors.
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = "A headless client that downloads a live DASH stream to disk.")]
pub struct Args {
    /// Manifest of the stream to download
    #[arg(short, long, default_value = "http://localhost:3001/stream1.mp4/stream1.mpd")]
    pub manifest_url: String,
    /// Directory the manifest and segments are written into
    #[arg(short, long, default_value = "./download")]
    pub target_dir: PathBuf,
    /// Failed requests tolerated per resource kind before the session stops
    #[arg(short, long, default_value_t = DEFAULT_RETRY_LIMIT)]
    pub retry_limit: u32,
    /// Control channel of the server; when set, the stream is registered before downloading
    #[arg(short, long)]
    pub control_server: Option<SocketAddr>,
    #[arg(long, default_value = "127.0.0.1")]
    pub source_ip: String,
    #[arg(short, long, default_value = "stream1.mp4")]
    pub uri: String,
    /// Lifetime of the registration in seconds, 0 for none
    #[arg(short, long, default_value_t = 0)]
    pub expires: u64,
    /// Seconds to wait for a control response
    #[arg(long, default_value_t = 5)]
    pub control_timeout: u64,
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

impl Args {
    /// Name of the local download session.
    pub fn session_id(&self) -> String {
        format!("{}:{}", self.source_ip, self.uri)
    }
}

pub fn parse_args() -> Args {
    Args::parse()
}

pub fn get_log_level_filter(args: &Args) -> LevelFilter {
    // Map the LogLevel enum to the LevelFilter enum
    match args.log_level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["dash-receiver"]).unwrap();
        assert_eq!(args.retry_limit, 3);
        assert_eq!(args.control_server, None);
        assert_eq!(args.expires, 0);
        assert_eq!(get_log_level_filter(&args), LevelFilter::INFO);
        assert_eq!(args.session_id(), "127.0.0.1:stream1.mp4");
    }

    #[test]
    fn registration_options() {
        let args = Args::try_parse_from([
            "dash-receiver",
            "--control-server",
            "10.0.0.1:5000",
            "--source-ip",
            "10.0.0.5",
            "-u",
            "live/cam.mp4",
            "-e",
            "60",
            "-l",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.control_server, Some("10.0.0.1:5000".parse().unwrap()));
        assert_eq!(args.session_id(), "10.0.0.5:live/cam.mp4");
        assert_eq!(args.expires, 60);
        assert_eq!(get_log_level_filter(&args), LevelFilter::DEBUG);
    }

    #[test]
    fn bad_control_address_is_rejected() {
        assert!(Args::try_parse_from(["dash-receiver", "-c", "not-an-address"]).is_err());
    }
}
