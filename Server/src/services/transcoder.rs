use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Launches the external process that turns a live source into a DASH manifest.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn launch(&self, unit_id: &str, source_uri: &str, output_path: &Path) -> io::Result<TranscodeHandle>;
}

/// A running transcode. Stopping it kills and reaps the process.
#[derive(Debug)]
pub struct TranscodeHandle {
    unit_id: String,
    child: Option<Child>,
}

impl TranscodeHandle {
    pub fn new(unit_id: &str, child: Child) -> Self {
        Self {
            unit_id: unit_id.to_owned(),
            child: Some(child),
        }
    }

    /// A handle with no process behind it.
    pub fn detached(unit_id: &str) -> Self {
        Self {
            unit_id: unit_id.to_owned(),
            child: None,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub async fn stop(&mut self) -> io::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            debug!("({}) Transcoder already exited: {}", self.unit_id, status);
            return Ok(());
        }
        child.kill().await?;
        info!("({}) Transcoder stopped", self.unit_id);
        Ok(())
    }
}

/// Runs `ffmpeg`, copying the source streams into a live DASH presentation.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, source_uri: &str, output_path: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["-hide_banner", "-loglevel", "warning", "-re", "-i", source_uri])
            .args(["-c", "copy", "-f", "dash"])
            .args(["-seg_duration", "1", "-window_size", "5", "-streaming", "1"])
            .args(["-remove_at_exit", "1"])
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn launch(&self, unit_id: &str, source_uri: &str, output_path: &Path) -> io::Result<TranscodeHandle> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut child = self.command(source_uri, output_path).spawn()?;
        info!(
            "({}) Transcoder started (pid={:?}, source={}, output={})",
            unit_id,
            child.id(),
            source_uri,
            output_path.display()
        );

        if let Some(stderr) = child.stderr.take() {
            let unit_id = unit_id.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => debug!("({}) ffmpeg: {}", unit_id, line),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("({}) Failed to read transcoder output: {}", unit_id, e);
                            break;
                        }
                    }
                }
            });
        }

        Ok(TranscodeHandle::new(unit_id, child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_handles_stop_cleanly() {
        let mut handle = TranscodeHandle::detached("u1");
        assert_eq!(handle.id(), None);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FfmpegTranscoder::new(dir.path().join("no-such-ffmpeg"));
        let output = dir.path().join("stream1/stream1.mpd");

        let result = transcoder.launch("u1", "rtmp://127.0.0.1:1940/stream1.mp4", &output).await;
        assert!(result.is_err());
        assert!(output.parent().unwrap().is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_and_reaps_the_process() {
        let child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        let mut handle = TranscodeHandle::new("u1", child);
        assert!(handle.id().is_some());

        handle.stop().await.unwrap();
        assert_eq!(handle.id(), None);
        handle.stop().await.unwrap();
    }
}
