// mpd/manager.rs

use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::debug;

use crate::error::{DashClientError, DashClientResult};
use crate::mpd::{parser::parse_mpd, MpdMetadata};
use crate::segment::writer::SegmentWriter;

/// Segment naming oracle for one parsed manifest.
///
/// Holds the video facts the download loop needs. Everything is fixed at construction except the
/// media sequence number, which only moves forward. A refreshed manifest means a new manager.
pub struct MpdManager {
    representation_id: String,
    init_segment_name: String,
    media_template: String,
    // Durations in microseconds.
    video_segment_duration: i64,
    min_buffer_time: i64,
    start_number: u64,
    video_segment_seq_num: u64,
    writer: Arc<dyn SegmentWriter>,
}

impl std::fmt::Debug for MpdManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpdManager")
            .field("representation_id", &self.representation_id)
            .field("init_segment_name", &self.init_segment_name)
            .field("media_template", &self.media_template)
            .field("video_segment_duration", &self.video_segment_duration)
            .field("min_buffer_time", &self.min_buffer_time)
            .field("start_number", &self.start_number)
            .field("video_segment_seq_num", &self.video_segment_seq_num)
            .finish()
    }
}

impl MpdManager {
    pub fn new(metadata: &MpdMetadata, writer: Arc<dyn SegmentWriter>) -> DashClientResult<Self> {
        let representation = metadata
            .video_representation()
            .ok_or(DashClientError::NoVideoRepresentation)?;

        if representation.media.contains("$Time$") {
            return Err(DashClientError::UnsupportedTemplate(representation.media.clone()));
        }

        let manager = Self {
            representation_id: representation.id.clone(),
            init_segment_name: representation.initialization.clone(),
            media_template: representation.media.clone(),
            video_segment_duration: seconds_to_micros(representation.segment_duration),
            min_buffer_time: metadata.min_buffer_time.map(seconds_to_micros).unwrap_or(0),
            start_number: representation.start_number,
            video_segment_seq_num: representation.start_number,
            writer,
        };
        debug!("{:?}", manager);
        Ok(manager)
    }

    pub fn parse(xml: &str, writer: Arc<dyn SegmentWriter>) -> DashClientResult<Self> {
        Self::new(&parse_mpd(xml)?, writer)
    }

    pub fn representation_id(&self) -> &str {
        &self.representation_id
    }

    /// Video segment duration in microseconds.
    ///
    /// The padded variant adds the manifest's `minBufferTime` and is only meant for the wait
    /// before the very first init segment request. A duration that is not positive disables
    /// pacing, padded or not.
    pub fn video_segment_duration(&self, pad: bool) -> i64 {
        if pad && self.video_segment_duration > 0 {
            self.video_segment_duration.saturating_add(self.min_buffer_time)
        } else {
            self.video_segment_duration
        }
    }

    pub fn video_init_segment_name(&self) -> &str {
        &self.init_segment_name
    }

    pub fn start_number(&self) -> u64 {
        self.start_number
    }

    pub fn video_segment_seq_num(&self) -> u64 {
        self.video_segment_seq_num
    }

    /// Name of the media segment for the current sequence number.
    pub fn video_media_segment_name(&self) -> String {
        replace_number_format(&self.media_template, self.video_segment_seq_num)
    }

    /// Moves to the next media segment. `None` once the sequence number space is exhausted, in
    /// which case the number stays where it is.
    pub fn inc_and_get_video_segment_seq_num(&mut self) -> Option<u64> {
        self.video_segment_seq_num = self.video_segment_seq_num.checked_add(1)?;
        Some(self.video_segment_seq_num)
    }

    pub fn make_init_segment(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.writer.write_segment(path, data)
    }

    pub fn make_media_segment(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.writer.write_segment(path, data)
    }
}

fn seconds_to_micros(seconds: f64) -> i64 {
    (seconds * 1_000_000.0).round() as i64
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$Number(?::%0(\d+)d|%0(\d+)d)?\$").expect("number placeholder pattern is valid")
    })
}

fn replace_number_format(template: &str, segment_number: u64) -> String {
    number_pattern()
        .replace_all(template, |caps: &regex::Captures| {
            if let Some(width) = caps.get(1).or_else(|| caps.get(2)) {
                format!(
                    "{:0width$}",
                    segment_number,
                    width = width.as_str().parse::<usize>().unwrap_or(1)
                )
            } else {
                segment_number.to_string()
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpd::{AdaptationSet, Representation};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWriter(Mutex<Vec<(PathBuf, Vec<u8>)>>);

    impl SegmentWriter for RecordingWriter {
        fn write_segment(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().push((path.to_path_buf(), data.to_vec()));
            Ok(())
        }
    }

    fn metadata(media: &str, duration: f64, start_number: u64) -> MpdMetadata {
        MpdMetadata {
            min_buffer_time: Some(0.5),
            adaptation_sets: vec![AdaptationSet {
                content_type: "video".to_owned(),
                mime_type: "video/mp4".to_owned(),
                representations: vec![Representation {
                    id: "0".to_owned(),
                    bandwidth: 1,
                    initialization: "init-stream0.m4s".to_owned(),
                    media: media.to_owned(),
                    segment_duration: duration,
                    timescale: 1,
                    start_number,
                    has_template: true,
                }],
            }],
        }
    }

    #[test]
    fn sequence_numbers_advance_by_one_from_start_number() {
        let writer = Arc::new(RecordingWriter::default());
        let mut manager =
            MpdManager::new(&metadata("chunk-stream0-$Number%05d$.m4s", 2.0, 7), writer).unwrap();

        assert_eq!(manager.video_segment_seq_num(), 7);
        assert_eq!(manager.video_media_segment_name(), "chunk-stream0-00007.m4s");
        // Naming is a pure function of the sequence number.
        assert_eq!(manager.video_media_segment_name(), "chunk-stream0-00007.m4s");

        let mut previous = manager.video_segment_seq_num();
        for _ in 0..100 {
            let next = manager.inc_and_get_video_segment_seq_num().unwrap();
            assert_eq!(next, previous + 1);
            previous = next;
        }
        assert_eq!(manager.video_media_segment_name(), "chunk-stream0-00107.m4s");
        assert_eq!(manager.start_number(), 7);
    }

    #[test]
    fn durations_are_in_microseconds() {
        let writer = Arc::new(RecordingWriter::default());
        let manager = MpdManager::new(&metadata("$Number$.m4s", 2.0, 1), writer).unwrap();
        assert_eq!(manager.video_segment_duration(false), 2_000_000);
        assert_eq!(manager.video_segment_duration(true), 2_500_000);
        assert_eq!(manager.video_init_segment_name(), "init-stream0.m4s");
    }

    #[test]
    fn huge_values_saturate_instead_of_overflowing() {
        let writer = Arc::new(RecordingWriter::default());
        let mut huge = metadata("$Number$.m4s", 1e300, u64::MAX);
        huge.min_buffer_time = Some(1e300);
        let mut manager = MpdManager::new(&huge, writer).unwrap();

        assert_eq!(manager.video_segment_duration(false), i64::MAX);
        assert_eq!(manager.video_segment_duration(true), i64::MAX);
        assert_eq!(manager.inc_and_get_video_segment_seq_num(), None);
        assert_eq!(manager.video_segment_seq_num(), u64::MAX);
        assert_eq!(manager.video_media_segment_name(), "18446744073709551615.m4s");
    }

    #[test]
    fn zero_duration_is_not_padded() {
        let writer = Arc::new(RecordingWriter::default());
        let manager = MpdManager::new(&metadata("$Number$.m4s", 0.0, 1), writer).unwrap();
        assert_eq!(manager.video_segment_duration(false), 0);
        assert_eq!(manager.video_segment_duration(true), 0);
    }

    #[test]
    fn number_placeholders() {
        assert_eq!(replace_number_format("seg-$Number$.m4s", 42), "seg-42.m4s");
        assert_eq!(replace_number_format("seg-$Number%03d$.m4s", 42), "seg-042.m4s");
        assert_eq!(replace_number_format("seg-$Number:%06d$.m4s", 42), "seg-000042.m4s");
        assert_eq!(replace_number_format("static.m4s", 42), "static.m4s");
    }

    #[test]
    fn time_based_templates_are_rejected() {
        let writer = Arc::new(RecordingWriter::default());
        assert!(matches!(
            MpdManager::new(&metadata("$Time$.m4s", 2.0, 1), writer.clone()),
            Err(DashClientError::UnsupportedTemplate(_))
        ));
        assert!(matches!(
            MpdManager::new(&MpdMetadata::default(), writer),
            Err(DashClientError::NoVideoRepresentation)
        ));
    }

    #[test]
    fn segments_go_through_the_writer() {
        let writer = Arc::new(RecordingWriter::default());
        let manager = MpdManager::new(&metadata("$Number$.m4s", 1.0, 1), writer.clone()).unwrap();
        manager.make_init_segment(Path::new("/tmp/init.m4s"), b"init").unwrap();
        manager.make_media_segment(Path::new("/tmp/1.m4s"), b"media").unwrap();

        let written = writer.0.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], (PathBuf::from("/tmp/init.m4s"), b"init".to_vec()));
        assert_eq!(written[1].1, b"media");
    }
}
