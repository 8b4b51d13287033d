//! DASH manifest data structures (MPD and related types).
//! Only the facts the download state machine needs are kept: segment template, timing and
//! sequence numbering of each representation.

pub mod manager;
pub mod parser;

pub use manager::MpdManager;

/// A single video/audio representation within an adaptation set.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    /// Unique identifier for the representation.
    pub id: String,
    /// Average bandwidth in bits per second (bps).
    pub bandwidth: u64,
    /// Initialization segment name, `$RepresentationID$` already substituted.
    pub initialization: String,
    /// Media segment name template, `$RepresentationID$` already substituted.
    /// Still contains the `$Number$` placeholder.
    pub media: String,
    /// Duration of each segment in seconds. Derived from `duration / timescale` in SegmentTemplate.
    pub segment_duration: f64,
    /// Timescale used to convert segment timing to seconds.
    pub timescale: u64,
    /// Sequence number of the first media segment.
    pub start_number: u64,
    /// True if a usable SegmentTemplate was resolved for this representation.
    pub has_template: bool,
}

/// An adaptation set groups representations with the same content type (e.g., audio or video).
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    /// Content type of the adaptation set (e.g., "audio" or "video").
    pub content_type: String,
    /// MIME type of the media (e.g., "video/mp4").
    pub mime_type: String,
    /// All representations available in this adaptation set.
    pub representations: Vec<Representation>,
}

/// Top-level metadata parsed from an MPD file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MpdMetadata {
    /// `minBufferTime` in seconds.
    pub min_buffer_time: Option<f64>,
    /// All adaptation sets (audio/video tracks) in the current Period.
    pub adaptation_sets: Vec<AdaptationSet>,
}

impl MpdMetadata {
    /// First video representation that has a segment template.
    pub fn video_representation(&self) -> Option<&Representation> {
        self.adaptation_sets
            .iter()
            .filter(|a| a.content_type == "video")
            .flat_map(|a| a.representations.iter())
            .find(|r| r.has_template)
    }
}
