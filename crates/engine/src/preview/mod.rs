//! Preview assets and chunked preview playback.

pub mod cache;
pub mod chunked;
pub mod cleanup;
pub mod color;
pub mod fingerprint;
pub mod manifest;
pub mod timeline;

pub use cache::{filmstrip_times, PreviewAssets, PreviewCache, PreviewError, PreviewSettings};
pub use chunked::{ChunkedSession, Composition, PlaybackSurface, SessionError, SessionSettings};
pub use cleanup::CleanupReport;
pub use color::ColorAdaptation;
pub use fingerprint::SourceFingerprint;
pub use manifest::CacheManifest;
pub use timeline::{build_timeline, ChunkLayout, SegmentSource, Timeline, TimelineSegment};
