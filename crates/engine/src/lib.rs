//! scrubline
//!
//! Conversion and preview engine: builds encoder commands from presets,
//! supervises the encoder, caches preview assets, runs chunked preview
//! sessions and watches a folder for new media.

pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod job_executor;
pub mod preset;
pub mod preview;
pub mod probe;
pub mod progress;
pub mod replace;
pub mod runner;
pub mod startup;
pub mod supervisor;
pub mod watch;

pub use scrubline_config as config;
pub use scrubline_config::Config;
pub use concurrency::ConcurrencyPlan;
pub use daemon::{Daemon, DaemonError};
pub use encode::{
    build_command, BuildError, ConversionJob, EncoderCommand, FilterChain, TrimRange,
    VisualStyle, VisualizationRequest,
};
pub use job_executor::{ConversionExecutor, JobError, JobEvent, JobState};
pub use preset::{Preset, Resolution};
pub use preview::{
    ChunkedSession, Composition, PlaybackSurface, PreviewAssets, PreviewCache, PreviewError,
    SessionError,
};
pub use probe::{Prober, SourceFacts};
pub use progress::{ProgressParser, ProgressUpdate};
pub use runner::{CommandRunner, SharedRunner, SystemRunner, ToolError, ToolInvocation};
pub use startup::{run_startup_checks, StartupError, ToolSet};
pub use supervisor::{Outcome, ProcessSupervisor, SupervisorState};
pub use watch::{FolderWatcher, PollReport, WatchError};
