//! Encoder command construction for scrubline

pub mod args;
pub mod filters;

pub use args::{
    build_command, default_destination, format_seconds, BuildError, ConversionJob, EncoderCommand,
    TrimRange,
};
pub use filters::{FilterChain, VisualStyle, VisualizationRequest};
