use clap::{Parser, Subcommand};
use scrubline::{Resolution, VisualStyle};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "scrubline")]
#[command(author, version, about = "Preset-driven media conversion with scrub previews")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "scrubline.toml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert one file with a preset
    Convert {
        source: PathBuf,

        /// Preset identifier (see `scrubline presets`)
        #[arg(short, long)]
        preset: String,

        /// Output directory (defaults to the configured one, then the source's)
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Free-text comment written to the output's metadata
        #[arg(long, default_value = "")]
        comment: String,

        /// Prefix the comment with today's date (yyyyMMdd)
        #[arg(long)]
        date_tag: bool,

        /// Keep global metadata and chapters
        #[arg(long)]
        keep_metadata: bool,

        /// Trim start in seconds
        #[arg(long)]
        start: Option<f64>,

        /// Trim end in seconds
        #[arg(long)]
        end: Option<f64>,

        /// Render the audio as a waveform video instead of using the preset
        #[arg(long, value_name = "STYLE")]
        visualize: Option<VisualStyle>,

        /// Visualization frame size
        #[arg(long, default_value = "1280x720", value_name = "WxH")]
        size: Resolution,

        /// Visualization frame rate
        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// Loudness-normalize the visualized audio
        #[arg(long)]
        normalize: bool,
    },

    /// List the preset catalog
    Presets,

    /// Generate (or read from cache) the preview assets of a file, printed as JSON
    Assets { source: PathBuf },

    /// Play a file through a chunked preview session and print the final timeline
    Scrub {
        source: PathBuf,

        /// Positions (seconds) to seek to after activation
        #[arg(long = "at", value_name = "SECONDS")]
        positions: Vec<f64>,
    },

    /// Inspect or clean the preview cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Watch a folder and convert files once they stop growing
    Watch {
        /// Folder to watch (overrides `[watch].dir`)
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum CacheAction {
    /// Print the cache size in bytes
    Size,
    /// Apply the configured retention policy now
    Clean,
    /// Remove every cache entry
    Purge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_convert_arguments() {
        let cli = Cli::parse_from([
            "scrubline", "convert", "in.mov", "--preset", "hevc_mp4", "--end", "5",
            "--visualize", "spectrogram", "--size", "640x360",
        ]);
        match cli.command {
            Commands::Convert {
                preset,
                end,
                visualize,
                size,
                keep_metadata,
                ..
            } => {
                assert_eq!(preset, "hevc_mp4");
                assert_eq!(end, Some(5.0));
                assert_eq!(visualize, Some(VisualStyle::Spectrogram));
                assert_eq!(size, Resolution::new(640, 360));
                assert!(!keep_metadata);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cache_and_watch() {
        let cli = Cli::parse_from(["scrubline", "-v", "cache", "purge"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Cache { action: CacheAction::Purge }));

        let cli = Cli::parse_from(["scrubline", "watch"]);
        assert!(matches!(cli.command, Commands::Watch { dir: None }));
    }
}
