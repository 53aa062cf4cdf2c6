//! Encoder argument construction.
//!
//! Turns a [`ConversionJob`] plus the probed [`SourceFacts`] into a complete
//! ffmpeg argument vector. Bad user input (nonsense trim values, blank
//! comments) is sanitized rather than rejected; only a malformed preset makes
//! the build fail.

use super::filters::{FilterChain, VisualizationRequest};
use crate::preset::Preset;
use crate::probe::SourceFacts;
use crate::replace::staging_path;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Error type for argument construction
#[derive(Debug, Error)]
pub enum BuildError {
    /// A preset flag that takes a value has none.
    #[error("preset {preset} has a dangling {flag} flag")]
    DanglingFlag { preset: &'static str, flag: String },

    /// The destination does not name a file.
    #[error("destination {0} has no file name")]
    InvalidDestination(PathBuf),
}

/// Normalized trim bounds in seconds.
///
/// A negative or non-finite bound unsets both bounds. A zero bound unsets only
/// itself. When both bounds are set but do not describe a positive span,
/// neither is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrimRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

fn is_invalid(value: Option<f64>) -> bool {
    value.is_some_and(|v| !v.is_finite() || v < 0.0)
}

impl TrimRange {
    pub fn new(start: Option<f64>, end: Option<f64>) -> Self {
        if is_invalid(start) || is_invalid(end) {
            return Self::default();
        }
        let start = start.filter(|v| *v > 0.0);
        let end = end.filter(|v| *v > 0.0);
        match (start, end) {
            (Some(s), Some(e)) if e - s <= 0.0 => Self::default(),
            _ => Self { start, end },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Length of the output implied by the trim alone.
    ///
    /// `end - start` when both are set, `end` when only the end is set,
    /// otherwise unknown.
    pub fn effective_duration(&self) -> Option<f64> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(e - s),
            (None, Some(e)) => Some(e),
            _ => None,
        }
    }
}

/// Everything needed to run one conversion.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub source: PathBuf,
    /// Output location without suffix or extension
    pub destination: PathBuf,
    pub preset: &'static Preset,
    pub comment: String,
    pub date_tag: bool,
    pub preserve_metadata: bool,
    pub trim_start: Option<f64>,
    pub trim_end: Option<f64>,
    pub visualization: Option<VisualizationRequest>,
    /// Total duration known by the caller, used for progress when no trim applies
    pub expected_duration: Option<f64>,
}

impl ConversionJob {
    /// A job writing next to the source (or into `output_dir`) under the source's stem.
    pub fn new(source: impl Into<PathBuf>, preset: &'static Preset, output_dir: Option<&Path>) -> Self {
        let source = source.into();
        let destination = default_destination(&source, output_dir);
        Self {
            source,
            destination,
            preset,
            comment: String::new(),
            date_tag: false,
            preserve_metadata: true,
            trim_start: None,
            trim_end: None,
            visualization: None,
            expected_duration: None,
        }
    }

    pub fn trim(&self) -> TrimRange {
        TrimRange::new(self.trim_start, self.trim_end)
    }

    /// Final output path: destination + suffix + extension.
    pub fn output_path(&self) -> Result<PathBuf, BuildError> {
        let (suffix, extension) = match self.visualization {
            Some(_) => ("_waveform", "mp4"),
            None => (self.preset.suffix, self.preset.extension),
        };
        let name = self
            .destination
            .file_name()
            .ok_or_else(|| BuildError::InvalidDestination(self.destination.clone()))?;
        let mut file_name = name.to_os_string();
        file_name.push(format!("{}.{}", suffix, extension));
        Ok(self.destination.with_file_name(file_name))
    }
}

/// Destination without extension: the source stem in `output_dir` or beside the source.
pub fn default_destination(source: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "output".into());
    match output_dir {
        Some(dir) => dir.join(stem),
        None => source.with_file_name(stem),
    }
}

/// A fully resolved encoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderCommand {
    /// Arguments for the encoder binary, staging path last
    pub args: Vec<String>,
    /// Where the finished file ends up
    pub output: PathBuf,
    /// Where the encoder actually writes
    pub staging: PathBuf,
    /// Total length used to turn encoded time into a fraction
    pub effective_duration: Option<f64>,
    pub trim: TrimRange,
}

/// Format seconds without trailing zeros ("5", "2.5", "10.125").
pub fn format_seconds(secs: f64) -> String {
    let text = format!("{:.3}", secs);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Index of the value following `flag` whose value satisfies `pred`.
fn find_pair(args: &[String], flag: &str, pred: impl Fn(&str) -> bool) -> Option<usize> {
    args.windows(2)
        .position(|w| w[0] == flag && pred(w[1].as_str()))
        .map(|i| i + 1)
}

/// Remove every `flag value` pair whose value satisfies `pred`.
fn remove_pairs(args: &mut Vec<String>, flag: &str, pred: impl Fn(&str) -> bool) {
    while let Some(value_idx) = find_pair(args, flag, &pred) {
        args.drain(value_idx - 1..=value_idx);
    }
}

fn check_pairs(preset: &Preset) -> Result<(), BuildError> {
    const SWITCHES: &[&str] = &["-vn", "-an", "-sn", "-dn", "-y", "-n"];
    let args = preset.base_args;
    let mut i = 0;
    while i < args.len() {
        let flag = args[i];
        if SWITCHES.contains(&flag) {
            i += 1;
            continue;
        }
        if args.get(i + 1).is_none() {
            return Err(BuildError::DanglingFlag {
                preset: preset.id,
                flag: flag.to_string(),
            });
        }
        i += 2;
    }
    Ok(())
}

/// Apply deinterlace adaptation and the resolution override to the `-vf` chain.
fn rewrite_video_filters(args: &mut Vec<String>, preset: &Preset, facts: &SourceFacts) {
    let existing = find_pair(args, "-vf", |_| true);
    let mut chain = match existing {
        Some(idx) => {
            let mut chain = FilterChain::parse(&args[idx]);
            chain.adapt_deinterlace(facts.is_interlaced());
            chain
        }
        None => FilterChain::default(),
    };

    if let Some(res) = preset.resolution {
        chain.push(format!(
            "scale=w={}:h={}:force_original_aspect_ratio=decrease:force_divisible_by=2",
            res.width, res.height
        ));
    }

    match (existing, chain.is_empty()) {
        (Some(idx), true) => {
            args.drain(idx - 1..=idx);
        }
        (Some(idx), false) => args[idx] = chain.to_string(),
        (None, false) => {
            args.push("-vf".to_string());
            args.push(chain.to_string());
        }
        (None, true) => {}
    }
}

/// Merge every audio stream into one when extracting all channels.
fn merge_audio_streams(args: &mut Vec<String>, facts: &SourceFacts) {
    let streams = &facts.audio_streams;
    let inputs: String = streams
        .iter()
        .map(|s| format!("[0:a:{}]", s.ordinal))
        .collect();
    let total_channels: u32 = streams.iter().map(|s| s.channels).sum();
    let mut merge = vec![
        "-filter_complex".to_string(),
        format!("{}amerge=inputs={}[aout]", inputs, streams.len()),
        "-map".to_string(),
        "[aout]".to_string(),
    ];

    match find_pair(args, "-map", |v| v.starts_with("0:a")) {
        Some(idx) => {
            args.splice(idx - 1..=idx, merge);
        }
        None => {
            merge.append(args);
            *args = merge;
        }
    }
    if total_channels > 0 {
        args.push("-ac".to_string());
        args.push(total_channels.to_string());
    }
}

fn compose_comment(job: &ConversionJob, today: NaiveDate) -> Option<String> {
    let mut parts = Vec::new();
    if job.date_tag {
        parts.push(today.format("%Y%m%d").to_string());
    }
    let text = job.comment.trim();
    if !text.is_empty() {
        parts.push(text.to_string());
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

/// Global metadata, chapters, encoder tag and the synthesized comment.
fn apply_metadata_policy(args: &mut Vec<String>, job: &ConversionJob, today: NaiveDate) {
    remove_pairs(args, "-map_metadata", |_| true);
    remove_pairs(args, "-map_chapters", |_| true);

    let maps_streams = args.iter().any(|a| a == "-map");
    if job.preserve_metadata {
        if maps_streams {
            args.extend(["-map_metadata", "0", "-map_chapters", "0"].map(String::from));
        }
    } else {
        remove_pairs(args, "-metadata", |v| v.starts_with("encoder="));
        args.extend(
            ["-map_metadata", "-1", "-map_chapters", "-1", "-metadata", "encoder="].map(String::from),
        );
    }

    let Some(comment) = compose_comment(job, today) else {
        return;
    };
    let entry = format!("comment={}", comment);
    match find_pair(args, "-metadata", |v| v.starts_with("comment=")) {
        Some(idx) => {
            args[idx] = entry;
            // Keep the first occurrence only.
            let mut tail = args.split_off(idx + 1);
            remove_pairs(&mut tail, "-metadata", |v| v.starts_with("comment="));
            args.append(&mut tail);
        }
        None => {
            args.push("-metadata".to_string());
            args.push(entry);
        }
    }
}

fn visualization_args(req: &VisualizationRequest) -> Vec<String> {
    let fps = req.fps.to_string();
    let graph = req.filter_graph();
    [
        "-filter_complex",
        graph.as_str(),
        "-map",
        "[vout]",
        "-map",
        "[aout]",
        "-c:v",
        "libx264",
        "-preset",
        "medium",
        "-crf",
        "20",
        "-pix_fmt",
        "yuv420p",
        "-r",
        fps.as_str(),
        "-c:a",
        "aac",
        "-b:a",
        "192k",
        "-movflags",
        "+faststart",
    ]
    .map(String::from)
    .to_vec()
}

/// Build the encoder command for a job.
///
/// Layout: global flags, optional `-ss` (input seek), `-i SOURCE`, trim
/// output bounds, preset or visualization flags, metadata policy, staging path.
pub fn build_command(
    job: &ConversionJob,
    facts: &SourceFacts,
    today: NaiveDate,
) -> Result<EncoderCommand, BuildError> {
    let output = job.output_path()?;
    let staging = staging_path(&output);
    let trim = job.trim();

    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y"].map(String::from).to_vec();
    if let Some(start) = trim.start {
        args.push("-ss".to_string());
        args.push(format_seconds(start));
    }
    args.push("-i".to_string());
    args.push(job.source.to_string_lossy().to_string());

    match (trim.start, trim.end) {
        (Some(_), Some(_)) => {
            if let Some(duration) = trim.effective_duration() {
                args.push("-t".to_string());
                args.push(format_seconds(duration));
            }
        }
        (None, Some(end)) => {
            args.push("-to".to_string());
            args.push(format_seconds(end));
        }
        _ => {}
    }

    let mut body = match &job.visualization {
        Some(req) => visualization_args(req),
        None => {
            check_pairs(job.preset)?;
            let mut body = job.preset.base_args_vec();
            rewrite_video_filters(&mut body, job.preset, facts);
            if job.preset.all_channel_audio && facts.audio_streams.len() > 1 {
                merge_audio_streams(&mut body, facts);
            }
            body
        }
    };
    apply_metadata_policy(&mut body, job, today);

    args.append(&mut body);
    args.push(staging.to_string_lossy().to_string());

    let command = EncoderCommand {
        args,
        output,
        staging,
        effective_duration: trim.effective_duration().or(job.expected_duration),
        trim,
    };
    debug!(preset = job.preset.id, args = ?command.args, "built encoder command");
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::filters::{VisualStyle, FIELD_DEINTERLACER};
    use crate::preset::Resolution;
    use crate::probe::{AudioStreamInfo, VideoColorInfo};
    use proptest::prelude::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    fn preset(id: &str) -> &'static Preset {
        Preset::find(id).unwrap()
    }

    fn job(id: &str) -> ConversionJob {
        ConversionJob::new("/media/in/clip.mov", preset(id), None)
    }

    fn count_pairs(args: &[String], flag: &str, prefix: &str) -> usize {
        args.windows(2)
            .filter(|w| w[0] == flag && w[1].starts_with(prefix))
            .count()
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.windows(2)
            .find(|w| w[0] == flag)
            .map(|w| w[1].as_str())
    }

    fn interlaced(order: &str) -> SourceFacts {
        SourceFacts {
            video: Some(VideoColorInfo {
                field_order: Some(order.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_effective_duration() {
        assert_eq!(TrimRange::new(Some(2.0), Some(10.0)).effective_duration(), Some(8.0));
        assert_eq!(TrimRange::new(None, Some(10.0)).effective_duration(), Some(10.0));
        assert_eq!(TrimRange::new(Some(2.0), None).effective_duration(), None);
    }

    #[test]
    fn test_trim_sanitizes_bad_values() {
        assert!(TrimRange::new(Some(-1.0), Some(f64::NAN)).is_empty());
        assert!(TrimRange::new(Some(0.0), Some(f64::INFINITY)).is_empty());
        assert!(TrimRange::new(Some(-3.0), Some(4.0)).is_empty());
        assert!(TrimRange::new(Some(2.0), Some(-1.0)).is_empty());
        assert!(TrimRange::new(Some(f64::NAN), Some(4.0)).is_empty());
        assert!(TrimRange::new(Some(10.0), Some(2.0)).is_empty());
        // zero only unsets its own bound
        assert_eq!(TrimRange::new(Some(0.0), Some(4.0)), TrimRange { start: None, end: Some(4.0) });
    }

    #[test]
    fn test_negative_start_emits_no_trim_flags() {
        let mut j = job("h264_mp4");
        j.trim_start = Some(-3.0);
        j.trim_end = Some(4.0);
        let cmd = build_command(&j, &SourceFacts::default(), today()).unwrap();
        assert!(!cmd.args.iter().any(|a| a == "-to" || a == "-t" || a == "-ss"));
        assert!(cmd.trim.is_empty());
    }

    #[test]
    fn test_output_path_uses_suffix_and_extension() {
        let j = job("prores_422_mov");
        assert_eq!(j.output_path().unwrap(), PathBuf::from("/media/in/clip_prores422.mov"));

        let j = ConversionJob::new("/media/in/clip.mov", preset("flac"), Some(Path::new("/out")));
        assert_eq!(j.output_path().unwrap(), PathBuf::from("/out/clip.flac"));
    }

    #[test]
    fn test_strip_metadata_with_trim_to_end() {
        let mut j = job("web_comment_mp4");
        j.preserve_metadata = false;
        j.date_tag = true;
        j.comment = "client cut".to_string();
        j.trim_end = Some(5.0);

        let cmd = build_command(&j, &SourceFacts::default(), today()).unwrap();
        let args = &cmd.args;

        assert_eq!(count_pairs(args, "-metadata", "comment="), 1);
        assert_eq!(value_of(args, "-metadata"), Some("comment=20240309 client cut"));
        assert_eq!(value_of(args, "-map_metadata"), Some("-1"));
        assert_eq!(value_of(args, "-map_chapters"), Some("-1"));
        assert_eq!(count_pairs(args, "-metadata", "encoder="), 1);
        assert_eq!(value_of(args, "-to"), Some("5"));
        assert!(!args.iter().any(|a| a == "-ss"));
        assert!(!args.iter().any(|a| a == "-t"));
        assert_eq!(cmd.effective_duration, Some(5.0));
    }

    #[test]
    fn test_comment_replaced_in_place() {
        let mut j = job("web_comment_mp4");
        j.comment = "final".to_string();
        let cmd = build_command(&j, &SourceFacts::default(), today()).unwrap();
        let original = preset("web_comment_mp4")
            .base_args
            .iter()
            .position(|a| a.starts_with("comment="))
            .unwrap();
        let rewritten = cmd.args.iter().position(|a| a == "comment=final").unwrap();
        let input = cmd.args.iter().position(|a| a == "-i").unwrap();
        // Same position relative to the preset body.
        assert_eq!(rewritten, input + 2 + original);
        assert_eq!(count_pairs(&cmd.args, "-metadata", "comment="), 1);
    }

    #[test]
    fn test_no_comment_keeps_preset_entry() {
        let cmd = build_command(&job("web_comment_mp4"), &SourceFacts::default(), today()).unwrap();
        assert_eq!(value_of(&cmd.args, "-metadata"), Some("comment=Exported for web"));
    }

    #[test]
    fn test_preserve_metadata_remaps_only_when_preset_maps() {
        let cmd = build_command(&job("hevc_mp4"), &SourceFacts::default(), today()).unwrap();
        assert_eq!(value_of(&cmd.args, "-map_metadata"), Some("0"));
        assert_eq!(value_of(&cmd.args, "-map_chapters"), Some("0"));

        let cmd = build_command(&job("h264_mp4"), &SourceFacts::default(), today()).unwrap();
        assert!(!cmd.args.iter().any(|a| a == "-map_metadata"));
        assert!(!cmd.args.iter().any(|a| a == "-metadata"));
    }

    #[test]
    fn test_both_bounds_emit_seek_and_duration() {
        let mut j = job("h264_mp4");
        j.trim_start = Some(2.0);
        j.trim_end = Some(10.5);
        let cmd = build_command(&j, &SourceFacts::default(), today()).unwrap();
        let ss = cmd.args.iter().position(|a| a == "-ss").unwrap();
        let input = cmd.args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(value_of(&cmd.args, "-t"), Some("8.5"));
        assert!(!cmd.args.iter().any(|a| a == "-to"));
        assert_eq!(cmd.effective_duration, Some(8.5));
    }

    #[test]
    fn test_expected_duration_fallback() {
        let mut j = job("h264_mp4");
        j.trim_start = Some(3.0);
        j.expected_duration = Some(60.0);
        let cmd = build_command(&j, &SourceFacts::default(), today()).unwrap();
        assert_eq!(cmd.effective_duration, Some(60.0));
    }

    #[test]
    fn test_staging_path_is_last_argument() {
        let cmd = build_command(&job("h264_mp4"), &SourceFacts::default(), today()).unwrap();
        assert_eq!(cmd.args.last().map(PathBuf::from), Some(cmd.staging.clone()));
        assert_eq!(cmd.output, PathBuf::from("/media/in/clip_h264.mp4"));
        assert_ne!(cmd.staging, cmd.output);
    }

    #[test]
    fn test_deinterlace_adaptation() {
        let cmd = build_command(&job("dv_deinterlace_mp4"), &interlaced("tt"), today()).unwrap();
        let vf = value_of(&cmd.args, "-vf").unwrap();
        assert!(vf.starts_with(FIELD_DEINTERLACER));
        assert!(!vf.contains("yadif"));

        let cmd = build_command(&job("dv_deinterlace_mp4"), &interlaced("progressive"), today()).unwrap();
        assert_eq!(value_of(&cmd.args, "-vf"), Some("scale=trunc(iw/2)*2:trunc(ih/2)*2"));

        let cmd = build_command(&job("dv_deinterlace_mp4"), &SourceFacts::default(), today()).unwrap();
        assert!(value_of(&cmd.args, "-vf").unwrap().starts_with("yadif"));
    }

    #[test]
    fn test_presets_without_chain_are_not_deinterlaced() {
        let cmd = build_command(&job("h264_mp4"), &interlaced("tt"), today()).unwrap();
        assert!(!cmd.args.iter().any(|a| a == "-vf"));
    }

    #[test]
    fn test_resolution_override_appends_scale() {
        let cmd = build_command(&job("h264_proxy_mp4"), &SourceFacts::default(), today()).unwrap();
        let vf = value_of(&cmd.args, "-vf").unwrap();
        assert!(vf.starts_with("scale=w=1280:h=720"));
    }

    #[test]
    fn test_multi_stream_audio_merge() {
        let facts = SourceFacts {
            audio_streams: vec![
                AudioStreamInfo { index: 1, ordinal: 0, channels: 2, channel_layout: None },
                AudioStreamInfo { index: 2, ordinal: 1, channels: 6, channel_layout: None },
            ],
            ..Default::default()
        };
        let cmd = build_command(&job("wav_all_channels"), &facts, today()).unwrap();
        assert_eq!(
            value_of(&cmd.args, "-filter_complex"),
            Some("[0:a:0][0:a:1]amerge=inputs=2[aout]")
        );
        assert_eq!(value_of(&cmd.args, "-map"), Some("[aout]"));
        assert_eq!(value_of(&cmd.args, "-ac"), Some("8"));
        assert!(!cmd.args.iter().any(|a| a == "0:a"));
    }

    #[test]
    fn test_single_stream_keeps_simple_map() {
        let facts = SourceFacts {
            audio_streams: vec![AudioStreamInfo { index: 1, ordinal: 0, channels: 2, channel_layout: None }],
            ..Default::default()
        };
        let cmd = build_command(&job("wav_all_channels"), &facts, today()).unwrap();
        assert_eq!(value_of(&cmd.args, "-map"), Some("0:a"));
        assert!(!cmd.args.iter().any(|a| a == "-filter_complex"));
    }

    #[test]
    fn test_visualization_ignores_preset() {
        let mut j = job("prores_422_mov");
        j.visualization = Some(VisualizationRequest::new(
            VisualStyle::Spectrogram,
            Resolution::new(1920, 1080),
            30,
        ));
        let cmd = build_command(&j, &SourceFacts::default(), today()).unwrap();
        assert!(!cmd.args.iter().any(|a| a == "prores_ks"));
        assert!(value_of(&cmd.args, "-filter_complex").unwrap().contains("showspectrum"));
        let maps: Vec<&str> = cmd
            .args
            .windows(2)
            .filter(|w| w[0] == "-map")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(maps, vec!["[vout]", "[aout]"]);
        assert_eq!(cmd.output, PathBuf::from("/media/in/clip_waveform.mp4"));
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(5.0), "5");
        assert_eq!(format_seconds(2.5), "2.5");
        assert_eq!(format_seconds(10.125), "10.125");
    }

    fn bound() -> impl Strategy<Value = Option<f64>> {
        prop_oneof![
            Just(None),
            Just(Some(f64::NAN)),
            Just(Some(f64::INFINITY)),
            (-100.0f64..100.0).prop_map(Some),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_trim_normalization(start in bound(), end in bound()) {
            let trim = TrimRange::new(start, end);
            for value in [trim.start, trim.end].into_iter().flatten() {
                prop_assert!(value.is_finite() && value > 0.0);
            }
            let invalid = |v: Option<f64>| v.is_some_and(|v| !v.is_finite() || v < 0.0);
            if invalid(start) || invalid(end) {
                prop_assert!(trim.is_empty());
            }
            if start.map_or(true, |s| s <= 0.0) {
                prop_assert_eq!(trim.start, None);
            }
            if end.map_or(true, |e| e <= 0.0) {
                prop_assert_eq!(trim.end, None);
            }

            let mut j = job("h264_mp4");
            j.trim_start = start;
            j.trim_end = end;
            let cmd = build_command(&j, &SourceFacts::default(), today()).unwrap();
            match value_of(&cmd.args, "-t") {
                Some(_) => prop_assert!(trim.effective_duration().is_some_and(|d| d > 0.0)),
                None => prop_assert!(trim.start.is_none() || trim.end.is_none()),
            }
            if let Some(d) = cmd.effective_duration {
                prop_assert!(d > 0.0);
            }
        }
    }
}
