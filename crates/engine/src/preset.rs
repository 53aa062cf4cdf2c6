//! Export preset catalog.
//!
//! A preset is immutable policy: the encoder flags placed after the input,
//! the container extension, the filename suffix, and which tracks the output
//! is expected to carry.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Output frame size override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("invalid size '{}', expected WIDTHxHEIGHT", s))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("invalid width in '{}'", s))?;
        let height: u32 = h.trim().parse().map_err(|_| format!("invalid height in '{}'", s))?;
        if width == 0 || height == 0 {
            return Err(format!("size '{}' must be non-zero", s));
        }
        Ok(Self { width, height })
    }
}

/// A named bundle of encoder policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preset {
    pub id: &'static str,
    pub label: &'static str,
    /// Container extension without the dot
    pub extension: &'static str,
    /// Appended to the destination stem
    pub suffix: &'static str,
    pub expects_video: bool,
    pub expects_audio: bool,
    /// Uncompressed extraction of every audio channel into one stream
    pub all_channel_audio: bool,
    /// Encoder flags placed after the input, in order
    pub base_args: &'static [&'static str],
    pub resolution: Option<Resolution>,
}

const EVEN_DIMENSIONS: &str = "scale=trunc(iw/2)*2:trunc(ih/2)*2";

static CATALOG: &[Preset] = &[
    Preset {
        id: "h264_mp4",
        label: "H.264 MP4",
        extension: "mp4",
        suffix: "_h264",
        expects_video: true,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &[
            "-c:v", "libx264", "-preset", "medium", "-crf", "18", "-pix_fmt", "yuv420p",
            "-c:a", "aac", "-b:a", "256k", "-movflags", "+faststart",
        ],
        resolution: None,
    },
    Preset {
        id: "hevc_mp4",
        label: "HEVC 10-bit MP4",
        extension: "mp4",
        suffix: "_hevc",
        expects_video: true,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &[
            "-map", "0:v:0", "-map", "0:a?", "-c:v", "libx265", "-preset", "medium", "-crf",
            "22", "-tag:v", "hvc1", "-vf", EVEN_DIMENSIONS, "-pix_fmt", "yuv420p10le", "-c:a",
            "aac", "-b:a", "256k", "-movflags", "+faststart",
        ],
        resolution: None,
    },
    Preset {
        id: "h264_proxy_mp4",
        label: "H.264 720p proxy",
        extension: "mp4",
        suffix: "_proxy",
        expects_video: true,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &[
            "-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-pix_fmt", "yuv420p",
            "-c:a", "aac", "-b:a", "160k", "-movflags", "+faststart",
        ],
        resolution: Some(Resolution::new(1280, 720)),
    },
    Preset {
        id: "prores_422_mov",
        label: "ProRes 422 MOV",
        extension: "mov",
        suffix: "_prores422",
        expects_video: true,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &[
            "-map", "0:v:0", "-map", "0:a?", "-c:v", "prores_ks", "-profile:v", "2", "-vendor",
            "apl0", "-pix_fmt", "yuv422p10le", "-c:a", "pcm_s24le",
        ],
        resolution: None,
    },
    Preset {
        id: "prores_proxy_mov",
        label: "ProRes Proxy MOV",
        extension: "mov",
        suffix: "_proxy",
        expects_video: true,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &[
            "-map", "0:v:0", "-map", "0:a?", "-c:v", "prores_ks", "-profile:v", "0", "-vendor",
            "apl0", "-pix_fmt", "yuv422p10le", "-c:a", "pcm_s16le",
        ],
        resolution: None,
    },
    Preset {
        id: "dnxhr_hq_mov",
        label: "DNxHR HQ MOV",
        extension: "mov",
        suffix: "_dnxhr",
        expects_video: true,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &[
            "-c:v", "dnxhd", "-profile:v", "dnxhr_hq", "-pix_fmt", "yuv422p", "-c:a",
            "pcm_s16le",
        ],
        resolution: None,
    },
    Preset {
        id: "dv_deinterlace_mp4",
        label: "Deinterlaced H.264 MP4",
        extension: "mp4",
        suffix: "_deint",
        expects_video: true,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &[
            "-c:v", "libx264", "-preset", "medium", "-crf", "18", "-vf",
            "yadif=0:-1:0,scale=trunc(iw/2)*2:trunc(ih/2)*2", "-pix_fmt", "yuv420p", "-c:a",
            "aac", "-b:a", "192k", "-movflags", "+faststart",
        ],
        resolution: None,
    },
    Preset {
        id: "web_comment_mp4",
        label: "Web H.264 MP4",
        extension: "mp4",
        suffix: "_web",
        expects_video: true,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &[
            "-c:v", "libx264", "-preset", "slow", "-crf", "20", "-pix_fmt", "yuv420p", "-c:a",
            "aac", "-b:a", "192k", "-metadata", "comment=Exported for web", "-movflags",
            "+faststart",
        ],
        resolution: None,
    },
    Preset {
        id: "aac_m4a",
        label: "AAC audio",
        extension: "m4a",
        suffix: "",
        expects_video: false,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &["-vn", "-c:a", "aac", "-b:a", "256k"],
        resolution: None,
    },
    Preset {
        id: "mp3_320",
        label: "MP3 320k",
        extension: "mp3",
        suffix: "",
        expects_video: false,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &["-vn", "-c:a", "libmp3lame", "-b:a", "320k"],
        resolution: None,
    },
    Preset {
        id: "flac",
        label: "FLAC lossless",
        extension: "flac",
        suffix: "",
        expects_video: false,
        expects_audio: true,
        all_channel_audio: false,
        base_args: &["-vn", "-c:a", "flac"],
        resolution: None,
    },
    Preset {
        id: "wav_all_channels",
        label: "WAV, all channels",
        extension: "wav",
        suffix: "_allch",
        expects_video: false,
        expects_audio: true,
        all_channel_audio: true,
        base_args: &["-vn", "-map", "0:a", "-c:a", "pcm_s24le"],
        resolution: None,
    },
];

impl Preset {
    /// Every built-in preset, in display order.
    pub fn all() -> &'static [Preset] {
        CATALOG
    }

    /// Look up a preset by identifier (case-insensitive).
    pub fn find(id: &str) -> Option<&'static Preset> {
        let id = id.trim();
        CATALOG.iter().find(|p| p.id.eq_ignore_ascii_case(id))
    }

    /// Base flags as owned strings, ready for rewriting.
    pub fn base_args_vec(&self) -> Vec<String> {
        self.base_args.iter().map(|s| s.to_string()).collect()
    }

    /// Whether the preset selects streams explicitly with `-map`.
    pub fn maps_streams(&self) -> bool {
        self.base_args.iter().any(|a| *a == "-map")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<_> = Preset::all().iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), Preset::all().len());
    }

    #[test]
    fn test_find_is_case_insensitive() {
        assert_eq!(Preset::find("H264_MP4").map(|p| p.id), Some("h264_mp4"));
        assert_eq!(Preset::find(" flac ").map(|p| p.id), Some("flac"));
        assert!(Preset::find("vp9_webm").is_none());
    }

    #[test]
    fn test_flag_pairs_are_complete() {
        // Every flag that takes a value must be followed by one.
        for preset in Preset::all() {
            let args = preset.base_args;
            for (i, arg) in args.iter().enumerate() {
                if arg.starts_with('-') && !matches!(*arg, "-vn" | "-an") {
                    assert!(
                        args.get(i + 1).is_some_and(|v| !v.starts_with('-') || v.starts_with("-1")),
                        "preset {} flag {} has no value",
                        preset.id,
                        arg
                    );
                }
            }
        }
    }

    #[test]
    fn test_audio_only_presets_drop_video() {
        for preset in Preset::all().iter().filter(|p| !p.expects_video) {
            assert!(preset.base_args.contains(&"-vn"), "{} should pass -vn", preset.id);
        }
    }

    #[test]
    fn test_all_channel_preset() {
        let preset = Preset::find("wav_all_channels").unwrap();
        assert!(preset.all_channel_audio);
        assert!(preset.maps_streams());
        assert_eq!(preset.extension, "wav");
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("1920x1080".parse::<Resolution>(), Ok(Resolution::new(1920, 1080)));
        assert!("1920".parse::<Resolution>().is_err());
        assert!("0x720".parse::<Resolution>().is_err());
        assert_eq!(Resolution::new(1280, 720).to_string(), "1280x720");
    }
}
