//! Video filter chain rewriting and waveform visualization graphs.
//!
//! Chains are handled as an ordered list of filter tokens. Splitting respects
//! quoting, escapes and bracketed option groups so expressions such as
//! `scale=trunc(iw/2)*2:trunc(ih/2)*2` or `drawtext=text='a,b'` stay intact.

use crate::preset::Resolution;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Field-aware deinterlacer swapped in for interlaced sources.
pub const FIELD_DEINTERLACER: &str = "bwdif=mode=send_field:parity=auto:deint=all";

const DEINTERLACE_FILTERS: &[&str] = &["yadif", "bwdif", "w3fdif", "estdif"];

/// Split a comma separated filter chain into tokens.
pub fn split_filter_chain(chain: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut escaped = false;

    for c in chain.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            '(' | '[' if !quoted => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' if !quoted => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if !quoted && depth == 0 => {
                let token = current.trim();
                if !token.is_empty() {
                    tokens.push(token.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let token = current.trim();
    if !token.is_empty() {
        tokens.push(token.to_string());
    }
    tokens
}

/// Name of a filter token: everything before its options or instance label.
pub fn filter_name(token: &str) -> &str {
    let end = token.find(['=', '@']).unwrap_or(token.len());
    token[..end].trim()
}

pub fn is_deinterlace_filter(token: &str) -> bool {
    DEINTERLACE_FILTERS.contains(&filter_name(token))
}

/// An ordered, linear video filter chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterChain {
    filters: Vec<String>,
}

impl FilterChain {
    pub fn parse(chain: &str) -> Self {
        Self {
            filters: split_filter_chain(chain),
        }
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn push(&mut self, filter: impl Into<String>) {
        self.filters.push(filter.into());
    }

    pub fn has_deinterlacer(&self) -> bool {
        self.filters.iter().any(|f| is_deinterlace_filter(f))
    }

    /// Adapt the chain to the source's field order.
    ///
    /// Interlaced sources get [`FIELD_DEINTERLACER`] in place of the first
    /// existing deinterlacer (later ones are dropped), or prepended when the
    /// chain had none. Progressive sources lose every deinterlace token.
    /// Unknown field order leaves the chain untouched.
    pub fn adapt_deinterlace(&mut self, interlaced: Option<bool>) {
        match interlaced {
            Some(true) => {
                let mut swapped = false;
                self.filters.retain_mut(|f| {
                    if !is_deinterlace_filter(f) {
                        return true;
                    }
                    if swapped {
                        return false;
                    }
                    *f = FIELD_DEINTERLACER.to_string();
                    swapped = true;
                    true
                });
                if !swapped {
                    self.filters.insert(0, FIELD_DEINTERLACER.to_string());
                }
            }
            Some(false) => self.filters.retain(|f| !is_deinterlace_filter(f)),
            None => {}
        }
    }
}

impl fmt::Display for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filters.join(","))
    }
}

/// Rendering style for waveform visualization exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualStyle {
    /// Linear trace across the frame
    Line,
    /// Polar vectorscope
    Circular,
    /// Dynamic range compressed before drawing
    Compressed,
    /// Linear trace projected through a fisheye lens
    Fisheye,
    Spectrogram,
}

impl VisualStyle {
    pub const ALL: [VisualStyle; 5] = [
        VisualStyle::Line,
        VisualStyle::Circular,
        VisualStyle::Compressed,
        VisualStyle::Fisheye,
        VisualStyle::Spectrogram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VisualStyle::Line => "line",
            VisualStyle::Circular => "circular",
            VisualStyle::Compressed => "compressed",
            VisualStyle::Fisheye => "fisheye",
            VisualStyle::Spectrogram => "spectrogram",
        }
    }
}

impl fmt::Display for VisualStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisualStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        VisualStyle::ALL
            .into_iter()
            .find(|style| style.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown visualization style '{}' (expected line, circular, compressed, fisheye or spectrogram)",
                    s
                )
            })
    }
}

/// Request to render the source's audio as a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationRequest {
    pub style: VisualStyle,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Apply EBU R128 loudness normalization to both paths
    pub normalize: bool,
    /// Background color, any form the encoder's color parser accepts
    pub background: String,
    pub foreground: String,
}

impl VisualizationRequest {
    pub fn new(style: VisualStyle, size: Resolution, fps: u32) -> Self {
        Self {
            style,
            width: size.width,
            height: size.height,
            fps: fps.max(1),
            normalize: false,
            background: "black".to_string(),
            foreground: "white".to_string(),
        }
    }

    pub fn normalized(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    fn style_filter(&self) -> String {
        let (w, h, fps, fg) = (self.width, self.height, self.fps, &self.foreground);
        match self.style {
            VisualStyle::Line => {
                format!("showwaves=s={w}x{h}:mode=line:rate={fps}:colors={fg}")
            }
            VisualStyle::Circular => {
                format!("avectorscope=s={w}x{h}:mode=polar:rate={fps}:draw=line:zoom=1.5")
            }
            VisualStyle::Compressed => format!(
                "acompressor=threshold=0.1:ratio=8:attack=5:release=50,showwaves=s={w}x{h}:mode=cline:scale=sqrt:rate={fps}:colors={fg}"
            ),
            VisualStyle::Fisheye => format!(
                "showwaves=s={w}x{h}:mode=cline:rate={fps}:colors={fg},v360=input=flat:output=fisheye:ih_fov=180:iv_fov=180:w={w}:h={h}"
            ),
            VisualStyle::Spectrogram => {
                format!("showspectrum=s={w}x{h}:mode=combined:slide=scroll:color=intensity:scale=log")
            }
        }
    }

    /// Complete `-filter_complex` graph producing `[vout]` and `[aout]`.
    pub fn filter_graph(&self) -> String {
        let loudness = if self.normalize {
            "loudnorm=I=-16:TP=-1.5:LRA=11,"
        } else {
            ""
        };
        format!(
            "[0:a]{loudness}asplit=2[aout][aviz];\
             [aviz]{style},format=rgba[wave];\
             color=c={bg}:s={w}x{h}:r={fps}[bg];\
             [bg][wave]overlay=shortest=1:format=auto[vout]",
            style = self.style_filter(),
            bg = self.background,
            w = self.width,
            h = self.height,
            fps = self.fps,
        )
    }
}
