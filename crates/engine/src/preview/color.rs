//! Color adaptation for thumbnail extraction.

use crate::probe::VideoColorInfo;
use serde::Serialize;

/// Tone-maps untagged high bit depth video to 8-bit BT.709.
pub const TONEMAP_CHAIN: &str = "zscale=t=linear:npl=100,format=gbrpf32le,zscale=p=bt709,tonemap=tonemap=hable:desat=0,zscale=t=bt709:m=bt709:r=tv,format=yuv420p";

/// Plain pixel format conversion for RAW-class decoders.
pub const FORMAT_ONLY_CHAIN: &str = "format=yuv420p";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorAdaptation {
    None,
    Tonemap,
    FormatOnly,
}

impl ColorAdaptation {
    /// Pick the adaptation for a source's first video stream.
    ///
    /// RAW-class codecs take precedence; tone mapping applies only to content
    /// of at least 10 bits that carries no color tags.
    pub fn for_video(info: Option<&VideoColorInfo>) -> Self {
        let Some(info) = info else {
            return ColorAdaptation::None;
        };
        if info.is_raw_class() {
            ColorAdaptation::FormatOnly
        } else if info.bit_depth() >= 10 && !info.has_color_metadata() {
            ColorAdaptation::Tonemap
        } else {
            ColorAdaptation::None
        }
    }

    pub fn chain(self) -> Option<&'static str> {
        match self {
            ColorAdaptation::None => None,
            ColorAdaptation::Tonemap => Some(TONEMAP_CHAIN),
            ColorAdaptation::FormatOnly => Some(FORMAT_ONLY_CHAIN),
        }
    }
}

/// Thumbnail filter chain: optional adaptation, then scale to `width`.
pub fn thumbnail_filter(adaptation: ColorAdaptation, width: u32) -> String {
    let scale = format!("scale={}:-2", width.max(16));
    match adaptation.chain() {
        Some(chain) => format!("{},{}", chain, scale),
        None => scale,
    }
}
