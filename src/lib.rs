//! Real-time ordered dithering: an 8x8 Bayer threshold pattern combined with
//! nearest-color palette matching, dispatched per frame over 8x8 tiles.

pub mod config;
pub mod error;
pub mod processing {
    pub mod palette;
    pub mod quantize;
    pub mod threshold;
}
pub mod render {
    pub mod backend;
    pub mod cpu;
    pub mod effect;
    pub mod gpu;
    pub mod host;
    pub mod resources;
}

pub use config::{BackendKind, Configuration};
pub use error::{Error, Result};
pub use processing::palette::Palette;
pub use processing::threshold::ThresholdMatrix;
pub use render::effect::{DitherEffect, EffectSettings, EffectStatus, FrameOutcome};
pub use render::host::{RenderReport, process_image};
