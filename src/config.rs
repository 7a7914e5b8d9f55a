use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::processing::palette::{Palette, Rgb, parse_hex_color};
use crate::render::backend::{FilterMode, KernelSource, MAX_SURFACE_DIMENSION};
use crate::render::effect::{EffectSettings, ForcedResolution};

/// Largest accepted `downsample-shift`; anything beyond collapses every
/// realistic frame below one tile.
pub const MAX_DOWNSAMPLE_SHIFT: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PalettePreset {
    #[serde(rename = "bisqwit-16")]
    Bisqwit16,
    #[serde(rename = "greyscale-16")]
    Greyscale16,
    RgbCube,
}

impl PalettePreset {
    pub fn palette(self) -> Palette {
        match self {
            Self::Bisqwit16 => Palette::bisqwit16(),
            Self::Greyscale16 => Palette::greyscale16(),
            Self::RgbCube => Palette::rgb_cube(),
        }
    }
}

/// One palette entry: `"#RRGGBB"`, `"0xRRGGBB"`, `"RRGGBB"` or `[r, g, b]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ColorSpec {
    Hex(String),
    Components(Rgb),
}

impl ColorSpec {
    fn resolve(&self) -> crate::error::Result<Rgb> {
        match self {
            Self::Hex(raw) => parse_hex_color(raw),
            Self::Components(rgb) => Ok(*rgb),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PaletteConfig {
    Preset(PalettePreset),
    Custom(Vec<ColorSpec>),
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self::Preset(PalettePreset::Bisqwit16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Try wgpu first and fall back to the CPU strategy.
    #[default]
    Auto,
    Cpu,
    WgpuCompute,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// Preset name or explicit list of colors.
    pub palette: PaletteConfig,
    /// Target size is the source size shifted right by this many bits.
    pub downsample_shift: u32,
    /// Explicit target size; overrides `downsample-shift` when present.
    pub forced_resolution: Option<ForcedResolution>,
    /// Filter used when stretching the quantized surface onto the output.
    pub filter_mode: FilterMode,
    pub backend: BackendKind,
    /// Scale of the threshold offset; 0 disables the pattern.
    pub dither_step: f32,
    /// Optional WGSL program replacing the built-in kernel.
    pub kernel_path: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            palette: PaletteConfig::default(),
            downsample_shift: 0,
            forced_resolution: None,
            filter_mode: FilterMode::default(),
            backend: BackendKind::default(),
            dither_step: EffectSettings::DEFAULT_DITHER_STEP,
            kernel_path: None,
        }
    }
}

impl Configuration {
    /// Parses a YAML file. A relative `kernel-path` is resolved against the
    /// directory holding the file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)?;
        let mut cfg: Self = serde_yaml::from_str(&s)?;
        if let (Some(kernel), Some(dir)) = (cfg.kernel_path.as_mut(), path.parent()) {
            if kernel.is_relative() {
                *kernel = dir.join(&*kernel);
            }
        }
        Ok(cfg)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            self.downsample_shift <= MAX_DOWNSAMPLE_SHIFT,
            "downsample-shift must be at most {MAX_DOWNSAMPLE_SHIFT}"
        );
        ensure!(
            self.dither_step.is_finite() && self.dither_step >= 0.0,
            "dither-step must be a finite, non-negative number"
        );
        if let Some(forced) = self.forced_resolution {
            ensure!(
                forced.width <= MAX_SURFACE_DIMENSION as i32
                    && forced.height <= MAX_SURFACE_DIMENSION as i32,
                "forced-resolution must be at most {MAX_SURFACE_DIMENSION} on each axis"
            );
        }
        self.palette().context("invalid palette configuration")?;
        Ok(self)
    }

    pub fn palette(&self) -> Result<Palette> {
        match &self.palette {
            PaletteConfig::Preset(preset) => Ok(preset.palette()),
            PaletteConfig::Custom(specs) => {
                let colors = specs
                    .iter()
                    .map(ColorSpec::resolve)
                    .collect::<crate::error::Result<Vec<_>>>()?;
                Ok(Palette::new(colors)?)
            }
        }
    }

    pub fn effect_settings(&self) -> EffectSettings {
        EffectSettings {
            downsample_shift: self.downsample_shift,
            forced_resolution: self.forced_resolution,
            filter_mode: self.filter_mode,
            dither_step: self.dither_step,
        }
    }

    /// The configured kernel, or the built-in one.
    pub fn kernel_source(&self) -> Result<KernelSource> {
        let Some(path) = &self.kernel_path else {
            return Ok(KernelSource::builtin());
        };
        let wgsl = std::fs::read_to_string(path)
            .with_context(|| format!("reading kernel {}", path.display()))?;
        Ok(KernelSource::from_wgsl(path.display().to_string(), wgsl))
    }
}

pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Configuration> {
    Configuration::from_yaml_file(path)
}
