use crate::error::{Error, Result};

/// RGB color with 8-bit channels.
pub type Rgb = [u8; 3];

/// 16-color RGB palette from Bisqwit's ordered dithering article.
const BISQWIT_16: [u32; 16] = [
    0x080000, 0x201A0B, 0x432817, 0x492910, //
    0x234309, 0x5D4F1E, 0x9C6B20, 0xA9220F, //
    0x2B347C, 0x2B7409, 0xD0CA40, 0xE8A077, //
    0x6A94AB, 0xD5C4B3, 0xFCE76E, 0xFCFAE2,
];

/// Ordered set of quantization targets.
///
/// Always holds at least one color. Index 0 seeds the nearest-color search,
/// so among equidistant entries the earliest wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<Rgb>,
}

impl Palette {
    pub fn new(colors: Vec<Rgb>) -> Result<Self> {
        if colors.is_empty() {
            return Err(Error::InvalidPalette(
                "palette must contain at least one color".into(),
            ));
        }
        Ok(Self { colors })
    }

    /// Builds a palette from `0xRRGGBB` words; bits above 24 are ignored.
    pub fn from_packed(packed: &[u32]) -> Result<Self> {
        Self::new(packed.iter().copied().map(unpack).collect())
    }

    pub fn bisqwit16() -> Self {
        Self {
            colors: BISQWIT_16.iter().copied().map(unpack).collect(),
        }
    }

    pub fn greyscale16() -> Self {
        Self {
            colors: (0..16u8).map(|i| [i * 0x11; 3]).collect(),
        }
    }

    /// Uniform cube with levels 0, 64, 128, 192 and 255 per channel.
    pub fn rgb_cube() -> Self {
        let levels: Vec<u8> = (0..=256u32)
            .step_by(64)
            .map(|v| v.min(255) as u8)
            .collect();
        let mut colors = Vec::with_capacity(levels.len().pow(3));
        for &r in &levels {
            for &g in &levels {
                for &b in &levels {
                    colors.push([r, g, b]);
                }
            }
        }
        Self { colors }
    }

    pub fn count(&self) -> usize {
        self.colors.len()
    }

    /// Packed `0xRRGGBB` form of the color at `index`.
    pub fn color_at(&self, index: usize) -> Option<u32> {
        self.colors.get(index).copied().map(pack)
    }

    pub fn as_components(&self, index: usize) -> Option<Rgb> {
        self.colors.get(index).copied()
    }

    /// Packed form in palette order, as uploaded to the `Palette` buffer.
    pub fn as_packed(&self) -> Vec<u32> {
        self.colors.iter().copied().map(pack).collect()
    }

    pub fn colors(&self) -> &[Rgb] {
        &self.colors
    }

    pub fn contains(&self, color: Rgb) -> bool {
        self.colors.contains(&color)
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::bisqwit16()
    }
}

pub const fn pack([r, g, b]: Rgb) -> u32 {
    ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

pub const fn unpack(packed: u32) -> Rgb {
    [
        ((packed >> 16) & 0xFF) as u8,
        ((packed >> 8) & 0xFF) as u8,
        (packed & 0xFF) as u8,
    ]
}

/// Parses `#RRGGBB`, `0xRRGGBB` or bare `RRGGBB`.
pub fn parse_hex_color(raw: &str) -> Result<Rgb> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix('#')
        .or_else(|| trimmed.strip_prefix("0x"))
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidPalette(format!(
            "`{raw}` is not a six-digit hex color"
        )));
    }
    u32::from_str_radix(digits, 16)
        .map(unpack)
        .map_err(|err| Error::InvalidPalette(format!("`{raw}`: {err}")))
}
