//! 8x8 ordered-dither threshold matrix.
//!
//! Each cell's level is built by interleaving the low three bits of the cell
//! index `p` with those of `p ^ (p >> 3)`, which yields the dispersed-dot
//! Bayer arrangement. Levels are normalised into `[0, 1)`.

/// Edge length of the threshold tile.
pub const MATRIX_SIZE: u32 = 8;
/// Number of cells in the threshold tile.
pub const MATRIX_LEN: usize = (MATRIX_SIZE * MATRIX_SIZE) as usize;

/// Raw threshold level of cell `p`, in `0..64`.
///
/// `p` is taken modulo 64 so the function is total.
pub const fn threshold_level(p: u32) -> u32 {
    let p = p & 63;
    let q = p ^ (p >> 3);
    ((p >> 2) & 1)
        | (((q >> 2) & 1) << 1)
        | (((p >> 1) & 1) << 2)
        | (((q >> 1) & 1) << 3)
        | ((p & 1) << 4)
        | ((q & 1) << 5)
}

/// Normalised threshold of cell `p`, in `[0, 1)`.
pub fn threshold(p: u32) -> f32 {
    threshold_level(p) as f32 / MATRIX_LEN as f32
}

/// Cell index for pixel `(x, y)`: `x mod 8 + 8 * (y mod 8)`.
pub const fn matrix_index(x: u32, y: u32) -> usize {
    ((x & 7) + ((y & 7) << 3)) as usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdMatrix {
    values: [f32; MATRIX_LEN],
}

impl ThresholdMatrix {
    pub fn generate() -> Self {
        let mut values = [0.0f32; MATRIX_LEN];
        for (p, value) in values.iter_mut().enumerate() {
            *value = threshold(p as u32);
        }
        Self { values }
    }

    pub fn values(&self) -> &[f32; MATRIX_LEN] {
        &self.values
    }

    /// Threshold applied to pixel `(x, y)` of an image tiled by the matrix.
    pub fn at(&self, x: u32, y: u32) -> f32 {
        self.values[matrix_index(x, y)]
    }

    /// Little-endian `f32` layout uploaded to the `Dither8x8` buffer.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.values[..])
    }

    /// Rebuilds a matrix from the words of an uploaded `Dither8x8` buffer.
    pub fn from_bits(words: &[u32]) -> Option<Self> {
        if words.len() != MATRIX_LEN {
            return None;
        }
        let mut values = [0.0f32; MATRIX_LEN];
        for (value, bits) in values.iter_mut().zip(words) {
            *value = f32::from_bits(*bits);
        }
        Some(Self { values })
    }
}

impl Default for ThresholdMatrix {
    fn default() -> Self {
        Self::generate()
    }
}
