use crate::processing::palette::{Palette, Rgb};

/// Squared Euclidean distance in RGB, without gamma or perceptual weighting.
pub fn distance_sq(a: Rgb, b: Rgb) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = i32::from(x) - i32::from(y);
            (d * d) as u32
        })
        .sum()
}

/// Index of the entry closest to `target`.
///
/// Starts from entry 0 and only moves on a strictly smaller distance, so ties
/// resolve to the earliest entry. Returns 0 for an empty slice.
pub fn nearest_index(target: Rgb, colors: &[Rgb]) -> usize {
    let Some(&first) = colors.first() else {
        return 0;
    };
    let mut best = 0;
    let mut best_distance = distance_sq(target, first);
    for (index, &candidate) in colors.iter().enumerate().skip(1) {
        let distance = distance_sq(target, candidate);
        if distance < best_distance {
            best = index;
            best_distance = distance;
        }
    }
    best
}

pub fn nearest(target: Rgb, palette: &Palette) -> Rgb {
    palette.colors()[nearest_index(target, palette.colors())]
}

/// Offsets every channel by `threshold * step` and rounds back to 8 bits.
///
/// Rounding is `floor(x + 0.5)` on the clamped value, the same expression the
/// compute kernel uses.
pub fn perturb(color: Rgb, threshold: f32, step: f32) -> Rgb {
    let offset = threshold * step;
    color.map(|channel| {
        let shifted = (f32::from(channel) + offset).clamp(0.0, 255.0);
        (shifted + 0.5).floor() as u8
    })
}

/// Per-pixel reference behaviour of the quantization kernel.
pub fn dither_pixel(color: Rgb, threshold: f32, step: f32, colors: &[Rgb]) -> Rgb {
    let wanted = perturb(color, threshold, step);
    colors
        .get(nearest_index(wanted, colors))
        .copied()
        .unwrap_or(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn brute_force(target: Rgb, palette: &Palette) -> Rgb {
        let best = palette
            .colors()
            .iter()
            .map(|&c| distance_sq(target, c))
            .min()
            .unwrap();
        *palette
            .colors()
            .iter()
            .find(|&&c| distance_sq(target, c) == best)
            .unwrap()
    }

    #[test]
    fn palette_members_map_to_themselves() {
        let palette = Palette::bisqwit16();
        for &color in palette.colors() {
            assert_eq!(nearest(color, &palette), color);
        }
    }

    #[test]
    fn ties_keep_the_earliest_entry() {
        let palette = Palette::new(vec![[0, 0, 10], [0, 0, 30], [0, 0, 10]]).unwrap();
        assert_eq!(nearest_index([0, 0, 20], palette.colors()), 0);

        let reversed = Palette::new(vec![[0, 0, 30], [0, 0, 10]]).unwrap();
        assert_eq!(nearest_index([0, 0, 20], reversed.colors()), 0);
        assert_eq!(nearest_index([0, 0, 10], &[[0, 0, 10], [0, 0, 10]]), 0);
    }

    #[test]
    fn matches_brute_force_minimum_on_sampled_colors() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for palette in [Palette::bisqwit16(), Palette::greyscale16(), Palette::rgb_cube()] {
            for _ in 0..2_000 {
                let target = [rng.random(), rng.random(), rng.random()];
                assert_eq!(nearest(target, &palette), brute_force(target, &palette));
            }
        }
    }

    #[test]
    fn greyscale_snaps_to_closest_step() {
        let palette = Palette::greyscale16();
        assert_eq!(nearest([0x12, 0x12, 0x12], &palette), [0x11; 3]);
        assert_eq!(nearest([0xF8, 0xF8, 0xF8], &palette), [0xFF; 3]);
        // 0x08 is 8 away from 0x00 and 9 away from 0x11.
        assert_eq!(nearest([0x08, 0x08, 0x08], &palette), [0x00; 3]);
    }

    #[test]
    fn perturb_clamps_and_rounds() {
        assert_eq!(perturb([250, 10, 0], 0.75, 64.0), [255, 58, 48]);
        assert_eq!(perturb([100, 100, 100], 0.0, 64.0), [100, 100, 100]);
        assert_eq!(perturb([100, 100, 100], 1.0 / 64.0, 32.0), [101, 101, 101]);
        assert_eq!(perturb([7, 7, 7], 0.9, 0.0), [7, 7, 7]);
    }

    #[test]
    fn threshold_moves_decision_across_boundary() {
        let colors = [[0, 0, 0], [64, 64, 64]];
        assert_eq!(dither_pixel([20, 20, 20], 0.0, 64.0, &colors), [0, 0, 0]);
        assert_eq!(dither_pixel([20, 20, 20], 0.25, 64.0, &colors), [64, 64, 64]);
    }
}
