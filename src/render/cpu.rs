//! CPU strategy: runs the kernel contract tile by tile on the host.
//!
//! Buffers keep the uploaded bytes as little-endian words and the dispatch
//! loop decodes palette and thresholds back out of them, so the CPU output
//! depends on exactly the data a GPU kernel would see.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use tracing::trace;

use crate::error::{Error, Result};
use crate::processing::palette::{Rgb, unpack};
use crate::processing::quantize::dither_pixel;
use crate::processing::threshold::{MATRIX_LEN, MATRIX_SIZE, ThresholdMatrix};
use crate::render::backend::{
    Backend, FilterMode, KernelInputs, KernelSource, MAX_SURFACE_DIMENSION, SurfaceDescriptor,
    WorkGroups,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuBuffer {
    label: String,
    words: Vec<u32>,
}

impl CpuBuffer {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

#[derive(Debug, Clone)]
pub struct CpuSurface {
    image: RgbaImage,
    filter: FilterMode,
}

impl CpuSurface {
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn filter(&self) -> FilterMode {
        self.filter
    }
}

/// The CPU loop needs no compiled program; the handle only marks activation.
#[derive(Debug, Clone, Copy)]
pub struct CpuKernel;

impl Backend for CpuBackend {
    type Image = RgbaImage;
    type Buffer = CpuBuffer;
    type Surface = CpuSurface;
    type Kernel = CpuKernel;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn supports_compute(&self) -> bool {
        true
    }

    fn image_size(&self, image: &RgbaImage) -> (u32, u32) {
        image.dimensions()
    }

    fn load_kernel(&mut self, _source: &KernelSource) -> Result<CpuKernel> {
        Ok(CpuKernel)
    }

    fn create_buffer(&mut self, label: &str, contents: &[u8]) -> Result<CpuBuffer> {
        if contents.len() % 4 != 0 {
            return Err(Error::Backend(anyhow::anyhow!(
                "buffer `{label}` is {} bytes, not a whole number of words",
                contents.len()
            )));
        }
        let words = contents
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Ok(CpuBuffer {
            label: label.to_owned(),
            words,
        })
    }

    fn release_buffer(&mut self, buffer: CpuBuffer) {
        trace!(label = %buffer.label, "released cpu buffer");
    }

    fn create_surface(&mut self, descriptor: &SurfaceDescriptor) -> Result<CpuSurface> {
        let (width, height) = (descriptor.width, descriptor.height);
        let bytes = usize::try_from(width)
            .ok()
            .zip(usize::try_from(height).ok())
            .and_then(|(w, h)| w.checked_mul(h))
            .and_then(|pixels| pixels.checked_mul(4));
        if bytes.is_none() || width > MAX_SURFACE_DIMENSION || height > MAX_SURFACE_DIMENSION {
            return Err(Error::Backend(anyhow::anyhow!(
                "surface {width}x{height} exceeds the {MAX_SURFACE_DIMENSION}px limit"
            )));
        }
        Ok(CpuSurface {
            image: RgbaImage::new(descriptor.width, descriptor.height),
            filter: descriptor.filter,
        })
    }

    fn release_surface(&mut self, surface: CpuSurface) {
        trace!(
            width = surface.image.width(),
            height = surface.image.height(),
            "released cpu surface"
        );
    }

    fn dispatch(
        &mut self,
        _kernel: &CpuKernel,
        result: &mut CpuSurface,
        inputs: KernelInputs<'_, Self>,
        groups: WorkGroups,
    ) -> Result<()> {
        let params = inputs.params;
        let colors: Vec<Rgb> = inputs
            .palette
            .words
            .iter()
            .take(params.palette_length as usize)
            .copied()
            .map(unpack)
            .collect();
        if colors.is_empty() {
            return Err(Error::Backend(anyhow::anyhow!("palette buffer is empty")));
        }
        let matrix = ThresholdMatrix::from_bits(&inputs.dither8x8.words).ok_or_else(|| {
            Error::Backend(anyhow::anyhow!(
                "threshold buffer holds {} values, expected {MATRIX_LEN}",
                inputs.dither8x8.words.len()
            ))
        })?;
        let source = inputs.image_input;
        let (src_w, src_h) = source.dimensions();
        if src_w == 0 || src_h == 0 || params.result_w == 0 || params.result_h == 0 {
            return Ok(());
        }
        let (out_w, out_h) = result.image.dimensions();

        for group_y in 0..groups.y {
            for group_x in 0..groups.x {
                for local_y in 0..MATRIX_SIZE {
                    for local_x in 0..MATRIX_SIZE {
                        let x = group_x * MATRIX_SIZE + local_x;
                        let y = group_y * MATRIX_SIZE + local_y;
                        if x >= params.result_w || y >= params.result_h || x >= out_w || y >= out_h
                        {
                            continue;
                        }
                        let sx = scale_coord(x, src_w, params.result_w);
                        let sy = scale_coord(y, src_h, params.result_h);
                        let texel = source.get_pixel(sx, sy);
                        let rgb = dither_pixel(
                            [texel[0], texel[1], texel[2]],
                            matrix.at(x, y),
                            params.dither_step,
                            &colors,
                        );
                        result
                            .image
                            .put_pixel(x, y, Rgba([rgb[0], rgb[1], rgb[2], 255]));
                    }
                }
            }
        }
        Ok(())
    }

    fn blit(&mut self, surface: &CpuSurface, destination: &mut RgbaImage) -> Result<()> {
        let (width, height) = destination.dimensions();
        if surface.image.dimensions() == (width, height) {
            destination.clone_from(&surface.image);
            return Ok(());
        }
        let filter = match surface.filter {
            FilterMode::Nearest => FilterType::Nearest,
            FilterMode::Bilinear => FilterType::Triangle,
        };
        *destination = imageops::resize(&surface.image, width, height, filter);
        Ok(())
    }

    fn copy(&mut self, source: &RgbaImage, destination: &mut RgbaImage) -> Result<()> {
        let (width, height) = destination.dimensions();
        if source.dimensions() == (width, height) {
            destination.clone_from(source);
        } else {
            *destination = imageops::resize(source, width, height, FilterType::Nearest);
        }
        Ok(())
    }
}

/// Point-sampled source coordinate for output coordinate `out`.
pub(crate) fn scale_coord(out: u32, source_len: u32, result_len: u32) -> u32 {
    let scaled = u64::from(out) * u64::from(source_len) / u64::from(result_len);
    (scaled as u32).min(source_len.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::palette::Palette;
    use crate::render::backend::KernelParams;

    fn params(src: (u32, u32), out: (u32, u32), palette_length: u32, step: f32) -> KernelParams {
        KernelParams {
            image_input_w: src.0,
            image_input_h: src.1,
            result_w: out.0,
            result_h: out.1,
            palette_length,
            downsample: 0,
            dither_step: step,
            _pad: 0,
        }
    }

    #[test]
    fn buffers_keep_uploaded_words() {
        let mut backend = CpuBackend::new();
        let packed = Palette::greyscale16().as_packed();
        let buffer = backend
            .create_buffer("palette", bytemuck::cast_slice(&packed))
            .unwrap();
        assert_eq!(buffer.words(), packed.as_slice());
        assert!(backend.create_buffer("odd", &[1, 2, 3]).is_err());
    }

    #[test]
    fn dispatch_matches_per_pixel_reference() {
        let mut backend = CpuBackend::new();
        let palette = Palette::bisqwit16();
        let matrix = ThresholdMatrix::generate();
        let source = RgbaImage::from_fn(16, 16, |x, y| {
            Rgba([(x * 16) as u8, (y * 16) as u8, ((x + y) * 8) as u8, 255])
        });
        let palette_buf = backend
            .create_buffer("palette", bytemuck::cast_slice(&palette.as_packed()))
            .unwrap();
        let matrix_buf = backend.create_buffer("dither8x8", matrix.as_bytes()).unwrap();
        let mut surface = backend
            .create_surface(&SurfaceDescriptor {
                width: 16,
                height: 16,
                filter: FilterMode::Nearest,
            })
            .unwrap();

        backend
            .dispatch(
                &CpuKernel,
                &mut surface,
                KernelInputs {
                    image_input: &source,
                    palette: &palette_buf,
                    dither8x8: &matrix_buf,
                    params: params((16, 16), (16, 16), 16, 64.0),
                },
                WorkGroups::covering(16, 16),
            )
            .unwrap();

        for (x, y, pixel) in surface.image().enumerate_pixels() {
            let src = source.get_pixel(x, y);
            let expected = dither_pixel(
                [src[0], src[1], src[2]],
                matrix.at(x, y),
                64.0,
                palette.colors(),
            );
            assert_eq!(pixel.0, [expected[0], expected[1], expected[2], 255]);
        }
    }

    #[test]
    fn partial_tiles_are_left_untouched() {
        let mut backend = CpuBackend::new();
        let source = RgbaImage::from_pixel(20, 20, Rgba([200, 200, 200, 255]));
        let palette_buf = backend
            .create_buffer("palette", bytemuck::cast_slice(&[0xFFFFFFu32]))
            .unwrap();
        let matrix_buf = backend
            .create_buffer("dither8x8", ThresholdMatrix::generate().as_bytes())
            .unwrap();
        let mut surface = backend
            .create_surface(&SurfaceDescriptor {
                width: 10,
                height: 10,
                filter: FilterMode::Nearest,
            })
            .unwrap();
        backend
            .dispatch(
                &CpuKernel,
                &mut surface,
                KernelInputs {
                    image_input: &source,
                    palette: &palette_buf,
                    dither8x8: &matrix_buf,
                    params: params((20, 20), (10, 10), 1, 0.0),
                },
                WorkGroups::covering(10, 10),
            )
            .unwrap();

        assert_eq!(surface.image().get_pixel(7, 7).0, [255, 255, 255, 255]);
        assert_eq!(surface.image().get_pixel(8, 3).0, [0, 0, 0, 0]);
        assert_eq!(surface.image().get_pixel(3, 9).0, [0, 0, 0, 0]);
    }

    #[test]
    fn blit_stretches_with_surface_filter() {
        let mut backend = CpuBackend::new();
        let surface = CpuSurface {
            image: RgbaImage::from_pixel(8, 8, Rgba([10, 20, 30, 255])),
            filter: FilterMode::Nearest,
        };
        let mut destination = RgbaImage::new(32, 16);
        backend.blit(&surface, &mut destination).unwrap();
        assert_eq!(destination.dimensions(), (32, 16));
        assert!(destination.pixels().all(|p| p.0 == [10, 20, 30, 255]));
    }

    #[test]
    fn oversized_surfaces_are_refused() {
        let mut backend = CpuBackend::new();
        let huge = SurfaceDescriptor {
            width: i32::MAX as u32,
            height: i32::MAX as u32,
            filter: FilterMode::Nearest,
        };
        assert!(matches!(
            backend.create_surface(&huge),
            Err(Error::Backend(_))
        ));
        let wide = SurfaceDescriptor {
            width: MAX_SURFACE_DIMENSION + 1,
            height: 8,
            filter: FilterMode::Nearest,
        };
        assert!(backend.create_surface(&wide).is_err());
        let edge = SurfaceDescriptor {
            width: MAX_SURFACE_DIMENSION,
            height: 8,
            filter: FilterMode::Nearest,
        };
        assert_eq!(
            backend.create_surface(&edge).unwrap().image().dimensions(),
            (MAX_SURFACE_DIMENSION, 8)
        );
    }

    #[test]
    fn source_coordinates_scale_down() {
        assert_eq!(scale_coord(0, 100, 50), 0);
        assert_eq!(scale_coord(49, 100, 50), 98);
        assert_eq!(scale_coord(7, 8, 8), 7);
        assert_eq!(scale_coord(799, 800, 800), 799);
    }
}
