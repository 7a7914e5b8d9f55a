//! Execution-environment seam shared by the CPU and wgpu strategies.
//!
//! A backend owns device handles and knows how to allocate buffers and
//! random-write surfaces, run the quantization kernel over a work-group grid,
//! and copy results into host images. Resource ownership stays with
//! [`ResourceLifecycle`](super::resources::ResourceLifecycle); release methods
//! consume their handle so nothing can be released twice.

use bytemuck::{Pod, Zeroable};
use serde::Deserialize;

use crate::error::Result;
use crate::processing::threshold::MATRIX_SIZE;

/// Name of the kernel entry point every quantization program must export.
pub const KERNEL_ENTRY_POINT: &str = "CSMain";

/// Largest surface edge a backend is asked to allocate.
pub const MAX_SURFACE_DIMENSION: u32 = 16384;

const BUILTIN_KERNEL: &str = include_str!("shaders/dither.comp.wgsl");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterMode {
    #[default]
    Nearest,
    Bilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    pub width: u32,
    pub height: u32,
    pub filter: FilterMode,
}

/// Work-group counts for one dispatch; each group covers one 8x8 tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroups {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkGroups {
    /// Integer tile counts for a `width` x `height` target. A remainder strip
    /// narrower than one tile is not covered.
    pub const fn covering(width: u32, height: u32) -> Self {
        Self {
            x: width / MATRIX_SIZE,
            y: height / MATRIX_SIZE,
            z: 1,
        }
    }

    /// Pixel extent actually written by the grid.
    pub const fn covered_extent(&self) -> (u32, u32) {
        (self.x * MATRIX_SIZE, self.y * MATRIX_SIZE)
    }
}

/// Uniform block bound next to the kernel's buffers and textures.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct KernelParams {
    pub image_input_w: u32,
    pub image_input_h: u32,
    pub result_w: u32,
    pub result_h: u32,
    pub palette_length: u32,
    pub downsample: u32,
    pub dither_step: f32,
    pub _pad: u32,
}

/// Read-only inputs of one kernel dispatch.
pub struct KernelInputs<'a, B: Backend + ?Sized> {
    pub image_input: &'a B::Image,
    pub palette: &'a B::Buffer,
    pub dither8x8: &'a B::Buffer,
    pub params: KernelParams,
}

/// Source text of a quantization program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub label: String,
    pub wgsl: String,
}

impl KernelSource {
    pub fn builtin() -> Self {
        Self {
            label: "dither-8x8".into(),
            wgsl: BUILTIN_KERNEL.into(),
        }
    }

    pub fn from_wgsl(label: impl Into<String>, wgsl: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            wgsl: wgsl.into(),
        }
    }

    /// True when the program text declares the `CSMain` entry point.
    ///
    /// Text after `//` on a line is ignored. Block comments are not parsed;
    /// the wgpu strategy still rejects such a program when it compiles it.
    pub fn declares_entry_point(&self) -> bool {
        let needle = format!("fn {KERNEL_ENTRY_POINT}");
        self.wgsl
            .lines()
            .map(|line| line.split_once("//").map_or(line, |(code, _)| code))
            .any(|code| {
                code.match_indices(&needle).any(|(at, _)| {
                    code[at + needle.len()..]
                        .chars()
                        .next()
                        .is_none_or(|c| c == '(' || c.is_whitespace())
                })
            })
    }
}

impl Default for KernelSource {
    fn default() -> Self {
        Self::builtin()
    }
}

pub trait Backend {
    /// Host image handed in by the frame callback.
    type Image;
    type Buffer;
    /// Random-write output surface.
    type Surface;
    /// Kernel handle resolved once at activation.
    type Kernel;

    fn name(&self) -> &'static str;

    /// Whether the environment can run the quantization kernel at all.
    fn supports_compute(&self) -> bool;

    fn image_size(&self, image: &Self::Image) -> (u32, u32);

    fn load_kernel(&mut self, source: &KernelSource) -> Result<Self::Kernel>;

    fn create_buffer(&mut self, label: &str, contents: &[u8]) -> Result<Self::Buffer>;

    fn release_buffer(&mut self, buffer: Self::Buffer);

    fn create_surface(&mut self, descriptor: &SurfaceDescriptor) -> Result<Self::Surface>;

    fn release_surface(&mut self, surface: Self::Surface);

    fn dispatch(
        &mut self,
        kernel: &Self::Kernel,
        result: &mut Self::Surface,
        inputs: KernelInputs<'_, Self>,
        groups: WorkGroups,
    ) -> Result<()>;

    /// Copies the whole surface into `destination`, stretching with the
    /// surface's filter mode when sizes differ.
    fn blit(&mut self, surface: &Self::Surface, destination: &mut Self::Image) -> Result<()>;

    /// Pass-through copy used when a frame is not quantized.
    fn copy(&mut self, source: &Self::Image, destination: &mut Self::Image) -> Result<()>;
}
