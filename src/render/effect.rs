//! Per-frame driver of the dither effect.
//!
//! [`DitherEffect::process`] is called once per rendered frame with a source
//! and destination image. It works out the target resolution, keeps the
//! output surface sized to it, dispatches the quantization kernel over whole
//! 8x8 tiles and copies the surface into the destination. Frames that cannot
//! be quantized are passed through; the host never sees an error.

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::processing::palette::Palette;
use crate::processing::threshold::{MATRIX_SIZE, ThresholdMatrix};
use crate::render::backend::{
    Backend, FilterMode, KernelInputs, KernelParams, KernelSource, SurfaceDescriptor, WorkGroups,
};
use crate::render::resources::{ResourceLifecycle, ResourceStats};

/// Explicit output size. A non-positive component falls back to the source
/// size on that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct ForcedResolution {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectSettings {
    pub downsample_shift: u32,
    pub forced_resolution: Option<ForcedResolution>,
    pub filter_mode: FilterMode,
    /// Scale of the threshold offset added to each channel before matching.
    pub dither_step: f32,
}

impl EffectSettings {
    pub const DEFAULT_DITHER_STEP: f32 = 64.0;
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            downsample_shift: 0,
            forced_resolution: None,
            filter_mode: FilterMode::Nearest,
            dither_step: Self::DEFAULT_DITHER_STEP,
        }
    }
}

/// Target size for a `source_w` x `source_h` frame.
pub fn target_resolution(source_w: u32, source_h: u32, settings: &EffectSettings) -> (u32, u32) {
    match settings.forced_resolution {
        Some(forced) => (
            u32::try_from(forced.width)
                .ok()
                .filter(|w| *w > 0)
                .unwrap_or(source_w),
            u32::try_from(forced.height)
                .ok()
                .filter(|h| *h > 0)
                .unwrap_or(source_h),
        ),
        None => (
            source_w.checked_shr(settings.downsample_shift).unwrap_or(0),
            source_h.checked_shr(settings.downsample_shift).unwrap_or(0),
        ),
    }
}

/// Everything one frame's dispatch is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDescriptor {
    pub source_width: u32,
    pub source_height: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub downsample_shift: u32,
    pub groups: WorkGroups,
}

impl DispatchDescriptor {
    pub fn new(source_width: u32, source_height: u32, settings: &EffectSettings) -> Self {
        let (target_width, target_height) =
            target_resolution(source_width, source_height, settings);
        Self {
            source_width,
            source_height,
            target_width,
            target_height,
            downsample_shift: if settings.forced_resolution.is_some() {
                0
            } else {
                settings.downsample_shift
            },
            groups: WorkGroups::covering(target_width, target_height),
        }
    }

    /// Whole 8x8 tiles are required on both axes.
    pub fn is_degenerate(&self) -> bool {
        self.target_width < MATRIX_SIZE || self.target_height < MATRIX_SIZE
    }

    fn kernel_params(&self, palette_length: u32, dither_step: f32) -> KernelParams {
        KernelParams {
            image_input_w: self.source_width,
            image_input_h: self.source_height,
            result_w: self.target_width,
            result_h: self.target_height,
            palette_length,
            downsample: self.downsample_shift,
            dither_step,
            _pad: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectStatus {
    /// Constructed but `enable` not yet called.
    Idle,
    Enabled,
    /// Turned off for the session after a capability failure.
    Disabled(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughReason {
    Disabled,
    BelowTileSize { width: u32, height: u32 },
    DispatchFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Dithered(DispatchDescriptor),
    PassThrough(PassThroughReason),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EffectStats {
    pub frames: u64,
    pub dispatches: u64,
    pub pass_through: u64,
}

pub struct DitherEffect<B: Backend> {
    backend: B,
    settings: EffectSettings,
    palette: Palette,
    kernel: KernelSource,
    matrix: Option<ThresholdMatrix>,
    resources: ResourceLifecycle<B>,
    status: EffectStatus,
    stats: EffectStats,
}

impl<B: Backend> DitherEffect<B> {
    pub fn new(backend: B, settings: EffectSettings, palette: Palette, kernel: KernelSource) -> Self {
        Self {
            backend,
            settings,
            palette,
            kernel,
            matrix: None,
            resources: ResourceLifecycle::new(),
            status: EffectStatus::Idle,
            stats: EffectStats::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn settings(&self) -> &EffectSettings {
        &self.settings
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn status(&self) -> &EffectStatus {
        &self.status
    }

    pub fn stats(&self) -> EffectStats {
        self.stats
    }

    pub fn resource_stats(&self) -> ResourceStats {
        self.resources.stats()
    }

    pub fn resources(&self) -> &ResourceLifecycle<B> {
        &self.resources
    }

    pub fn matrix(&self) -> Option<&ThresholdMatrix> {
        self.matrix.as_ref()
    }

    /// Generates the threshold matrix and activates GPU-side resources.
    ///
    /// A capability failure disables the effect for the rest of the session;
    /// later calls return the same error without retrying.
    pub fn enable(&mut self) -> Result<()> {
        if let EffectStatus::Disabled(reason) = &self.status {
            return Err(Error::Capability(reason.clone()));
        }
        let matrix = self.matrix.get_or_insert_with(ThresholdMatrix::generate);
        match self
            .resources
            .activate(&mut self.backend, &self.kernel, &self.palette, matrix)
        {
            Ok(()) => {
                self.status = EffectStatus::Enabled;
                Ok(())
            }
            Err(Error::Capability(reason)) => {
                warn!(
                    backend = self.backend.name(),
                    %reason,
                    "dither effect disabled for this session"
                );
                self.status = EffectStatus::Disabled(reason.clone());
                Err(Error::Capability(reason))
            }
            Err(err) => Err(err),
        }
    }

    /// Releases all resources. Safe to call repeatedly.
    pub fn disable(&mut self) {
        self.resources.deactivate(&mut self.backend);
        if self.status == EffectStatus::Enabled {
            self.status = EffectStatus::Idle;
        }
    }

    /// Swaps in a new palette, re-uploading buffers if the effect is live.
    pub fn set_palette(&mut self, palette: Palette) -> Result<()> {
        self.palette = palette;
        if self.resources.is_active() {
            self.enable()?;
        }
        Ok(())
    }

    /// Runs one frame. Never fails: frames that cannot be quantized are
    /// copied through unchanged.
    pub fn process(&mut self, source: &B::Image, destination: &mut B::Image) -> FrameOutcome {
        self.stats.frames += 1;
        let outcome = self.run_frame(source, destination);
        if let FrameOutcome::PassThrough(reason) = outcome {
            self.stats.pass_through += 1;
            if let Err(err) = self.backend.copy(source, destination) {
                error!(?reason, error = %err, "pass-through copy failed");
            }
        }
        outcome
    }

    fn run_frame(&mut self, source: &B::Image, destination: &mut B::Image) -> FrameOutcome {
        if matches!(self.status, EffectStatus::Disabled(_)) {
            return FrameOutcome::PassThrough(PassThroughReason::Disabled);
        }

        let (source_w, source_h) = self.backend.image_size(source);
        let descriptor = DispatchDescriptor::new(source_w, source_h, &self.settings);
        if descriptor.is_degenerate() {
            debug!(
                width = descriptor.target_width,
                height = descriptor.target_height,
                "target below one dither tile; passing frame through"
            );
            return FrameOutcome::PassThrough(PassThroughReason::BelowTileSize {
                width: descriptor.target_width,
                height: descriptor.target_height,
            });
        }

        if let Err(err) = self.recover_stale_state() {
            if matches!(err, Error::Capability(_)) {
                return FrameOutcome::PassThrough(PassThroughReason::Disabled);
            }
            error!(error = %err, "failed to restore dither resources");
            return FrameOutcome::PassThrough(PassThroughReason::DispatchFailed);
        }

        match self.dispatch(&descriptor, source, destination) {
            Ok(()) => {
                self.stats.dispatches += 1;
                FrameOutcome::Dithered(descriptor)
            }
            Err(err) => {
                error!(
                    backend = self.backend.name(),
                    error = %err,
                    "dither dispatch failed; passing frame through"
                );
                FrameOutcome::PassThrough(PassThroughReason::DispatchFailed)
            }
        }
    }

    /// Regenerates the matrix or re-activates resources when they were found
    /// missing at frame time.
    fn recover_stale_state(&mut self) -> Result<()> {
        if self.matrix.is_none() {
            warn!("threshold matrix missing at dispatch time; regenerating");
            self.matrix = Some(ThresholdMatrix::generate());
            if self.resources.is_active() {
                self.enable()?;
            }
        }
        if !self.resources.is_active() {
            warn!("dither resources inactive at dispatch time; activating");
            self.enable()?;
            info!(backend = self.backend.name(), "dither effect enabled lazily");
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        descriptor: &DispatchDescriptor,
        source: &B::Image,
        destination: &mut B::Image,
    ) -> Result<()> {
        let surface_descriptor = SurfaceDescriptor {
            width: descriptor.target_width,
            height: descriptor.target_height,
            filter: self.settings.filter_mode,
        };
        if self
            .resources
            .ensure_surface(&mut self.backend, surface_descriptor)?
        {
            debug!(
                width = descriptor.target_width,
                height = descriptor.target_height,
                "allocated dither surface"
            );
        }

        let resources = self.resources.active_mut().ok_or(Error::Inactive)?;
        let bindings = resources.binding_set()?;
        let params = descriptor.kernel_params(bindings.palette_len, self.settings.dither_step);
        self.backend.dispatch(
            bindings.kernel,
            bindings.surface,
            KernelInputs {
                image_input: source,
                palette: bindings.palette,
                dither8x8: bindings.matrix,
                params,
            },
            descriptor.groups,
        )?;
        self.backend.blit(bindings.surface, destination)
    }
}

impl<B: Backend> Drop for DitherEffect<B> {
    fn drop(&mut self) {
        self.resources.deactivate(&mut self.backend);
    }
}
