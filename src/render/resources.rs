//! Ownership of the device-side palette, threshold matrix and output surface.
//!
//! The lifecycle is either `Inactive` (nothing held) or `Active`. Buffers are
//! uploaded once on activation and replaced wholesale; the output surface is
//! allocated lazily on the first frame and reallocated only when the target
//! size changes.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::processing::palette::Palette;
use crate::processing::threshold::ThresholdMatrix;
use crate::render::backend::{Backend, KernelSource, SurfaceDescriptor};

/// Allocation counters, kept across activations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStats {
    pub buffers_allocated: u32,
    pub buffers_released: u32,
    pub surfaces_allocated: u32,
    pub surfaces_released: u32,
}

struct SurfaceSlot<S> {
    surface: S,
    descriptor: SurfaceDescriptor,
}

pub struct ActiveResources<B: Backend> {
    kernel: B::Kernel,
    palette_buffer: B::Buffer,
    palette_len: u32,
    matrix_buffer: B::Buffer,
    surface: Option<SurfaceSlot<B::Surface>>,
}

impl<B: Backend> ActiveResources<B> {
    pub fn kernel(&self) -> &B::Kernel {
        &self.kernel
    }

    pub fn palette_buffer(&self) -> &B::Buffer {
        &self.palette_buffer
    }

    pub fn palette_len(&self) -> u32 {
        self.palette_len
    }

    pub fn matrix_buffer(&self) -> &B::Buffer {
        &self.matrix_buffer
    }

    pub fn surface(&self) -> Option<&B::Surface> {
        self.surface.as_ref().map(|slot| &slot.surface)
    }

    pub fn surface_descriptor(&self) -> Option<SurfaceDescriptor> {
        self.surface.as_ref().map(|slot| slot.descriptor)
    }

    /// Borrows everything a dispatch needs, with the surface writable.
    pub fn binding_set(&mut self) -> Result<BindingSet<'_, B>> {
        let slot = self.surface.as_mut().ok_or(Error::Inactive)?;
        Ok(BindingSet {
            kernel: &self.kernel,
            surface: &mut slot.surface,
            palette: &self.palette_buffer,
            palette_len: self.palette_len,
            matrix: &self.matrix_buffer,
        })
    }
}

pub struct BindingSet<'a, B: Backend> {
    pub kernel: &'a B::Kernel,
    pub surface: &'a mut B::Surface,
    pub palette: &'a B::Buffer,
    pub palette_len: u32,
    pub matrix: &'a B::Buffer,
}

enum LifecycleState<B: Backend> {
    Inactive,
    Active(ActiveResources<B>),
}

pub struct ResourceLifecycle<B: Backend> {
    state: LifecycleState<B>,
    stats: ResourceStats,
}

impl<B: Backend> Default for ResourceLifecycle<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> ResourceLifecycle<B> {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Inactive,
            stats: ResourceStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, LifecycleState::Active(_))
    }

    pub fn stats(&self) -> ResourceStats {
        self.stats
    }

    pub fn active(&self) -> Option<&ActiveResources<B>> {
        match &self.state {
            LifecycleState::Active(resources) => Some(resources),
            LifecycleState::Inactive => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveResources<B>> {
        match &mut self.state {
            LifecycleState::Active(resources) => Some(resources),
            LifecycleState::Inactive => None,
        }
    }

    pub fn surface(&self) -> Option<&B::Surface> {
        self.active().and_then(ActiveResources::surface)
    }

    /// Resolves the kernel and uploads palette and matrix.
    ///
    /// Activating while already active replaces every resource. On failure
    /// the lifecycle is left inactive.
    pub fn activate(
        &mut self,
        backend: &mut B,
        kernel: &KernelSource,
        palette: &Palette,
        matrix: &ThresholdMatrix,
    ) -> Result<()> {
        if !backend.supports_compute() {
            return Err(Error::Capability(format!(
                "{} backend cannot run compute kernels",
                backend.name()
            )));
        }
        if !kernel.declares_entry_point() {
            return Err(Error::Capability(format!(
                "no quantization kernel configured (`{}` has no entry point `{}`)",
                kernel.label,
                crate::render::backend::KERNEL_ENTRY_POINT
            )));
        }
        self.deactivate(backend);

        let kernel = backend.load_kernel(kernel)?;
        let packed = palette.as_packed();
        let palette_buffer = backend.create_buffer("palette", bytemuck::cast_slice(&packed))?;
        self.stats.buffers_allocated += 1;
        let matrix_buffer = match backend.create_buffer("dither8x8", matrix.as_bytes()) {
            Ok(buffer) => buffer,
            Err(err) => {
                backend.release_buffer(palette_buffer);
                self.stats.buffers_released += 1;
                return Err(err);
            }
        };
        self.stats.buffers_allocated += 1;

        info!(
            backend = backend.name(),
            palette_len = packed.len(),
            "dither resources activated"
        );
        self.state = LifecycleState::Active(ActiveResources {
            kernel,
            palette_buffer,
            palette_len: packed.len() as u32,
            matrix_buffer,
            surface: None,
        });
        Ok(())
    }

    /// Makes sure the surface matches `descriptor`'s size.
    ///
    /// Returns `true` when a new surface was allocated. A matching surface is
    /// kept as is.
    pub fn ensure_surface(&mut self, backend: &mut B, descriptor: SurfaceDescriptor) -> Result<bool> {
        let LifecycleState::Active(resources) = &mut self.state else {
            return Err(Error::Inactive);
        };
        if let Some(slot) = &resources.surface {
            if slot.descriptor.width == descriptor.width
                && slot.descriptor.height == descriptor.height
            {
                return Ok(false);
            }
        }
        if let Some(old) = resources.surface.take() {
            debug!(
                old_width = old.descriptor.width,
                old_height = old.descriptor.height,
                width = descriptor.width,
                height = descriptor.height,
                "reallocating dither surface"
            );
            backend.release_surface(old.surface);
            self.stats.surfaces_released += 1;
        }
        let surface = backend.create_surface(&descriptor)?;
        self.stats.surfaces_allocated += 1;
        resources.surface = Some(SurfaceSlot {
            surface,
            descriptor,
        });
        Ok(true)
    }

    /// Releases everything held. Calling it while inactive does nothing.
    pub fn deactivate(&mut self, backend: &mut B) {
        let LifecycleState::Active(resources) =
            std::mem::replace(&mut self.state, LifecycleState::Inactive)
        else {
            return;
        };
        backend.release_buffer(resources.palette_buffer);
        backend.release_buffer(resources.matrix_buffer);
        self.stats.buffers_released += 2;
        if let Some(slot) = resources.surface {
            backend.release_surface(slot.surface);
            self.stats.surfaces_released += 1;
        }
        debug!(backend = backend.name(), "dither resources released");
    }
}
