//! Host-side driver: runs the effect over a still image the way a renderer
//! would run it once per frame.

use image::RgbaImage;
use tracing::{info, warn};

use crate::config::{BackendKind, Configuration};
use crate::error::{Error, Result};
use crate::processing::palette::Palette;
use crate::render::backend::{Backend, KernelSource};
use crate::render::cpu::CpuBackend;
use crate::render::effect::{DitherEffect, EffectSettings, EffectStats, FrameOutcome};
use crate::render::gpu::GpuBackend;

#[derive(Debug, Clone)]
pub struct RenderReport {
    pub image: RgbaImage,
    pub backend: &'static str,
    /// Outcome of the last frame.
    pub outcome: FrameOutcome,
    pub stats: EffectStats,
}

/// Runs `frames` frames of the configured effect over `source`.
///
/// The destination has the source's size. Running more than one frame
/// reuses the output surface, which is what a live renderer sees.
pub fn process_image(
    cfg: &Configuration,
    source: &RgbaImage,
    frames: u32,
) -> anyhow::Result<RenderReport> {
    anyhow::ensure!(
        source.width() > 0 && source.height() > 0,
        "input image is empty"
    );
    let palette = cfg.palette()?;
    let settings = cfg.effect_settings();
    let kernel = cfg.kernel_source()?;
    let frames = frames.max(1);

    let report = match cfg.backend {
        BackendKind::Cpu => run_cpu(settings, palette, kernel, source, frames),
        BackendKind::WgpuCompute => {
            run_gpu(GpuBackend::new()?, settings, palette, kernel, source, frames)?
        }
        BackendKind::Auto => match GpuBackend::new() {
            Ok(gpu) if gpu.supports_compute() => {
                run_gpu(gpu, settings, palette, kernel, source, frames)?
            }
            Ok(_) => {
                warn!("wgpu adapter lacks compute shaders; using cpu dither");
                run_cpu(settings, palette, kernel, source, frames)
            }
            Err(err) => {
                warn!("wgpu dither unavailable, using cpu: {err}");
                run_cpu(settings, palette, kernel, source, frames)
            }
        },
    };
    info!(
        backend = report.backend,
        frames = report.stats.frames,
        dispatches = report.stats.dispatches,
        pass_through = report.stats.pass_through,
        "render finished"
    );
    Ok(report)
}

fn run_cpu(
    settings: EffectSettings,
    palette: Palette,
    kernel: KernelSource,
    source: &RgbaImage,
    frames: u32,
) -> RenderReport {
    let mut effect = DitherEffect::new(CpuBackend::new(), settings, palette, kernel);
    let mut destination = RgbaImage::new(source.width(), source.height());
    let outcome = run_frames(&mut effect, source, &mut destination, frames);
    RenderReport {
        image: destination,
        backend: effect.backend().name(),
        outcome,
        stats: effect.stats(),
    }
}

fn run_gpu(
    backend: GpuBackend,
    settings: EffectSettings,
    palette: Palette,
    kernel: KernelSource,
    source: &RgbaImage,
    frames: u32,
) -> Result<RenderReport> {
    let texture = backend.upload_image(source);
    let mut target = backend.create_target(source.width(), source.height());
    let mut effect = DitherEffect::new(backend, settings, palette, kernel);
    let outcome = run_frames(&mut effect, &texture, &mut target, frames);
    let image = effect.backend().read_image(&target)?;
    texture.destroy();
    target.destroy();
    Ok(RenderReport {
        image,
        backend: effect.backend().name(),
        outcome,
        stats: effect.stats(),
    })
}

/// Enables the effect and drives `frames` frames, returning the last outcome.
pub fn run_frames<B: Backend>(
    effect: &mut DitherEffect<B>,
    source: &B::Image,
    destination: &mut B::Image,
    frames: u32,
) -> FrameOutcome {
    if let Err(err) = effect.enable() {
        match err {
            Error::Capability(_) => {}
            other => warn!(error = %other, "enabling dither effect failed; will retry per frame"),
        }
    }
    let mut outcome = effect.process(source, destination);
    for _ in 1..frames {
        outcome = effect.process(source, destination);
    }
    outcome
}
