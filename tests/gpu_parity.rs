//! The wgpu kernel must pick the same palette entries as the CPU strategy.
//! Skipped when the machine exposes no adapter with compute support.

use bayer_dither::processing::palette::Palette;
use bayer_dither::render::backend::{Backend, KernelSource};
use bayer_dither::render::cpu::CpuBackend;
use bayer_dither::render::effect::{
    DitherEffect, EffectSettings, FrameOutcome, PassThroughReason,
};
use bayer_dither::render::gpu::GpuBackend;
use image::{Rgba, RgbaImage};

fn gpu() -> Option<GpuBackend> {
    match GpuBackend::new() {
        Ok(backend) if backend.supports_compute() => Some(backend),
        Ok(_) => {
            eprintln!("skipping: wgpu adapter lacks compute shaders");
            None
        }
        Err(err) => {
            eprintln!("skipping: {err}");
            None
        }
    }
}

fn scene(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            (x * 255 / width) as u8,
            (y * 255 / height) as u8,
            ((x * 7 + y * 13) % 256) as u8,
            255,
        ])
    })
}

struct Frame {
    outcome: FrameOutcome,
    surface: Option<RgbaImage>,
    destination: RgbaImage,
}

fn run_cpu(settings: EffectSettings, source: &RgbaImage) -> Frame {
    let mut effect = DitherEffect::new(
        CpuBackend::new(),
        settings,
        Palette::bisqwit16(),
        KernelSource::builtin(),
    );
    effect.enable().unwrap();
    let mut destination = RgbaImage::new(source.width(), source.height());
    let outcome = effect.process(source, &mut destination);
    let surface = effect.resources().surface().map(|s| s.image().clone());
    Frame {
        outcome,
        surface,
        destination,
    }
}

fn run_gpu(backend: GpuBackend, settings: EffectSettings, source: &RgbaImage) -> Frame {
    let input = backend.upload_image(source);
    let mut target = backend.create_target(source.width(), source.height());
    let mut effect = DitherEffect::new(
        backend,
        settings,
        Palette::bisqwit16(),
        KernelSource::builtin(),
    );
    effect.enable().unwrap();
    let outcome = effect.process(&input, &mut target);
    let surface = effect
        .resources()
        .surface()
        .map(|s| effect.backend().read_image(s.texture()).unwrap());
    let destination = effect.backend().read_image(&target).unwrap();
    Frame {
        outcome,
        surface,
        destination,
    }
}

fn differing_pixels(a: &RgbaImage, b: &RgbaImage) -> usize {
    assert_eq!(a.dimensions(), b.dimensions());
    a.pixels().zip(b.pixels()).filter(|(p, q)| p != q).count()
}

fn assert_same_frame(settings: EffectSettings, source: &RgbaImage) {
    let Some(backend) = gpu() else {
        return;
    };
    let gpu = run_gpu(backend, settings, source);
    let cpu = run_cpu(settings, source);

    assert_eq!(gpu.outcome, cpu.outcome);
    match (&gpu.surface, &cpu.surface) {
        (Some(g), Some(c)) => assert_eq!(differing_pixels(g, c), 0, "surfaces differ"),
        (None, None) => {}
        _ => panic!("only one backend allocated a surface"),
    }
    assert_eq!(
        differing_pixels(&gpu.destination, &cpu.destination),
        0,
        "destinations differ"
    );
}

#[test]
fn full_resolution_frame_matches_cpu() {
    assert_same_frame(EffectSettings::default(), &scene(64, 48));
}

#[test]
fn downsampled_frame_matches_cpu() {
    let settings = EffectSettings {
        downsample_shift: 1,
        ..EffectSettings::default()
    };
    assert_same_frame(settings, &scene(100, 100));
}

#[test]
fn zero_step_frame_matches_cpu() {
    let settings = EffectSettings {
        dither_step: 0.0,
        ..EffectSettings::default()
    };
    assert_same_frame(settings, &scene(32, 32));
}

#[test]
fn sub_tile_frame_passes_through_on_gpu() {
    let Some(backend) = gpu() else {
        return;
    };
    let source = scene(4, 4);
    let frame = run_gpu(backend, EffectSettings::default(), &source);
    assert_eq!(
        frame.outcome,
        FrameOutcome::PassThrough(PassThroughReason::BelowTileSize { width: 4, height: 4 })
    );
    assert!(frame.surface.is_none());
    assert_eq!(frame.destination, source);
}
