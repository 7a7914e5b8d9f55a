use std::io::Write;

use clap::ValueEnum;

use bayer_dither::config::{
    BackendKind, ColorSpec, Configuration, PaletteConfig, PalettePreset,
};
use bayer_dither::processing::palette::Palette;
use bayer_dither::render::backend::FilterMode;
use bayer_dither::render::effect::{EffectSettings, ForcedResolution};

#[test]
fn empty_document_uses_defaults() {
    let cfg: Configuration = serde_yaml::from_str("{}").unwrap();
    assert_eq!(cfg.palette, PaletteConfig::Preset(PalettePreset::Bisqwit16));
    assert_eq!(cfg.downsample_shift, 0);
    assert_eq!(cfg.forced_resolution, None);
    assert_eq!(cfg.filter_mode, FilterMode::Nearest);
    assert_eq!(cfg.backend, BackendKind::Auto);
    assert!((cfg.dither_step - 64.0).abs() < f32::EPSILON);
    assert!(cfg.kernel_path.is_none());
    assert_eq!(cfg.palette().unwrap(), Palette::bisqwit16());
}

#[test]
fn parse_kebab_case_config() {
    let yaml = r#"
palette: greyscale-16
downsample-shift: 2
forced-resolution: { width: 0, height: 480 }
filter-mode: bilinear
backend: wgpu-compute
dither-step: 32.0
"#;
    let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(cfg.palette().unwrap(), Palette::greyscale16());
    assert_eq!(cfg.downsample_shift, 2);
    assert_eq!(
        cfg.forced_resolution,
        Some(ForcedResolution {
            width: 0,
            height: 480
        })
    );
    assert_eq!(cfg.filter_mode, FilterMode::Bilinear);
    assert_eq!(cfg.backend, BackendKind::WgpuCompute);

    let settings = cfg.effect_settings();
    assert_eq!(
        settings,
        EffectSettings {
            downsample_shift: 2,
            forced_resolution: cfg.forced_resolution,
            filter_mode: FilterMode::Bilinear,
            dither_step: 32.0,
        }
    );
}

#[test]
fn parse_rgb_cube_preset() {
    let cfg: Configuration = serde_yaml::from_str("palette: rgb-cube").unwrap();
    assert_eq!(cfg.palette().unwrap().count(), 125);
}

#[test]
fn parse_custom_palette_mixing_forms() {
    let yaml = r##"
palette:
  - "#000000"
  - "0xFF8000"
  - "2b347c"
  - [255, 255, 255]
"##;
    let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
    let PaletteConfig::Custom(specs) = &cfg.palette else {
        panic!("expected custom palette");
    };
    assert_eq!(specs[3], ColorSpec::Components([255, 255, 255]));
    let palette = cfg.palette().unwrap();
    assert_eq!(
        palette.colors(),
        &[[0, 0, 0], [255, 128, 0], [0x2b, 0x34, 0x7c], [255, 255, 255]]
    );
}

#[test]
fn unknown_preset_is_rejected() {
    assert!(serde_yaml::from_str::<Configuration>("palette: sepia-8").is_err());
}

#[test]
fn unknown_backend_is_rejected() {
    assert!(serde_yaml::from_str::<Configuration>("backend: opengl").is_err());
}

#[test]
fn validation_rejects_empty_palette() {
    let cfg: Configuration = serde_yaml::from_str("palette: []").unwrap();
    assert!(cfg.validated().is_err());
}

#[test]
fn validation_rejects_bad_hex() {
    let cfg: Configuration = serde_yaml::from_str(r##"palette: ["#12345G"]"##).unwrap();
    let err = cfg.validated().unwrap_err();
    assert!(format!("{err:#}").contains("invalid palette"));
}

#[test]
fn validation_rejects_out_of_range_numbers() {
    let cfg: Configuration = serde_yaml::from_str("downsample-shift: 16").unwrap();
    assert!(cfg.validated().is_err());
    let cfg: Configuration = serde_yaml::from_str("dither-step: -1.0").unwrap();
    assert!(cfg.validated().is_err());
    let cfg: Configuration = serde_yaml::from_str("dither-step: .nan").unwrap();
    assert!(cfg.validated().is_err());
    let cfg: Configuration = serde_yaml::from_str("dither-step: 0.0\ndownsample-shift: 15").unwrap();
    assert!(cfg.validated().is_ok());
}

#[test]
fn validation_bounds_forced_resolution() {
    let cfg: Configuration =
        serde_yaml::from_str("forced-resolution: { width: 2147483647, height: 2147483647 }")
            .unwrap();
    let err = cfg.validated().unwrap_err();
    assert!(err.to_string().contains("forced-resolution"));
    let cfg: Configuration =
        serde_yaml::from_str("forced-resolution: { width: 16384, height: -1 }").unwrap();
    assert!(cfg.validated().is_ok());
    let cfg: Configuration =
        serde_yaml::from_str("forced-resolution: { width: 640, height: 16385 }").unwrap();
    assert!(cfg.validated().is_err());
}

#[test]
fn backend_names_match_between_yaml_and_cli() {
    for (name, kind) in [
        ("auto", BackendKind::Auto),
        ("cpu", BackendKind::Cpu),
        ("wgpu-compute", BackendKind::WgpuCompute),
    ] {
        let cfg: Configuration = serde_yaml::from_str(&format!("backend: {name}")).unwrap();
        assert_eq!(cfg.backend, kind);
        assert_eq!(BackendKind::from_str(name, false).unwrap(), kind);
    }
    assert!(BackendKind::from_str("opengl", false).is_err());
}

#[test]
fn from_yaml_file_resolves_kernel_next_to_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("custom.wgsl"),
        "@compute @workgroup_size(8, 8, 1)\nfn CSMain() {}\n",
    )
    .unwrap();
    let path = dir.path().join("dither.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "kernel-path: custom.wgsl").unwrap();
    writeln!(file, "palette: greyscale-16").unwrap();
    drop(file);

    let cfg = Configuration::from_yaml_file(&path)
        .unwrap()
        .validated()
        .unwrap();
    assert_eq!(cfg.kernel_path, Some(dir.path().join("custom.wgsl")));
    let kernel = cfg.kernel_source().unwrap();
    assert!(kernel.declares_entry_point());
}

#[test]
fn missing_kernel_file_is_an_error() {
    let cfg: Configuration = serde_yaml::from_str("kernel-path: /nonexistent/kernel.wgsl").unwrap();
    assert!(cfg.kernel_source().is_err());
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(bayer_dither::config::from_yaml_file(dir.path().join("absent.yaml")).is_err());
}
