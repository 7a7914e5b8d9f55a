//! wgpu strategy: compute-pipeline dispatch plus a fullscreen blit.
//!
//! Host images are `wgpu::Texture`s. Sources need `TEXTURE_BINDING` (and
//! `COPY_SRC` for the direct pass-through copy); destinations need
//! `RENDER_ATTACHMENT` (and `COPY_DST` for the direct copy). The output
//! surface is always `Rgba8Unorm` because it is bound as a write-only storage
//! texture.

use std::collections::HashMap;
use std::sync::mpsc;

use anyhow::{Context, anyhow, ensure};
use image::RgbaImage;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::error::{Error, Result};
use crate::render::backend::{
    Backend, FilterMode, KERNEL_ENTRY_POINT, KernelInputs, KernelSource, MAX_SURFACE_DIMENSION,
    SurfaceDescriptor, WorkGroups,
};

pub const SURFACE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const BLIT_SHADER: &str = include_str!("shaders/blit.wgsl");

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    supports_compute: bool,
    blit_shader: wgpu::ShaderModule,
    blit_layout: wgpu::BindGroupLayout,
    blit_pipeline_layout: wgpu::PipelineLayout,
    blit_pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
    nearest_sampler: wgpu::Sampler,
    linear_sampler: wgpu::Sampler,
}

pub struct GpuKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

pub struct GpuSurface {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    filter: FilterMode,
}

impl GpuSurface {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }
}

impl GpuBackend {
    /// Requests a headless adapter and device.
    ///
    /// Having no adapter at all is reported as a capability error so callers
    /// can fall back to the CPU strategy.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| Error::Capability(format!("no wgpu adapter available: {err}")))?;
        let supports_compute = adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
        let info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("dither-device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| Error::Capability(format!("failed to acquire wgpu device: {err}")))?;
        info!(
            adapter = %info.name,
            backend = ?info.backend,
            supports_compute,
            "wgpu dither backend ready"
        );
        Ok(Self::from_device(device, queue, supports_compute))
    }

    /// Wraps a device the host already owns.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, supports_compute: bool) -> Self {
        let blit_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("dither-blit"),
            source: wgpu::ShaderSource::Wgsl(BLIT_SHADER.into()),
        });
        let blit_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("dither-blit-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let blit_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("dither-blit-pipeline-layout"),
            bind_group_layouts: &[&blit_layout],
            push_constant_ranges: &[],
        });
        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("dither-blit-nearest"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("dither-blit-linear"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self {
            device,
            queue,
            supports_compute,
            blit_shader,
            blit_layout,
            blit_pipeline_layout,
            blit_pipelines: HashMap::new(),
            nearest_sampler,
            linear_sampler,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Uploads an RGBA image as a frame source.
    pub fn upload_image(&self, image: &RgbaImage) -> wgpu::Texture {
        self.device.create_texture_with_data(
            &self.queue,
            &wgpu::TextureDescriptor {
                label: Some("dither-source"),
                size: extent(image.width(), image.height()),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: SURFACE_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            image.as_raw(),
        )
    }

    /// Creates a destination texture that can be rendered to and read back.
    pub fn create_target(&self, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("dither-destination"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SURFACE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }

    /// Reads an `Rgba8Unorm` texture back into host memory.
    pub fn read_image(&self, texture: &wgpu::Texture) -> Result<RgbaImage> {
        self.read_image_inner(texture).map_err(Error::Backend)
    }

    fn read_image_inner(&self, texture: &wgpu::Texture) -> anyhow::Result<RgbaImage> {
        ensure!(
            texture.format() == SURFACE_FORMAT,
            "readback expects {SURFACE_FORMAT:?}, got {:?}",
            texture.format()
        );
        let (width, height) = (texture.width(), texture.height());
        let unpadded = width * 4;
        let padded = padded_bytes_per_row(width);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("dither-readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dither-readback"),
            });
        encoder.copy_texture_to_buffer(
            texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            texture.size(),
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        let _ = self.device.poll(wgpu::PollType::Wait);
        receiver
            .recv()
            .context("receive map result")?
            .context("map buffer for read")?;
        let data = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        for row in data.chunks(padded as usize) {
            pixels.extend_from_slice(&row[..unpadded as usize]);
        }
        drop(data);
        buffer.unmap();
        RgbaImage::from_raw(width, height, pixels).ok_or_else(|| anyhow!("readback size mismatch"))
    }

    fn ensure_blit_pipeline(&mut self, format: wgpu::TextureFormat) {
        if self.blit_pipelines.contains_key(&format) {
            return;
        }
        debug!(?format, "building blit pipeline");
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("dither-blit-pipeline"),
                layout: Some(&self.blit_pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.blit_shader,
                    entry_point: Some("vs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &self.blit_shader,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        self.blit_pipelines.insert(format, pipeline);
    }

    fn draw_blit(
        &mut self,
        source: &wgpu::TextureView,
        filter: FilterMode,
        destination: &wgpu::Texture,
    ) -> Result<()> {
        let format = destination.format();
        self.ensure_blit_pipeline(format);
        let sampler = match filter {
            FilterMode::Nearest => &self.nearest_sampler,
            FilterMode::Bilinear => &self.linear_sampler,
        };
        let pipeline = self
            .blit_pipelines
            .get(&format)
            .ok_or_else(|| Error::Backend(anyhow!("no blit pipeline for {format:?}")))?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let target = destination.create_view(&wgpu::TextureViewDescriptor::default());
        let bind = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dither-blit-bind"),
            layout: &self.blit_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dither-blit"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("dither-blit"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        self.pop_validation("blit")
    }

    fn pop_validation(&self, stage: &str) -> Result<()> {
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(Error::Backend(anyhow!("{stage} failed validation: {err}"))),
            None => Ok(()),
        }
    }
}

impl Backend for GpuBackend {
    type Image = wgpu::Texture;
    type Buffer = wgpu::Buffer;
    type Surface = GpuSurface;
    type Kernel = GpuKernel;

    fn name(&self) -> &'static str {
        "wgpu-compute"
    }

    fn supports_compute(&self) -> bool {
        self.supports_compute
    }

    fn image_size(&self, image: &wgpu::Texture) -> (u32, u32) {
        (image.width(), image.height())
    }

    fn load_kernel(&mut self, source: &KernelSource) -> Result<GpuKernel> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(source.label.as_str()),
                source: wgpu::ShaderSource::Wgsl(source.wgsl.as_str().into()),
            });
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("dither-kernel-layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: SURFACE_FORMAT,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    storage_entry(2),
                    storage_entry(3),
                    wgpu::BindGroupLayoutEntry {
                        binding: 4,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("dither-kernel-pipeline-layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("dither-kernel-pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(KERNEL_ENTRY_POINT),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Capability(format!(
                "kernel `{}` failed to compile: {err}",
                source.label
            )));
        }
        debug!(label = %source.label, entry_point = KERNEL_ENTRY_POINT, "kernel resolved");
        Ok(GpuKernel { pipeline, layout })
    }

    fn create_buffer(&mut self, label: &str, contents: &[u8]) -> Result<wgpu::Buffer> {
        Ok(self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            }))
    }

    fn release_buffer(&mut self, buffer: wgpu::Buffer) {
        buffer.destroy();
    }

    fn create_surface(&mut self, descriptor: &SurfaceDescriptor) -> Result<GpuSurface> {
        if descriptor.width > MAX_SURFACE_DIMENSION || descriptor.height > MAX_SURFACE_DIMENSION {
            return Err(Error::Backend(anyhow!(
                "surface {}x{} exceeds the {MAX_SURFACE_DIMENSION}px limit",
                descriptor.width,
                descriptor.height
            )));
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("dither-surface"),
            size: extent(descriptor.width, descriptor.height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SURFACE_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        self.pop_validation("surface allocation")?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuSurface {
            texture,
            view,
            filter: descriptor.filter,
        })
    }

    fn release_surface(&mut self, surface: GpuSurface) {
        surface.texture.destroy();
    }

    fn dispatch(
        &mut self,
        kernel: &GpuKernel,
        result: &mut GpuSurface,
        inputs: KernelInputs<'_, Self>,
        groups: WorkGroups,
    ) -> Result<()> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("dither-params"),
                contents: bytemuck::bytes_of(&inputs.params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let input_view = inputs
            .image_input
            .create_view(&wgpu::TextureViewDescriptor::default());
        let bind = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dither-kernel-bind"),
            layout: &kernel.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&result.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&input_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: inputs.palette.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: inputs.dither8x8.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dither-kernel"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("dither-kernel"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups(groups.x, groups.y, groups.z);
        }
        self.queue.submit(Some(encoder.finish()));
        self.pop_validation("dispatch")
    }

    fn blit(&mut self, surface: &GpuSurface, destination: &mut wgpu::Texture) -> Result<()> {
        self.draw_blit(&surface.view, surface.filter, destination)
    }

    fn copy(&mut self, source: &wgpu::Texture, destination: &mut wgpu::Texture) -> Result<()> {
        let direct = source.size() == destination.size()
            && source.format() == destination.format()
            && source.usage().contains(wgpu::TextureUsages::COPY_SRC)
            && destination.usage().contains(wgpu::TextureUsages::COPY_DST);
        if !direct {
            let view = source.create_view(&wgpu::TextureViewDescriptor::default());
            return self.draw_blit(&view, FilterMode::Nearest, destination);
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dither-pass-through"),
            });
        encoder.copy_texture_to_texture(
            source.as_image_copy(),
            destination.as_image_copy(),
            source.size(),
        );
        self.queue.submit(Some(encoder.finish()));
        self.pop_validation("pass-through copy")
    }
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

/// Row pitch for texture-to-buffer copies, rounded up to wgpu's alignment.
fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * 4).div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readback_rows_are_aligned() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(1), 256);
    }

    #[test]
    fn blit_shader_exports_both_stages() {
        assert!(BLIT_SHADER.contains("fn vs_main"));
        assert!(BLIT_SHADER.contains("fn fs_main"));
    }
}
