use super::{DrawOutcome, RenderError, Renderer, Viewport};
use crate::dmatex::Dmatex;
use crate::import::{ImportError, ImportedImage, import_dmatex};
use crate::wgpu_init::{DeviceInitError, GpuContext, create_device, vulkan_instance};
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};
use winit::window::Window;

#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Unable to create a surface for the window: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),
    #[error(transparent)]
    Device(#[from] DeviceInitError),
    #[error("Surface supports no formats on this adapter")]
    NoSurfaceFormat,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct ScreenUniform {
    res: Vec2,
}

/// An imported scanout buffer ready to be drawn.
pub struct GpuImage {
    bind_group: wgpu::BindGroup,
    image: ImportedImage,
}

impl GpuImage {
    pub fn imported(&self) -> &ImportedImage {
        &self.image
    }
}

/// Draws the captured buffer stretched over the whole window.
pub struct WgpuRenderer {
    // fields drop in declaration order: pipeline objects, then the surface,
    // then the device
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    screen: wgpu::Buffer,
    config: wgpu::SurfaceConfiguration,
    surface: wgpu::Surface<'static>,
    queue: wgpu::Queue,
    device: wgpu::Device,
    _adapter: wgpu::Adapter,
    _instance: wgpu::Instance,
}

impl WgpuRenderer {
    pub fn new(window: Arc<Window>, viewport: Viewport) -> Result<Self, RendererError> {
        let instance = vulkan_instance();
        let surface = instance.create_surface(window)?;
        let GpuContext {
            adapter,
            device,
            queue,
        } = create_device(&instance, Some(&surface))?;
        device.on_uncaptured_error(Box::new(|err| error!("Uncaptured wgpu error: {err}")));

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|format| !format.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or(RendererError::NoSurfaceFormat)?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: viewport.size.x,
            height: viewport.size.y,
            present_mode: wgpu::PresentMode::Fifo,
            desired_maximum_frame_latency: 2,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };
        surface.configure(&device, &config);
        info!("Surface format {format:?}, {}x{}", config.width, config.height);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("kmsgrab-shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shader.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kmsgrab-bind-group-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kmsgrab-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("kmsgrab-pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("kmsgrab-sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let screen = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kmsgrab-screen"),
            size: size_of::<ScreenUniform>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            pipeline,
            bind_group_layout,
            sampler,
            screen,
            config,
            surface,
            queue,
            device,
            _adapter: adapter,
            _instance: instance,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn configure(&mut self) {
        self.surface.configure(&self.device, &self.config);
    }
}

impl Renderer for WgpuRenderer {
    type Image = GpuImage;

    fn import(&mut self, dma: Dmatex) -> Result<GpuImage, ImportError> {
        let image = import_dmatex(&self.device, dma)?;
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kmsgrab-bind-group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.screen.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&image.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        Ok(GpuImage { bind_group, image })
    }

    fn resize(&mut self, viewport: Viewport) {
        if self.config.width == viewport.size.x && self.config.height == viewport.size.y {
            return;
        }
        self.config.width = viewport.size.x;
        self.config.height = viewport.size.y;
        self.configure();
    }

    fn draw(&mut self, image: &GpuImage, viewport: Viewport) -> Result<DrawOutcome, RenderError> {
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(err @ (wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost)) => {
                debug!("Reconfiguring surface: {err}");
                self.configure();
                return Ok(DrawOutcome::Skipped);
            }
            Err(wgpu::SurfaceError::Timeout) => {
                debug!("Timed out waiting for the surface");
                return Ok(DrawOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let size = viewport.size.as_vec2();
        self.queue.write_buffer(
            &self.screen,
            0,
            bytemuck::bytes_of(&ScreenUniform { res: size }),
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kmsgrab-encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("kmsgrab-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
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
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &image.bind_group, &[]);
            pass.set_viewport(0.0, 0.0, size.x, size.y, 0.0, 1.0);
            pass.draw(0..6, 0..1);
        }

        self.queue.submit(Some(encoder.finish()));
        frame.present();
        Ok(DrawOutcome::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_uniform_is_a_plain_vec2() {
        assert_eq!(size_of::<ScreenUniform>(), 8);
        let uniform = ScreenUniform {
            res: Vec2::new(800.0, 600.0),
        };
        let bytes = bytemuck::bytes_of(&uniform);
        assert_eq!(&bytes[..4], &800.0f32.to_ne_bytes());
    }

    #[test]
    fn shader_declares_the_bindings() {
        let source = include_str!("shader.wgsl");
        for binding in ["@binding(0)", "@binding(1)", "@binding(2)"] {
            assert!(source.contains(binding));
        }
        assert!(source.contains("fn vs_main"));
        assert!(source.contains("fn fs_main"));
    }
}
