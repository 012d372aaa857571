use std::ffi::CStr;
use thiserror::Error;
use tracing::{debug, info};
use wgpu::hal::api::Vulkan;

const REQUIRED_EXTENSIONS: &[&CStr] = &[
    ash::ext::image_drm_format_modifier::NAME,
    ash::ext::external_memory_dma_buf::NAME,
    ash::khr::external_memory_fd::NAME,
    ash::khr::external_memory::NAME,
    ash::khr::swapchain::NAME,
];

pub const fn required_device_extensions() -> &'static [&'static CStr] {
    REQUIRED_EXTENSIONS
}

#[derive(Error, Debug)]
pub enum DeviceInitError {
    #[error("No Vulkan adapter available: {0}")]
    NoAdapter(#[from] wgpu::RequestAdapterError),
    #[error("Adapter is not a Vulkan adapter")]
    NotVulkan,
    #[error("Unable to open Vulkan device with dmabuf import extensions: {0}")]
    Open(#[from] wgpu::hal::DeviceError),
    #[error("Unable to create wgpu device: {0}")]
    Request(#[from] wgpu::RequestDeviceError),
}

pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

pub fn vulkan_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::VULKAN,
        ..Default::default()
    })
}

/// Opens a device on the first Vulkan adapter able to present to `surface`,
/// with every extension dmabuf import depends on enabled.
pub fn create_device(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'_>>,
) -> Result<GpuContext, DeviceInitError> {
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::default(),
        force_fallback_adapter: false,
        compatible_surface: surface,
    }))?;
    info!("Using adapter {:?}", adapter.get_info().name);

    let desc = wgpu::DeviceDescriptor {
        label: Some("kmsgrab"),
        ..Default::default()
    };

    let open_device = {
        let hal_adapter = unsafe { adapter.as_hal::<Vulkan>() }.ok_or(DeviceInitError::NotVulkan)?;
        let callback: Box<wgpu::hal::vulkan::CreateDeviceCallback<'_>> = Box::new(|args| {
            for &extension in REQUIRED_EXTENSIONS {
                if !args.extensions.contains(&extension) {
                    debug!("Enabling {extension:?}");
                    args.extensions.push(extension);
                }
            }
        });
        unsafe {
            hal_adapter.open_with_callback(
                desc.required_features,
                &desc.memory_hints,
                Some(callback),
            )?
        }
    };

    let (device, queue) = unsafe { adapter.create_device_from_hal::<Vulkan>(open_device, &desc)? };
    Ok(GpuContext {
        adapter,
        device,
        queue,
    })
}
