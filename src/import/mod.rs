//! Wraps an exported scanout buffer as a sampleable wgpu texture without
//! copying it.

use crate::dmatex::Dmatex;
use crate::kms::MAX_PLANES;
use ash::vk;
use drm_fourcc::DrmModifier;
use std::os::fd::RawFd;
use thiserror::Error;
use tracing::{debug, instrument};

mod formats;
mod hal;

pub use formats::{get_vk_format, known_formats, vulkan_to_wgpu};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Format is not compatible with Vulkan")]
    VulkanIncompatibleFormat,
    #[error("Format is not compatible with Wgpu")]
    WgpuIncompatibleFormat,
    #[error("Unsupported Modifier {0:#x} for Format")]
    ModifierInvalid(u64),
    #[error("Unable to create Vulkan Image: {0}")]
    VulkanImageCreationFailed(vk::Result),
    #[error("Unrecognized Fourcc/Format")]
    UnrecognizedFourcc(#[from] drm_fourcc::UnrecognizedFourcc),
    #[error("RenderDevice is not a Vulkan Device")]
    NotVulkan,
    #[error("Device was created without the {0} extension")]
    MissingExtension(String),
    #[error("Unable to query dmabuf memory properties: {0}")]
    MemoryFdProperties(vk::Result),
    #[error("Unable to find valid Gpu Memory type index")]
    NoValidMemoryTypes,
    #[error("Unable to allocate Vulkan Gpu Memory: {0}")]
    VulkanMemoryAllocFailed(vk::Result),
    #[error("Unable to bind Vulkan Gpu Memory to Vulkan Image: {0}")]
    VulkanImageMemoryBindFailed(vk::Result),
    #[error(
        "The number of DmaTex planes does not equal the number of planes defined by the drm modifier"
    )]
    IncorrectNumberOfPlanes,
    #[error("No Planes to Import")]
    NoPlanes,
    #[error("Planes live in {0} separate buffer objects but the driver cannot bind them disjointly")]
    SeparateBufferObjects(usize),
    #[error("Unable to inspect dmabuf: {0}")]
    Inspect(std::io::Error),
    #[error("Wgpu rejected the imported texture: {0}")]
    Validation(String),
}

/// An imported scanout buffer. The Vulkan image and its memory are released
/// once wgpu drops the last reference to the texture.
#[derive(Debug)]
pub struct ImportedImage {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl ImportedImage {
    pub fn size(&self) -> wgpu::Extent3d {
        self.texture.size()
    }
}

/// Memory layout of one plane as the image is created with it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    pub fd: RawFd,
    pub offset: u64,
    pub row_pitch: u64,
}

/// What gets handed to the driver for a buffer: one layout per plane, in
/// plane order, all sharing a single modifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportPlan {
    pub modifier: DrmModifier,
    pub planes: Vec<PlaneLayout>,
    /// Distinct buffer objects behind the planes.
    pub buffer_objects: usize,
}

impl ImportPlan {
    /// How many planes get their own memory import. Without disjoint binding
    /// only the first plane's buffer is imported, which is only correct when
    /// every plane lives in it.
    pub fn bound_planes(&self, disjoint: bool) -> Result<usize, ImportError> {
        if disjoint {
            Ok(self.planes.len())
        } else if self.buffer_objects == 1 {
            Ok(1)
        } else {
            Err(ImportError::SeparateBufferObjects(self.buffer_objects))
        }
    }

    pub fn subresource_layouts(&self) -> Vec<vk::SubresourceLayout> {
        self.planes
            .iter()
            .map(|plane| vk::SubresourceLayout {
                offset: plane.offset,
                row_pitch: plane.row_pitch,
                // size must be zero for explicit modifier layouts
                size: 0,
                array_pitch: 0,
                depth_pitch: 0,
            })
            .collect()
    }
}

/// Buffers without a declared modifier are assumed linear.
pub fn import_plan(dma: &Dmatex) -> Result<ImportPlan, ImportError> {
    match dma.plane_count() {
        0 => return Err(ImportError::NoPlanes),
        n if n > MAX_PLANES => return Err(ImportError::IncorrectNumberOfPlanes),
        _ => {}
    }

    Ok(ImportPlan {
        modifier: dma.modifier.unwrap_or(DrmModifier::Linear),
        buffer_objects: dma.buffer_objects().map_err(ImportError::Inspect)?,
        planes: dma
            .planes
            .iter()
            .map(|plane| PlaneLayout {
                fd: plane.raw_fd(),
                offset: plane.offset as u64,
                row_pitch: plane.stride as u64,
            })
            .collect(),
    })
}

/// Imports `dma` into `device`. The device must be a Vulkan device created
/// with [`crate::wgpu_init::required_device_extensions`].
///
/// The buffer's file descriptors are consumed: handed to the driver on
/// success, closed on failure.
#[instrument(level = "debug", skip_all, fields(res = ?dma.res, format = %dma.format_name()))]
pub fn import_dmatex(device: &wgpu::Device, dma: Dmatex) -> Result<ImportedImage, ImportError> {
    let plan = import_plan(&dma)?;
    let image = hal::import_dmabuf_as_texture(device, dma, &plan)?;
    debug!(
        "Imported {}x{} texture with modifier {:#x}",
        image.size().width,
        image.size().height,
        u64::from(plan.modifier)
    );
    Ok(image)
}
