use super::{ImportError, ImportPlan, ImportedImage, formats};
use crate::dmatex::{Dmatex, DmatexPlane};
use crate::wgpu_init::required_device_extensions;
use ash::{khr, vk};
use drm_fourcc::DrmFourcc;
use std::os::fd::{AsRawFd, IntoRawFd};
use tracing::{debug, trace};
use wgpu::hal::{api::Vulkan, vulkan::Device as VkDevice};

pub(super) fn import_dmabuf_as_texture(
    device: &wgpu::Device,
    dma: Dmatex,
    plan: &ImportPlan,
) -> Result<ImportedImage, ImportError> {
    let vk_device = unsafe { device.as_hal::<Vulkan>() }.ok_or(ImportError::NotVulkan)?;
    ensure_extensions(&vk_device)?;

    let fourcc = DrmFourcc::try_from(dma.format)?;
    let vk_format = formats::get_vk_format(fourcc).ok_or(ImportError::VulkanIncompatibleFormat)?;
    let wgpu_format =
        formats::vulkan_to_wgpu(vk_format).ok_or(ImportError::WgpuIncompatibleFormat)?;

    let modifier = ensure_modifier_supported(&vk_device, vk_format, plan)?;
    let disjoint = plan.planes.len() > 1
        && modifier
            .drm_format_modifier_tiling_features
            .contains(vk::FormatFeatureFlags::DISJOINT);
    trace!("{modifier:?}, disjoint: {disjoint}");
    let bound_planes = plan.bound_planes(disjoint)?;

    let hal_tex_desc = hal_texture_desc(&dma, wgpu_format);
    let wgpu_desc = wgpu_texture_desc(&dma, wgpu_format);

    let image = create_vk_image(&vk_device, &dma, plan, vk_format, disjoint)?;
    let memory = match import_and_bind_image_memory(&vk_device, dma, image, bound_planes) {
        Ok(memory) => memory,
        Err(err) => {
            unsafe { vk_device.raw_device().destroy_image(image, None) };
            return Err(err);
        }
    };

    let drop_callback: wgpu::hal::DropCallback = {
        let raw_device = vk_device.raw_device().clone();
        Box::new(move || unsafe {
            raw_device.destroy_image(image, None);
            for memory in memory {
                raw_device.free_memory(memory, None);
            }
        })
    };

    let hal_texture =
        unsafe { vk_device.texture_from_raw(image, &hal_tex_desc, Some(drop_callback)) };

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let wgpu_texture = unsafe { device.create_texture_from_hal::<Vulkan>(hal_texture, &wgpu_desc) };
    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(ImportError::Validation(err.to_string()));
    }

    let view = wgpu_texture.create_view(&wgpu::TextureViewDescriptor::default());
    Ok(ImportedImage {
        texture: wgpu_texture,
        view,
    })
}

fn ensure_extensions(hal: &VkDevice) -> Result<(), ImportError> {
    let enabled = hal.enabled_device_extensions();
    match required_device_extensions()
        .iter()
        .find(|required| !enabled.contains(required))
    {
        Some(missing) => Err(ImportError::MissingExtension(
            missing.to_string_lossy().into_owned(),
        )),
        None => Ok(()),
    }
}

fn ensure_modifier_supported(
    hal: &VkDevice,
    format: vk::Format,
    plan: &ImportPlan,
) -> Result<vk::DrmFormatModifierPropertiesEXT, ImportError> {
    let modifier = u64::from(plan.modifier);

    let supported_modifiers = get_supported_modifiers_for_format(
        hal.shared_instance().raw_instance(),
        hal.raw_physical_device(),
        format,
    );
    let Some(properties) = supported_modifiers
        .into_iter()
        .find(|m| m.drm_format_modifier == modifier)
    else {
        debug!("Modifier {modifier:#x} is not importable as {format:?}");
        return Err(ImportError::ModifierInvalid(modifier));
    };

    if !properties
        .drm_format_modifier_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE)
    {
        debug!("Modifier {modifier:#x} cannot be sampled as {format:?}");
        return Err(ImportError::ModifierInvalid(modifier));
    }
    if properties.drm_format_modifier_plane_count as usize != plan.planes.len() {
        return Err(ImportError::IncorrectNumberOfPlanes);
    }
    Ok(properties)
}

fn default_usage_flags() -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC
}

fn create_vk_image(
    hal: &VkDevice,
    dma: &Dmatex,
    plan: &ImportPlan,
    format: vk::Format,
    disjoint: bool,
) -> Result<vk::Image, ImportError> {
    let mut external = vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

    let plane_layouts = plan.subresource_layouts();
    let mut drm_explicit = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
        .drm_format_modifier(plan.modifier.into())
        .plane_layouts(&plane_layouts);

    let create_flags = if disjoint {
        vk::ImageCreateFlags::DISJOINT
    } else {
        vk::ImageCreateFlags::empty()
    };

    let info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: dma.res.x,
            height: dma.res.y,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(default_usage_flags())
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .flags(create_flags)
        .push_next(&mut external)
        .push_next(&mut drm_explicit);

    let image = unsafe {
        hal.raw_device()
            .create_image(&info, None)
            .map_err(ImportError::VulkanImageCreationFailed)?
    };

    Ok(image)
}

fn get_mem_props(hal: &VkDevice) -> vk::PhysicalDeviceMemoryProperties {
    unsafe {
        hal.shared_instance()
            .raw_instance()
            .get_physical_device_memory_properties(hal.raw_physical_device())
    }
}

/// Imports and binds the memory behind the first `bound_planes` planes, each
/// to its own memory plane aspect when more than one is bound. The remaining
/// descriptors are closed; [`ImportPlan::bound_planes`] only allows that when
/// they share the first plane's buffer object.
///
/// On failure every allocation made so far is freed; the image is left to
/// the caller.
fn import_and_bind_image_memory(
    hal: &VkDevice,
    dma: Dmatex,
    image: vk::Image,
    bound_planes: usize,
) -> Result<Vec<vk::DeviceMemory>, ImportError> {
    let ext_mem_fd = khr::external_memory_fd::Device::new(
        hal.shared_instance().raw_instance(),
        hal.raw_device(),
    );
    let mem_props = get_mem_props(hal);
    let disjoint = bound_planes > 1;

    let mut binds = Vec::with_capacity(bound_planes);
    for (i, plane) in dma.planes.into_iter().take(bound_planes).enumerate() {
        let aspect = if disjoint {
            Some(memory_plane_aspect(i).inspect_err(|_| free_memory(hal, &binds))?)
        } else {
            None
        };

        let req = query_image_requirements(hal, image, aspect);
        match import_plane_memory(hal, &ext_mem_fd, image, plane, req, &mem_props) {
            Ok(memory) => binds.push(PlaneBind {
                memory,
                aspect_flags: aspect,
            }),
            Err(err) => {
                free_memory(hal, &binds);
                return Err(err);
            }
        }
    }

    if let Err(err) = bind_image_memory(hal, image, &binds) {
        free_memory(hal, &binds);
        return Err(err);
    }
    Ok(binds.into_iter().map(|bind| bind.memory).collect())
}

fn free_memory(hal: &VkDevice, binds: &[PlaneBind]) {
    for bind in binds {
        unsafe { hal.raw_device().free_memory(bind.memory, None) };
    }
}

fn memory_plane_aspect(i: usize) -> Result<vk::ImageAspectFlags, ImportError> {
    Ok(match i {
        0 => vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
        1 => vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
        2 => vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
        3 => vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
        _ => return Err(ImportError::IncorrectNumberOfPlanes),
    })
}

struct PlaneReq {
    size: vk::DeviceSize,
    memory_type_bits: u32,
    needs_dedicated: bool,
}

fn query_image_requirements(
    hal: &VkDevice,
    image: vk::Image,
    plane: Option<vk::ImageAspectFlags>,
) -> PlaneReq {
    let mut dedicated = vk::MemoryDedicatedRequirements::default();

    let mut plane_info =
        plane.map(|aspect| vk::ImagePlaneMemoryRequirementsInfo::default().plane_aspect(aspect));

    let mut req_info = vk::ImageMemoryRequirementsInfo2::default().image(image);
    if let Some(p) = plane_info.as_mut() {
        req_info = req_info.push_next(p);
    }

    let mut reqs2 = vk::MemoryRequirements2::default().push_next(&mut dedicated);
    unsafe {
        hal.raw_device()
            .get_image_memory_requirements2(&req_info, &mut reqs2);
    }

    PlaneReq {
        size: reqs2.memory_requirements.size,
        memory_type_bits: reqs2.memory_requirements.memory_type_bits,
        needs_dedicated: dedicated.requires_dedicated_allocation != 0,
    }
}

fn import_plane_memory(
    hal: &VkDevice,
    ext_mem_fd: &khr::external_memory_fd::Device,
    image: vk::Image,
    plane: DmatexPlane,
    req: PlaneReq,
    mem_props: &vk::PhysicalDeviceMemoryProperties,
) -> Result<vk::DeviceMemory, ImportError> {
    let fd = plane.dmabuf_fd.as_raw_fd();

    let mut fd_props = vk::MemoryFdPropertiesKHR::default();
    unsafe {
        ext_mem_fd
            .get_memory_fd_properties(
                vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                fd,
                &mut fd_props,
            )
            .map_err(ImportError::MemoryFdProperties)?;
    }

    let mem_type_index =
        select_memory_type_index(req.memory_type_bits & fd_props.memory_type_bits, mem_props)
            .ok_or(ImportError::NoValidMemoryTypes)?;

    let mut import_fd = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(fd);

    let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);

    let mut alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(req.size)
        .memory_type_index(mem_type_index)
        .push_next(&mut import_fd);

    if req.needs_dedicated {
        alloc = alloc.push_next(&mut dedicated);
    }

    let mem = unsafe {
        hal.raw_device()
            .allocate_memory(&alloc, None)
            .map_err(ImportError::VulkanMemoryAllocFailed)?
    };

    // a successful import transfers ownership of the descriptor to the driver
    let _ = plane.dmabuf_fd.into_raw_fd();
    Ok(mem)
}

fn select_memory_type_index(
    memory_type_bits: u32,
    mem_props: &vk::PhysicalDeviceMemoryProperties,
) -> Option<u32> {
    let forbidden = vk::MemoryPropertyFlags::PROTECTED | vk::MemoryPropertyFlags::LAZILY_ALLOCATED;

    (0..mem_props.memory_type_count).find(|&i| {
        memory_type_bits & (1 << i) != 0
            && !mem_props.memory_types[i as usize]
                .property_flags
                .intersects(forbidden)
    })
}

struct PlaneBind {
    memory: vk::DeviceMemory,
    aspect_flags: Option<vk::ImageAspectFlags>,
}

fn bind_image_memory(
    hal: &VkDevice,
    image: vk::Image,
    binds: &[PlaneBind],
) -> Result<(), ImportError> {
    let mut plane_mem_infos = binds
        .iter()
        .map(|bind| {
            bind.aspect_flags
                .map(|aspect| vk::BindImagePlaneMemoryInfo::default().plane_aspect(aspect))
        })
        .collect::<Vec<_>>();

    let bind_infos = binds
        .iter()
        .zip(plane_mem_infos.iter_mut())
        .map(|(bind, plane_info)| {
            let info = vk::BindImageMemoryInfo::default()
                .image(image)
                .memory(bind.memory);
            match plane_info {
                Some(plane_info) => info.push_next(plane_info),
                None => info,
            }
        })
        .collect::<Vec<_>>();

    unsafe {
        hal.raw_device()
            .bind_image_memory2(&bind_infos)
            .map_err(ImportError::VulkanImageMemoryBindFailed)?;
    }
    Ok(())
}

fn hal_texture_desc(
    dma: &Dmatex,
    format: wgpu::TextureFormat,
) -> wgpu::hal::TextureDescriptor<'static> {
    use wgpu::hal::MemoryFlags;
    use wgpu::{Extent3d, TextureDimension, TextureUses};

    wgpu::hal::TextureDescriptor {
        label: Some("kmsgrab-scanout"),
        size: Extent3d {
            width: dma.res.x,
            height: dma.res.y,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format,
        usage: TextureUses::RESOURCE | TextureUses::COPY_SRC,
        memory_flags: MemoryFlags::empty(),
        view_formats: vec![],
    }
}

fn wgpu_texture_desc(dma: &Dmatex, format: wgpu::TextureFormat) -> wgpu::TextureDescriptor<'static> {
    use wgpu::{Extent3d, TextureDimension, TextureUsages};

    wgpu::TextureDescriptor {
        label: Some("kmsgrab-scanout"),
        size: Extent3d {
            width: dma.res.x,
            height: dma.res.y,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format,
        usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_SRC,
        view_formats: &[],
    }
}

fn get_supported_modifiers_for_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
) -> Vec<vk::DrmFormatModifierPropertiesEXT> {
    let modifier_count = {
        let mut list_len = vk::DrmFormatModifierPropertiesListEXT::default();
        unsafe {
            instance.get_physical_device_format_properties2(
                physical_device,
                format,
                &mut vk::FormatProperties2::default().push_next(&mut list_len),
            );
        }
        let count = list_len.drm_format_modifier_count as usize;
        if count == 0 {
            return vec![];
        }
        count
    };

    let mut supported_modifiers =
        vec![vk::DrmFormatModifierPropertiesEXT::default(); modifier_count];

    let drm_format_modifier_count = {
        let mut list = vk::DrmFormatModifierPropertiesListEXT::default()
            .drm_format_modifier_properties(&mut supported_modifiers);

        let mut props2 = vk::FormatProperties2::default().push_next(&mut list);
        unsafe {
            instance.get_physical_device_format_properties2(physical_device, format, &mut props2);
        }
        list.drm_format_modifier_count as usize
    };

    supported_modifiers.truncate(drm_format_modifier_count);
    supported_modifiers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, flags) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    #[test]
    fn memory_type_honours_allowed_bits() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(select_memory_type_index(0b11, &props), Some(0));
        assert_eq!(select_memory_type_index(0b10, &props), Some(1));
        assert_eq!(select_memory_type_index(0, &props), None);
    }

    #[test]
    fn protected_memory_is_never_chosen() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::PROTECTED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
        ]);
        assert_eq!(select_memory_type_index(0b11, &props), None);
    }

    #[test]
    fn memory_planes_stop_at_four() {
        assert_eq!(
            memory_plane_aspect(3).unwrap(),
            vk::ImageAspectFlags::MEMORY_PLANE_3_EXT
        );
        assert!(matches!(
            memory_plane_aspect(4),
            Err(ImportError::IncorrectNumberOfPlanes)
        ));
    }
}
