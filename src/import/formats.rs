//! This file is a modified version of Smithay's DRM/Vulkan format conversions
//! Original file: https://github.com/Smithay/smithay/blob/2928e4f34541d957b7b3c3b3e13b2539cd44990f/src/backend/allocator/vulkan/format.rs
//!
//! MIT License
//!
//! Copyright (c) 2017 Victor Berger and Victoria Brekenfeld
//!
//! Permission is hereby granted, free of charge, to any person obtaining a copy
//! of this software and associated documentation files (the "Software"), to deal
//! in the Software without restriction, including without limitation the rights
//! to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//! copies of the Software, and to permit persons to whom the Software is
//! furnished to do so, subject to the following conditions:
//!
//! The above copyright notice and this permission notice shall be included in all
//! copies or substantial portions of the Software.
//!
//! THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//! IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//! AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//! LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//! OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//! SOFTWARE.

use ash::vk;
use drm_fourcc::DrmFourcc;

/// Macro to generate format conversions between Vulkan and FourCC format codes.
///
/// Any entry in this table may have attributes associated with a conversion. This is needed for `PACK` Vulkan
/// formats which may only have an alternative given a specific host endian.
macro_rules! vk_format_table {
    (
        $(
            // This meta specifier is used for format conversions for PACK formats.
            $(#[$conv_meta:meta])*
            $fourcc: ident => $vk: ident
        ),* $(,)?
    ) => {
        /// Converts a FourCC format code to a Vulkan format code.
        ///
        /// This will return [`None`] if the format is not known. The caller is responsible for testing
        /// that the device can actually import the format.
        pub const fn get_vk_format(fourcc: DrmFourcc) -> Option<vk::Format> {
            match fourcc {
                $(
                    $(#[$conv_meta])*
                    DrmFourcc::$fourcc => Some(vk::Format::$vk),
                )*

                _ => None,
            }
        }

        /// Returns all the known format conversions.
        pub const fn known_formats() -> &'static [DrmFourcc] {
            &[
                $(
                    $(#[$conv_meta])*
                    DrmFourcc::$fourcc
                ),*
            ]
        }
    };
}

//
// Vulkan classifies formats by both channel sizes and colorspace. FourCC format codes do not classify formats
// based on colorspace. Scanout buffers are sampled as UNORM and shown as is.
//
// Many of these conversions come from wsi_common_wayland.c in Mesa
vk_format_table! {
    Argb8888 => B8G8R8A8_UNORM,
    Xrgb8888 => B8G8R8A8_UNORM,

    Abgr8888 => R8G8B8A8_UNORM,
    Xbgr8888 => R8G8B8A8_UNORM,

    // PACK32 formats are equivalent to u32 instead of [u8; 4] and thus their layout depends on the host
    // endian. Only layouts wgpu can sample are listed.
    #[cfg(target_endian = "little")]
    Abgr2101010 => A2B10G10R10_UNORM_PACK32,
    #[cfg(target_endian = "little")]
    Xbgr2101010 => A2B10G10R10_UNORM_PACK32,

    Abgr16161616f => R16G16B16A16_SFLOAT,
    Xbgr16161616f => R16G16B16A16_SFLOAT,
}

/// The wgpu format backed by exactly the same Vulkan format, so a texture
/// created from a raw image samples the memory as the producer wrote it.
pub fn vulkan_to_wgpu(format: vk::Format) -> Option<wgpu::TextureFormat> {
    use vk::Format as F;
    use wgpu::TextureFormat as Tf;
    Some(match format {
        F::B8G8R8A8_UNORM => Tf::Bgra8Unorm,
        F::R8G8B8A8_UNORM => Tf::Rgba8Unorm,
        F::A2B10G10R10_UNORM_PACK32 => Tf::Rgb10a2Unorm,
        F::R16G16B16A16_SFLOAT => Tf::Rgba16Float,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_formats_map_to_wgpu() {
        for fourcc in [DrmFourcc::Xrgb8888, DrmFourcc::Argb8888] {
            let vk = get_vk_format(fourcc).unwrap();
            assert_eq!(vulkan_to_wgpu(vk), Some(wgpu::TextureFormat::Bgra8Unorm));
        }
        let vk = get_vk_format(DrmFourcc::Xbgr8888).unwrap();
        assert_eq!(vulkan_to_wgpu(vk), Some(wgpu::TextureFormat::Rgba8Unorm));
    }

    #[test]
    fn yuv_is_not_in_the_table() {
        assert_eq!(get_vk_format(DrmFourcc::Nv12), None);
        assert!(!known_formats().contains(&DrmFourcc::Nv12));
    }

    #[test]
    fn every_listed_format_has_a_wgpu_equivalent() {
        for fourcc in known_formats() {
            let vk = get_vk_format(*fourcc).unwrap();
            assert!(vulkan_to_wgpu(vk).is_some(), "{fourcc:?} maps to {vk:?}");
        }
    }

    #[test]
    fn layouts_wgpu_cannot_sample_are_absent() {
        for fourcc in [
            DrmFourcc::Rgba8888,
            DrmFourcc::Rgbx8888,
            DrmFourcc::Argb2101010,
            DrmFourcc::Xrgb2101010,
        ] {
            assert_eq!(get_vk_format(fourcc), None);
        }
    }
}
