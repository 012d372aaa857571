use drm_fourcc::DrmModifier;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

/// Dmabuf backed copy of a scanout framebuffer.
///
/// Owns one file descriptor per memory plane. Dropping it closes them, the
/// GPU import keeps its own references.
#[derive(Debug)]
pub struct Dmatex {
    pub planes: Vec<DmatexPlane>,
    pub res: Resolution,
    /// fourcc code, see [`drm_fourcc::DrmFourcc`]
    pub format: u32,
    /// `None` when the producer did not declare a layout modifier.
    pub modifier: Option<DrmModifier>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Resolution {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug)]
pub struct DmatexPlane {
    pub dmabuf_fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// What a buffer samples as: the memory behind each plane and how it is laid
/// out. Framebuffer ids get recycled, this does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferIdentity {
    pub res: Resolution,
    pub format: u32,
    pub modifier: Option<DrmModifier>,
    pub planes: Vec<PlaneIdentity>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlaneIdentity {
    pub inode: u64,
    pub offset: u32,
    pub stride: u32,
}

impl Dmatex {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn identity(&self) -> io::Result<BufferIdentity> {
        let planes = self
            .planes
            .iter()
            .map(|plane| {
                Ok(PlaneIdentity {
                    inode: plane.buffer_inode()?,
                    offset: plane.offset,
                    stride: plane.stride,
                })
            })
            .collect::<io::Result<_>>()?;
        Ok(BufferIdentity {
            res: self.res,
            format: self.format,
            modifier: self.modifier,
            planes,
        })
    }

    /// Number of distinct buffer objects the planes live in.
    pub fn buffer_objects(&self) -> io::Result<usize> {
        let mut inodes = self
            .planes
            .iter()
            .map(DmatexPlane::buffer_inode)
            .collect::<io::Result<Vec<_>>>()?;
        inodes.sort_unstable();
        inodes.dedup();
        Ok(inodes.len())
    }

    /// Human readable fourcc, falls back to hex for unknown codes.
    pub fn format_name(&self) -> String {
        match drm_fourcc::DrmFourcc::try_from(self.format) {
            Ok(fourcc) => format!("{fourcc:?}"),
            Err(_) => format!("{:#010x}", self.format),
        }
    }
}

impl DmatexPlane {
    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        self.dmabuf_fd.as_fd().as_raw_fd()
    }

    /// The kernel keeps one dmabuf file per buffer object, so every export
    /// of the same memory reports the same inode.
    pub fn buffer_inode(&self) -> io::Result<u64> {
        let stat = nix::sys::stat::fstat(self.raw_fd())?;
        Ok(stat.st_ino as u64)
    }
}
