//! Read-only access to the display controller: scanout planes, framebuffer
//! metadata and PRIME export of the GEM buffers behind them.

use crate::dmatex::Resolution;
use drm::control::{Device as ControlDevice, plane, property};
use drm_fourcc::DrmModifier;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub mod resources;
pub use resources::ResourceSummary;

pub const DEFAULT_CARD: &str = "/dev/dri/card0";

/// Kernel framebuffers expose at most four memory planes.
pub const MAX_PLANES: usize = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PlaneId(pub u32);

/// Nonzero framebuffer object id. An unbound plane has no `FramebufferId`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FramebufferId(NonZeroU32);

/// GEM handle local to the opened device file.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GemHandle(NonZeroU32);

impl FramebufferId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl GemHandle {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for PlaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for FramebufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Snapshot of one scanout plane. Stale after the next enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanoutPlane {
    pub id: PlaneId,
    pub framebuffer: Option<FramebufferId>,
    pub crtc: Option<u32>,
    pub possible_crtcs: u32,
    pub geometry: PlaneGeometry,
    pub gamma_size: u32,
}

/// Source origin inside the framebuffer and destination origin on the CRTC.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PlaneGeometry {
    pub x: u32,
    pub y: u32,
    pub crtc_x: i32,
    pub crtc_y: i32,
}

impl ScanoutPlane {
    pub fn unbound(id: u32) -> Self {
        Self {
            id: PlaneId(id),
            framebuffer: None,
            crtc: None,
            possible_crtcs: 0,
            geometry: PlaneGeometry::default(),
            gamma_size: 0,
        }
    }

    pub fn bound(id: u32, framebuffer: FramebufferId) -> Self {
        Self {
            framebuffer: Some(framebuffer),
            ..Self::unbound(id)
        }
    }

    pub fn is_bound(&self) -> bool {
        self.framebuffer.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDescriptor {
    pub id: FramebufferId,
    pub res: Resolution,
    pub format: u32,
    /// Only set when the framebuffer was created with explicit modifiers.
    /// Applies to every plane.
    pub modifier: Option<DrmModifier>,
    pub planes: Vec<FramebufferPlane>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FramebufferPlane {
    pub handle: GemHandle,
    pub pitch: u32,
    pub offset: u32,
}

impl FramebufferDescriptor {
    /// Builds a descriptor from the kernel's fixed plane slots.
    ///
    /// Planes are the leading slots with a nonzero handle; the kernel hands out
    /// zero handles to callers without `CAP_SYS_ADMIN`, so an unprivileged
    /// lookup yields no planes at all.
    pub fn from_slots(
        id: FramebufferId,
        res: Resolution,
        format: u32,
        modifier: Option<DrmModifier>,
        handles: [u32; MAX_PLANES],
        pitches: [u32; MAX_PLANES],
        offsets: [u32; MAX_PLANES],
    ) -> Self {
        let planes = handles
            .iter()
            .zip(pitches.iter().zip(offsets.iter()))
            .map_while(|(handle, (pitch, offset))| {
                Some(FramebufferPlane {
                    handle: GemHandle::new(*handle)?,
                    pitch: *pitch,
                    offset: *offset,
                })
            })
            .collect();

        Self {
            id,
            res,
            format,
            modifier,
            planes,
        }
    }

    /// Each GEM handle once, in plane order. Planes of one buffer object
    /// share a handle.
    pub fn distinct_handles(&self) -> Vec<GemHandle> {
        let mut handles = Vec::with_capacity(self.planes.len());
        for plane in &self.planes {
            if !handles.contains(&plane.handle) {
                handles.push(plane.handle);
            }
        }
        handles
    }
}

#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("Unable to open display device {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("Display device does not support universal plane enumeration: {0}")]
    Capability(io::Error),
    #[error("Unable to query plane resources: {0}")]
    PlaneResources(io::Error),
    #[error("Unable to query plane {id:#x}: {source}")]
    Plane { id: u32, source: io::Error },
    #[error("Unable to query display resources: {0}")]
    Resources(io::Error),
}

#[derive(Error, Debug)]
#[error("Unable to query framebuffer {id}: {source}")]
pub struct FramebufferError {
    pub id: FramebufferId,
    pub source: io::Error,
}

/// The queries the capture pipeline needs from a display device.
pub trait KmsDevice {
    /// Every plane in enumeration order, cursor and overlay planes included.
    fn planes(&self) -> Result<Vec<ScanoutPlane>, EnumerationError>;

    /// Looks up framebuffer metadata. Any GEM handles in the result belong to
    /// the caller and must be given back through [`KmsDevice::release_handle`];
    /// prefer [`Framebuffer::acquire`] which does that on drop.
    fn framebuffer(&self, id: FramebufferId) -> Result<FramebufferDescriptor, FramebufferError>;

    /// Converts a GEM handle into a dmabuf file descriptor.
    fn export_handle(&self, handle: GemHandle) -> io::Result<OwnedFd>;

    fn release_handle(&self, handle: GemHandle) -> io::Result<()>;
}

/// Framebuffer metadata whose GEM handles are released when dropped.
pub struct Framebuffer<'d, D: KmsDevice + ?Sized> {
    device: &'d D,
    descriptor: FramebufferDescriptor,
}

impl<'d, D: KmsDevice + ?Sized> Framebuffer<'d, D> {
    pub fn acquire(device: &'d D, id: FramebufferId) -> Result<Self, FramebufferError> {
        let descriptor = device.framebuffer(id)?;
        Ok(Self { device, descriptor })
    }

    pub fn descriptor(&self) -> &FramebufferDescriptor {
        &self.descriptor
    }

    pub fn device(&self) -> &'d D {
        self.device
    }
}

impl<D: KmsDevice + ?Sized> std::ops::Deref for Framebuffer<'_, D> {
    type Target = FramebufferDescriptor;

    fn deref(&self) -> &Self::Target {
        &self.descriptor
    }
}

impl<D: KmsDevice + ?Sized> Drop for Framebuffer<'_, D> {
    fn drop(&mut self) {
        for handle in self.descriptor.distinct_handles() {
            if let Err(err) = self.device.release_handle(handle) {
                warn!(
                    "Unable to close GEM handle {} of framebuffer {}: {err}",
                    handle.get(),
                    self.descriptor.id
                );
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum GeometryProperty {
    SrcX,
    SrcY,
    CrtcX,
    CrtcY,
}

impl GeometryProperty {
    fn from_name(name: &[u8]) -> Option<Self> {
        Some(match name {
            b"SRC_X" => Self::SrcX,
            b"SRC_Y" => Self::SrcY,
            b"CRTC_X" => Self::CrtcX,
            b"CRTC_Y" => Self::CrtcY,
            _ => return None,
        })
    }
}

/// An opened `/dev/dri/card*` node with universal planes enabled.
#[derive(Debug)]
pub struct Card {
    file: File,
    path: PathBuf,
    // property ids are stable for the lifetime of the device
    geometry_properties: RefCell<HashMap<u32, Option<GeometryProperty>>>,
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EnumerationError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|source| EnumerationError::Open {
                path: path.to_owned(),
                source,
            })?;

        let card = Self {
            file,
            path: path.to_owned(),
            geometry_properties: RefCell::default(),
        };
        drm::Device::set_client_capability(&card, drm::ClientCapability::UniversalPlanes, true)
            .map_err(EnumerationError::Capability)?;

        debug!("Opened display device {:?}", card.path);
        Ok(card)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scanout_plane(&self, handle: plane::Handle) -> Result<ScanoutPlane, EnumerationError> {
        let id = u32::from(handle);
        let info = drm_ffi::mode::get_plane(self.as_fd(), id, None)
            .map_err(|source| EnumerationError::Plane { id, source })?;

        Ok(ScanoutPlane {
            id: PlaneId(id),
            framebuffer: FramebufferId::new(info.fb_id),
            crtc: (info.crtc_id != 0).then_some(info.crtc_id),
            possible_crtcs: info.possible_crtcs,
            geometry: self.plane_geometry(handle),
            gamma_size: info.gamma_size,
        })
    }

    /// Planes of legacy drivers have no geometry properties and report zeros.
    fn plane_geometry(&self, handle: plane::Handle) -> PlaneGeometry {
        let mut geometry = PlaneGeometry::default();
        let Ok(props) = self.get_properties(handle) else {
            return geometry;
        };

        let (ids, values) = props.as_props_and_values();
        for (id, value) in ids.iter().zip(values) {
            match self.geometry_property(*id) {
                // 16.16 fixed point
                Some(GeometryProperty::SrcX) => geometry.x = (*value >> 16) as u32,
                Some(GeometryProperty::SrcY) => geometry.y = (*value >> 16) as u32,
                Some(GeometryProperty::CrtcX) => geometry.crtc_x = *value as i64 as i32,
                Some(GeometryProperty::CrtcY) => geometry.crtc_y = *value as i64 as i32,
                None => {}
            }
        }
        geometry
    }

    fn geometry_property(&self, id: property::Handle) -> Option<GeometryProperty> {
        let key = u32::from(id);
        if let Some(known) = self.geometry_properties.borrow().get(&key) {
            return *known;
        }

        let known = self
            .get_property(id)
            .ok()
            .and_then(|info| GeometryProperty::from_name(info.name().to_bytes()));
        self.geometry_properties.borrow_mut().insert(key, known);
        known
    }
}

fn buffer_handle(handle: GemHandle) -> drm::buffer::Handle {
    drm::buffer::Handle::from(handle.0)
}

impl KmsDevice for Card {
    fn planes(&self) -> Result<Vec<ScanoutPlane>, EnumerationError> {
        let handles = self
            .plane_handles()
            .map_err(EnumerationError::PlaneResources)?;
        handles
            .into_iter()
            .map(|handle| self.scanout_plane(handle))
            .collect()
    }

    fn framebuffer(&self, id: FramebufferId) -> Result<FramebufferDescriptor, FramebufferError> {
        let handle = drm::control::from_u32(id.get()).ok_or_else(|| FramebufferError {
            id,
            source: io::ErrorKind::InvalidInput.into(),
        })?;
        let info = self
            .get_planar_framebuffer(handle)
            .map_err(|err| FramebufferError {
                id,
                source: io::Error::other(err),
            })?;

        let (width, height) = info.size();
        let handles = info
            .buffers()
            .map(|buffer| buffer.map_or(0, u32::from));

        Ok(FramebufferDescriptor::from_slots(
            id,
            Resolution {
                x: width,
                y: height,
            },
            info.pixel_format() as u32,
            info.modifier(),
            handles,
            info.pitches(),
            info.offsets(),
        ))
    }

    fn export_handle(&self, handle: GemHandle) -> io::Result<OwnedFd> {
        self.buffer_to_prime_fd(buffer_handle(handle), nix::libc::O_CLOEXEC as u32)
    }

    fn release_handle(&self, handle: GemHandle) -> io::Result<()> {
        self.close_buffer(buffer_handle(handle))
    }
}

/// The first `/dev/dri/card*` node, in numeric order.
pub fn default_device_path() -> PathBuf {
    let mut cards = std::fs::read_dir("/dev/dri")
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let index = card_index(&entry.file_name().to_string_lossy())?;
            Some((index, entry.path()))
        })
        .collect::<Vec<_>>();
    cards.sort_by_key(|(index, _)| *index);

    cards
        .into_iter()
        .next()
        .map(|(_, path)| path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CARD))
}

fn card_index(file_name: &str) -> Option<u32> {
    file_name.strip_prefix("card")?.parse().ok()
}
