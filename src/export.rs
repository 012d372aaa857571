//! Turns the framebuffer behind a scanout plane into dmabuf file descriptors.

use crate::dmatex::{Dmatex, DmatexPlane};
use crate::kms::{Framebuffer, FramebufferDescriptor, FramebufferError, FramebufferId, KmsDevice};
use std::io;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Metadata(#[from] FramebufferError),
    /// The kernel withholds GEM handles from callers without `CAP_SYS_ADMIN`.
    #[error("Framebuffer {0} has no buffer handles: insufficient privilege; requires elevated capability")]
    PermissionDenied(FramebufferId),
    #[error("Unable to export plane {plane} as a dmabuf: {source}")]
    Prime { plane: usize, source: io::Error },
    #[error("Unable to identify the buffers of framebuffer {framebuffer}: {source}")]
    Identity {
        framebuffer: FramebufferId,
        source: io::Error,
    },
}

/// Exports every memory plane of a framebuffer.
///
/// Returns the metadata alongside the buffer so callers can log or classify
/// it. The GEM handles are closed before returning; on failure no file
/// descriptor survives.
#[instrument(level = "debug", skip(device), fields(framebuffer = %id))]
pub fn export<D: KmsDevice + ?Sized>(
    device: &D,
    id: FramebufferId,
) -> Result<(FramebufferDescriptor, Dmatex), ExportError> {
    let framebuffer = Framebuffer::acquire(device, id)?;
    if framebuffer.planes.is_empty() {
        return Err(ExportError::PermissionDenied(id));
    }

    let mut planes = Vec::with_capacity(framebuffer.planes.len());
    for (index, plane) in framebuffer.planes.iter().enumerate() {
        let dmabuf_fd = device
            .export_handle(plane.handle)
            .map_err(|source| ExportError::Prime {
                plane: index,
                source,
            })?;
        planes.push(DmatexPlane {
            dmabuf_fd,
            offset: plane.offset,
            stride: plane.pitch,
        });
    }

    let descriptor = framebuffer.descriptor().clone();
    let dmatex = Dmatex {
        planes,
        res: descriptor.res,
        format: descriptor.format,
        modifier: descriptor.modifier,
    };
    debug!(
        "Exported {}x{} {} with {} plane(s)",
        dmatex.res.x,
        dmatex.res.y,
        dmatex.format_name(),
        dmatex.plane_count()
    );
    Ok((descriptor, dmatex))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmatex::Resolution;
    use crate::kms::{EnumerationError, GemHandle, ScanoutPlane};
    use drm_fourcc::{DrmFourcc, DrmModifier};
    use std::cell::{Cell, RefCell};
    use std::io::{PipeReader, Read};
    use std::os::fd::OwnedFd;

    struct Exporting {
        handles: [u32; 4],
        fail_at: Option<u32>,
        readers: RefCell<Vec<PipeReader>>,
        released: RefCell<Vec<u32>>,
        exports: Cell<usize>,
    }

    impl Exporting {
        fn new(handles: [u32; 4]) -> Self {
            Self {
                handles,
                fail_at: None,
                readers: RefCell::default(),
                released: RefCell::default(),
                exports: Cell::new(0),
            }
        }
    }

    impl KmsDevice for Exporting {
        fn planes(&self) -> Result<Vec<ScanoutPlane>, EnumerationError> {
            Ok(Vec::new())
        }

        fn framebuffer(
            &self,
            id: FramebufferId,
        ) -> Result<FramebufferDescriptor, FramebufferError> {
            Ok(FramebufferDescriptor::from_slots(
                id,
                Resolution { x: 1920, y: 1080 },
                DrmFourcc::Xrgb8888 as u32,
                Some(DrmModifier::Linear),
                self.handles,
                [7680, 7680, 7680, 7680],
                [0, 0x1000, 0x2000, 0x3000],
            ))
        }

        fn export_handle(&self, handle: GemHandle) -> io::Result<OwnedFd> {
            if self.fail_at == Some(handle.get()) {
                return Err(io::ErrorKind::PermissionDenied.into());
            }
            self.exports.set(self.exports.get() + 1);
            let (reader, writer) = io::pipe()?;
            self.readers.borrow_mut().push(reader);
            Ok(writer.into())
        }

        fn release_handle(&self, handle: GemHandle) -> io::Result<()> {
            self.released.borrow_mut().push(handle.get());
            Ok(())
        }
    }

    fn fb() -> FramebufferId {
        FramebufferId::new(0x42).unwrap()
    }

    #[test]
    fn exports_the_leading_nonzero_slots() {
        let device = Exporting::new([3, 4, 0, 0]);
        let (descriptor, dmatex) = export(&device, fb()).unwrap();

        assert_eq!(dmatex.plane_count(), 2);
        assert_eq!(descriptor.planes.len(), 2);
        assert_eq!(dmatex.planes[1].offset, 0x1000);
        assert_eq!(dmatex.planes[1].stride, 7680);
        assert_eq!(dmatex.modifier, Some(DrmModifier::Linear));
        assert_eq!(*device.released.borrow(), vec![3, 4]);
    }

    #[test]
    fn no_handles_means_no_privilege() {
        let device = Exporting::new([0; 4]);
        let err = export(&device, fb()).unwrap_err();

        assert!(matches!(err, ExportError::PermissionDenied(id) if id == fb()));
        assert!(err.to_string().contains("insufficient privilege"));
        assert_eq!(device.exports.get(), 0);
    }

    #[test]
    fn failed_plane_closes_earlier_fds() {
        let mut device = Exporting::new([3, 4, 5, 0]);
        device.fail_at = Some(5);

        let err = export(&device, fb()).unwrap_err();
        assert!(matches!(err, ExportError::Prime { plane: 2, .. }));
        assert_eq!(device.exports.get(), 2);

        // every write end is gone, so each reader sees end of file
        for reader in device.readers.borrow_mut().iter_mut() {
            let mut buf = [0u8; 1];
            assert_eq!(reader.read(&mut buf).unwrap(), 0);
        }
        assert_eq!(*device.released.borrow(), vec![3, 4, 5]);
    }

    #[test]
    fn shared_buffer_objects_are_released_once() {
        let device = Exporting::new([9, 9, 0, 0]);
        let (_, dmatex) = export(&device, fb()).unwrap();

        assert_eq!(dmatex.plane_count(), 2);
        assert_eq!(device.exports.get(), 2);
        assert_eq!(*device.released.borrow(), vec![9]);
    }
}
