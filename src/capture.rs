//! Frame sources for the presentation loop and the socket server.

use crate::dmatex::{BufferIdentity, Dmatex};
use crate::export::{ExportError, export};
use crate::kms::{Card, EnumerationError, FramebufferId, KmsDevice};
use crate::present::FrameSource;
use crate::select::{CursorSize, NoActivePlaneError, PlaneSelector, SurfaceClassifier};
use crate::transfer::{TransferError, recv_dmatex};
use std::io;
use std::os::unix::net::UnixStream;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
    #[error(transparent)]
    NoActivePlane(#[from] NoActivePlaneError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("The received buffer was already handed out")]
    Exhausted,
}

impl CaptureError {
    /// Name of the pipeline stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Enumeration(_) => "enumeration",
            Self::NoActivePlane(_) => "selection",
            Self::Export(_) => "export",
            Self::Transfer(_) | Self::Exhausted => "transfer",
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Export(ExportError::PermissionDenied(_)) => true,
            Self::Export(ExportError::Prime { source, .. }) => {
                source.kind() == io::ErrorKind::PermissionDenied
            }
            Self::Enumeration(EnumerationError::Open { source, .. }) => {
                source.kind() == io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }
}

/// Identifies what the selected plane shows.
///
/// Compositors destroy and recreate framebuffers freely and the kernel hands
/// the freed id to the next one, so the id is paired with the identity of the
/// exported buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanoutKey {
    pub framebuffer: FramebufferId,
    pub buffer: BufferIdentity,
}

/// Reads the scanout buffer straight from a display device.
///
/// Every [`FrameSource::locate`] exports the current framebuffer; the export
/// is kept until the loop asks for it, so an unchanged key costs no import.
pub struct KmsSource<D: KmsDevice = Card, C = CursorSize> {
    device: D,
    selector: PlaneSelector<C>,
    prefer_cursor: bool,
    exported: Option<(ScanoutKey, Dmatex)>,
}

impl<D: KmsDevice> KmsSource<D> {
    pub fn new(device: D, prefer_cursor: bool) -> Self {
        Self::with_classifier(device, CursorSize::default(), prefer_cursor)
    }
}

impl<D: KmsDevice, C: SurfaceClassifier> KmsSource<D, C> {
    pub fn with_classifier(device: D, classifier: C, prefer_cursor: bool) -> Self {
        Self {
            device,
            selector: PlaneSelector::new(classifier),
            prefer_cursor,
            exported: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn selector(&self) -> &PlaneSelector<C> {
        &self.selector
    }

    fn locate_framebuffer(&mut self) -> Result<FramebufferId, CaptureError> {
        let planes = self.device.planes()?;
        let plane = self
            .selector
            .select_active_plane(&self.device, &planes, self.prefer_cursor)?;
        let framebuffer = planes
            .iter()
            .find(|candidate| candidate.id == plane)
            .and_then(|candidate| candidate.framebuffer)
            .ok_or(NoActivePlaneError {
                prefer_cursor: self.prefer_cursor,
            })?;
        trace!("Plane {plane} shows framebuffer {framebuffer}");
        Ok(framebuffer)
    }
}

impl<D: KmsDevice, C: SurfaceClassifier> FrameSource for KmsSource<D, C> {
    type Key = ScanoutKey;

    fn locate(&mut self) -> Result<ScanoutKey, CaptureError> {
        self.exported = None;
        let framebuffer = self.locate_framebuffer()?;
        let (_, dmatex) = export(&self.device, framebuffer)?;
        let buffer = dmatex
            .identity()
            .map_err(|source| ExportError::Identity {
                framebuffer,
                source,
            })?;

        let key = ScanoutKey {
            framebuffer,
            buffer,
        };
        self.exported = Some((key.clone(), dmatex));
        Ok(key)
    }

    fn export(&mut self, key: &ScanoutKey) -> Result<Dmatex, CaptureError> {
        match self.exported.take() {
            Some((exported, dmatex)) if exported == *key => Ok(dmatex),
            _ => {
                let (_, dmatex) = export(&self.device, key.framebuffer)?;
                Ok(dmatex)
            }
        }
    }
}

/// A single buffer received from a capturing process. It never changes, so
/// the loop imports it once and keeps showing it.
pub struct SocketSource {
    buffer: Option<Dmatex>,
}

impl SocketSource {
    /// Blocks until the peer sends its buffer.
    pub fn receive(stream: &UnixStream) -> Result<Self, CaptureError> {
        Ok(Self::from_dmatex(recv_dmatex(stream)?))
    }

    pub fn from_dmatex(dmatex: Dmatex) -> Self {
        Self {
            buffer: Some(dmatex),
        }
    }
}

impl FrameSource for SocketSource {
    type Key = ();

    fn locate(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn export(&mut self, _key: &()) -> Result<Dmatex, CaptureError> {
        self.buffer.take().ok_or(CaptureError::Exhausted)
    }
}
