//! Picks the plane that most likely shows the desktop.

use crate::kms::{Framebuffer, FramebufferDescriptor, KmsDevice, PlaneId, ScanoutPlane};
use thiserror::Error;
use tracing::{debug, trace};

/// Hardware cursor sprites are conventionally 256x256 on current hardware.
pub const DEFAULT_CURSOR_SIZE: u32 = 256;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("No scanout plane has a bound framebuffer (prefer_cursor: {prefer_cursor})")]
pub struct NoActivePlaneError {
    pub prefer_cursor: bool,
}

/// Decides whether a framebuffer is a transient overlay such as the pointer
/// sprite rather than desktop content.
pub trait SurfaceClassifier {
    fn is_cursor_class(&self, framebuffer: &FramebufferDescriptor) -> bool;
}

impl<F: Fn(&FramebufferDescriptor) -> bool> SurfaceClassifier for F {
    fn is_cursor_class(&self, framebuffer: &FramebufferDescriptor) -> bool {
        self(framebuffer)
    }
}

/// Square framebuffers of exactly this edge length are cursors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CursorSize(pub u32);

impl Default for CursorSize {
    fn default() -> Self {
        Self(DEFAULT_CURSOR_SIZE)
    }
}

impl SurfaceClassifier for CursorSize {
    fn is_cursor_class(&self, framebuffer: &FramebufferDescriptor) -> bool {
        framebuffer.res.x == self.0 && framebuffer.res.y == self.0
    }
}

/// Selection state carried between frames.
///
/// The index of the last plane that matched is tried first; as long as it
/// still has a framebuffer bound the full scan is skipped.
pub struct PlaneSelector<C = CursorSize> {
    last_good: Option<usize>,
    classifier: C,
}

impl Default for PlaneSelector {
    fn default() -> Self {
        Self::new(CursorSize::default())
    }
}

impl<C: SurfaceClassifier> PlaneSelector<C> {
    pub fn new(classifier: C) -> Self {
        Self {
            last_good: None,
            classifier,
        }
    }

    /// Index into the last plane snapshot that was selected, if any.
    pub fn cached(&self) -> Option<usize> {
        self.last_good
    }

    pub fn reset(&mut self) {
        self.last_good = None;
    }

    pub fn select_active_plane<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        planes: &[ScanoutPlane],
        prefer_cursor: bool,
    ) -> Result<PlaneId, NoActivePlaneError> {
        if let Some(index) = self.last_good {
            match planes.get(index) {
                Some(plane) if plane.is_bound() => {
                    trace!("Plane {} still bound, skipping scan", plane.id);
                    return Ok(plane.id);
                }
                _ => {
                    debug!("Cached plane index {index} lost its framebuffer, rescanning");
                    self.last_good = None;
                }
            }
        }

        // with prefer_cursor the first bound desktop plane stands in when no
        // cursor plane is showing anything
        let mut fallback = None;
        for (index, plane) in planes.iter().enumerate() {
            let Some(fb_id) = plane.framebuffer else {
                continue;
            };

            let framebuffer = match Framebuffer::acquire(device, fb_id) {
                Ok(framebuffer) => framebuffer,
                Err(err) => {
                    debug!("Skipping plane {}: {err}", plane.id);
                    continue;
                }
            };

            let is_cursor = self.classifier.is_cursor_class(&framebuffer);
            if is_cursor != prefer_cursor {
                trace!(
                    "Skipping plane {} ({}x{}, cursor class: {is_cursor})",
                    plane.id, framebuffer.res.x, framebuffer.res.y
                );
                if prefer_cursor && fallback.is_none() {
                    fallback = Some((index, plane.id));
                }
                continue;
            }

            debug!(
                "Selected plane {} with framebuffer {} ({}x{})",
                plane.id, fb_id, framebuffer.res.x, framebuffer.res.y
            );
            self.last_good = Some(index);
            return Ok(plane.id);
        }

        match fallback {
            Some((index, id)) => {
                debug!("No cursor plane is bound, selected plane {id}");
                self.last_good = Some(index);
                Ok(id)
            }
            None => Err(NoActivePlaneError { prefer_cursor }),
        }
    }
}
