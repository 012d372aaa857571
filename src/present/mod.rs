//! Keeps a window showing whatever the capture source currently points at.
//!
//! The loop owns at most one imported image. Every frame it asks the source
//! where the current buffer is; only when that changes is the buffer exported
//! and imported again. A failed refresh keeps the previous image on screen.

use crate::capture::CaptureError;
use crate::dmatex::Dmatex;
use crate::import::ImportError;
use glam::UVec2;
use std::fmt::Debug;
use thiserror::Error;
use tracing::{debug, debug_span, info, warn};

pub mod renderer;
pub mod window;

pub use renderer::WgpuRenderer;
pub use window::{WindowOptions, run};

/// Where frames come from.
pub trait FrameSource {
    /// Identifies a buffer; equal keys mean the image on screen is current.
    type Key: PartialEq + Debug;

    fn locate(&mut self) -> Result<Self::Key, CaptureError>;

    fn export(&mut self, key: &Self::Key) -> Result<Dmatex, CaptureError>;
}

/// GPU side of the loop.
pub trait Renderer {
    type Image;

    fn import(&mut self, dma: Dmatex) -> Result<Self::Image, ImportError>;

    fn resize(&mut self, viewport: Viewport);

    fn draw(&mut self, image: &Self::Image, viewport: Viewport) -> Result<DrawOutcome, RenderError>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Viewport {
    pub size: UVec2,
}

impl Viewport {
    /// Zero sized windows (minimised) are treated as one pixel.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: UVec2::new(width, height).max(UVec2::ONE),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Rendering,
    Resizing,
    Refreshing,
    Terminated,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DrawOutcome {
    Presented,
    /// The surface was not ready; nothing was drawn this frame.
    Skipped,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { reimported: bool },
    Skipped,
    Quit,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Unable to acquire the next surface texture: {0}")]
    Surface(#[from] wgpu::SurfaceError),
}

#[derive(Error, Debug)]
pub enum PresentError {
    #[error("Unable to capture the first frame during {stage}: {source}")]
    Startup {
        stage: &'static str,
        source: CaptureError,
    },
    #[error("Unable to import the first frame: {0}")]
    Import(#[from] ImportError),
    #[error(transparent)]
    Present(#[from] RenderError),
    #[error("Presentation loop is {0:?}")]
    InvalidState(LoopState),
}

impl PresentError {
    pub fn capture_error(&self) -> Option<&CaptureError> {
        match self {
            Self::Startup { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub struct PresentationLoop<S: FrameSource, R: Renderer> {
    state: LoopState,
    quit_requested: bool,
    // released before the renderer that created it
    image: Option<(S::Key, R::Image)>,
    // last key that could not be shown, so a persistent failure warns once
    failed: Option<S::Key>,
    renderer: Option<R>,
    source: S,
    viewport: Viewport,
}

impl<S: FrameSource, R: Renderer> PresentationLoop<S, R> {
    pub fn new(source: S, renderer: R, viewport: Viewport) -> Self {
        Self {
            state: LoopState::Idle,
            quit_requested: false,
            image: None,
            failed: None,
            renderer: Some(renderer),
            source,
            viewport,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn renderer(&self) -> Option<&R> {
        self.renderer.as_ref()
    }

    /// Key of the buffer on screen.
    pub fn current(&self) -> Option<&S::Key> {
        self.image.as_ref().map(|(key, _)| key)
    }

    /// Acquires and imports the first frame. Every failure here is fatal.
    pub fn start(&mut self) -> Result<(), PresentError> {
        if self.state != LoopState::Idle {
            return Err(PresentError::InvalidState(self.state));
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return Err(PresentError::InvalidState(self.state));
        };

        let first = self
            .source
            .locate()
            .and_then(|key| self.source.export(&key).map(|dma| (key, dma)));
        let (key, dma) = match first {
            Ok(first) => first,
            Err(source) => {
                self.terminate();
                return Err(PresentError::Startup {
                    stage: source.stage(),
                    source,
                });
            }
        };

        let image = match renderer.import(dma) {
            Ok(image) => image,
            Err(err) => {
                self.terminate();
                return Err(err.into());
            }
        };
        info!("Showing {key:?}");
        self.image = Some((key, image));
        renderer.resize(self.viewport);
        self.state = LoopState::Rendering;
        Ok(())
    }

    /// Follows the window size. The imported image is left alone.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.state != LoopState::Rendering {
            return;
        }
        self.state = LoopState::Resizing;
        self.viewport = Viewport::new(width, height);
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.resize(self.viewport);
        }
        debug!("Viewport is now {}", self.viewport.size);
        self.state = LoopState::Rendering;
    }

    /// Takes effect at the start of the next frame.
    pub fn request_quit(&mut self) {
        self.quit_requested = true;
    }

    pub fn frame(&mut self) -> Result<FrameOutcome, PresentError> {
        if self.quit_requested {
            self.terminate();
            return Ok(FrameOutcome::Quit);
        }
        match self.state {
            LoopState::Rendering => {}
            LoopState::Terminated => return Ok(FrameOutcome::Quit),
            state => return Err(PresentError::InvalidState(state)),
        }

        self.state = LoopState::Refreshing;
        let reimported = self.refresh();
        self.state = LoopState::Rendering;

        let (Some(renderer), Some((_, image))) = (self.renderer.as_mut(), self.image.as_ref())
        else {
            return Err(PresentError::InvalidState(self.state));
        };
        match renderer.draw(image, self.viewport) {
            Ok(DrawOutcome::Presented) => Ok(FrameOutcome::Presented { reimported }),
            Ok(DrawOutcome::Skipped) => Ok(FrameOutcome::Skipped),
            Err(err) => {
                self.terminate();
                Err(err.into())
            }
        }
    }

    /// Re-acquires the scanout buffer if it moved. Returns whether the image
    /// on screen was replaced.
    fn refresh(&mut self) -> bool {
        let _span = debug_span!("refresh").entered();
        let Some(renderer) = self.renderer.as_mut() else {
            return false;
        };

        let key = match self.source.locate() {
            Ok(key) => key,
            Err(err) => {
                debug!("Keeping previous frame, {} failed: {err}", err.stage());
                return false;
            }
        };
        if self.image.as_ref().is_some_and(|(current, _)| *current == key) {
            return false;
        }

        let repeated = self.failed.as_ref() == Some(&key);
        let image = match self.source.export(&key) {
            Ok(dma) => renderer.import(dma).map_err(|err| format!("unable to import: {err}")),
            Err(err) => Err(format!("unable to export: {err}")),
        };
        let image = match image {
            Ok(image) => image,
            Err(err) if repeated => {
                debug!("Keeping previous frame, {err}");
                return false;
            }
            Err(err) => {
                warn!("Keeping previous frame, {key:?} cannot be shown, {err}");
                self.failed = Some(key);
                return false;
            }
        };

        debug!("Switched to {key:?}");
        self.failed = None;
        self.image = None;
        self.image = Some((key, image));
        true
    }

    /// Key of the last buffer that failed to export or import, while it keeps
    /// failing.
    pub fn failing(&self) -> Option<&S::Key> {
        self.failed.as_ref()
    }

    /// Releases the image, then the renderer. Idempotent.
    pub fn terminate(&mut self) {
        if self.state == LoopState::Terminated {
            return;
        }
        self.image = None;
        self.renderer = None;
        self.state = LoopState::Terminated;
        debug!("Presentation loop terminated");
    }
}

impl<S: FrameSource, R: Renderer> Drop for PresentationLoop<S, R> {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmatex::{DmatexPlane, Resolution};
    use crate::select::NoActivePlaneError;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    fn dma(tag: u32) -> Dmatex {
        Dmatex {
            planes: vec![DmatexPlane {
                dmabuf_fd: io::pipe().unwrap().1.into(),
                offset: 0,
                stride: tag * 4,
            }],
            res: Resolution { x: tag, y: tag },
            format: drm_fourcc::DrmFourcc::Xrgb8888 as u32,
            modifier: None,
        }
    }

    /// Serves keys from a script; once the script runs out the last key
    /// repeats.
    struct Script {
        keys: VecDeque<Result<u32, ()>>,
        last: u32,
        fail_export: bool,
        exports: Vec<u32>,
    }

    impl Script {
        fn new(keys: impl IntoIterator<Item = Result<u32, ()>>) -> Self {
            Self {
                keys: keys.into_iter().collect(),
                last: 0,
                fail_export: false,
                exports: Vec::new(),
            }
        }
    }

    impl FrameSource for Script {
        type Key = u32;

        fn locate(&mut self) -> Result<u32, CaptureError> {
            match self.keys.pop_front() {
                Some(Ok(key)) => {
                    self.last = key;
                    Ok(key)
                }
                Some(Err(())) => Err(NoActivePlaneError {
                    prefer_cursor: false,
                }
                .into()),
                None => Ok(self.last),
            }
        }

        fn export(&mut self, key: &u32) -> Result<Dmatex, CaptureError> {
            if self.fail_export {
                return Err(NoActivePlaneError {
                    prefer_cursor: false,
                }
                .into());
            }
            self.exports.push(*key);
            Ok(dma(*key))
        }
    }

    struct Image {
        size: u32,
        log: Log,
    }

    impl Drop for Image {
        fn drop(&mut self) {
            self.log.borrow_mut().push(format!("drop image {}", self.size));
        }
    }

    struct Fake {
        log: Log,
        viewports: Vec<Viewport>,
        fail_import: bool,
        draw: Option<DrawOutcome>,
    }

    impl Fake {
        fn new(log: &Log) -> Self {
            Self {
                log: log.clone(),
                viewports: Vec::new(),
                fail_import: false,
                draw: Some(DrawOutcome::Presented),
            }
        }
    }

    impl Renderer for Fake {
        type Image = Image;

        fn import(&mut self, dma: Dmatex) -> Result<Image, ImportError> {
            if self.fail_import {
                return Err(ImportError::ModifierInvalid(0));
            }
            self.log.borrow_mut().push(format!("import {}", dma.res.x));
            Ok(Image {
                size: dma.res.x,
                log: self.log.clone(),
            })
        }

        fn resize(&mut self, viewport: Viewport) {
            self.viewports.push(viewport);
        }

        fn draw(&mut self, image: &Image, _viewport: Viewport) -> Result<DrawOutcome, RenderError> {
            self.log.borrow_mut().push(format!("draw {}", image.size));
            self.draw.ok_or(RenderError::Surface(wgpu::SurfaceError::OutOfMemory))
        }
    }

    impl Drop for Fake {
        fn drop(&mut self) {
            self.log.borrow_mut().push("drop renderer".to_string());
        }
    }

    fn started(source: Script, log: &Log) -> PresentationLoop<Script, Fake> {
        let mut presentation = PresentationLoop::new(source, Fake::new(log), Viewport::new(1280, 720));
        presentation.start().unwrap();
        presentation
    }

    #[test]
    fn startup_imports_the_first_frame() {
        let log = Log::default();
        let presentation = started(Script::new([Ok(1920)]), &log);

        assert_eq!(presentation.state(), LoopState::Rendering);
        assert_eq!(presentation.current(), Some(&1920));
        assert_eq!(*log.borrow(), vec!["import 1920"]);
    }

    #[test]
    fn startup_failure_is_fatal() {
        let log = Log::default();
        let mut presentation =
            PresentationLoop::new(Script::new([Err(())]), Fake::new(&log), Viewport::new(1, 1));

        let err = presentation.start().unwrap_err();
        assert!(matches!(err, PresentError::Startup { stage: "selection", .. }));
        assert_eq!(presentation.state(), LoopState::Terminated);
        assert!(presentation.renderer().is_none());
    }

    #[test]
    fn startup_import_failure_is_fatal() {
        let log = Log::default();
        let mut renderer = Fake::new(&log);
        renderer.fail_import = true;
        let mut presentation =
            PresentationLoop::new(Script::new([Ok(64)]), renderer, Viewport::new(1, 1));

        assert!(matches!(presentation.start(), Err(PresentError::Import(_))));
        assert_eq!(presentation.state(), LoopState::Terminated);
    }

    #[test]
    fn resize_does_not_reimport() {
        let log = Log::default();
        let mut presentation = started(Script::new([Ok(1920)]), &log);

        presentation.resize(800, 600);
        assert_eq!(presentation.state(), LoopState::Rendering);
        assert_eq!(presentation.viewport(), Viewport::new(800, 600));
        assert_eq!(
            presentation.frame().unwrap(),
            FrameOutcome::Presented { reimported: false }
        );

        assert_eq!(presentation.source().exports, vec![1920]);
        assert_eq!(
            presentation.renderer().unwrap().viewports.last(),
            Some(&Viewport::new(800, 600))
        );
        assert_eq!(*log.borrow(), vec!["import 1920", "draw 1920"]);
    }

    #[test]
    fn new_buffer_replaces_the_old_image() {
        let log = Log::default();
        let mut presentation = started(Script::new([Ok(10), Ok(20)]), &log);

        assert_eq!(
            presentation.frame().unwrap(),
            FrameOutcome::Presented { reimported: true }
        );
        assert_eq!(presentation.current(), Some(&20));
        assert_eq!(
            *log.borrow(),
            vec!["import 10", "import 20", "drop image 10", "draw 20"]
        );
    }

    #[test]
    fn failed_refresh_keeps_the_previous_image() {
        let log = Log::default();
        let mut presentation = started(Script::new([Ok(10), Err(()), Ok(20)]), &log);

        // locate fails
        assert_eq!(
            presentation.frame().unwrap(),
            FrameOutcome::Presented { reimported: false }
        );

        // import fails
        presentation.renderer.as_mut().unwrap().fail_import = true;
        assert_eq!(
            presentation.frame().unwrap(),
            FrameOutcome::Presented { reimported: false }
        );
        assert_eq!(presentation.current(), Some(&10));
        assert_eq!(*log.borrow(), vec!["import 10", "draw 10", "draw 10"]);
    }

    #[test]
    fn failed_export_keeps_the_previous_image() {
        let log = Log::default();
        let mut presentation = started(Script::new([Ok(10), Ok(20)]), &log);
        presentation.source.fail_export = true;

        presentation.frame().unwrap();
        assert_eq!(presentation.current(), Some(&10));
    }

    #[test]
    fn persistent_failure_is_tracked_until_it_clears() {
        let log = Log::default();
        let mut presentation = started(Script::new([Ok(10), Ok(20)]), &log);
        presentation.renderer.as_mut().unwrap().fail_import = true;

        for _ in 0..3 {
            presentation.frame().unwrap();
            assert_eq!(presentation.failing(), Some(&20));
            assert_eq!(presentation.current(), Some(&10));
        }

        presentation.renderer.as_mut().unwrap().fail_import = false;
        assert_eq!(
            presentation.frame().unwrap(),
            FrameOutcome::Presented { reimported: true }
        );
        assert_eq!(presentation.failing(), None);
        assert_eq!(presentation.current(), Some(&20));
    }

    #[test]
    fn skipped_draws_keep_running() {
        let log = Log::default();
        let mut presentation = started(Script::new([Ok(10)]), &log);
        presentation.renderer.as_mut().unwrap().draw = Some(DrawOutcome::Skipped);

        assert_eq!(presentation.frame().unwrap(), FrameOutcome::Skipped);
        assert_eq!(presentation.state(), LoopState::Rendering);
    }

    #[test]
    fn draw_failure_terminates() {
        let log = Log::default();
        let mut presentation = started(Script::new([Ok(10)]), &log);
        presentation.renderer.as_mut().unwrap().draw = None;

        assert!(matches!(presentation.frame(), Err(PresentError::Present(_))));
        assert_eq!(presentation.state(), LoopState::Terminated);
        assert_eq!(presentation.frame().unwrap(), FrameOutcome::Quit);
    }

    #[test]
    fn quit_tears_down_image_before_renderer() {
        let log = Log::default();
        let mut presentation = started(Script::new([Ok(10)]), &log);

        presentation.request_quit();
        assert_eq!(presentation.frame().unwrap(), FrameOutcome::Quit);
        assert_eq!(presentation.state(), LoopState::Terminated);
        assert_eq!(
            *log.borrow(),
            vec!["import 10", "drop image 10", "drop renderer"]
        );
    }

    #[test]
    fn resize_is_ignored_unless_rendering() {
        let log = Log::default();
        let mut presentation =
            PresentationLoop::new(Script::new([Ok(10)]), Fake::new(&log), Viewport::new(1280, 720));
        presentation.resize(10, 10);
        assert_eq!(presentation.viewport(), Viewport::new(1280, 720));
        assert_eq!(presentation.state(), LoopState::Idle);
    }

    #[test]
    fn zero_sized_viewport_is_clamped() {
        assert_eq!(Viewport::new(0, 0).size, UVec2::ONE);
    }
}
