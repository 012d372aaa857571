use super::renderer::{RendererError, WgpuRenderer};
use super::{FrameOutcome, FrameSource, PresentError, PresentationLoop, Viewport};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::error::{EventLoopError, OsError};
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::platform::x11::WindowAttributesExtX11;
use winit::window::{Fullscreen, Window, WindowId};

pub const WINDOW_CLASS: &str = "kmsgrab";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOptions {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            title: WINDOW_CLASS.to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum WindowError {
    #[error("Unable to run the event loop: {0}")]
    EventLoop(#[from] EventLoopError),
    #[error("Unable to create window: {0}")]
    Os(#[from] OsError),
    #[error(transparent)]
    Renderer(#[from] RendererError),
    #[error(transparent)]
    Present(#[from] PresentError),
}

/// Opens the window and presents `source` until the user quits or a fatal
/// error occurs.
pub fn run<S: FrameSource>(source: S, options: WindowOptions) -> Result<(), WindowError> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App {
        presentation: None,
        window: None,
        source: Some(source),
        options,
        error: None,
    };
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct App<S: FrameSource> {
    // the loop goes before the window it draws into
    presentation: Option<PresentationLoop<S, WgpuRenderer>>,
    window: Option<Arc<Window>>,
    source: Option<S>,
    options: WindowOptions,
    error: Option<WindowError>,
}

impl<S: FrameSource> App<S> {
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<(), WindowError> {
        let mut attributes = Window::default_attributes()
            .with_title(self.options.title.clone())
            .with_inner_size(PhysicalSize::new(self.options.width, self.options.height))
            .with_name(WINDOW_CLASS, WINDOW_CLASS);
        if self.options.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = Arc::new(event_loop.create_window(attributes)?);
        self.window = Some(window.clone());

        let size = window.inner_size();
        let viewport = Viewport::new(size.width, size.height);
        let renderer = WgpuRenderer::new(window, viewport)?;

        let Some(source) = self.source.take() else {
            return Ok(());
        };
        let presentation = self
            .presentation
            .insert(PresentationLoop::new(source, renderer, viewport));
        presentation.start()?;
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: WindowError) {
        debug!("Stopping after fatal error: {err}");
        self.error = Some(err);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut presentation) = self.presentation.take() {
            presentation.terminate();
        }
        self.window = None;
        event_loop.exit();
    }

    fn request_quit(&mut self) {
        if let Some(presentation) = self.presentation.as_mut() {
            presentation.request_quit();
        }
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

impl<S: FrameSource> ApplicationHandler for App<S> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(err) = self.init(event_loop) {
            self.fail(event_loop, err);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.request_quit();
            }
            WindowEvent::Destroyed => self.shutdown(event_loop),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key,
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } if is_quit_key(&logical_key) => self.request_quit(),
            WindowEvent::Resized(size) => {
                if let Some(presentation) = self.presentation.as_mut() {
                    presentation.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(presentation) = self.presentation.as_mut() else {
                    return;
                };
                match presentation.frame() {
                    Ok(FrameOutcome::Quit) => {
                        debug!("Quitting");
                        self.shutdown(event_loop);
                    }
                    Ok(_) => {}
                    Err(err) => self.fail(event_loop, err.into()),
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.presentation = None;
        self.window = None;
    }
}

fn is_quit_key(key: &Key) -> bool {
    match key {
        Key::Named(NamedKey::Escape) => true,
        Key::Character(c) => c.as_str() == "q",
        _ => false,
    }
}
