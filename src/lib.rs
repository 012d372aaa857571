//! Zero-copy viewer for the buffer a KMS display controller is scanning out.
//!
//! The scanout framebuffer is exported as DMA-BUF file descriptors, optionally
//! passed to another process over a unix socket, imported into a Vulkan image
//! through wgpu and drawn into a window every frame.

pub mod capture;
pub mod config;
pub mod dmatex;
pub mod export;
pub mod import;
pub mod kms;
pub mod logging;
pub mod present;
pub mod select;
pub mod transfer;
pub mod wgpu_init;

pub use capture::{CaptureError, KmsSource, ScanoutKey, SocketSource};
pub use config::{Config, ConfigError};
pub use dmatex::{Dmatex, DmatexPlane, Resolution};
pub use import::{ImportError, ImportedImage, import_dmatex};
pub use kms::{Card, KmsDevice};
pub use present::{FrameSource, PresentError, PresentationLoop, Renderer, WindowOptions};
pub use select::{CursorSize, PlaneSelector, SurfaceClassifier};
pub use wgpu_init::required_device_extensions;
