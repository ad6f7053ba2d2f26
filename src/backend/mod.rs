//! Backend abstraction layer
//!
//! Provides the [`Device`] and [`GraphicsContext`] traits the renderer is written
//! against, plus two implementations: a wgpu backend for real rendering and a
//! headless recording backend for tests and offline use.

pub mod headless;
pub mod traits;
pub mod types;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use headless::{FailureInjection, HeadlessBackend, RecordedCommand};
pub use traits::*;
pub use types::*;
