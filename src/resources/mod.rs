//! Resource management
//!
//! Frame-partitioned GPU buffers, material textures and background texture decoding.

mod ring_buffer;
mod texture;
mod upload;

pub use ring_buffer::*;
pub use texture::*;
pub use upload::*;
