//! Scene-side data: camera, sun, meshes and the per-frame draw collection

mod camera;
mod draw_data;
mod light;
mod mesh;

pub use camera::*;
pub use draw_data::*;
pub use light::*;
pub use mesh::*;
