//! Post-processing effects

mod tonemapping;

pub use tonemapping::{tonemap_shader, TonemapOperator, TonemapPushConstants, TonemappingPass};
