//! Render Graph System
//!
//! A frame-scoped list of named passes. Each pass declares its outputs and reads through
//! a builder; the graph acquires transient textures from its pool, caches backend render
//! passes and framebuffers by pass name, and runs the passes in the order they were added.

pub mod graph;
pub mod pass;
pub mod resource;

pub use graph::*;
pub use pass::*;
pub use resource::*;
