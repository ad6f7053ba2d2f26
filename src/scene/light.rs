//! Light types for the scene

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// Directional light (the sun)
#[derive(Debug, Clone)]
pub struct DirectionalLight {
    /// Direction the light travels in
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.5, -1.0, -0.5).normalize(),
            color: Vec3::ONE,
            intensity: 3.0,
        }
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize(),
            color,
            intensity,
        }
    }

    /// Unit vector pointing from the scene towards the sun
    pub fn sun_direction(&self) -> Vec3 {
        (-self.direction).normalize_or_zero()
    }

    /// Convert to GPU data format
    pub fn to_gpu_data(&self) -> GpuSunData {
        GpuSunData {
            direction_intensity: self.sun_direction().extend(self.intensity),
            color: self.color.extend(1.0),
        }
    }
}

/// Sun parameters as laid out in the lighting uniform
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuSunData {
    /// xyz: direction towards the sun, w: intensity
    pub direction_intensity: Vec4,
    pub color: Vec4,
}
