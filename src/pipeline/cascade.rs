//! Cascaded shadow map math
//!
//! Split distances blend a logarithmic and a uniform distribution. Each cascade is
//! fitted with a bounding sphere so its size does not change as the camera rotates,
//! and its origin is snapped to whole shadow-map texels so edges do not shimmer
//! while the camera moves.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

pub const CASCADE_COUNT: usize = 4;

/// Orthographic depth range, in multiples of the cascade radius on each side of the eye
const DEPTH_RANGE_SCALE: f32 = 100.0;

/// Radius quantisation step, in world units
const RADIUS_STEP: f32 = 1.0 / 16.0;

/// Per-cascade data as laid out in the lighting uniform
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct CascadeData {
    pub view_proj: Mat4,
    /// View-space distance where this cascade ends
    pub split_depth: f32,
    pub _padding: [f32; 3],
}

/// Far distance of each cascade. The last one is always exactly `far`.
pub fn calculate_cascade_splits(near: f32, far: f32, lambda: f32) -> [f32; CASCADE_COUNT] {
    let mut splits = [0.0; CASCADE_COUNT];
    let ratio = far / near;
    let range = far - near;

    for (i, split) in splits.iter_mut().enumerate() {
        let p = (i + 1) as f32 / CASCADE_COUNT as f32;
        let log_split = near * ratio.powf(p);
        let uniform_split = near + range * p;
        *split = lambda * log_split + (1.0 - lambda) * uniform_split;
    }
    splits[CASCADE_COUNT - 1] = far;

    splits
}

/// Maps GL clip space to the [0, 1] depth range with Y flipped
fn clip_correction() -> Mat4 {
    Mat4::from_cols(
        Vec4::new(1.0, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -1.0, 0.0, 0.0),
        Vec4::new(0.0, 0.0, 0.5, 0.0),
        Vec4::new(0.0, 0.0, 0.5, 1.0),
    )
}

/// World-space corners of the camera frustum slice between two view distances.
/// Near-plane corners come first, in the same order as the far-plane corners.
pub fn frustum_slice_corners(
    inv_view_proj: Mat4,
    near: f32,
    far: f32,
    near_split: f32,
    far_split: f32,
) -> [Vec3; 8] {
    let ndc_xy = [
        Vec2::new(-1.0, -1.0),
        Vec2::new(1.0, -1.0),
        Vec2::new(1.0, 1.0),
        Vec2::new(-1.0, 1.0),
    ];
    let unproject = |xy: Vec2, z: f32| {
        let p = inv_view_proj * Vec4::new(xy.x, xy.y, z, 1.0);
        p.truncate() / p.w
    };

    let range = far - near;
    let t_near = (near_split - near) / range;
    let t_far = (far_split - near) / range;

    let mut corners = [Vec3::ZERO; 8];
    for (i, xy) in ndc_xy.into_iter().enumerate() {
        let near_corner = unproject(xy, 0.0);
        let far_corner = unproject(xy, 1.0);
        let ray = far_corner - near_corner;
        corners[i] = near_corner + ray * t_near;
        corners[i + 4] = near_corner + ray * t_far;
    }
    corners
}

/// Light view-projection for one cascade, stabilised and texel snapped
pub fn calculate_cascade_view_proj(
    inv_view_proj: Mat4,
    near: f32,
    far: f32,
    near_split: f32,
    far_split: f32,
    sun_dir: Vec3,
    shadow_map_size: u32,
) -> Mat4 {
    let corners = frustum_slice_corners(inv_view_proj, near, far, near_split, far_split);

    let center = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;
    // Near bottom-left to far top-right
    let radius = corners[0].distance(corners[6]) * 0.5;
    let radius = (radius / RADIUS_STEP).ceil() * RADIUS_STEP;

    let sun_dir = sun_dir.normalize_or_zero();
    let up = if sun_dir.cross(Vec3::Y).length_squared() < 1e-6 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let light_view = Mat4::look_at_rh(center + sun_dir * radius, center, up);

    let mut light_proj = clip_correction()
        * Mat4::orthographic_rh_gl(
            -radius,
            radius,
            -radius,
            radius,
            -radius * DEPTH_RANGE_SCALE,
            radius * DEPTH_RANGE_SCALE,
        );

    let offset = texel_snap_offset(light_proj * light_view, shadow_map_size);
    light_proj.w_axis.x += offset.x;
    light_proj.w_axis.y += offset.y;

    light_proj * light_view
}

/// Clip-space translation that moves the shadow-space origin onto the nearest texel
pub fn texel_snap_offset(shadow_matrix: Mat4, shadow_map_size: u32) -> Vec2 {
    let half_size = shadow_map_size as f32 * 0.5;
    let origin = (shadow_matrix * Vec4::new(0.0, 0.0, 0.0, 1.0)).truncate().truncate() * half_size;
    let rounded = origin.round();
    (rounded - origin) / half_size
}

/// Splits and matrices for every cascade
pub fn build_cascades(
    view_proj: Mat4,
    near: f32,
    far: f32,
    lambda: f32,
    sun_dir: Vec3,
    shadow_map_size: u32,
) -> [CascadeData; CASCADE_COUNT] {
    let inv_view_proj = view_proj.inverse();
    let splits = calculate_cascade_splits(near, far, lambda);

    let mut cascades = [CascadeData::default(); CASCADE_COUNT];
    let mut near_split = near;
    for (cascade, far_split) in cascades.iter_mut().zip(splits) {
        cascade.view_proj = calculate_cascade_view_proj(
            inv_view_proj,
            near,
            far,
            near_split,
            far_split,
            sun_dir,
            shadow_map_size,
        );
        cascade.split_depth = far_split;
        near_split = far_split;
    }
    cascades
}
