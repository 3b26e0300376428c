use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Constants read by the ray generation program to turn pixels into rays.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_inverse: Mat4,
    pub projection_inverse: Mat4,
}

impl CameraConstants {
    pub const FIELD_OF_VIEW_DEGREES: f32 = 45.0;
    pub const NEAR: f32 = 0.1;
    pub const FAR: f32 = 1000.0;

    pub fn new(view: Mat4, projection: Mat4) -> Self {
        Self {
            view,
            projection,
            view_inverse: view.inverse(),
            projection_inverse: projection.inverse(),
        }
    }

    /// A right handed camera at `eye` looking at `target`, with Y up.
    pub fn look_at(eye: Vec3, target: Vec3, aspect_ratio: f32) -> Self {
        Self::new(
            Mat4::look_at_rh(eye, target, Vec3::Y),
            Mat4::perspective_rh(
                Self::FIELD_OF_VIEW_DEGREES.to_radians(),
                aspect_ratio,
                Self::NEAR,
                Self::FAR,
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_four_matrices() {
        assert_eq!(mem::size_of::<CameraConstants>(), 4 * 64);
    }

    #[test]
    fn test_inverses() {
        let camera = CameraConstants::look_at(Vec3::splat(1.5), Vec3::ZERO, 16.0 / 9.0);

        let eye = camera.view_inverse.transform_point3(Vec3::ZERO);
        assert!(eye.abs_diff_eq(Vec3::splat(1.5), 1e-5));
        assert!((camera.projection * camera.projection_inverse).abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }
}
