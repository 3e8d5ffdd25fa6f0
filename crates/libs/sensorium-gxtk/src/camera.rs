//! Camera and projection maths shared by the sensor pipelines.

use glam::{Mat4, Vec3};

/// A look-at camera.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    /// Camera position in world space.
    pub eye: Vec3,
    /// Point the camera looks at.
    pub target: Vec3,
    /// Up direction.
    pub up: Vec3,
}

impl Camera {
    /// Creates a camera at `eye` looking at `target`.
    pub fn new(eye: Vec3, target: Vec3, up: Vec3) -> Self {
        Self { eye, target, up }
    }

    /// Right-handed view matrix.
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    /// Forward direction (towards the target), normalised.
    pub fn forward(&self) -> Vec3 {
        (self.target - self.eye).normalize()
    }
}

/// Perspective projection; depth maps `[near, far]` onto `[0, 1]` the way
/// wgpu expects.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    /// Vertical field of view in radians.
    pub fov_y: f32,
    /// Width / height.
    pub aspect: f32,
    /// Near clip plane, world units.
    pub near: f32,
    /// Far clip plane, world units.
    pub far: f32,
}

impl Projection {
    /// Creates a new projection.
    pub fn new(fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            fov_y,
            aspect,
            near,
            far,
        }
    }

    /// Projection matrix (right-handed, zero-to-one depth).
    pub fn matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    /// The `(a, b)` reprojection coefficients of this projection: a depth
    /// buffer value `d` decodes to the view-space distance `b / (a - d)`.
    pub fn depth_coefficients(&self) -> (f32, f32) {
        let a = self.far / (self.far - self.near);
        let b = self.far * self.near / (self.far - self.near);
        (a, b)
    }

    /// Decodes a raw depth buffer value into a view-space distance.
    ///
    /// `d = 1.0` (the clear value, nothing rendered) decodes to `far`.
    pub fn linearize_depth(&self, d: f32) -> f32 {
        let (a, b) = self.depth_coefficients();
        b / (a - d)
    }

    /// Whether a point given in view space (camera looks down `-Z`) lies
    /// inside the view frustum.
    pub fn contains_view_point(&self, p: Vec3) -> bool {
        let dist = -p.z;
        if dist < self.near || dist > self.far {
            return false;
        }
        let half_h = dist * (self.fov_y * 0.5).tan();
        let half_w = half_h * self.aspect;
        p.x.abs() <= half_w && p.y.abs() <= half_h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn depth_linearization_round_trip() {
        let proj = Projection::new(std::f32::consts::FRAC_PI_3, 1.0, 0.1, 100.0);
        let m = proj.matrix();
        for dist in [0.5f32, 5.0, 42.0, 99.0] {
            let clip = m * Vec4::new(0.0, 0.0, -dist, 1.0);
            let d = clip.z / clip.w;
            assert_relative_eq!(proj.linearize_depth(d), dist, max_relative = 1e-3);
        }
    }

    #[test]
    fn cleared_depth_decodes_to_far() {
        let proj = Projection::new(1.0, 1.0, 0.1, 30.0);
        assert_relative_eq!(proj.linearize_depth(1.0), 30.0, max_relative = 1e-4);
    }

    #[test]
    fn frustum_containment() {
        let proj = Projection::new(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 10.0);
        assert!(proj.contains_view_point(Vec3::new(0.0, 0.0, -5.0)));
        // At 90 degrees fov the frustum half-extent equals the distance.
        assert!(proj.contains_view_point(Vec3::new(4.9, 0.0, -5.0)));
        assert!(!proj.contains_view_point(Vec3::new(5.1, 0.0, -5.0)));
        assert!(!proj.contains_view_point(Vec3::new(0.0, 0.0, -11.0)));
        assert!(!proj.contains_view_point(Vec3::new(0.0, 0.0, 5.0)));
    }
}
