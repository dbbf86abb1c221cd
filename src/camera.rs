// src/camera.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Perspective camera with position and Euler rotation (yaw, pitch).
///
/// The occlusion core never derives these from input; callers own the camera
/// and hand its matrices over once per frame.
#[derive(Clone, Debug)]
pub struct Camera {
    pub position: Vec3,
    /// yaw: rotation around Y axis (radians). pitch: rotation around X axis (radians).
    pub yaw: f32,
    pub pitch: f32,

    pub fovy: f32,
    pub aspect: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32, fovy_radians: f32, aspect: f32, znear: f32, zfar: f32) -> Self {
        Self {
            position,
            yaw,
            pitch,
            fovy: fovy_radians,
            aspect,
            znear,
            zfar,
        }
    }

    /// Unit view direction. `yaw = pitch = 0` looks down +Z.
    pub fn forward(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        Vec3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw).normalize_or_zero()
    }

    /// View matrix (right-handed, Y up).
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), Vec3::Y)
    }

    pub fn inverse_view_matrix(&self) -> Mat4 {
        self.view_matrix().inverse()
    }

    /// Perspective projection with 0..1 depth, near mapped to 0.
    pub fn proj_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fovy, self.aspect, self.znear, self.zfar)
    }

    pub fn view_proj_matrix(&self) -> Mat4 {
        self.proj_matrix() * self.view_matrix()
    }

    /// Update aspect ratio (call on resize).
    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn set_position(&mut self, pos: Vec3) {
        self.position = pos;
    }
}

/// Per-frame camera uniform (`CameraData` in the culling shader).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct CameraData {
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub inv_view: [[f32; 4]; 4],
}

impl CameraData {
    pub fn new(proj: Mat4, view: Mat4, inv_view: Mat4) -> Self {
        Self {
            view: view.to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
            inv_view: inv_view.to_cols_array_2d(),
        }
    }
}

impl Default for CameraData {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Mat4::IDENTITY, Mat4::IDENTITY)
    }
}

/// Recover `(znear, zfar)` from a `perspective_rh` projection.
///
/// An infinite far plane comes back as `f32::MAX`.
pub fn near_far_from_projection(proj: &Mat4) -> (f32, f32) {
    let r = proj.z_axis.z;
    let rn = proj.w_axis.z;
    let znear = if r.abs() > f32::EPSILON { rn / r } else { 0.0 };
    let denom = r + 1.0;
    let zfar = if denom.abs() > 1e-7 { rn / denom } else { f32::MAX };
    (znear, zfar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_orientation_looks_down_positive_z() {
        let cam = Camera::new(Vec3::new(0.0, 0.0, -10.0), 0.0, 0.0, 90f32.to_radians(), 1.0, 0.1, 100.0);
        assert!((cam.forward() - Vec3::Z).length() < 1e-6);

        // A point in front of the camera lands on negative view-space Z.
        let p = cam.view_matrix().transform_point3(Vec3::ZERO);
        assert!((p.z + 10.0).abs() < 1e-4);
    }

    #[test]
    fn near_far_roundtrip() {
        let proj = Mat4::perspective_rh(1.2, 16.0 / 9.0, 0.25, 500.0);
        let (n, f) = near_far_from_projection(&proj);
        assert!((n - 0.25).abs() < 1e-4);
        assert!((f - 500.0).abs() / 500.0 < 1e-3);
    }

    #[test]
    fn inverse_view_undoes_view() {
        let cam = Camera::new(Vec3::new(3.0, 2.0, 1.0), 0.7, -0.2, 1.0, 1.5, 0.1, 50.0);
        let m = cam.view_matrix() * cam.inverse_view_matrix();
        assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }
}
