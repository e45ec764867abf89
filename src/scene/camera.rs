//! Camera contract and a perspective orbit camera

use glam::{Mat4, Vec3};

/// What the frame uploader and viewport need from a camera
pub trait CameraSource {
    /// Advance any animation by `dt` seconds
    fn update(&mut self, dt: f32);

    /// Adapt the projection to a new viewport size
    fn resize(&mut self, width: u32, height: u32);

    fn view_projection(&self) -> Mat4;

    fn inverse_view_projection(&self) -> Mat4;

    fn position(&self) -> Vec3;
}

/// Perspective projection parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            fov_y: std::f32::consts::FRAC_PI_4, // 45 degrees
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }
}

/// Camera looking at a target, optionally orbiting it around +Y
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    /// Orbit speed in radians per second
    pub orbit_speed: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.0, 4.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::default(),
            orbit_speed: 0.0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            ..Default::default()
        }
    }

    pub fn with_orbit_speed(mut self, speed: f32) -> Self {
        self.orbit_speed = speed;
        self
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }
}

impl CameraSource for Camera {
    fn update(&mut self, dt: f32) {
        if self.orbit_speed == 0.0 {
            return;
        }
        let rotation = Mat4::from_rotation_y(self.orbit_speed * dt);
        let offset = self.position - self.target;
        self.position = self.target + rotation.transform_vector3(offset);
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.projection.aspect = width.max(1) as f32 / height.max(1) as f32;
    }

    fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    fn inverse_view_projection(&self) -> Mat4 {
        self.view_projection().inverse()
    }

    fn position(&self) -> Vec3 {
        self.position
    }
}
