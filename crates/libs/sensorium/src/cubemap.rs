//! Cube-face maths shared by the GPU lidar and the wide-angle camera.
//!
//! Both sensors render the scene into up to six 90-degree faces and then
//! resample those faces into their native output layout. The face selection
//! and (u, v) mapping here is the single source of truth: the WGSL
//! resampling shaders implement the same formulas, and the CPU-side
//! projection routines reuse these functions directly so hit-testing agrees
//! with what was rendered.
//!
//! Sensor-local frame: `+X` forward, `+Y` left, `+Z` up. Azimuth grows
//! counter-clockwise from `+X` around `+Z`; elevation grows from the XY
//! plane towards `+Z`.

use glam::{Mat4, Quat, Vec2, Vec3};

use crate::params::{GpuRaysParams, LensFun};

/// One face of the cubemap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeFace {
    /// Forward, `+X`.
    PosX,
    /// Backward, `-X`.
    NegX,
    /// Left, `+Y`.
    PosY,
    /// Right, `-Y`.
    NegY,
    /// Up, `+Z`.
    PosZ,
    /// Down, `-Z`.
    NegZ,
}

impl CubeFace {
    /// All six faces, in layer order.
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PosX,
        CubeFace::NegX,
        CubeFace::PosY,
        CubeFace::NegY,
        CubeFace::PosZ,
        CubeFace::NegZ,
    ];

    /// Texture array layer of this face.
    pub fn layer(&self) -> u32 {
        match self {
            CubeFace::PosX => 0,
            CubeFace::NegX => 1,
            CubeFace::PosY => 2,
            CubeFace::NegY => 3,
            CubeFace::PosZ => 4,
            CubeFace::NegZ => 5,
        }
    }

    /// Face basis in the sensor-local frame: `(forward, up)`. The right
    /// vector is `forward x up`, matching `Mat4::look_to_rh`.
    pub fn basis(&self) -> (Vec3, Vec3) {
        match self {
            CubeFace::PosX => (Vec3::X, Vec3::Z),
            CubeFace::NegX => (Vec3::NEG_X, Vec3::Z),
            CubeFace::PosY => (Vec3::Y, Vec3::Z),
            CubeFace::NegY => (Vec3::NEG_Y, Vec3::Z),
            CubeFace::PosZ => (Vec3::Z, Vec3::X),
            CubeFace::NegZ => (Vec3::NEG_Z, Vec3::X),
        }
    }

    /// View matrix of this face's 90-degree camera for a sensor at `eye`
    /// with world orientation `orientation`.
    pub fn view_matrix(&self, eye: Vec3, orientation: Quat) -> Mat4 {
        let (forward, up) = self.basis();
        Mat4::look_to_rh(eye, orientation * forward, orientation * up)
    }
}

/// Maps a sensor-local direction to the cube face it pierces and the (u, v)
/// coordinate on that face, both in `[0, 1]`. `None` for a zero direction.
pub fn dir_to_face_uv(d: Vec3) -> Option<(CubeFace, f32, f32)> {
    if d.length_squared() < 1e-12 {
        return None;
    }
    let mut best: Option<(CubeFace, f32)> = None;
    for face in CubeFace::ALL {
        let (forward, _) = face.basis();
        let along = d.dot(forward);
        if along > best.map_or(0.0, |(_, a)| a) {
            best = Some((face, along));
        }
    }
    let (face, along) = best?;
    let (forward, up) = face.basis();
    let right = forward.cross(up);
    let u = 0.5 * (1.0 + d.dot(right) / along);
    let v = 0.5 * (1.0 - d.dot(up) / along);
    Some((face, u, v))
}

/// Unit direction for the given azimuth and elevation.
pub fn direction(azimuth: f32, elevation: f32) -> Vec3 {
    let (sin_az, cos_az) = azimuth.sin_cos();
    let (sin_el, cos_el) = elevation.sin_cos();
    Vec3::new(cos_el * cos_az, cos_el * sin_az, sin_el)
}

/// Per-output-pixel sample of the lidar lookup table.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LookupTexel {
    /// Face-local texture coordinate.
    pub u: f32,
    /// Face-local texture coordinate.
    pub v: f32,
    /// Cube face layer index.
    pub face: f32,
    /// `1 / cos` of the angle between the ray and the face's forward axis;
    /// multiplies the linearised face depth into a euclidean range.
    pub inv_cos: f32,
}

/// The lidar's precomputed (u, v, face) lookup table.
///
/// Built once from the angular ranges and sample counts, never re-derived
/// per frame. Row `j`, column `i` holds the cube-face sample of the ray with
/// the `i`-th azimuth and `j`-th elevation; rows run from the maximum
/// elevation down so the table matches image memory order.
pub struct RayLookupTable {
    /// Horizontal sample count.
    pub width: u32,
    /// Vertical sample count.
    pub height: u32,
    /// Texels in row-major order.
    pub texels: Vec<LookupTexel>,
    /// The faces the configured angular field actually touches, in layer
    /// order; only these are rendered each frame.
    pub faces: Vec<CubeFace>,
}

impl RayLookupTable {
    /// Builds the table for the given scan configuration.
    pub fn build(params: &GpuRaysParams) -> Self {
        let width = params.horizontal_samples;
        let height = params.vertical_samples;
        let mut texels = Vec::with_capacity((width * height) as usize);
        let mut used = [false; 6];
        for j in 0..height {
            let elevation = sample_angle(
                params.vertical_min_angle,
                params.vertical_max_angle,
                height,
                height - 1 - j,
            );
            for i in 0..width {
                let azimuth = sample_angle(
                    params.horizontal_min_angle,
                    params.horizontal_max_angle,
                    width,
                    i,
                );
                let dir = direction(azimuth, elevation);
                // Angles are validated, the direction cannot be zero.
                let (face, u, v) = dir_to_face_uv(dir).expect("non-zero scan direction");
                used[face.layer() as usize] = true;
                texels.push(LookupTexel {
                    u,
                    v,
                    face: face.layer() as f32,
                    inv_cos: 1.0 / dir.dot(face.basis().0),
                });
            }
        }
        let faces = CubeFace::ALL
            .into_iter()
            .filter(|f| used[f.layer() as usize])
            .collect();
        Self {
            width,
            height,
            texels,
            faces,
        }
    }
}

/// The `i`-th of `n` samples over `[min, max]`, endpoints included.
fn sample_angle(min: f32, max: f32, n: u32, i: u32) -> f32 {
    if n <= 1 {
        0.5 * (min + max)
    } else {
        min + (max - min) * i as f32 / (n - 1) as f32
    }
}

/// The wide-angle camera's lens mapping: a ray at angle `theta` from the
/// optical axis lands at image-plane radius `c1 * f * fun(theta / c2 + c3)`.
#[derive(Debug, Clone, Copy)]
pub struct LensMapping {
    /// Coefficient `c1`.
    pub c1: f32,
    /// Coefficient `c2`.
    pub c2: f32,
    /// Coefficient `c3`.
    pub c3: f32,
    /// Focal length.
    pub focal_length: f32,
    /// Mapping function family.
    pub fun: LensFun,
}

impl LensMapping {
    /// Image-plane radius of a ray at `theta` radians off the optical axis.
    pub fn radius(&self, theta: f32) -> f32 {
        let x = theta / self.c2 + self.c3;
        let fun = match self.fun {
            LensFun::Sin => x.sin(),
            LensFun::Tan => x.tan(),
            LensFun::Id => x,
        };
        self.c1 * self.focal_length * fun
    }

    /// Inverse of [`Self::radius`]: the off-axis angle landing at `r`.
    pub fn theta(&self, r: f32) -> f32 {
        let x = r / (self.c1 * self.focal_length);
        let fun_inv = match self.fun {
            LensFun::Sin => x.clamp(-1.0, 1.0).asin(),
            LensFun::Tan => x.atan(),
            LensFun::Id => x,
        };
        (fun_inv - self.c3) * self.c2
    }

    /// Projects a sensor-local direction to pixel coordinates of a
    /// `width x height` output image, replicating the resampling shader's
    /// math for hit-testing. `None` when the ray falls outside the lens
    /// cutoff angle.
    ///
    /// The radius is scaled so the cutoff angle lands on the smaller half
    /// extent of the image, same as the shader.
    pub fn project(
        &self,
        d: Vec3,
        width: u32,
        height: u32,
        cutoff: f32,
    ) -> Option<Vec2> {
        let len = d.length();
        if len < 1e-9 {
            return None;
        }
        let theta = (d.x / len).clamp(-1.0, 1.0).acos();
        if theta > cutoff * 0.5 {
            return None;
        }
        let half = 0.5 * width.min(height) as f32;
        let scale = half / self.radius(cutoff * 0.5);
        let rho = self.radius(theta) * scale;
        let lateral = Vec2::new(-d.y, -d.z); // image right, image down
        let dir = if lateral.length_squared() < 1e-12 {
            Vec2::ZERO
        } else {
            lateral.normalize()
        };
        let center = Vec2::new(width as f32 * 0.5, height as f32 * 0.5);
        Some(center + dir * rho)
    }
}
