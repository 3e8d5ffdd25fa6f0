//! CPU-side triangle meshes and bounding volumes.

use glam::{Mat3, Mat4, Quat, Vec3};

/// An indexed triangle mesh.
#[derive(Debug, Clone)]
pub struct TriMesh {
    /// Vertex positions in object space.
    pub positions: Vec<[f32; 3]>,
    /// Triangle indices.
    pub indices: Vec<u32>,
}

impl TriMesh {
    /// Creates a mesh from positions and indices.
    pub fn new(positions: Vec<[f32; 3]>, indices: Vec<u32>) -> Self {
        debug_assert_eq!(indices.len() % 3, 0);
        Self { positions, indices }
    }

    /// An axis-aligned unit cube centred at the origin, scaled by `size`.
    pub fn cuboid(size: Vec3) -> Self {
        let h = size * 0.5;
        let positions = vec![
            [-h.x, -h.y, -h.z],
            [h.x, -h.y, -h.z],
            [h.x, h.y, -h.z],
            [-h.x, h.y, -h.z],
            [-h.x, -h.y, h.z],
            [h.x, -h.y, h.z],
            [h.x, h.y, h.z],
            [-h.x, h.y, h.z],
        ];
        #[rustfmt::skip]
        let indices = vec![
            0, 2, 1, 0, 3, 2, // -z
            4, 5, 6, 4, 6, 7, // +z
            0, 1, 5, 0, 5, 4, // -y
            3, 6, 2, 3, 7, 6, // +y
            0, 4, 7, 0, 7, 3, // -x
            1, 2, 6, 1, 6, 5, // +x
        ];
        Self { positions, indices }
    }

    /// Object-space axis-aligned bounding box; `None` for an empty mesh.
    pub fn aabb(&self) -> Option<Aabb> {
        Aabb::from_points(self.positions.iter().map(|p| Vec3::from(*p)))
    }
}

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Aabb {
    /// Smallest box containing all `points`; `None` when empty.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut aabb = Self {
            min: first,
            max: first,
        };
        for p in iter {
            aabb.min = aabb.min.min(p);
            aabb.max = aabb.max.max(p);
        }
        Some(aabb)
    }

    /// Box centre.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Box size along each axis.
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Union with another box.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// The eight corners of the box.
    pub fn corners(&self) -> [Vec3; 8] {
        let (mn, mx) = (self.min, self.max);
        [
            Vec3::new(mn.x, mn.y, mn.z),
            Vec3::new(mx.x, mn.y, mn.z),
            Vec3::new(mn.x, mx.y, mn.z),
            Vec3::new(mx.x, mx.y, mn.z),
            Vec3::new(mn.x, mn.y, mx.z),
            Vec3::new(mx.x, mn.y, mx.z),
            Vec3::new(mn.x, mx.y, mx.z),
            Vec3::new(mx.x, mx.y, mx.z),
        ]
    }

    /// Box transformed by `m`, re-aligned to the axes.
    pub fn transformed(&self, m: &Mat4) -> Self {
        Self::from_points(self.corners().iter().map(|c| m.transform_point3(*c)))
            .unwrap_or(*self)
    }
}

/// An oriented bounding box.
#[derive(Debug, Clone, Copy)]
pub struct Obb {
    /// Box centre.
    pub center: Vec3,
    /// Box orientation.
    pub orientation: Quat,
    /// Full extents along the oriented axes.
    pub size: Vec3,
}

impl Obb {
    /// Fits an oriented box to `points` by principal-component analysis:
    /// the box axes are the eigenvectors of the covariance matrix of the
    /// point set. `None` when fewer than one point is given.
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f32;
        let mean = points.iter().copied().sum::<Vec3>() / n;

        // Symmetric covariance matrix, lower triangle is mirrored.
        let mut cov = [[0.0f32; 3]; 3];
        for p in points {
            let d = *p - mean;
            cov[0][0] += d.x * d.x;
            cov[0][1] += d.x * d.y;
            cov[0][2] += d.x * d.z;
            cov[1][1] += d.y * d.y;
            cov[1][2] += d.y * d.z;
            cov[2][2] += d.z * d.z;
        }
        cov[1][0] = cov[0][1];
        cov[2][0] = cov[0][2];
        cov[2][1] = cov[1][2];
        for row in cov.iter_mut() {
            for v in row.iter_mut() {
                *v /= n;
            }
        }

        let axes = jacobi_eigenvectors(cov);
        let rot = Mat3::from_cols(axes[0], axes[1], axes[2]);
        // Ensure a proper rotation (det +1), eigenvectors may be mirrored.
        let rot = if rot.determinant() < 0.0 {
            Mat3::from_cols(axes[0], axes[1], -axes[2])
        } else {
            rot
        };

        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        let inv = rot.transpose();
        for p in points {
            let local = inv * (*p - mean);
            min = min.min(local);
            max = max.max(local);
        }
        let center_local = (min + max) * 0.5;
        Some(Self {
            center: mean + rot * center_local,
            orientation: Quat::from_mat3(&rot),
            size: max - min,
        })
    }
}

/// Eigenvectors of a symmetric 3x3 matrix via cyclic Jacobi rotations.
fn jacobi_eigenvectors(mut a: [[f32; 3]; 3]) -> [Vec3; 3] {
    let mut v = [
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::new(0.0, 0.0, 1.0),
    ];
    for _ in 0..16 {
        // Largest off-diagonal element.
        let (mut p, mut q) = (0, 1);
        let mut off = a[0][1].abs();
        if a[0][2].abs() > off {
            (p, q, off) = (0, 2, a[0][2].abs());
        }
        if a[1][2].abs() > off {
            (p, q, off) = (1, 2, a[1][2].abs());
        }
        if off < 1e-10 {
            break;
        }
        let theta = 0.5 * (a[q][q] - a[p][p]) / a[p][q];
        let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
        let c = 1.0 / (t * t + 1.0).sqrt();
        let s = t * c;

        // Apply the rotation G(p, q, theta) on both sides.
        let mut b = a;
        for k in 0..3 {
            b[k][p] = c * a[k][p] - s * a[k][q];
            b[k][q] = s * a[k][p] + c * a[k][q];
        }
        a = b;
        let mut d = a;
        for k in 0..3 {
            d[p][k] = c * a[p][k] - s * a[q][k];
            d[q][k] = s * a[p][k] + c * a[q][k];
        }
        a = d;
        for vec in v.iter_mut() {
            let vp = vec[p];
            let vq = vec[q];
            vec[p] = c * vp - s * vq;
            vec[q] = s * vp + c * vq;
        }
    }
    // Columns of the accumulated rotation are the eigenvectors.
    [
        Vec3::new(v[0].x, v[1].x, v[2].x),
        Vec3::new(v[0].y, v[1].y, v[2].y),
        Vec3::new(v[0].z, v[1].z, v[2].z),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn aabb_from_points_and_union() {
        let a = Aabb::from_points([Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0)]).unwrap();
        assert_eq!(a.size(), Vec3::new(1.0, 2.0, 3.0));
        let b = Aabb::from_points([Vec3::new(-1.0, 0.0, 0.0), Vec3::new(0.5, 1.0, 4.0)]).unwrap();
        let u = a.union(&b);
        assert_eq!(u.min, Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(u.max, Vec3::new(1.0, 2.0, 4.0));
    }

    #[test]
    fn cuboid_aabb_matches_size() {
        let mesh = TriMesh::cuboid(Vec3::new(2.0, 4.0, 6.0));
        let aabb = mesh.aabb().unwrap();
        assert_eq!(aabb.size(), Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(aabb.center(), Vec3::ZERO);
    }

    #[test]
    fn obb_recovers_axis_aligned_extents() {
        let mesh = TriMesh::cuboid(Vec3::new(2.0, 1.0, 3.0));
        let pts: Vec<Vec3> = mesh.positions.iter().map(|p| Vec3::from(*p)).collect();
        let obb = Obb::from_points(&pts).unwrap();
        assert_relative_eq!(obb.center.x, 0.0, epsilon = 1e-5);
        // PCA may permute the axes; compare the sorted extents.
        let mut got = [obb.size.x, obb.size.y, obb.size.z];
        got.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(got[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(got[1], 2.0, epsilon = 1e-4);
        assert_relative_eq!(got[2], 3.0, epsilon = 1e-4);
    }

    #[test]
    fn obb_follows_rotated_points() {
        let rot = Quat::from_rotation_z(std::f32::consts::FRAC_PI_4);
        let mesh = TriMesh::cuboid(Vec3::new(4.0, 1.0, 1.0));
        let pts: Vec<Vec3> = mesh
            .positions
            .iter()
            .map(|p| rot * Vec3::from(*p) + Vec3::new(5.0, 0.0, 0.0))
            .collect();
        let obb = Obb::from_points(&pts).unwrap();
        assert_relative_eq!(obb.center.x, 5.0, epsilon = 1e-4);
        let mut got = [obb.size.x, obb.size.y, obb.size.z];
        got.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(got[2], 4.0, epsilon = 1e-3);
    }
}
