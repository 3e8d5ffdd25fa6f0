//! CPU-side decoding of read-back sensor textures.
//!
//! Everything a shader cannot finish lives here: unpacking the ID mask into
//! label maps, extracting and merging bounding boxes, clamping ray and depth
//! buffers, and quantising temperatures. All routines operate on tightly
//! packed buffers; the attachments strip row padding during read-back.

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec2, Vec3, Vec4Swizzles};
use rayon::prelude::*;
use scene::{Obb, TriMesh, VisualId};

use crate::params::{DepthCameraParams, GpuRaysParams, NoHitPolicy, ThermalCameraParams};

/// Encodes a 16-bit object id and a label into RGBA8 channels, the layout
/// the segmentation and bounding-box scene passes render with.
pub fn pack_id_label(id: u16, label: u8) -> [u8; 4] {
    [(id / 256) as u8, (id % 256) as u8, label, 255]
}

/// Inverse of [`pack_id_label`] over the first three channels of a pixel.
pub fn unpack_id_label(pixel: &[u8]) -> (u16, u8) {
    (u16::from(pixel[0]) * 256 + u16::from(pixel[1]), pixel[2])
}

/// Per-pixel label map decoded from an RGBA8 ID-mask buffer.
pub struct LabelMap {
    /// Object id per pixel, row-major.
    pub ids: Vec<u16>,
    /// Label per pixel, row-major.
    pub labels: Vec<u8>,
}

impl LabelMap {
    /// Decodes a tightly packed ID-mask buffer into id and label planes.
    /// `channels` is the pixel stride, 3 for RGB and 4 for RGBA.
    pub fn from_colored_buffer(buffer: &[u8], channels: usize) -> Self {
        debug_assert!(channels >= 3);
        let pixels = buffer.len() / channels;
        let mut ids = Vec::with_capacity(pixels);
        let mut labels = Vec::with_capacity(pixels);
        for pixel in buffer.chunks_exact(channels) {
            let (id, label) = unpack_id_label(pixel);
            ids.push(id);
            labels.push(label);
        }
        Self { ids, labels }
    }
}

/// Screen-space extent in pixel coordinates, `max` exclusive on neither end;
/// a single pixel has `min == max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent2 {
    /// Smallest covered pixel coordinate.
    pub min: Vec2,
    /// Largest covered pixel coordinate.
    pub max: Vec2,
}

impl Extent2 {
    /// Extent covering both operands.
    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Midpoint of the extent.
    pub fn center(&self) -> Vec2 {
        0.5 * (self.min + self.max)
    }

    /// Edge lengths; non-negative by construction.
    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }
}

/// A 2D bounding box in screen space.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox2d {
    /// Box center in pixels.
    pub center: Vec2,
    /// Box size in pixels.
    pub size: Vec2,
    /// Label of the boxed object.
    pub label: u8,
}

/// A 3D oriented bounding box in camera space.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox3d {
    /// Box center.
    pub center: Vec3,
    /// Box orientation.
    pub orientation: Quat,
    /// Box edge lengths.
    pub size: Vec3,
    /// Label of the boxed object.
    pub label: u8,
}

/// Scans an RGBA8 ID mask once and returns per-id pixel extents and labels,
/// skipping pixels carrying the background label.
pub fn visible_extents(
    mask: &[u8],
    width: u32,
    height: u32,
    background_label: u8,
) -> HashMap<u16, (Extent2, u8)> {
    let mut extents: HashMap<u16, (Extent2, u8)> = HashMap::new();
    for y in 0..height {
        for x in 0..width {
            let at = 4 * (y * width + x) as usize;
            let (id, label) = unpack_id_label(&mask[at..at + 4]);
            if label == background_label {
                continue;
            }
            let pixel = Extent2 {
                min: Vec2::new(x as f32, y as f32),
                max: Vec2::new(x as f32, y as f32),
            };
            extents
                .entry(id)
                .and_modify(|(e, _)| *e = e.union(pixel))
                .or_insert((pixel, label));
        }
    }
    extents
}

/// Projects every vertex of a mesh through `view_proj` and returns the
/// screen-space extent, ignoring occlusion. `None` when the mesh lies
/// entirely outside the visible clip range or entirely behind the camera.
pub fn full_extent(
    mesh: &TriMesh,
    model: Mat4,
    view_proj: Mat4,
    width: u32,
    height: u32,
) -> Option<Extent2> {
    let mvp = view_proj * model;
    let mut min = Vec2::splat(f32::INFINITY);
    let mut max = Vec2::splat(f32::NEG_INFINITY);
    for p in &mesh.positions {
        let clip = mvp * Vec3::from(*p).extend(1.0);
        if clip.w <= 0.0 {
            continue;
        }
        let ndc = clip.xy() / clip.w;
        min = min.min(ndc);
        max = max.max(ndc);
    }
    if min.x > max.x || max.x < -1.0 || min.x > 1.0 || max.y < -1.0 || min.y > 1.0 {
        return None;
    }
    let to_px = |ndc: Vec2| {
        let clamped = ndc.clamp(Vec2::splat(-1.0), Vec2::splat(1.0));
        Vec2::new(
            (clamped.x + 1.0) * 0.5 * width as f32,
            // NDC y points up, pixel y points down.
            (1.0 - clamped.y) * 0.5 * height as f32,
        )
    };
    let a = to_px(min);
    let b = to_px(max);
    Some(Extent2 {
        min: a.min(b),
        max: a.max(b),
    })
}

/// Camera-space points of a mesh under `view * model`.
pub fn camera_space_points(mesh: &TriMesh, model: Mat4, view: Mat4) -> Vec<Vec3> {
    let to_camera = view * model;
    mesh.positions
        .iter()
        .map(|p| to_camera.transform_point3(Vec3::from(*p)))
        .collect()
}

/// Merges per-link 2D extents into final boxes, one per group key.
///
/// Extents sharing a key are unioned. Groups come out in reverse first-seen
/// order, matching the established consumer-facing ordering.
pub fn merge_boxes_2d(links: Vec<(VisualId, Extent2, u8)>) -> Vec<BoundingBox2d> {
    let mut order: Vec<VisualId> = Vec::new();
    let mut merged: HashMap<VisualId, (Extent2, u8)> = HashMap::new();
    for (key, extent, label) in links {
        match merged.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().0 = e.get().0.union(extent);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert((extent, label));
                order.push(key);
            }
        }
    }
    order
        .into_iter()
        .rev()
        .map(|key| {
            let (extent, label) = merged[&key];
            BoundingBox2d {
                center: extent.center(),
                size: extent.size(),
                label,
            }
        })
        .collect()
}

/// Merges per-link camera-space point sets into oriented 3D boxes, one per
/// group key, recomputing the orientation over the merged point cloud.
/// Output order is reversed first-seen order, same as [`merge_boxes_2d`].
pub fn merge_boxes_3d(links: Vec<(VisualId, Vec<Vec3>, u8)>) -> Vec<BoundingBox3d> {
    let mut order: Vec<VisualId> = Vec::new();
    let mut merged: HashMap<VisualId, (Vec<Vec3>, u8)> = HashMap::new();
    for (key, points, label) in links {
        match merged.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().0.extend(points);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert((points, label));
                order.push(key);
            }
        }
    }
    order
        .into_iter()
        .rev()
        .filter_map(|key| {
            let (points, label) = &merged[&key];
            let obb = Obb::from_points(points)?;
            Some(BoundingBox3d {
                center: obb.center,
                orientation: obb.orientation,
                size: obb.size,
                label: *label,
            })
        })
        .collect()
}

/// Clamps a linearised depth buffer into the configured window, in place.
pub fn clamp_depth(depth: &mut [f32], params: &DepthCameraParams) {
    for d in depth {
        *d = d.clamp(params.min_depth, params.max_depth);
    }
}

/// Repacks a depth buffer into a camera-space point cloud, one
/// `(x, y, z, w)` sample per pixel with `w` carrying a packed RGBA colour.
///
/// Pixel rays are reconstructed from the perspective parameters; depth is
/// the distance along the view direction.
pub fn depth_point_cloud(
    depth: &[f32],
    width: u32,
    height: u32,
    fov_y: f32,
    color: u32,
) -> Vec<[f32; 4]> {
    let aspect = width as f32 / height as f32;
    let tan_half = (fov_y * 0.5).tan();
    let packed = f32::from_bits(color);
    let points = depth
        .par_iter()
        .enumerate()
        .map(|(i, &d)| {
            let px = (i as u32 % width) as f32;
            let py = (i as u32 / width) as f32;
            let ndc_x = 2.0 * (px + 0.5) / width as f32 - 1.0;
            let ndc_y = 1.0 - 2.0 * (py + 0.5) / height as f32;
            [
                ndc_x * tan_half * aspect * d,
                ndc_y * tan_half * d,
                -d,
                packed,
            ]
        })
        .collect();
    points
}

/// Quantises a kelvin buffer into 16-bit counts of `linear_resolution`
/// kelvin each, clamping into the configured temperature window.
pub fn quantise_temperatures(kelvin: &[f32], params: &ThermalCameraParams) -> Vec<u16> {
    kelvin
        .iter()
        .map(|&t| {
            let clamped = t.clamp(params.min_temperature, params.max_temperature);
            ((clamped / params.linear_resolution).round() as u32).min(u32::from(u16::MAX)) as u16
        })
        .collect()
}

/// Finalises the resampled ray scan: takes the RGBA32F buffer of the second
/// lidar stage (range, retro, unused, unused) and produces the 3-channel
/// output, applying the range window and the no-hit policy.
///
/// Hits nearer than `min_range` are clamped up; samples at or beyond
/// `max_range` count as misses and report `max_range` or infinity per
/// policy. The third channel is reserved and always zero.
pub fn finalize_ray_scan(samples: &[f32], params: &GpuRaysParams) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len() / 4 * 3);
    for sample in samples.chunks_exact(4) {
        let (range, retro) = (sample[0], sample[1]);
        let (range, retro) = if range >= params.max_range || !range.is_finite() {
            let miss = match params.no_hit {
                NoHitPolicy::MaxRange => params.max_range,
                NoHitPolicy::Infinity => f32::INFINITY,
            };
            (miss, 0.0)
        } else {
            (range.max(params.min_range), retro)
        };
        out.push(range);
        out.push(retro);
        out.push(0.0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CameraParams;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn id_packing_round_trip_boundaries() {
        for id in [0u16, 255, 256, 65535] {
            let px = pack_id_label(id, 7);
            assert_eq!(unpack_id_label(&px), (id, 7));
        }
    }

    proptest! {
        #[test]
        fn id_packing_round_trip(id in 0u16..=u16::MAX, label in 0u8..=u8::MAX) {
            let px = pack_id_label(id, label);
            prop_assert_eq!(unpack_id_label(&px), (id, label));
        }
    }

    #[test]
    fn background_pixels_are_skipped() {
        // 2x2 mask: one labelled pixel, three background.
        let bg = pack_id_label(0, 255);
        let fg = pack_id_label(300, 4);
        let mut mask = Vec::new();
        for px in [bg, fg, bg, bg] {
            mask.extend_from_slice(&px);
        }
        let extents = visible_extents(&mask, 2, 2, 255);
        assert_eq!(extents.len(), 1);
        let (extent, label) = extents[&300];
        assert_eq!(label, 4);
        assert_eq!(extent.min, Vec2::new(1.0, 0.0));
        assert_eq!(extent.max, Vec2::new(1.0, 0.0));
    }

    #[test]
    fn visible_extent_spans_covered_pixels() {
        let bg = pack_id_label(0, 255);
        let fg = pack_id_label(1, 2);
        let mut mask = Vec::new();
        // 3x3 with object pixels at (0,0) and (2,1).
        for px in [fg, bg, bg, bg, bg, fg, bg, bg, bg] {
            mask.extend_from_slice(&px);
        }
        let extents = visible_extents(&mask, 3, 3, 255);
        let (extent, _) = extents[&1];
        assert_eq!(extent.min, Vec2::ZERO);
        assert_eq!(extent.max, Vec2::new(2.0, 1.0));
    }

    fn extent(min: (f32, f32), max: (f32, f32)) -> Extent2 {
        Extent2 {
            min: Vec2::new(min.0, min.1),
            max: Vec2::new(max.0, max.1),
        }
    }

    #[test]
    fn multi_link_boxes_merge_by_union() {
        // Two links of one object: [8,12]x[8,12] and [18,22]x[8,12].
        let key = VisualId(1);
        let merged = merge_boxes_2d(vec![
            (key, extent((8.0, 8.0), (12.0, 12.0)), 5),
            (key, extent((18.0, 8.0), (22.0, 12.0)), 5),
        ]);
        assert_eq!(merged.len(), 1);
        assert_relative_eq!(merged[0].center.x, 15.0);
        assert_relative_eq!(merged[0].center.y, 10.0);
        assert_relative_eq!(merged[0].size.x, 14.0);
        assert_relative_eq!(merged[0].size.y, 4.0);
        assert_eq!(merged[0].label, 5);
    }

    #[test]
    fn merged_groups_come_out_reversed() {
        let merged = merge_boxes_2d(vec![
            (VisualId(1), extent((0.0, 0.0), (1.0, 1.0)), 1),
            (VisualId(2), extent((5.0, 5.0), (6.0, 6.0)), 2),
            (VisualId(1), extent((2.0, 0.0), (3.0, 1.0)), 1),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].label, 2);
        assert_eq!(merged[1].label, 1);
    }

    #[test]
    fn merge_3d_recomputes_over_combined_points() {
        let key = VisualId(3);
        // Two unit cubes side by side along x merge into a 3x1x1 box.
        let cube = |offset: f32| -> Vec<Vec3> {
            let mut pts = Vec::new();
            for x in [0.0, 1.0] {
                for y in [0.0, 1.0] {
                    for z in [0.0, 1.0] {
                        pts.push(Vec3::new(x + offset, y, z));
                    }
                }
            }
            pts
        };
        let merged = merge_boxes_3d(vec![(key, cube(0.0), 9), (key, cube(2.0), 9)]);
        assert_eq!(merged.len(), 1);
        let mut dims = [merged[0].size.x, merged[0].size.y, merged[0].size.z];
        dims.sort_by(f32::total_cmp);
        assert_relative_eq!(dims[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(dims[1], 1.0, epsilon = 1e-4);
        assert_relative_eq!(dims[2], 3.0, epsilon = 1e-4);
        assert_relative_eq!(merged[0].center.x, 1.5, epsilon = 1e-4);
    }

    #[test]
    fn full_extent_rejects_mesh_outside_clip_range() {
        let mesh = TriMesh::cuboid(Vec3::ONE);
        let view_proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0)
            * Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        // Far off to the side.
        let model = Mat4::from_translation(Vec3::new(500.0, 0.0, -10.0));
        assert!(full_extent(&mesh, model, view_proj, 64, 64).is_none());
    }

    #[test]
    fn full_extent_centered_cube_covers_image_center() {
        let mesh = TriMesh::cuboid(Vec3::ONE);
        let view_proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0)
            * Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let model = Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0));
        let extent = full_extent(&mesh, model, view_proj, 64, 64).unwrap();
        let center = extent.center();
        assert_relative_eq!(center.x, 32.0, epsilon = 1e-3);
        assert_relative_eq!(center.y, 32.0, epsilon = 1e-3);
        assert!(extent.size().x > 0.0 && extent.size().x < 64.0);
    }

    fn rays(no_hit: NoHitPolicy) -> GpuRaysParams {
        GpuRaysParams {
            horizontal_samples: 4,
            vertical_samples: 1,
            horizontal_min_angle: -0.5,
            horizontal_max_angle: 0.5,
            vertical_min_angle: 0.0,
            vertical_max_angle: 0.0,
            min_range: 0.5,
            max_range: 30.0,
            no_hit,
            face_size: 64,
            visibility_mask: scene::VISIBILITY_ALL,
        }
    }

    #[test]
    fn no_hit_rays_report_max_range() {
        // A miss comes back as the cleared far value, at or past max range.
        let samples = [35.0, 0.8, 0.0, 0.0, 5.0, 0.3, 0.0, 0.0];
        let out = finalize_ray_scan(&samples, &rays(NoHitPolicy::MaxRange));
        assert_eq!(out.len(), 6);
        assert_relative_eq!(out[0], 30.0);
        assert_relative_eq!(out[1], 0.0);
        assert_relative_eq!(out[3], 5.0);
        assert_relative_eq!(out[4], 0.3);
    }

    #[test]
    fn no_hit_rays_can_report_infinity() {
        let samples = [35.0, 0.8, 0.0, 0.0];
        let out = finalize_ray_scan(&samples, &rays(NoHitPolicy::Infinity));
        assert!(out[0].is_infinite());
    }

    #[test]
    fn near_hits_clamp_to_min_range() {
        let samples = [0.1, 0.9, 0.0, 0.0];
        let out = finalize_ray_scan(&samples, &rays(NoHitPolicy::MaxRange));
        assert_relative_eq!(out[0], 0.5);
        assert_relative_eq!(out[1], 0.9);
    }

    #[test]
    fn temperatures_quantise_to_resolution_counts() {
        let params = ThermalCameraParams {
            camera: CameraParams {
                width: 4,
                height: 1,
                near_clip: 0.1,
                far_clip: 100.0,
                fov_y: 1.0,
                visibility_mask: scene::VISIBILITY_ALL,
            },
            min_temperature: 250.0,
            max_temperature: 400.0,
            ambient_temperature: 300.0,
            ambient_temperature_range: 0.0,
            linear_resolution: 0.01,
            ambient_from_color: false,
        };
        let out = quantise_temperatures(&[300.0, 100.0, 500.0], &params);
        assert_eq!(out, vec![30000, 25000, 40000]);
    }

    #[test]
    fn label_map_splits_ids_and_labels() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&pack_id_label(257, 3));
        buffer.extend_from_slice(&pack_id_label(0, 255));
        let map = LabelMap::from_colored_buffer(&buffer, 4);
        assert_eq!(map.ids, vec![257, 0]);
        assert_eq!(map.labels, vec![3, 255]);
    }

    #[test]
    fn point_cloud_center_pixel_lies_on_axis() {
        let points = depth_point_cloud(&[2.0; 4], 2, 2, std::f32::consts::FRAC_PI_2, 0);
        // All four pixels straddle the axis symmetrically.
        let sum: Vec3 = points
            .iter()
            .map(|p| Vec3::new(p[0], p[1], 0.0))
            .sum();
        assert_relative_eq!(sum.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(sum.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(points[0][2], -2.0);
    }
}
