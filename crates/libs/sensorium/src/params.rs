//! Sensor parameters.
//!
//! Each sensor kind has a parameter struct, loadable from a YAML sensor
//! description and validated before the sensor touches the GPU. Invalid
//! parameters are rejected up front; a sensor never half-builds.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path};

/// Image and clip parameters shared by all camera-like sensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraParams {
    /// Output image width in pixels.
    pub width: u32,
    /// Output image height in pixels.
    pub height: u32,
    /// Near clip plane distance.
    pub near_clip: f32,
    /// Far clip plane distance.
    pub far_clip: f32,
    /// Vertical field of view in radians.
    #[serde(default = "default_fov_y")]
    pub fov_y: f32,
    /// Visibility mask of the scene pass; only visuals sharing a bit are
    /// rendered.
    #[serde(default = "default_visibility")]
    pub visibility_mask: u32,
}

fn default_fov_y() -> f32 {
    std::f32::consts::FRAC_PI_3
}

fn default_visibility() -> u32 {
    scene::VISIBILITY_ALL
}

impl CameraParams {
    /// Validates image size and clip planes.
    pub fn validate(self) -> Result<Self, Error> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidParameters(format!(
                "image size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !(self.near_clip > 0.0 && self.far_clip > self.near_clip) {
            return Err(Error::InvalidParameters(format!(
                "clip planes must satisfy 0 < near < far, got near={} far={}",
                self.near_clip, self.far_clip
            )));
        }
        if !(self.fov_y > 0.0 && self.fov_y < std::f32::consts::PI) {
            return Err(Error::InvalidParameters(format!(
                "vertical fov must be in (0, pi), got {}",
                self.fov_y
            )));
        }
        Ok(self)
    }

    /// Width / height.
    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// Depth camera parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DepthCameraParams {
    /// Shared camera parameters.
    #[serde(flatten)]
    pub camera: CameraParams,
    /// Samples closer than this are clamped to `min_depth`.
    pub min_depth: f32,
    /// Samples farther than this are clamped to `max_depth`.
    pub max_depth: f32,
}

impl DepthCameraParams {
    /// Validates camera parameters and the depth window.
    pub fn validate(self) -> Result<Self, Error> {
        let camera = self.camera.validate()?;
        if !(self.min_depth >= 0.0 && self.max_depth > self.min_depth) {
            return Err(Error::InvalidParameters(format!(
                "depth window must satisfy 0 <= min < max, got min={} max={}",
                self.min_depth, self.max_depth
            )));
        }
        Ok(Self { camera, ..self })
    }
}

/// Thermal camera parameters. Temperatures are in kelvin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThermalCameraParams {
    /// Shared camera parameters.
    #[serde(flatten)]
    pub camera: CameraParams,
    /// Lowest representable temperature.
    pub min_temperature: f32,
    /// Highest representable temperature.
    pub max_temperature: f32,
    /// Temperature reported for surfaces without a heat-source annotation.
    pub ambient_temperature: f32,
    /// Half-width of the noise band around the ambient temperature.
    #[serde(default)]
    pub ambient_temperature_range: f32,
    /// Quantisation step of the 16-bit output, kelvin per count.
    #[serde(default = "default_linear_resolution")]
    pub linear_resolution: f32,
    /// When set, non-heat-source pixels derive their ambient value from the
    /// rendered surface brightness instead of the flat ambient temperature.
    #[serde(default)]
    pub ambient_from_color: bool,
}

fn default_linear_resolution() -> f32 {
    0.01
}

impl ThermalCameraParams {
    /// Validates camera parameters and the temperature window.
    pub fn validate(self) -> Result<Self, Error> {
        let camera = self.camera.validate()?;
        if !(self.min_temperature < self.max_temperature) {
            return Err(Error::InvalidParameters(format!(
                "temperature window must satisfy min < max, got min={} max={}",
                self.min_temperature, self.max_temperature
            )));
        }
        if self.linear_resolution <= 0.0 {
            return Err(Error::InvalidParameters(format!(
                "linear resolution must be positive, got {}",
                self.linear_resolution
            )));
        }
        if !(self.min_temperature..=self.max_temperature).contains(&self.ambient_temperature) {
            return Err(Error::InvalidParameters(format!(
                "ambient temperature {} outside [{}, {}]",
                self.ambient_temperature, self.min_temperature, self.max_temperature
            )));
        }
        Ok(Self { camera, ..self })
    }
}

/// What a lidar ray reports when it hits nothing within range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoHitPolicy {
    /// Report the configured maximum range.
    MaxRange,
    /// Report `f32::INFINITY`.
    Infinity,
}

/// GPU lidar parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GpuRaysParams {
    /// Number of horizontal samples per scan.
    pub horizontal_samples: u32,
    /// Number of vertical samples (scan lines).
    pub vertical_samples: u32,
    /// Smallest horizontal (azimuth) angle, radians.
    pub horizontal_min_angle: f32,
    /// Largest horizontal angle, radians.
    pub horizontal_max_angle: f32,
    /// Smallest vertical (elevation) angle, radians.
    pub vertical_min_angle: f32,
    /// Largest vertical angle, radians.
    pub vertical_max_angle: f32,
    /// Minimum range; nearer hits are clamped up.
    pub min_range: f32,
    /// Maximum range; farther hits follow [`NoHitPolicy`].
    pub max_range: f32,
    /// No-hit behaviour.
    #[serde(default = "default_no_hit")]
    pub no_hit: NoHitPolicy,
    /// Per-face cubemap resolution of the first stage.
    #[serde(default = "default_face_size")]
    pub face_size: u32,
    /// Visibility mask for the scene passes.
    #[serde(default = "default_visibility")]
    pub visibility_mask: u32,
}

fn default_no_hit() -> NoHitPolicy {
    NoHitPolicy::MaxRange
}

fn default_face_size() -> u32 {
    512
}

impl GpuRaysParams {
    /// Validates the sample counts, angle ranges and the range window.
    pub fn validate(self) -> Result<Self, Error> {
        if self.horizontal_samples == 0 || self.vertical_samples == 0 {
            return Err(Error::InvalidParameters(
                "sample counts must be non-zero".into(),
            ));
        }
        if self.horizontal_min_angle > self.horizontal_max_angle
            || self.vertical_min_angle > self.vertical_max_angle
        {
            return Err(Error::InvalidParameters(
                "angle ranges must satisfy min <= max".into(),
            ));
        }
        if self.vertical_min_angle < -std::f32::consts::FRAC_PI_2
            || self.vertical_max_angle > std::f32::consts::FRAC_PI_2
        {
            return Err(Error::InvalidParameters(
                "vertical angles must lie within [-pi/2, pi/2]".into(),
            ));
        }
        if !(self.min_range >= 0.0 && self.max_range > self.min_range) {
            return Err(Error::InvalidParameters(format!(
                "range window must satisfy 0 <= min < max, got min={} max={}",
                self.min_range, self.max_range
            )));
        }
        if self.face_size == 0 {
            return Err(Error::InvalidParameters("face size must be non-zero".into()));
        }
        Ok(self)
    }
}

/// Segmentation camera parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SegmentationCameraParams {
    /// Shared camera parameters.
    #[serde(flatten)]
    pub camera: CameraParams,
    /// Label decoded for pixels no labelled visual covers.
    #[serde(default = "default_background_label")]
    pub background_label: u8,
}

fn default_background_label() -> u8 {
    255
}

impl SegmentationCameraParams {
    /// Validates the camera parameters.
    pub fn validate(self) -> Result<Self, Error> {
        Ok(Self {
            camera: self.camera.validate()?,
            ..self
        })
    }
}

/// Bounding-box extraction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoundingBoxType {
    /// 2D boxes over visible pixels only (occlusion respected).
    VisibleBox2d,
    /// 2D boxes over the full mesh extent (occlusion ignored).
    FullBox2d,
    /// Oriented 3D boxes in camera space.
    Box3d,
}

/// Bounding-box camera parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BoundingBoxCameraParams {
    /// Shared camera parameters.
    #[serde(flatten)]
    pub camera: CameraParams,
    /// Extraction mode.
    pub box_type: BoundingBoxType,
    /// Label treated as background in the ID mask.
    #[serde(default = "default_background_label")]
    pub background_label: u8,
}

impl BoundingBoxCameraParams {
    /// Validates the camera parameters.
    pub fn validate(self) -> Result<Self, Error> {
        Ok(Self {
            camera: self.camera.validate()?,
            ..self
        })
    }
}

/// Lens mapping function family of the wide-angle camera: the image-plane
/// radius of a ray at angle `theta` is `c1 * f * fun(theta / c2 + c3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LensFun {
    /// `fun = sin`.
    Sin,
    /// `fun = tan`.
    Tan,
    /// `fun = identity`.
    Id,
}

/// Wide-angle (cubemap) camera parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WideAngleCameraParams {
    /// Shared camera parameters; `fov_y` here is the lens cutoff angle and
    /// may exceed the usual perspective limit up to `2*pi`.
    #[serde(flatten)]
    pub camera: CameraParams,
    /// Lens mapping coefficient `c1`.
    pub c1: f32,
    /// Lens mapping coefficient `c2`.
    pub c2: f32,
    /// Lens mapping coefficient `c3`.
    #[serde(default)]
    pub c3: f32,
    /// Focal length of the mapping.
    pub focal_length: f32,
    /// Mapping function.
    pub lens_fun: LensFun,
    /// Per-face cubemap resolution.
    #[serde(default = "default_face_size")]
    pub face_size: u32,
}

impl WideAngleCameraParams {
    /// Validates the image size and mapping coefficients.
    pub fn validate(self) -> Result<Self, Error> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(Error::InvalidParameters(format!(
                "image size must be non-zero, got {}x{}",
                self.camera.width, self.camera.height
            )));
        }
        if !(self.camera.near_clip > 0.0 && self.camera.far_clip > self.camera.near_clip) {
            return Err(Error::InvalidParameters(
                "clip planes must satisfy 0 < near < far".into(),
            ));
        }
        if !(self.camera.fov_y > 0.0 && self.camera.fov_y <= std::f32::consts::TAU) {
            return Err(Error::InvalidParameters(format!(
                "cutoff angle must be in (0, 2*pi], got {}",
                self.camera.fov_y
            )));
        }
        if self.c1 == 0.0 || self.c2 == 0.0 || self.focal_length <= 0.0 {
            return Err(Error::InvalidParameters(
                "lens coefficients c1, c2 and focal length must be non-zero".into(),
            ));
        }
        if self.face_size == 0 {
            return Err(Error::InvalidParameters("face size must be non-zero".into()));
        }
        Ok(self)
    }
}

/// A sensor description: one of the supported sensor kinds with parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum SensorParams {
    /// Depth camera.
    Depth(DepthCameraParams),
    /// Thermal camera.
    Thermal(ThermalCameraParams),
    /// GPU lidar.
    GpuRays(GpuRaysParams),
    /// Segmentation camera.
    Segmentation(SegmentationCameraParams),
    /// Bounding-box camera.
    BoundingBox(BoundingBoxCameraParams),
    /// Wide-angle camera.
    WideAngle(WideAngleCameraParams),
}

impl SensorParams {
    /// Validates the contained parameters.
    pub fn validate(self) -> Result<Self, Error> {
        match self {
            SensorParams::Depth(p) => Ok(Self::Depth(p.validate()?)),
            SensorParams::Thermal(p) => Ok(Self::Thermal(p.validate()?)),
            SensorParams::GpuRays(p) => Ok(Self::GpuRays(p.validate()?)),
            SensorParams::Segmentation(p) => Ok(Self::Segmentation(p.validate()?)),
            SensorParams::BoundingBox(p) => Ok(Self::BoundingBox(p.validate()?)),
            SensorParams::WideAngle(p) => Ok(Self::WideAngle(p.validate()?)),
        }
    }

    /// Loads and validates a sensor description from a YAML file.
    pub fn load_from_yaml(path: &Path) -> Result<Self, Error> {
        let reader = BufReader::new(File::open(path)?);
        let params: Self = serde_yaml::from_reader(reader)?;
        params.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> CameraParams {
        CameraParams {
            width: 320,
            height: 240,
            near_clip: 0.1,
            far_clip: 100.0,
            fov_y: 1.0,
            visibility_mask: scene::VISIBILITY_ALL,
        }
    }

    #[test]
    fn zero_size_rejected() {
        let mut p = camera();
        p.width = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn inverted_clip_planes_rejected() {
        let mut p = camera();
        p.near_clip = 50.0;
        p.far_clip = 10.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn depth_window_rejected_when_inverted() {
        let p = DepthCameraParams {
            camera: camera(),
            min_depth: 5.0,
            max_depth: 1.0,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let params = SensorParams::Segmentation(SegmentationCameraParams {
            camera: camera(),
            background_label: 255,
        });
        let text = serde_yaml::to_string(&params).unwrap();
        let back: SensorParams = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn kebab_case_yaml_accepted() {
        let text = "type: depth\nwidth: 64\nheight: 48\nnear-clip: 0.1\nfar-clip: 10.0\nmin-depth: 0.2\nmax-depth: 9.0\n";
        let params: SensorParams = serde_yaml::from_str(text).unwrap();
        let params = params.validate().unwrap();
        match params {
            SensorParams::Depth(p) => {
                assert_eq!(p.camera.width, 64);
                assert_eq!(p.max_depth, 9.0);
            }
            _ => panic!("wrong variant"),
        }
    }
}
