//! Materials, reduced to what the sensor passes consume.

use glam::Vec4;

/// A visual's material.
///
/// The sensor passes do not light anything; a material is a base colour, an
/// optional custom `vec4` shader parameter the material switcher encodes
/// sensor metadata into, and a depth-check flag for overlay visuals.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    /// Base (albedo) colour, RGBA.
    pub color: Vec4,
    /// Custom per-object shader parameter; the material switcher writes
    /// encoded metadata here for exactly one pass.
    pub custom_param: Option<Vec4>,
    /// When set, the visual ignores the depth test (rendered as overlay).
    pub depth_check: bool,
}

impl Material {
    /// A plain solid-colour material.
    pub fn solid(color: Vec4) -> Self {
        Self {
            color,
            custom_param: None,
            depth_check: true,
        }
    }

    /// Same material with the custom parameter set.
    pub fn with_custom_param(mut self, param: Vec4) -> Self {
        self.custom_param = Some(param);
        self
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::solid(Vec4::new(0.7, 0.7, 0.7, 1.0))
    }
}
