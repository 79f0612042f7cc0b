//! Plane model.

use std::collections::HashMap;

use drm_fourcc::{DrmFourcc, DrmModifier};

use super::props::PropTable;
use crate::control::{PlaneId, PlaneInfo, PlaneKind, PropertyId};
use crate::error::Error;
use crate::utils::Transform;

/// The four cardinal rotations a plane may advertise through its
/// "rotation" bitmask property. Enum entries carry the bit position;
/// names outside this set (reflections) are ignored.
const ROTATION_NAMES: &[(&str, Transform)] = &[
    ("rotate-0", Transform::Normal),
    ("rotate-90", Transform::Rotate90),
    ("rotate-180", Transform::Rotate180),
    ("rotate-270", Transform::Rotate270),
];

/// A hardware compositing layer.
#[derive(Debug)]
pub struct Plane {
    id: PlaneId,
    kind: PlaneKind,
    crtc_mask: u32,
    formats: Vec<DrmFourcc>,
    modifiers: Vec<(DrmFourcc, Vec<DrmModifier>)>,
    props: PropTable,
    rotation_map: HashMap<Transform, u64>,
}

impl Plane {
    pub(crate) fn from_info(info: &PlaneInfo) -> Self {
        let props = PropTable::from_props(&info.props);

        let mut rotation_map = HashMap::new();
        if let Some(entries) = props.enum_values("rotation") {
            for (name, bit) in entries {
                if let Some((_, transform)) = ROTATION_NAMES.iter().find(|(n, _)| n == name) {
                    rotation_map.insert(*transform, 1u64 << bit);
                }
            }
        }

        Plane {
            id: info.id,
            kind: info.kind,
            crtc_mask: info.crtc_mask,
            formats: info.formats.clone(),
            modifiers: info.modifiers.clone(),
            props,
            rotation_map,
        }
    }

    /// Object id of the plane
    pub fn id(&self) -> PlaneId {
        self.id
    }

    /// Plane type
    pub fn kind(&self) -> PlaneKind {
        self.kind
    }

    /// Whether this plane can source the CRTC at hardware index `index`
    pub fn supports_crtc_index(&self, index: usize) -> bool {
        self.crtc_mask & (1 << index) != 0
    }

    /// Whether the plane's rotation property covers `transform`
    pub fn supports_transform(&self, transform: Transform) -> bool {
        self.rotation_map.contains_key(&transform)
    }

    /// Hardware bitmask value for `transform`, if advertised
    pub fn rotation_value(&self, transform: Transform) -> Option<u64> {
        self.rotation_map.get(&transform).copied()
    }

    /// Copy of the formats supported without explicit modifiers
    pub fn formats(&self) -> Vec<DrmFourcc> {
        self.formats.clone()
    }

    /// Copy of the modifiers advertised for `format`
    pub fn modifiers_for(&self, format: DrmFourcc) -> Vec<DrmModifier> {
        self.modifiers
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, m)| m.clone())
            .unwrap_or_default()
    }

    /// Whether the plane can scan out `format`, optionally with an
    /// explicit modifier.
    pub fn supports_format(&self, format: DrmFourcc, modifier: Option<DrmModifier>) -> bool {
        match modifier {
            None | Some(DrmModifier::Invalid) => self.formats.contains(&format),
            Some(modifier) => self
                .modifiers
                .iter()
                .any(|(f, mods)| *f == format && mods.contains(&modifier)),
        }
    }

    /// Whether the plane advertises cursor hotspot properties
    pub fn supports_hotspot(&self) -> bool {
        self.props.get("HOTSPOT_X").is_some() && self.props.get("HOTSPOT_Y").is_some()
    }

    /// Property id by name, if the plane has it
    pub fn prop(&self, name: &str) -> Option<PropertyId> {
        self.props.get(name)
    }

    pub(crate) fn require_prop(&self, name: &'static str) -> Result<PropertyId, Error> {
        self.props.require(self.id.0, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::PropInfo;

    fn rotation_prop() -> PropInfo {
        PropInfo {
            id: PropertyId(40),
            name: "rotation".into(),
            value: 1,
            enum_values: vec![
                ("rotate-0".into(), 0),
                ("rotate-90".into(), 1),
                ("rotate-180".into(), 2),
                ("rotate-270".into(), 3),
                ("reflect-x".into(), 4),
                ("some-vendor-extension".into(), 6),
            ],
        }
    }

    fn plane_info() -> PlaneInfo {
        PlaneInfo {
            id: PlaneId(31),
            kind: PlaneKind::Primary,
            crtc_mask: 0b01,
            formats: vec![DrmFourcc::Xrgb8888, DrmFourcc::Argb8888],
            modifiers: vec![(DrmFourcc::Xrgb8888, vec![DrmModifier::Linear])],
            props: vec![rotation_prop()],
        }
    }

    #[test]
    fn rotation_parsing_keeps_cardinals_only() {
        let plane = Plane::from_info(&plane_info());
        assert_eq!(plane.rotation_value(Transform::Normal), Some(1 << 0));
        assert_eq!(plane.rotation_value(Transform::Rotate90), Some(1 << 1));
        assert_eq!(plane.rotation_value(Transform::Rotate270), Some(1 << 3));
        // reflections and unknown names do not enter the map
        assert!(!plane.supports_transform(Transform::Flipped));
        assert_eq!(plane.rotation_map.len(), 4);
    }

    #[test]
    fn format_queries_are_copies() {
        let plane = Plane::from_info(&plane_info());
        assert!(plane.supports_format(DrmFourcc::Xrgb8888, None));
        assert!(plane.supports_format(DrmFourcc::Xrgb8888, Some(DrmModifier::Linear)));
        assert!(!plane.supports_format(DrmFourcc::Xrgb8888, Some(DrmModifier::I915_x_tiled)));
        // a format the plane never listed is unsupported
        assert!(!plane.supports_format(DrmFourcc::Nv12, None));
        assert!(plane.modifiers_for(DrmFourcc::Nv12).is_empty());
    }
}
