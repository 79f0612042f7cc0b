//! CRTC model.

use std::sync::RwLock;

use super::props::PropTable;
use crate::control::{CrtcId, CrtcInfo, PlaneId, PropertyId};
use crate::error::Error;
use crate::utils::{Rectangle, Transform};

/// A gamma lookup table as uploaded to the CRTC's `GAMMA_LUT` blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaLut {
    /// Red channel ramp
    pub red: Vec<u16>,
    /// Green channel ramp
    pub green: Vec<u16>,
    /// Blue channel ramp
    pub blue: Vec<u16>,
}

/// Mutable per-CRTC state.
#[derive(Debug, Default)]
pub struct CrtcState {
    /// Whether the CRTC currently drives an output
    pub active: bool,
    /// Layout of the CRTC in compositor coordinates
    pub layout: Rectangle<i32>,
    /// Transform the output layer wants applied
    pub wanted_transform: Transform,
    /// Primary plane assigned to this CRTC
    pub primary_plane: Option<PlaneId>,
    /// Cursor plane assigned to this CRTC. `None` while the CRTC is
    /// leased out.
    pub cursor_plane: Option<PlaneId>,
    /// Whether the CRTC is owned by an active lease
    pub leased: bool,
    /// Cached gamma ramp, re-armed after mode sets
    pub gamma: Option<GammaLut>,
    /// Current VRR state as last committed
    pub vrr_enabled: bool,
}

/// A scanout pipeline stage of the device.
#[derive(Debug)]
pub struct Crtc {
    id: CrtcId,
    index: usize,
    gamma_size: u32,
    vrr_capable: bool,
    props: PropTable,
    state: RwLock<CrtcState>,
}

impl Crtc {
    pub(crate) fn from_info(info: &CrtcInfo) -> Self {
        let props = PropTable::from_props(&info.props);
        let gamma_size = props.initial_value("GAMMA_LUT_SIZE").unwrap_or(0) as u32;
        let vrr_capable = props.get("VRR_ENABLED").is_some();

        Crtc {
            id: info.id,
            index: info.index,
            gamma_size,
            vrr_capable,
            props,
            state: RwLock::new(CrtcState {
                active: info.active,
                ..Default::default()
            }),
        }
    }

    /// Object id of the CRTC
    pub fn id(&self) -> CrtcId {
        self.id
    }

    /// Hardware index, used to resolve plane and connector CRTC masks
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of entries the gamma LUT takes, 0 if not supported
    pub fn gamma_size(&self) -> u32 {
        self.gamma_size
    }

    /// Whether the CRTC supports variable refresh
    pub fn is_vrr_capable(&self) -> bool {
        self.vrr_capable
    }

    /// Property id by name, if the CRTC has it
    pub fn prop(&self, name: &str) -> Option<PropertyId> {
        self.props.get(name)
    }

    pub(crate) fn require_prop(&self, name: &'static str) -> Result<PropertyId, Error> {
        self.props.require(self.id.0, name)
    }

    /// Read access to the mutable state
    pub fn state(&self) -> std::sync::RwLockReadGuard<'_, CrtcState> {
        self.state.read().unwrap()
    }

    pub(crate) fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, CrtcState> {
        self.state.write().unwrap()
    }

    /// Primary plane currently assigned
    pub fn primary_plane(&self) -> Option<PlaneId> {
        self.state().primary_plane
    }

    /// Cursor plane currently assigned, `None` while leased
    pub fn cursor_plane(&self) -> Option<PlaneId> {
        self.state().cursor_plane
    }

    /// Whether the CRTC is owned by an active lease
    pub fn is_leased(&self) -> bool {
        self.state().leased
    }

    /// Update the compositor-space layout of this CRTC
    pub fn set_layout(&self, layout: Rectangle<i32>) {
        self.state_mut().layout = layout;
    }

    /// Record the transform the output layer wants
    pub fn set_wanted_transform(&self, transform: Transform) {
        self.state_mut().wanted_transform = transform;
    }

    /// Serialize a gamma LUT into the byte layout of the kernel's
    /// `drm_color_lut` array.
    pub(crate) fn serialize_gamma(lut: &GammaLut) -> Vec<u8> {
        let entries = lut.red.len().min(lut.green.len()).min(lut.blue.len());
        let mut data = Vec::with_capacity(entries * 8);
        for i in 0..entries {
            data.extend_from_slice(&lut.red[i].to_ne_bytes());
            data.extend_from_slice(&lut.green[i].to_ne_bytes());
            data.extend_from_slice(&lut.blue[i].to_ne_bytes());
            data.extend_from_slice(&0u16.to_ne_bytes());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_serialization_layout() {
        let lut = GammaLut {
            red: vec![0, 0xffff],
            green: vec![1, 2],
            blue: vec![3, 4],
        };
        let data = Crtc::serialize_gamma(&lut);
        // two drm_color_lut entries of 8 bytes each
        assert_eq!(data.len(), 16);
        assert_eq!(&data[0..2], &0u16.to_ne_bytes());
        assert_eq!(&data[8..10], &0xffffu16.to_ne_bytes());
    }
}
