//! Connector model.

use std::sync::RwLock;

use super::mode::{Mode, ModeCache};
use super::props::PropTable;
use crate::control::{ConnectorId, ConnectorInfo, CrtcId, PropertyId};
use crate::utils::Size;

/// Requested broadcast RGB range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RgbRange {
    /// Let the sink decide
    #[default]
    Automatic,
    /// Full 0-255 range
    Full,
    /// Limited 16-235 range
    Limited,
}

/// Requested output colorspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colorspace {
    /// Default RGB colorimetry
    #[default]
    Default,
    /// BT.2020 RGB colorimetry
    Bt2020,
}

/// Mutable per-connector state, refreshed on hotplug rescans.
#[derive(Debug, Default)]
pub struct ConnectorState {
    /// Whether a display is attached
    pub connected: bool,
    /// Deduplicated modes of the attached display
    pub modes: Vec<Mode>,
    /// Bitmask of CRTC indexes that can drive this connector
    pub crtc_mask: u32,
    /// CRTC currently driving the connector
    pub current_crtc: Option<CrtcId>,
    /// The output layer explicitly flagged this connector leasable
    pub leasable_hint: bool,
}

/// A physical port and the logic describing its attached display.
#[derive(Debug)]
pub struct Connector {
    id: ConnectorId,
    interface: String,
    non_desktop: bool,
    props: PropTable,
    state: RwLock<ConnectorState>,
}

/// Underscan border sizes: 5% of the mode dimension, capped at 128px.
pub fn underscan_borders(mode_size: Size<u32>) -> (u32, u32) {
    (
        (mode_size.w * 5 / 100).min(128),
        (mode_size.h * 5 / 100).min(128),
    )
}

impl Connector {
    pub(crate) fn from_info(info: &ConnectorInfo, modes: &mut ModeCache) -> Self {
        let props = PropTable::from_props(&info.props);
        let non_desktop = props.initial_value("non-desktop").unwrap_or(0) == 1;

        let connector = Connector {
            id: info.id,
            interface: info.interface.clone(),
            non_desktop,
            props,
            state: RwLock::new(ConnectorState::default()),
        };
        connector.refresh(info, modes);
        connector
    }

    /// Update mutable state from a rescan, re-interning the mode list.
    pub(crate) fn refresh(&self, info: &ConnectorInfo, modes: &mut ModeCache) {
        let mut state = self.state.write().unwrap();
        state.connected = info.connected;
        state.crtc_mask = info.crtc_mask;
        state.current_crtc = info.current_crtc;
        state.modes = info
            .modes
            .iter()
            .map(|m| Mode {
                id: modes.intern(m.timings),
                timings: m.timings,
                name: m.name.clone(),
                preferred: m.preferred,
            })
            .collect();
    }

    /// Object id of the connector
    pub fn id(&self) -> ConnectorId {
        self.id
    }

    /// Interface name, e.g. `DP-1`
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Kernel "non-desktop" flag, set for VR headsets and the like
    pub fn is_non_desktop(&self) -> bool {
        self.non_desktop
    }

    /// Whether the connector may be handed to lease clients
    pub fn is_leasable(&self) -> bool {
        self.non_desktop || self.state().leasable_hint
    }

    /// Let the output layer flag this connector leasable
    pub fn set_leasable_hint(&self, leasable: bool) {
        self.state.write().unwrap().leasable_hint = leasable;
    }

    /// Read access to the mutable state
    pub fn state(&self) -> std::sync::RwLockReadGuard<'_, ConnectorState> {
        self.state.read().unwrap()
    }

    pub(crate) fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, ConnectorState> {
        self.state.write().unwrap()
    }

    /// Property id by name, if the connector has it
    pub fn prop(&self, name: &str) -> Option<PropertyId> {
        self.props.get(name)
    }

    /// Whether the underscan property trio is available
    pub fn supports_underscanning(&self) -> bool {
        self.props.get("underscan").is_some()
            && self.props.get("underscan hborder").is_some()
            && self.props.get("underscan vborder").is_some()
    }

    /// Whether the privacy screen can be driven by software
    pub fn supports_privacy_screen(&self) -> bool {
        self.props.get("privacy-screen sw-state").is_some()
    }

    /// Whether the sink's color depth can be clamped
    pub fn supports_max_bpc(&self) -> bool {
        self.props.get("max bpc").is_some()
    }

    /// Whether the connector reports VRR capable sinks
    pub fn is_vrr_capable(&self) -> bool {
        self.props.initial_value("vrr_capable").unwrap_or(0) == 1
    }

    pub(crate) fn enum_value(&self, prop: &str, entry: &str) -> Option<u64> {
        self.props.enum_value(prop, entry)
    }

    /// Resolve a [`RgbRange`] to the "Broadcast RGB" enum value
    pub(crate) fn rgb_range_value(&self, range: RgbRange) -> Option<u64> {
        let entry = match range {
            RgbRange::Automatic => "Automatic",
            RgbRange::Full => "Full",
            RgbRange::Limited => "Limited 16:235",
        };
        self.enum_value("Broadcast RGB", entry)
    }

    /// Resolve a [`Colorspace`] to the "Colorspace" enum value
    pub(crate) fn colorspace_value(&self, colorspace: Colorspace) -> Option<u64> {
        let entry = match colorspace {
            Colorspace::Default => "Default",
            Colorspace::Bt2020 => "BT2020_RGB",
        };
        self.enum_value("Colorspace", entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscan_border_cap() {
        assert_eq!(underscan_borders(Size::new(1920, 1080)), (96, 54));
        // 5% of 3840 would be 192, the cap clamps it
        assert_eq!(underscan_borders(Size::new(3840, 2160)), (128, 108));
    }
}
