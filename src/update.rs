//! Accumulation of hardware state changes for one atomic commit.
//!
//! An [`Update`] is a single-use batch: components append property
//! writes for one device until the batch is handed to the commit engine,
//! which consumes it. Feedback about the commit is delivered through the
//! listeners registered on the batch.

use std::fmt;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use crate::control::{
    ClockSource, ConnectorId, CrtcId, DeviceError, FramebufferId, GpuId, PlaneId, PropertyId,
};
use crate::device::crtc::GammaLut;
use crate::device::mode::Mode;
use crate::utils::{Point, Rectangle};

bitflags::bitflags! {
    /// Flags modifying how a plane assignment is committed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AssignPlaneFlags: u32 {
        /// This plane alone may be dropped from the commit on failure,
        /// used for the cursor plane.
        const ALLOW_FAIL = 1 << 0;
        /// The buffer is unchanged from the previous commit, skip
        /// re-validation.
        const FB_UNCHANGED = 1 << 1;
        /// Explicit fences are supplied, disable implicit sync.
        const DISABLE_IMPLICIT_SYNC = 1 << 2;
    }
}

/// One plane → buffer assignment within an update.
#[derive(Debug)]
pub struct PlaneAssignment {
    /// Target CRTC
    pub crtc: CrtcId,
    /// Plane to assign
    pub plane: PlaneId,
    /// Framebuffer to scan out
    pub fb: FramebufferId,
    /// Source rectangle in buffer coordinates
    pub src: Rectangle<f64>,
    /// Destination rectangle in CRTC coordinates
    pub dst: Rectangle<i32>,
    /// Assignment flags
    pub flags: AssignPlaneFlags,
    /// Explicit sync fence the kernel must wait on
    pub fence: Option<OwnedFd>,
    /// Cursor hotspot, when the plane advertises hotspot properties
    pub hotspot: Option<Point<i32>>,
    /// Raw rotation bitmask value to program, if any
    pub rotation: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum PlaneOp {
    Assign(PlaneAssignment),
    Unassign { plane: PlaneId },
}

impl PlaneOp {
    fn plane(&self) -> PlaneId {
        match self {
            PlaneOp::Assign(assignment) => assignment.plane,
            PlaneOp::Unassign { plane } => *plane,
        }
    }
}

/// A mode set for one CRTC.
#[derive(Debug)]
pub(crate) struct ModeSetOp {
    pub crtc: CrtcId,
    /// `None` disables the CRTC
    pub mode: Option<Mode>,
    pub connectors: Vec<ConnectorId>,
}

#[derive(Debug)]
pub(crate) struct ConnectorPropOp {
    pub connector: ConnectorId,
    pub prop: PropertyId,
    pub value: u64,
}

#[derive(Debug)]
pub(crate) struct CrtcPropOp {
    pub crtc: CrtcId,
    pub prop: PropertyId,
    pub value: u64,
}

#[derive(Debug)]
pub(crate) struct PlanePropOp {
    pub plane: PlaneId,
    pub prop: PropertyId,
    pub value: u64,
}

#[derive(Debug)]
pub(crate) struct GammaOp {
    pub crtc: CrtcId,
    /// `None` resets the LUT
    pub lut: Option<GammaLut>,
}

/// Timestamp of a page flip.
#[derive(Debug, Clone, Copy)]
pub struct FlipTimestamp {
    /// Time since the epoch of `clock`
    pub time: Duration,
    /// Clock domain of `time`
    pub clock: ClockSource,
}

/// Per-CRTC page flip feedback, mirroring the four completion paths of
/// the kernel contract.
pub trait PageFlipListener: Send + Sync {
    /// A real vsync-synchronized flip completed
    fn flipped(&self, crtc: CrtcId, sequence: u32, time: FlipTimestamp);
    /// The commit succeeded but produced no real flip
    fn ready(&self, crtc: CrtcId);
    /// The commit was applied through a blocking legacy mode set
    fn mode_set_fallback(&self, crtc: CrtcId);
    /// The commit failed, no new pixels reached the display
    fn discarded(&self, crtc: CrtcId, error: Option<&DeviceError>);
}

/// Result of one committed update.
#[derive(Debug)]
pub struct CommitFeedback {
    /// The error, if the commit failed
    pub error: Option<DeviceError>,
    /// Planes that were dropped from the commit because their
    /// assignment carried [`AssignPlaneFlags::ALLOW_FAIL`].
    pub failed_planes: Vec<PlaneId>,
}

impl CommitFeedback {
    /// Whether the commit reached the hardware
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Listener invoked once with the commit result.
pub type ResultListener = Box<dyn FnOnce(&CommitFeedback) + Send>;

/// Custom submission routine replacing the atomic commit, used by
/// special-cased scanout paths.
pub type CustomPageFlip = Box<dyn FnOnce() -> Result<(), DeviceError> + Send>;

/// A single-use batch of hardware state changes for one device.
pub struct Update {
    device: GpuId,
    pub(crate) plane_ops: Vec<PlaneOp>,
    pub(crate) mode_sets: Vec<ModeSetOp>,
    pub(crate) connector_props: Vec<ConnectorPropOp>,
    pub(crate) crtc_props: Vec<CrtcPropOp>,
    pub(crate) plane_props: Vec<PlanePropOp>,
    pub(crate) gamma_ops: Vec<GammaOp>,
    pub(crate) flip_listeners: Vec<(CrtcId, Arc<dyn PageFlipListener>)>,
    pub(crate) result_listeners: Vec<ResultListener>,
    pub(crate) custom_page_flip: Option<CustomPageFlip>,
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("device", &self.device)
            .field("plane_ops", &self.plane_ops)
            .field("mode_sets", &self.mode_sets)
            .field("connector_props", &self.connector_props)
            .field("crtc_props", &self.crtc_props)
            .field("gamma_ops", &self.gamma_ops)
            .field("flip_listeners", &self.flip_listeners.len())
            .field("result_listeners", &self.result_listeners.len())
            .finish_non_exhaustive()
    }
}

impl Update {
    /// Create an empty update for `device`
    pub fn new(device: GpuId) -> Self {
        Update {
            device,
            plane_ops: Vec::new(),
            mode_sets: Vec::new(),
            connector_props: Vec::new(),
            crtc_props: Vec::new(),
            plane_props: Vec::new(),
            gamma_ops: Vec::new(),
            flip_listeners: Vec::new(),
            result_listeners: Vec::new(),
            custom_page_flip: None,
        }
    }

    /// Device this update belongs to
    pub fn device(&self) -> GpuId {
        self.device
    }

    /// Whether the update carries no state changes
    pub fn is_empty(&self) -> bool {
        self.plane_ops.is_empty()
            && self.mode_sets.is_empty()
            && self.connector_props.is_empty()
            && self.crtc_props.is_empty()
            && self.plane_props.is_empty()
            && self.gamma_ops.is_empty()
            && self.custom_page_flip.is_none()
    }

    /// Whether the update requires mode setting privileges
    pub fn needs_modeset(&self) -> bool {
        !self.mode_sets.is_empty()
    }

    fn replace_plane_op(&mut self, op: PlaneOp) {
        // only the latest state of a plane ever reaches the kernel
        self.plane_ops.retain(|existing| existing.plane() != op.plane());
        self.plane_ops.push(op);
    }

    /// Assign `fb` to `plane` on `crtc`. Returns the assignment so the
    /// caller can attach a fence, hotspot or rotation.
    pub fn assign_plane(
        &mut self,
        crtc: CrtcId,
        plane: PlaneId,
        fb: FramebufferId,
        src: Rectangle<f64>,
        dst: Rectangle<i32>,
        flags: AssignPlaneFlags,
    ) -> &mut PlaneAssignment {
        self.replace_plane_op(PlaneOp::Assign(PlaneAssignment {
            crtc,
            plane,
            fb,
            src,
            dst,
            flags,
            fence: None,
            hotspot: None,
            rotation: None,
        }));
        match self.plane_ops.last_mut() {
            Some(PlaneOp::Assign(assignment)) => assignment,
            _ => unreachable!("assignment was just pushed"),
        }
    }

    /// Remove `plane` from scanout. Idempotent.
    pub fn unassign_plane(&mut self, plane: PlaneId) {
        self.replace_plane_op(PlaneOp::Unassign { plane });
    }

    /// Program `mode` on `crtc` driving `connectors`; `None` disables
    /// the CRTC.
    pub fn set_mode(&mut self, crtc: CrtcId, mode: Option<Mode>, connectors: Vec<ConnectorId>) {
        self.mode_sets.retain(|existing| existing.crtc != crtc);
        self.mode_sets.push(ModeSetOp {
            crtc,
            mode,
            connectors,
        });
    }

    /// Write a raw connector property
    pub fn set_connector_property(&mut self, connector: ConnectorId, prop: PropertyId, value: u64) {
        self.connector_props
            .retain(|existing| !(existing.connector == connector && existing.prop == prop));
        self.connector_props.push(ConnectorPropOp {
            connector,
            prop,
            value,
        });
    }

    /// Write a raw CRTC property
    pub fn set_crtc_property(&mut self, crtc: CrtcId, prop: PropertyId, value: u64) {
        self.crtc_props
            .retain(|existing| !(existing.crtc == crtc && existing.prop == prop));
        self.crtc_props.push(CrtcPropOp { crtc, prop, value });
    }

    /// Write a raw plane property outside of a full assignment
    pub fn set_plane_property(&mut self, plane: PlaneId, prop: PropertyId, value: u64) {
        self.plane_props
            .retain(|existing| !(existing.plane == plane && existing.prop == prop));
        self.plane_props.push(PlanePropOp { plane, prop, value });
    }

    /// Upload a gamma LUT for `crtc`; `None` resets it
    pub fn set_gamma(&mut self, crtc: CrtcId, lut: Option<GammaLut>) {
        self.gamma_ops.retain(|existing| existing.crtc != crtc);
        self.gamma_ops.push(GammaOp { crtc, lut });
    }

    /// Register a page flip listener for `crtc`
    pub fn add_page_flip_listener(&mut self, crtc: CrtcId, listener: Arc<dyn PageFlipListener>) {
        self.flip_listeners.push((crtc, listener));
    }

    /// Register a listener for the commit result
    pub fn add_result_listener(&mut self, listener: ResultListener) {
        self.result_listeners.push(listener);
    }

    /// Replace the atomic submission with a custom routine
    pub fn set_custom_page_flip(&mut self, flip: CustomPageFlip) {
        self.custom_page_flip = Some(flip);
    }

    /// Merge `other` into `self`. Per-object duplicates resolve to the
    /// entry from `other`, listeners are concatenated.
    pub fn merge(&mut self, other: Update) {
        debug_assert_eq!(self.device, other.device, "updates of different devices");

        for op in other.plane_ops {
            self.replace_plane_op(op);
        }
        for mode_set in other.mode_sets {
            self.mode_sets.retain(|existing| existing.crtc != mode_set.crtc);
            self.mode_sets.push(mode_set);
        }
        for prop in other.connector_props {
            self.set_connector_property(prop.connector, prop.prop, prop.value);
        }
        for prop in other.crtc_props {
            self.set_crtc_property(prop.crtc, prop.prop, prop.value);
        }
        for prop in other.plane_props {
            self.set_plane_property(prop.plane, prop.prop, prop.value);
        }
        for gamma in other.gamma_ops {
            self.gamma_ops.retain(|existing| existing.crtc != gamma.crtc);
            self.gamma_ops.push(gamma);
        }
        self.flip_listeners.extend(other.flip_listeners);
        self.result_listeners.extend(other.result_listeners);
        if other.custom_page_flip.is_some() {
            self.custom_page_flip = other.custom_page_flip;
        }
    }

    /// CRTCs this update touches
    pub fn crtcs(&self) -> Vec<CrtcId> {
        let mut crtcs = Vec::new();
        let mut push = |crtc: CrtcId| {
            if !crtcs.contains(&crtc) {
                crtcs.push(crtc);
            }
        };
        for op in &self.plane_ops {
            if let PlaneOp::Assign(assignment) = op {
                push(assignment.crtc);
            }
        }
        for mode_set in &self.mode_sets {
            push(mode_set.crtc);
        }
        for prop in &self.crtc_props {
            push(prop.crtc);
        }
        for gamma in &self.gamma_ops {
            push(gamma.crtc);
        }
        for (crtc, _) in &self.flip_listeners {
            push(*crtc);
        }
        crtcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Size;

    fn rect_f64() -> Rectangle<f64> {
        Rectangle {
            loc: Point::new(0.0, 0.0),
            size: Size::new(64.0, 64.0),
        }
    }

    #[test]
    fn unassign_plane_is_idempotent() {
        let mut update = Update::new(GpuId(1));
        update.unassign_plane(PlaneId(5));
        update.unassign_plane(PlaneId(5));
        assert_eq!(update.plane_ops.len(), 1);
        assert!(matches!(
            update.plane_ops[0],
            PlaneOp::Unassign { plane: PlaneId(5) }
        ));
    }

    #[test]
    fn latest_assignment_wins() {
        let mut update = Update::new(GpuId(1));
        update.assign_plane(
            CrtcId(1),
            PlaneId(5),
            FramebufferId(10),
            rect_f64(),
            Rectangle::new((0, 0), (64, 64)),
            AssignPlaneFlags::empty(),
        );
        update.assign_plane(
            CrtcId(1),
            PlaneId(5),
            FramebufferId(11),
            rect_f64(),
            Rectangle::new((0, 0), (64, 64)),
            AssignPlaneFlags::empty(),
        );
        assert_eq!(update.plane_ops.len(), 1);
        match &update.plane_ops[0] {
            PlaneOp::Assign(assignment) => assert_eq!(assignment.fb, FramebufferId(11)),
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn merge_concatenates_and_overrides() {
        let mut a = Update::new(GpuId(1));
        a.assign_plane(
            CrtcId(1),
            PlaneId(5),
            FramebufferId(10),
            rect_f64(),
            Rectangle::new((0, 0), (64, 64)),
            AssignPlaneFlags::empty(),
        );
        a.set_connector_property(ConnectorId(7), PropertyId(20), 1);

        let mut b = Update::new(GpuId(1));
        b.assign_plane(
            CrtcId(1),
            PlaneId(5),
            FramebufferId(12),
            rect_f64(),
            Rectangle::new((0, 0), (64, 64)),
            AssignPlaneFlags::empty(),
        );
        b.set_connector_property(ConnectorId(7), PropertyId(20), 0);
        b.unassign_plane(PlaneId(6));

        a.merge(b);
        assert_eq!(a.plane_ops.len(), 2);
        match &a.plane_ops[0] {
            PlaneOp::Assign(assignment) => assert_eq!(assignment.fb, FramebufferId(12)),
            other => panic!("unexpected op: {:?}", other),
        }
        assert_eq!(a.connector_props.len(), 1);
        assert_eq!(a.connector_props[0].value, 0);
    }
}
