//! The kernel-facing device contract.
//!
//! Everything above this module speaks in terms of plain object ids and
//! property tuples; the only place that knows how to marshal those into
//! ioctls is the [`DeviceControl`] implementation. The real implementation
//! lives in [`fd`] and wraps an open DRM node, tests substitute their own.

use std::fmt;
use std::io;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;

use drm_fourcc::{DrmFourcc, DrmModifier};
use smallvec::SmallVec;

use crate::utils::Size;

pub mod event;
pub mod fd;

#[cfg(test)]
pub(crate) mod fake;

macro_rules! object_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

object_id!(
    /// Id of a CRTC
    CrtcId
);
object_id!(
    /// Id of a plane
    PlaneId
);
object_id!(
    /// Id of a connector
    ConnectorId
);
object_id!(
    /// Id of a property
    PropertyId
);
object_id!(
    /// Id of an attached framebuffer
    FramebufferId
);
object_id!(
    /// Id of a kernel property blob
    BlobId
);
object_id!(
    /// Id the kernel assigned to a lessee. `0` never names an active lease.
    LesseeId
);

/// Identity of a GPU device, derived from its `dev_t`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuId(pub u64);

impl fmt::Debug for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuId({}:{})", (self.0 >> 8) & 0xfff, self.0 & 0xff)
    }
}

/// Opaque id of a dumb buffer allocation owned by a [`DeviceControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DumbBufferId(pub u64);

/// A KMS object an atomic property write can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    /// A CRTC
    Crtc(CrtcId),
    /// A plane
    Plane(PlaneId),
    /// A connector
    Connector(ConnectorId),
}

impl ObjectId {
    /// The raw kernel object id
    pub fn raw(self) -> u32 {
        match self {
            ObjectId::Crtc(id) => id.0,
            ObjectId::Plane(id) => id.0,
            ObjectId::Connector(id) => id.0,
        }
    }
}

impl From<CrtcId> for ObjectId {
    fn from(id: CrtcId) -> Self {
        ObjectId::Crtc(id)
    }
}
impl From<PlaneId> for ObjectId {
    fn from(id: PlaneId) -> Self {
        ObjectId::Plane(id)
    }
}
impl From<ConnectorId> for ObjectId {
    fn from(id: ConnectorId) -> Self {
        ObjectId::Connector(id)
    }
}

bitflags::bitflags! {
    /// Flags of an atomic commit, mirroring the kernel's commit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        /// Request a page flip event on completion
        const PAGE_FLIP_EVENT = 1 << 0;
        /// Return immediately instead of blocking for the commit
        const NONBLOCK = 1 << 1;
        /// The commit may perform a full mode set
        const ALLOW_MODESET = 1 << 2;
        /// Validate only, do not touch hardware state
        const TEST_ONLY = 1 << 3;
    }
}

/// One property-tuple batch to be applied atomically.
///
/// Values are raw `u64`s as the kernel sees them; blob and object
/// properties carry their id.
#[derive(Debug, Default, Clone)]
pub struct AtomicRequest {
    props: SmallVec<[(ObjectId, PropertyId, u64); 24]>,
}

impl AtomicRequest {
    /// Create an empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property write. Writes for the same (object, property)
    /// pair are legal, the last one wins in the kernel.
    pub fn add_property(&mut self, object: impl Into<ObjectId>, prop: PropertyId, value: u64) {
        self.props.push((object.into(), prop, value));
    }

    /// Whether the request contains no writes
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Number of property writes
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Iterate over all property writes in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &(ObjectId, PropertyId, u64)> {
        self.props.iter()
    }
}

/// Raw mode timings as programmed into the hardware.
///
/// Deliberately excludes the mode name so that equality and hashing only
/// consider the timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeTimings {
    /// Pixel clock in kHz
    pub clock: u32,
    /// Horizontal display size
    pub hdisplay: u16,
    /// Horizontal sync start
    pub hsync_start: u16,
    /// Horizontal sync end
    pub hsync_end: u16,
    /// Horizontal total
    pub htotal: u16,
    /// Vertical display size
    pub vdisplay: u16,
    /// Vertical sync start
    pub vsync_start: u16,
    /// Vertical sync end
    pub vsync_end: u16,
    /// Vertical total
    pub vtotal: u16,
    /// Mode flags (sync polarity, interlace, ...)
    pub flags: u32,
}

impl ModeTimings {
    /// Visible size of this mode
    pub fn size(&self) -> Size<u32> {
        Size::new(self.hdisplay as u32, self.vdisplay as u32)
    }

    /// Refresh rate in millihertz
    pub fn refresh_mhz(&self) -> u32 {
        let total = self.htotal as u64 * self.vtotal as u64;
        if total == 0 {
            return 0;
        }
        (self.clock as u64 * 1_000_000 / total) as u32
    }
}

/// A single property as discovered on a KMS object.
#[derive(Debug, Clone)]
pub struct PropInfo {
    /// Property id used in atomic requests
    pub id: PropertyId,
    /// Kernel name of the property
    pub name: String,
    /// Value at discovery time
    pub value: u64,
    /// For enum and bitmask properties the possible (name, value) pairs
    pub enum_values: Vec<(String, u64)>,
}

/// Kind of a plane as advertised by its `type` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    /// Scanout plane a CRTC reads its main image from
    Primary,
    /// Small plane dedicated to the cursor image
    Cursor,
    /// Additional composition layer
    Overlay,
}

/// Discovery data of one plane.
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    /// Object id
    pub id: PlaneId,
    /// Plane type
    pub kind: PlaneKind,
    /// Bitmask of CRTC indexes this plane can be used with
    pub crtc_mask: u32,
    /// Formats supported without explicit modifiers
    pub formats: Vec<DrmFourcc>,
    /// Per-format modifier lists from the `IN_FORMATS` blob
    pub modifiers: Vec<(DrmFourcc, Vec<DrmModifier>)>,
    /// All properties of the plane
    pub props: Vec<PropInfo>,
}

/// Discovery data of one CRTC.
#[derive(Debug, Clone)]
pub struct CrtcInfo {
    /// Object id
    pub id: CrtcId,
    /// Index into the device's CRTC array, used to resolve `crtc_mask`s
    pub index: usize,
    /// Whether the CRTC is currently active
    pub active: bool,
    /// Timings currently programmed, if any
    pub current_mode: Option<ModeTimings>,
    /// All properties of the CRTC
    pub props: Vec<PropInfo>,
}

/// One display mode as reported by a connector.
#[derive(Debug, Clone)]
pub struct ConnectorMode {
    /// Raw timings
    pub timings: ModeTimings,
    /// Display name, e.g. `1920x1080`
    pub name: String,
    /// Whether the connector marks this mode preferred
    pub preferred: bool,
}

/// Discovery data of one connector.
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    /// Object id
    pub id: ConnectorId,
    /// Interface name, e.g. `DP-1`
    pub interface: String,
    /// Whether a display is attached
    pub connected: bool,
    /// Bitmask of CRTC indexes that can drive this connector
    pub crtc_mask: u32,
    /// CRTC currently driving the connector, if any
    pub current_crtc: Option<CrtcId>,
    /// Modes reported by the attached display
    pub modes: Vec<ConnectorMode>,
    /// All properties of the connector
    pub props: Vec<PropInfo>,
}

/// Complete topology snapshot taken at discovery time.
#[derive(Debug, Clone, Default)]
pub struct ResourceTopology {
    /// All CRTCs in hardware order
    pub crtcs: Vec<CrtcInfo>,
    /// All planes
    pub planes: Vec<PlaneInfo>,
    /// All connectors
    pub connectors: Vec<ConnectorInfo>,
}

/// Which clock the device timestamps page flips with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// `CLOCK_MONOTONIC`
    Monotonic,
    /// `CLOCK_REALTIME`
    Realtime,
}

/// Static capabilities of a device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    /// Whether the device supports atomic commits
    pub atomic: bool,
    /// Whether overlay/cursor planes are exposed
    pub universal_planes: bool,
    /// Which clock flip timestamps use
    pub clock: ClockSource,
    /// Maximum dimensions of the cursor plane
    pub cursor_size: Size<u32>,
    /// Whether framebuffers can carry explicit format modifiers
    pub addfb2_modifiers: bool,
    /// Whether PRIME buffer import is available
    pub prime_import: bool,
}

/// A dumb buffer allocation, persistently CPU mappable via
/// [`DeviceControl::write_dumb_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct DumbBufferInfo {
    /// Opaque allocation id
    pub id: DumbBufferId,
    /// Framebuffer attached to the allocation
    pub fb: FramebufferId,
    /// Buffer dimensions
    pub size: Size<u32>,
    /// Pixel format
    pub format: DrmFourcc,
    /// Row pitch in bytes
    pub pitch: u32,
}

/// One plane of an imported dma-buf.
#[derive(Debug)]
pub struct DmabufPlane {
    /// File descriptor of the memory
    pub fd: OwnedFd,
    /// Byte offset of the plane within the buffer
    pub offset: u32,
    /// Row pitch in bytes
    pub stride: u32,
}

/// Cross-device buffer handle to be imported for scanout.
#[derive(Debug)]
pub struct DmabufHandle {
    /// Memory planes, at most 4
    pub planes: SmallVec<[DmabufPlane; 4]>,
    /// Buffer dimensions
    pub size: Size<u32>,
    /// Pixel format
    pub format: DrmFourcc,
    /// Format modifier
    pub modifier: DrmModifier,
}

/// A page flip completion read from the device.
#[derive(Debug, Clone, Copy)]
pub struct FlipEvent {
    /// CRTC the flip completed on
    pub crtc: CrtcId,
    /// Hardware frame sequence number
    pub sequence: u32,
    /// Timestamp relative to the epoch of [`DeviceCaps::clock`]
    pub time: Duration,
}

/// Errors produced by a [`DeviceControl`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// An ioctl on the device failed
    #[error("DRM access error: {errmsg} on device `{dev:?}`")]
    Access {
        /// Description of the failed operation
        errmsg: &'static str,
        /// Path of the device node, if known
        dev: Option<PathBuf>,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// An object id was used that the device does not know
    #[error("Unknown object id {0}")]
    UnknownObject(u32),
    /// The operation requires a capability the device lacks
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl DeviceError {
    /// Lost DRM master (VT switch) or insufficient privileges. Expected
    /// during session switches and recovered by retrying next frame.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.raw_os_error(), Some(libc::EACCES) | Some(libc::EPERM))
    }

    /// The device is busy, retry later.
    pub fn is_busy(&self) -> bool {
        matches!(self.raw_os_error(), Some(libc::EBUSY))
    }

    /// Whether this error is expected to clear up without intervention.
    pub fn is_transient(&self) -> bool {
        self.is_permission_denied()
            || self.is_busy()
            || matches!(self.raw_os_error(), Some(libc::EINTR))
    }

    fn raw_os_error(&self) -> Option<i32> {
        match self {
            DeviceError::Access { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// The external device collaborator: every hardware access of the crate
/// funnels through this trait.
///
/// Object safety is required, the rest of the crate holds it as
/// `Arc<dyn DeviceControl>`.
pub trait DeviceControl: fmt::Debug + Send + Sync {
    /// Path of the underlying device node, for diagnostics
    fn dev_path(&self) -> Option<PathBuf>;

    /// File descriptor to poll for page flip events, when one exists
    fn poll_fd(&self) -> Option<std::os::unix::io::BorrowedFd<'_>> {
        None
    }

    /// Static device capabilities
    fn caps(&self) -> DeviceCaps;

    /// Full topology snapshot, taken once at device creation
    fn topology(&self) -> Result<ResourceTopology, DeviceError>;

    /// Re-read connector state only, e.g. after a hotplug event
    fn connectors(&self) -> Result<Vec<ConnectorInfo>, DeviceError>;

    /// Submit an atomic commit
    fn atomic_commit(&self, flags: CommitFlags, req: &AtomicRequest) -> Result<(), DeviceError>;

    /// Upload mode timings as a property blob
    fn create_mode_blob(&self, mode: &ModeTimings) -> Result<BlobId, DeviceError>;

    /// Upload raw bytes as a property blob (gamma LUTs, HDR metadata)
    fn create_blob(&self, data: &[u8]) -> Result<BlobId, DeviceError>;

    /// Destroy a previously created blob
    fn destroy_blob(&self, blob: BlobId) -> Result<(), DeviceError>;

    /// Legacy blocking mode set on a CRTC
    fn set_crtc(
        &self,
        crtc: CrtcId,
        fb: Option<FramebufferId>,
        connectors: &[ConnectorId],
        mode: Option<&ModeTimings>,
    ) -> Result<(), DeviceError>;

    /// Legacy page flip, completion delivered via [`DeviceControl::receive_events`]
    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> Result<(), DeviceError>;

    /// Allocate a dumb buffer with an attached framebuffer
    fn create_dumb_buffer(&self, size: Size<u32>, format: DrmFourcc) -> Result<DumbBufferInfo, DeviceError>;

    /// Run `f` over the CPU mapping of a dumb buffer
    fn write_dumb_buffer(
        &self,
        buffer: DumbBufferId,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), DeviceError>;

    /// Free a dumb buffer and its framebuffer
    fn destroy_dumb_buffer(&self, buffer: DumbBufferId) -> Result<(), DeviceError>;

    /// Import a dma-buf and attach a framebuffer to it
    fn import_dmabuf(&self, dmabuf: &DmabufHandle) -> Result<FramebufferId, DeviceError>;

    /// Destroy a framebuffer created by an import
    fn destroy_framebuffer(&self, fb: FramebufferId) -> Result<(), DeviceError>;

    /// Create a lease over raw object ids, returning the lessee id and the
    /// fd to hand to the client
    fn create_lease(&self, objects: &[u32], flags: u32) -> Result<(LesseeId, OwnedFd), DeviceError>;

    /// Revoke an active lease
    fn revoke_lease(&self, lessee: LesseeId) -> Result<(), DeviceError>;

    /// List the ids of all live lessees
    fn list_lessees(&self) -> Result<Vec<LesseeId>, DeviceError>;

    /// Drain pending page flip events from the device
    fn receive_events(&self) -> Result<Vec<FlipEvent>, DeviceError>;
}
