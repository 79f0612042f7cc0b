//! Error taxonomy of the crate.
//!
//! Kernel failures keep their [`DeviceError`] classification so callers
//! can tell expected, transient conditions (lost DRM master on a VT
//! switch, `EBUSY`) from real problems. Anything else in this enum is a
//! capability or bookkeeping failure recovered by feature downgrade.

use crate::control::{ConnectorId, CrtcId, DeviceError, PlaneId};

/// Errors of the presentation backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device collaborator reported a failure
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A CRTC id was used that this device does not own
    #[error("CRTC {0:?} is unknown to this device")]
    UnknownCrtc(CrtcId),
    /// A plane id was used that this device does not own
    #[error("Plane {0:?} is unknown to this device")]
    UnknownPlane(PlaneId),
    /// A connector id was used that this device does not own
    #[error("Connector {0:?} is unknown to this device")]
    UnknownConnector(ConnectorId),
    /// An object is missing a property required for the operation
    #[error("Object {object} is missing the property '{name}'")]
    MissingProperty {
        /// Raw id of the object
        object: u32,
        /// Kernel name of the property
        name: &'static str,
    },
    /// A test-only commit rejected the proposed state
    #[error("Atomic test failed for CRTC {0:?}")]
    TestFailed(CrtcId),
    /// The device is shutting down, the operation was discarded
    #[error("Device is shutting down, operation rejected")]
    ShuttingDown,
}

impl Error {
    /// Whether this error is expected to clear up without intervention
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Device(err) => err.is_transient(),
            _ => false,
        }
    }
}
