//! DRM resource leasing.
//!
//! Hands bundles of (connector, CRTC, planes) to external privileged
//! clients such as VR compositors. A leased CRTC leaves normal
//! rendering entirely; all bookkeeping here keeps the invariant that a
//! connector, CRTC or plane is owned by either the compositor or one
//! active lease, never both.

use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Mutex};

use rustix::fs::OFlags;
use tracing::{debug, info, info_span, warn};

use crate::control::{ConnectorId, CrtcId, DeviceError, LesseeId, PlaneId};
use crate::device::KmsDevice;

/// Errors of lease creation.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// A requested connector does not exist on the device
    #[error("Connector {0:?} is unknown to this device")]
    UnknownConnector(ConnectorId),
    /// A requested connector is not flagged leasable
    #[error("Connector {0:?} is not leasable")]
    NotLeasable(ConnectorId),
    /// A requested connector is already part of an active lease
    #[error("Connector {0:?} is already leased")]
    AlreadyLeased(ConnectorId),
    /// No unclaimed CRTC is compatible with the connector
    #[error("No free CRTC for connector {0:?}")]
    NoFreeCrtc(ConnectorId),
    /// The chosen CRTC has no primary plane to lease
    #[error("No primary plane for connector {0:?}")]
    NoPrimaryPlane(ConnectorId),
    /// The kernel rejected the lease
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// The hardware bundle leased for one connector.
#[derive(Debug, Clone)]
pub struct LeasedBundle {
    /// Leased connector
    pub connector: ConnectorId,
    /// CRTC driving it
    pub crtc: CrtcId,
    /// Primary plane of the CRTC
    pub primary_plane: PlaneId,
    /// Cursor plane, when one was free
    pub cursor_plane: Option<PlaneId>,
}

/// An active lease. The lessee id is zeroed on revocation.
#[derive(Debug)]
pub struct Lease {
    lessee: LesseeId,
    fd: Option<OwnedFd>,
    bundles: Vec<LeasedBundle>,
}

impl Lease {
    /// Kernel id of the lessee; 0 once revoked
    pub fn lessee(&self) -> LesseeId {
        self.lessee
    }

    /// Whether the lease has not been revoked yet
    pub fn is_active(&self) -> bool {
        self.lessee.0 != 0
    }

    /// Hardware bundles of the lease
    pub fn bundles(&self) -> &[LeasedBundle] {
        &self.bundles
    }
}

/// Notifications about lease lifecycle.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    /// A lease was created
    Created {
        /// Kernel id of the lessee
        lessee: LesseeId,
    },
    /// A lease ended; fired exactly once per lease
    Revoked {
        /// Kernel id the lease had
        lessee: LesseeId,
        /// Connectors that were part of it
        connectors: Vec<ConnectorId>,
    },
}

type LeaseObserver = Box<dyn Fn(&LeaseEvent) + Send + Sync>;

#[derive(Default)]
struct LeaseInner {
    available: Vec<ConnectorId>,
    leases: Vec<Lease>,
    paused: bool,
}

/// Lease bookkeeping for one device.
pub struct LeaseManager {
    device: Arc<KmsDevice>,
    inner: Mutex<LeaseInner>,
    observers: Mutex<Vec<LeaseObserver>>,
    span: tracing::Span,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("device", &self.device.id())
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Create the manager and collect the initially leasable connectors
    pub fn new(device: Arc<KmsDevice>) -> Self {
        let manager = LeaseManager {
            span: info_span!("drm_lease", device = ?device.id()),
            device,
            inner: Mutex::new(LeaseInner::default()),
            observers: Mutex::new(Vec::new()),
        };
        manager.refresh_available();
        manager
    }

    /// Register an observer for lease lifecycle events
    pub fn add_observer(&self, observer: LeaseObserver) {
        self.observers.lock().unwrap().push(observer);
    }

    fn notify(&self, event: &LeaseEvent) {
        for observer in self.observers.lock().unwrap().iter() {
            observer(event);
        }
    }

    /// Connectors currently offered for leasing
    pub fn available_connectors(&self) -> Vec<ConnectorId> {
        self.inner.lock().unwrap().available.clone()
    }

    /// Ids of all active leases
    pub fn active_lessees(&self) -> Vec<LesseeId> {
        self.inner
            .lock()
            .unwrap()
            .leases
            .iter()
            .filter(|lease| lease.is_active())
            .map(|lease| lease.lessee)
            .collect()
    }

    /// Whether `lessee` names an active lease
    pub fn is_active(&self, lessee: LesseeId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .leases
            .iter()
            .any(|lease| lease.is_active() && lease.lessee == lessee)
    }

    /// Steal the lease fd to hand to the client. Returns `None` if
    /// already taken or the lease is gone.
    pub fn take_fd(&self, lessee: LesseeId) -> Option<OwnedFd> {
        self.inner
            .lock()
            .unwrap()
            .leases
            .iter_mut()
            .find(|lease| lease.is_active() && lease.lessee == lessee)
            .and_then(|lease| lease.fd.take())
    }

    /// Bundles of an active lease
    pub fn bundles(&self, lessee: LesseeId) -> Option<Vec<LeasedBundle>> {
        self.inner
            .lock()
            .unwrap()
            .leases
            .iter()
            .find(|lease| lease.is_active() && lease.lessee == lessee)
            .map(|lease| lease.bundles.clone())
    }

    /// Recompute the set of leasable connectors. A no-op while paused.
    pub fn refresh_available(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.paused {
            return;
        }
        let leased: Vec<ConnectorId> = inner
            .leases
            .iter()
            .filter(|lease| lease.is_active())
            .flat_map(|lease| lease.bundles.iter().map(|bundle| bundle.connector))
            .collect();
        inner.available = self
            .device
            .connectors()
            .iter()
            .filter(|connector| connector.is_leasable() && !leased.contains(&connector.id()))
            .map(|connector| connector.id())
            .collect();
    }

    /// Stop hotplug-driven bookkeeping without touching active leases
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    /// Re-enable hotplug-driven bookkeeping
    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
        self.refresh_available();
    }

    /// Create a lease over `connectors`.
    ///
    /// All-or-nothing: every connector needs a free compatible CRTC and
    /// a primary plane, otherwise the whole request fails with no state
    /// mutated. A missing cursor plane only warns.
    #[profiling::function]
    pub fn create_lease(&self, connectors: &[ConnectorId]) -> Result<LesseeId, LeaseError> {
        let _guard = self.span.enter();
        let mut inner = self.inner.lock().unwrap();

        let mut bundles: Vec<LeasedBundle> = Vec::with_capacity(connectors.len());
        for id in connectors {
            let connector = self
                .device
                .connector(*id)
                .ok_or(LeaseError::UnknownConnector(*id))?;
            if !connector.is_leasable() {
                return Err(LeaseError::NotLeasable(*id));
            }
            let already = inner.leases.iter().any(|lease| {
                lease.is_active()
                    && lease.bundles.iter().any(|bundle| bundle.connector == *id)
            });
            if already || bundles.iter().any(|bundle| bundle.connector == *id) {
                return Err(LeaseError::AlreadyLeased(*id));
            }

            let crtc_mask = connector.state().crtc_mask;
            let crtc = self
                .device
                .crtcs()
                .iter()
                .find(|crtc| {
                    let state = crtc.state();
                    crtc_mask & (1 << crtc.index()) != 0
                        && !state.active
                        && !state.leased
                        && !bundles.iter().any(|bundle| bundle.crtc == crtc.id())
                })
                .ok_or(LeaseError::NoFreeCrtc(*id))?;

            let state = crtc.state();
            let primary_plane = state.primary_plane.ok_or(LeaseError::NoPrimaryPlane(*id))?;
            let cursor_plane = state.cursor_plane;
            if cursor_plane.is_none() {
                warn!(connector = ?id, crtc = ?crtc.id(), "leasing without a cursor plane");
            }
            drop(state);

            bundles.push(LeasedBundle {
                connector: *id,
                crtc: crtc.id(),
                primary_plane,
                cursor_plane,
            });
        }

        let mut objects: Vec<u32> = Vec::new();
        for bundle in &bundles {
            objects.push(bundle.connector.0);
            objects.push(bundle.crtc.0);
            objects.push(bundle.primary_plane.0);
            if let Some(cursor) = bundle.cursor_plane {
                objects.push(cursor.0);
            }
        }

        // one atomic lease object over the whole bundle
        let (lessee, fd) = self
            .device
            .control()
            .create_lease(&objects, OFlags::CLOEXEC.bits())?;
        info!(?lessee, ?connectors, "created lease");

        for bundle in &bundles {
            if let Some(crtc) = self.device.crtc(bundle.crtc) {
                let mut state = crtc.state_mut();
                state.leased = true;
                // the cursor plane leaves compositor control entirely
                state.cursor_plane = None;
            }
        }
        inner
            .available
            .retain(|connector| !connectors.contains(connector));
        inner.leases.push(Lease {
            lessee,
            fd: Some(fd),
            bundles,
        });
        drop(inner);

        self.notify(&LeaseEvent::Created { lessee });
        Ok(lessee)
    }

    /// Explicitly revoke a lease. Returns whether it was active.
    pub fn revoke_lease(&self, lessee: LesseeId) -> bool {
        let _guard = self.span.enter();
        if !self.is_active(lessee) {
            return false;
        }
        if let Err(err) = self.device.control().revoke_lease(lessee) {
            // the client may have vanished concurrently
            debug!(?lessee, ?err, "kernel lease revocation failed");
        }
        self.finish_lease(lessee);
        true
    }

    /// Revoke leases whose connectors vanished in a rescan, then
    /// recompute availability. A no-op while paused.
    pub fn handle_rescan(&self, removed: &[ConnectorId]) {
        if self.inner.lock().unwrap().paused {
            return;
        }
        let stale: Vec<LesseeId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .leases
                .iter()
                .filter(|lease| {
                    lease.is_active()
                        && lease
                            .bundles
                            .iter()
                            .any(|bundle| removed.contains(&bundle.connector))
                })
                .map(|lease| lease.lessee)
                .collect()
        };
        for lessee in stale {
            info!(?lessee, "connector of lease vanished, revoking");
            self.revoke_lease(lessee);
        }
        self.refresh_available();
    }

    /// Compare the kernel's live lessee list against our bookkeeping;
    /// leases whose id disappeared (client crashed) are cleaned up.
    pub fn poll_lessees(&self) -> Result<(), DeviceError> {
        let live = self.device.control().list_lessees()?;
        let dead: Vec<LesseeId> = self
            .active_lessees()
            .into_iter()
            .filter(|lessee| !live.contains(lessee))
            .collect();
        for lessee in dead {
            info!(?lessee, "lessee disappeared, cleaning up");
            self.finish_lease(lessee);
        }
        Ok(())
    }

    /// Common teardown: unassign planes, clear leased flags, zero the
    /// lessee id, return connectors to the pool, fire `Revoked` once.
    fn finish_lease(&self, lessee: LesseeId) {
        let (connectors, bundles) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(lease) = inner
                .leases
                .iter_mut()
                .find(|lease| lease.is_active() && lease.lessee == lessee)
            else {
                return;
            };
            // 0 is the inactive sentinel; guarantees exactly-once
            lease.lessee = LesseeId(0);
            lease.fd = None;
            let bundles = lease.bundles.clone();
            let connectors: Vec<ConnectorId> =
                bundles.iter().map(|bundle| bundle.connector).collect();
            (connectors, bundles)
        };

        for bundle in &bundles {
            if let Some(crtc) = self.device.crtc(bundle.crtc) {
                let mut state = crtc.state_mut();
                state.leased = false;
                state.cursor_plane = bundle.cursor_plane;
            }
        }
        self.refresh_available();

        self.notify(&LeaseEvent::Revoked {
            lessee,
            connectors,
        });
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        let lessees = self.active_lessees();
        for lessee in lessees {
            self.revoke_lease(lessee);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::control::fake::FakeTopology;
    use crate::control::{DeviceControl, GpuId};
    use crate::device::{GpuFlags, KmsDevice};

    fn setup_two_connectors_one_crtc() -> (Arc<KmsDevice>, ConnectorId, ConnectorId) {
        let mut topo = FakeTopology::new();
        let (_crtc, _primary, _cursor, first) = topo.add_output(true);
        // second connector can only be driven by the same CRTC
        let second = topo.add_connector(0, false);
        let fake = topo.build();
        let device = KmsDevice::new(
            GpuId(1),
            GpuFlags::empty(),
            fake as Arc<dyn DeviceControl>,
        )
        .unwrap();
        for connector in device.connectors() {
            connector.set_leasable_hint(true);
        }
        (device, first, second)
    }

    fn events_sink(manager: &LeaseManager) -> Arc<StdMutex<Vec<LeaseEvent>>> {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        manager.add_observer(Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        events
    }

    #[test]
    fn lease_creation_is_all_or_nothing() {
        let (device, first, second) = setup_two_connectors_one_crtc();
        let manager = LeaseManager::new(device.clone());
        manager.refresh_available();

        let err = manager.create_lease(&[first, second]).unwrap_err();
        assert!(matches!(err, LeaseError::NoFreeCrtc(id) if id == second));

        // nothing was mutated by the failed request
        assert!(device.crtcs().iter().all(|crtc| !crtc.is_leased()));
        assert!(manager.active_lessees().is_empty());
        assert_eq!(manager.available_connectors().len(), 2);
    }

    #[test]
    fn leased_crtc_loses_its_cursor_plane() {
        let (device, first, _second) = setup_two_connectors_one_crtc();
        let manager = LeaseManager::new(device.clone());
        manager.refresh_available();

        let lessee = manager.create_lease(&[first]).unwrap();
        assert!(manager.is_active(lessee));
        assert!(manager.take_fd(lessee).is_some());
        assert!(manager.take_fd(lessee).is_none());

        let bundle = &manager.bundles(lessee).unwrap()[0];
        let crtc = device.crtc(bundle.crtc).unwrap();
        assert!(crtc.is_leased());
        assert_eq!(crtc.cursor_plane(), None);
        assert!(bundle.cursor_plane.is_some());

        // normal output and lease ownership stay mutually exclusive
        assert!(!manager.available_connectors().contains(&first));

        manager.revoke_lease(lessee);
        assert!(!crtc.is_leased());
        assert_eq!(crtc.cursor_plane(), bundle.cursor_plane);
    }

    #[test]
    fn vanished_connector_revokes_exactly_once() {
        let mut topo = FakeTopology::new();
        let (_crtc, _primary, _cursor, connector) = topo.add_output(true);
        let fake = topo.build();
        let device = KmsDevice::new(
            GpuId(1),
            GpuFlags::empty(),
            fake.clone() as Arc<dyn DeviceControl>,
        )
        .unwrap();
        device.connector(connector).unwrap().set_leasable_hint(true);

        let manager = LeaseManager::new(device.clone());
        manager.refresh_available();
        let events = events_sink(&manager);

        let lessee = manager.create_lease(&[connector]).unwrap();
        let crtc_id = manager.bundles(lessee).unwrap()[0].crtc;

        let info = fake.unplug_connector(connector);
        let rescan = device.rescan_connectors().unwrap();
        assert_eq!(rescan.removed, vec![connector]);
        manager.handle_rescan(&rescan.removed);
        // a second rescan with the connector still gone must not fire again
        manager.handle_rescan(&rescan.removed);

        let revocations = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, LeaseEvent::Revoked { .. }))
            .count();
        assert_eq!(revocations, 1);
        assert!(!manager.is_active(lessee));
        assert!(!device.crtc(crtc_id).unwrap().is_leased());

        // the connector coming back ends up available again
        fake.replug_connector(info);
        let rescan = device.rescan_connectors().unwrap();
        assert_eq!(rescan.added, vec![connector]);
        device.connector(connector).unwrap().set_leasable_hint(true);
        manager.refresh_available();
        assert!(manager.available_connectors().contains(&connector));
    }

    #[test]
    fn crashed_lessee_is_detected_by_polling() {
        let (device, first, _second) = setup_two_connectors_one_crtc();
        let fake_control = device.control().clone();
        let manager = LeaseManager::new(device.clone());
        manager.refresh_available();
        let events = events_sink(&manager);

        let lessee = manager.create_lease(&[first]).unwrap();
        assert!(fake_control.list_lessees().unwrap().contains(&lessee));

        // the kernel dropping the lessee is how a crashed client shows up
        fake_control.revoke_lease(lessee).unwrap();

        manager.poll_lessees().unwrap();
        assert!(!manager.is_active(lessee));
        let revocations = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, LeaseEvent::Revoked { .. }))
            .count();
        assert_eq!(revocations, 1);
    }

    #[test]
    fn pause_freezes_bookkeeping_but_not_leases() {
        let (device, first, second) = setup_two_connectors_one_crtc();
        let manager = LeaseManager::new(device.clone());
        manager.refresh_available();

        let lessee = manager.create_lease(&[first]).unwrap();
        manager.pause();

        // hotplug bookkeeping is frozen
        manager.handle_rescan(&[first]);
        assert!(manager.is_active(lessee));

        manager.resume();
        assert!(manager.is_active(lessee));
        assert!(manager.available_connectors().contains(&second));
    }
}
