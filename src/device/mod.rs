//! Per-GPU device model.
//!
//! A [`KmsDevice`] owns the static topology discovered from its device
//! collaborator (CRTCs, planes, connectors), the deduplicated mode list,
//! and the commit engine all updates for the device funnel through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use crate::commit::{CommitEngine, CommitMode};
use crate::control::{
    ClockSource, ConnectorId, CrtcId, DeviceCaps, DeviceControl, FlipEvent, FramebufferId, GpuId,
    PlaneId, PlaneKind,
};
use crate::error::Error;
use crate::update::{FlipTimestamp, Update};
use crate::utils::{Size, Transform};

pub mod connector;
pub mod crtc;
pub mod mode;
pub mod plane;
mod props;

use connector::Connector;
use crtc::Crtc;
use mode::{Mode, ModeCache, FALLBACK_MODES};
use plane::Plane;

bitflags::bitflags! {
    /// Static facts about a GPU that feed primary device selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GpuFlags: u32 {
        /// The firmware marked this the boot VGA device
        const BOOT_VGA = 1 << 0;
        /// Platform (integrated) device rather than a discrete card
        const PLATFORM = 1 << 1;
        /// Configuration explicitly prefers this device as primary
        const PREFERRED_PRIMARY = 1 << 2;
    }
}

/// Result of a connector rescan.
#[derive(Debug, Default)]
pub struct ConnectorRescan {
    /// Connectors that appeared
    pub added: Vec<ConnectorId>,
    /// Connectors that vanished
    pub removed: Vec<ConnectorId>,
}

/// One GPU with its display topology.
#[derive(Debug)]
pub struct KmsDevice {
    id: GpuId,
    flags: GpuFlags,
    caps: DeviceCaps,
    control: Arc<dyn DeviceControl>,
    crtcs: Vec<Crtc>,
    planes: Vec<Plane>,
    connectors: RwLock<Vec<Arc<Connector>>>,
    modes: Mutex<ModeCache>,
    engine: CommitEngine,
    shutting_down: AtomicBool,
    span: tracing::Span,
}

impl KmsDevice {
    /// Discover the topology of `control` and build the device model.
    pub fn new(id: GpuId, flags: GpuFlags, control: Arc<dyn DeviceControl>) -> Result<Arc<Self>, Error> {
        let span = info_span!("kms_device", device = ?id);
        let _guard = span.enter();

        let caps = control.caps();
        let topology = control.topology()?;
        info!(
            crtcs = topology.crtcs.len(),
            planes = topology.planes.len(),
            connectors = topology.connectors.len(),
            atomic = caps.atomic,
            "initializing device"
        );

        let crtcs: Vec<Crtc> = topology.crtcs.iter().map(Crtc::from_info).collect();
        let planes: Vec<Plane> = topology.planes.iter().map(Plane::from_info).collect();

        let mut modes = ModeCache::new();
        let connectors: Vec<Arc<Connector>> = topology
            .connectors
            .iter()
            .map(|info| Arc::new(Connector::from_info(info, &mut modes)))
            .collect();
        for connector in &connectors {
            add_fallback_modes(connector, &mut modes);
        }

        assign_planes(&crtcs, &planes);

        drop(_guard);
        Ok(Arc::new(KmsDevice {
            id,
            flags,
            caps,
            engine: CommitEngine::new(control.clone()),
            control,
            crtcs,
            planes,
            connectors: RwLock::new(connectors),
            modes: Mutex::new(modes),
            shutting_down: AtomicBool::new(false),
            span,
        }))
    }

    /// Identity of the device
    pub fn id(&self) -> GpuId {
        self.id
    }

    /// Selection-relevant device flags
    pub fn flags(&self) -> GpuFlags {
        self.flags
    }

    /// Kernel capabilities of the device
    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    /// The device collaborator
    pub fn control(&self) -> &Arc<dyn DeviceControl> {
        &self.control
    }

    /// Maximum hardware cursor dimensions
    pub fn cursor_size(&self) -> Size<u32> {
        self.caps.cursor_size
    }

    /// All CRTCs in hardware order
    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    /// All planes
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Snapshot of the current connector list
    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors.read().unwrap().clone()
    }

    /// CRTC by id
    pub fn crtc(&self, id: CrtcId) -> Option<&Crtc> {
        self.crtcs.iter().find(|crtc| crtc.id() == id)
    }

    /// Plane by id
    pub fn plane(&self, id: PlaneId) -> Option<&Plane> {
        self.planes.iter().find(|plane| plane.id() == id)
    }

    /// Connector by id
    pub fn connector(&self, id: ConnectorId) -> Option<Arc<Connector>> {
        self.connectors
            .read()
            .unwrap()
            .iter()
            .find(|connector| connector.id() == id)
            .cloned()
    }

    /// Current time in the device's flip timestamp clock domain
    pub fn now(&self) -> Duration {
        let clock = match self.caps.clock {
            ClockSource::Monotonic => rustix::time::ClockId::Monotonic,
            ClockSource::Realtime => rustix::time::ClockId::Realtime,
        };
        let ts = rustix::time::clock_gettime(clock);
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }

    /// Clock domain of [`KmsDevice::now`] and flip timestamps
    pub fn clock(&self) -> ClockSource {
        self.caps.clock
    }

    /// Run `f` over the single open update of this device
    pub fn with_pending_update<R>(&self, f: impl FnOnce(&mut Update) -> R) -> R {
        self.engine.with_pending_update(self, f)
    }

    /// Whether an update is currently open
    pub fn has_pending_update(&self) -> bool {
        self.engine.has_pending_update()
    }

    /// Whether an asynchronous commit is outstanding on `crtc`
    pub fn is_crtc_flushing(&self, crtc: CrtcId) -> bool {
        self.engine.is_crtc_flushing(crtc)
    }

    /// Flush the open update, if any
    pub fn post_pending_update(&self, mode: CommitMode) -> Result<(), Error> {
        let _guard = self.span.enter();
        self.engine.post_pending_update(self, mode)
    }

    /// Submit a standalone update
    pub fn post_update(&self, update: Update, mode: CommitMode) -> Result<(), Error> {
        let _guard = self.span.enter();
        self.engine.post_update(self, update, mode)
    }

    /// Dry-run validation of a standalone update
    pub fn test_update(&self, update: Update) -> Result<(), Error> {
        let _guard = self.span.enter();
        self.engine.test_update(self, update)
    }

    /// Feed a page flip event back into the commit bookkeeping
    pub fn dispatch_event(&self, event: FlipEvent) {
        let time = FlipTimestamp {
            time: event.time,
            clock: self.caps.clock,
        };
        self.engine.dispatch_flip_event(event.crtc, event.sequence, time);
    }

    /// Drain pending device events and dispatch them
    pub fn process_events(&self) -> Result<(), Error> {
        for event in self.control.receive_events()? {
            self.dispatch_event(event);
        }
        Ok(())
    }

    /// Start an orderly shutdown: queued frames complete symbolically,
    /// new frames are rejected.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.engine.discard_inflight();
    }

    /// Whether the device is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether the primary plane of `crtc` can scan out `transform`
    pub fn is_transform_handled(&self, crtc: CrtcId, transform: Transform) -> bool {
        let Some(crtc) = self.crtc(crtc) else {
            return false;
        };
        let Some(primary) = crtc.primary_plane() else {
            return false;
        };
        self.plane(primary)
            .map(|plane| plane.supports_transform(transform))
            .unwrap_or(false)
    }

    /// Write the wanted transform of `crtc` into `update`, falling back
    /// to [`Transform::Normal`] when the hardware cannot rotate. A no-op
    /// if even that is not expressible.
    pub fn apply_transform(&self, crtc_id: CrtcId, update: &mut Update) {
        let Some(crtc) = self.crtc(crtc_id) else {
            return;
        };
        let Some(primary) = crtc.primary_plane() else {
            return;
        };
        let Some(plane) = self.plane(primary) else {
            return;
        };

        let wanted = crtc.state().wanted_transform;
        let transform = if plane.supports_transform(wanted) {
            wanted
        } else {
            Transform::Normal
        };
        let Some(value) = plane.rotation_value(transform) else {
            return;
        };
        let Some(prop) = plane.prop("rotation") else {
            return;
        };

        debug!(crtc = ?crtc_id, ?transform, "applying transform");
        update.set_plane_property(primary, prop, value);
    }

    /// Re-read the connector list after a hotplug event.
    ///
    /// Existing connectors are refreshed in place, new ones added, and
    /// ids of vanished connectors are reported so leases over them can
    /// be revoked.
    pub fn rescan_connectors(&self) -> Result<ConnectorRescan, Error> {
        let _guard = self.span.enter();
        let infos = self.control.connectors()?;
        let mut connectors = self.connectors.write().unwrap();
        let mut modes = self.modes.lock().unwrap();
        let mut rescan = ConnectorRescan::default();

        for info in &infos {
            match connectors.iter().find(|conn| conn.id() == info.id) {
                Some(connector) => connector.refresh(info, &mut modes),
                None => {
                    debug!(connector = ?info.id, "connector appeared");
                    let connector = Arc::new(Connector::from_info(info, &mut modes));
                    add_fallback_modes(&connector, &mut modes);
                    connectors.push(connector);
                    rescan.added.push(info.id);
                }
            }
        }

        connectors.retain(|connector| {
            let still_there = infos.iter().any(|info| info.id == connector.id());
            if !still_there {
                debug!(connector = ?connector.id(), "connector vanished");
                rescan.removed.push(connector.id());
            }
            still_there
        });

        Ok(rescan)
    }

    /// Blocking legacy flip: submit a page flip and wait for the event
    /// of this CRTC. Events of other CRTCs received while waiting are
    /// dispatched normally.
    pub fn flip_and_wait(&self, crtc: CrtcId, fb: FramebufferId) -> Result<FlipEvent, Error> {
        let _guard = self.span.enter();
        self.control.page_flip(crtc, fb)?;
        loop {
            for event in self.control.receive_events()? {
                if event.crtc == crtc {
                    return Ok(event);
                }
                self.dispatch_event(event);
            }
        }
    }

    /// Resolve timings to the device's stable logical mode id
    pub fn intern_mode(&self, timings: crate::control::ModeTimings) -> mode::ModeId {
        self.modes.lock().unwrap().intern(timings)
    }
}

impl Drop for KmsDevice {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        self.engine.discard_inflight();
    }
}

/// Assign a primary and, when available, a cursor plane to every CRTC.
/// A plane belongs to at most one CRTC.
fn assign_planes(crtcs: &[Crtc], planes: &[Plane]) {
    let mut used: Vec<PlaneId> = Vec::new();
    for crtc in crtcs {
        let mut state = crtc.state_mut();
        let state = &mut *state;
        for (kind, slot) in [
            (PlaneKind::Primary, &mut state.primary_plane),
            (PlaneKind::Cursor, &mut state.cursor_plane),
        ] {
            let candidate = planes.iter().find(|plane| {
                plane.kind() == kind
                    && plane.supports_crtc_index(crtc.index())
                    && !used.contains(&plane.id())
            });
            match candidate {
                Some(plane) => {
                    used.push(plane.id());
                    *slot = Some(plane.id());
                }
                None if kind == PlaneKind::Primary => {
                    warn!(crtc = ?crtc.id(), "no primary plane available");
                }
                None => {}
            }
        }
    }
}

/// Connected connectors without modes (e.g. VGA without EDID) get the
/// built-in fallback timings.
fn add_fallback_modes(connector: &Connector, modes: &mut ModeCache) {
    let mut state = connector.state_mut();
    if !state.connected || !state.modes.is_empty() {
        return;
    }
    debug!(connector = ?connector.id(), "no modes reported, using fallback table");
    state.modes = FALLBACK_MODES
        .iter()
        .map(|(timings, name)| Mode {
            id: modes.intern(*timings),
            timings: *timings,
            name: (*name).to_owned(),
            preferred: false,
        })
        .collect();
}

/// Pick the GPU that should drive the compositor's primary rendering.
///
/// Priority: explicit configuration, integrated/platform devices with
/// working acceleration, the boot VGA device with working acceleration,
/// any accelerated device, and as a last resort the first device
/// (software rendering).
pub fn choose_primary_gpu(
    devices: &[Arc<KmsDevice>],
    accelerated: impl Fn(&KmsDevice) -> bool,
) -> Option<Arc<KmsDevice>> {
    if devices.is_empty() {
        return None;
    }

    let pick =
        |pred: &dyn Fn(&KmsDevice) -> bool| devices.iter().find(|dev| pred(&***dev)).cloned();

    pick(&|dev| dev.flags().contains(GpuFlags::PREFERRED_PRIMARY))
        .or_else(|| pick(&|dev| dev.flags().contains(GpuFlags::PLATFORM) && accelerated(dev)))
        .or_else(|| pick(&|dev| dev.flags().contains(GpuFlags::BOOT_VGA) && accelerated(dev)))
        .or_else(|| pick(&|dev| accelerated(dev)))
        .or_else(|| devices.first().cloned())
}
