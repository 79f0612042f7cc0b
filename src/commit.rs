//! Submission of update batches to the device.
//!
//! Each device has exactly one open update that components extend until
//! it is flushed; the engine turns a batch into property tuples, chooses
//! the commit flags, and routes completion back to the listeners the
//! batch carried. Commits for one CRTC complete in submission order and
//! at most one asynchronous commit is outstanding per CRTC.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::control::{
    AtomicRequest, BlobId, CommitFlags, CrtcId, DeviceControl, DeviceError, PlaneId,
};
use crate::device::crtc::Crtc;
use crate::device::KmsDevice;
use crate::error::Error;
use crate::update::{
    CommitFeedback, FlipTimestamp, PageFlipListener, PlaneOp, ResultListener, Update,
};
use crate::utils::to_fixed;

/// How a batch is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Block until the kernel acknowledged the commit
    Sync,
    /// Return immediately, completion arrives as a page flip event
    Async,
    /// Validate only, no hardware effect
    TestOnly,
}

struct Inflight {
    listeners: Vec<Arc<dyn PageFlipListener>>,
}

struct EngineInner {
    pending: Option<Update>,
    inflight: HashMap<CrtcId, Inflight>,
}

/// Per-device commit engine.
pub struct CommitEngine {
    control: Arc<dyn DeviceControl>,
    inner: Mutex<EngineInner>,
}

impl std::fmt::Debug for CommitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitEngine")
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl CommitEngine {
    pub(crate) fn new(control: Arc<dyn DeviceControl>) -> Self {
        CommitEngine {
            control,
            inner: Mutex::new(EngineInner {
                pending: None,
                inflight: HashMap::new(),
            }),
        }
    }

    /// Run `f` over the single open update of the device, creating it if
    /// absent. Writes from multiple CRTCs accumulate here until flushed.
    pub fn with_pending_update<R>(&self, device: &KmsDevice, f: impl FnOnce(&mut Update) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let update = inner.pending.get_or_insert_with(|| Update::new(device.id()));
        f(update)
    }

    /// Whether an update is currently open
    pub fn has_pending_update(&self) -> bool {
        self.inner.lock().unwrap().pending.is_some()
    }

    /// Whether an asynchronous commit is outstanding on `crtc`
    pub fn is_crtc_flushing(&self, crtc: CrtcId) -> bool {
        self.inner.lock().unwrap().inflight.contains_key(&crtc)
    }

    /// Flush the open update, if any
    #[profiling::function]
    pub fn post_pending_update(&self, device: &KmsDevice, mode: CommitMode) -> Result<(), Error> {
        let update = self.inner.lock().unwrap().pending.take();
        match update {
            Some(update) => self.post_update(device, update, mode),
            None => Ok(()),
        }
    }

    /// Submit a standalone update. If an unsent batch already exists and
    /// the new one touches any of the same CRTCs, the two are merged and
    /// flushed together to preserve per-CRTC ordering.
    #[profiling::function]
    pub fn post_update(&self, device: &KmsDevice, update: Update, mode: CommitMode) -> Result<(), Error> {
        let update = {
            let mut inner = self.inner.lock().unwrap();
            match inner.pending.take() {
                Some(mut pending) => {
                    let overlap = {
                        let touched = update.crtcs();
                        pending.crtcs().iter().any(|crtc| touched.contains(crtc))
                    };
                    if overlap {
                        pending.merge(update);
                        pending
                    } else {
                        inner.pending = Some(pending);
                        update
                    }
                }
                None => update,
            }
        };

        self.submit(device, update, mode)
    }

    /// Dry-run validation of a standalone update. Never merged with the
    /// pending batch since it has no hardware effect.
    pub fn test_update(&self, device: &KmsDevice, update: Update) -> Result<(), Error> {
        self.submit(device, update, CommitMode::TestOnly)
    }

    #[profiling::function]
    fn submit(&self, device: &KmsDevice, mut update: Update, mode: CommitMode) -> Result<(), Error> {
        if update.is_empty() {
            return Ok(());
        }

        if let Some(custom) = update.custom_page_flip.take() {
            let result = custom();
            let feedback = CommitFeedback {
                error: result.as_ref().err().map(clone_device_error),
                failed_planes: Vec::new(),
            };
            let result_listeners = std::mem::take(&mut update.result_listeners);
            let flip_listeners = std::mem::take(&mut update.flip_listeners);
            drop(update);
            for listener in result_listeners {
                listener(&feedback);
            }
            // no kernel event will arrive for a custom flip
            for (crtc, listener) in flip_listeners {
                match &feedback.error {
                    None => listener.ready(crtc),
                    Some(err) => listener.discarded(crtc, Some(err)),
                }
            }
            return result.map_err(Error::Device);
        }

        if !device.caps().atomic {
            return self.submit_legacy(device, update);
        }

        let needs_modeset = update.needs_modeset();
        let mut blobs = Vec::new();
        let request = match self.build_request(device, &update, false, &mut blobs) {
            Ok(request) => request,
            Err(err) => {
                self.destroy_blobs(&blobs);
                self.dispatch_failure_with(
                    update,
                    DeviceError::Unsupported("request could not be built"),
                );
                return Err(err);
            }
        };

        let flags = match mode {
            CommitMode::TestOnly if needs_modeset => CommitFlags::TEST_ONLY | CommitFlags::ALLOW_MODESET,
            CommitMode::TestOnly => CommitFlags::TEST_ONLY,
            CommitMode::Sync if needs_modeset => CommitFlags::ALLOW_MODESET,
            CommitMode::Sync => CommitFlags::empty(),
            // modesets are committed blocking: some drivers misbehave when
            // NONBLOCK is combined with a full mode set
            CommitMode::Async if needs_modeset => {
                CommitFlags::PAGE_FLIP_EVENT | CommitFlags::ALLOW_MODESET
            }
            CommitMode::Async => CommitFlags::PAGE_FLIP_EVENT | CommitFlags::NONBLOCK,
        };

        trace!(?flags, props = request.len(), "submitting atomic commit");
        let mut failed_planes = Vec::new();
        let mut result = self.control.atomic_commit(flags, &request);

        if result.is_err() && mode != CommitMode::TestOnly {
            // drop allow-fail planes and retry once; if that commit goes
            // through, only those planes failed
            let allow_fail: Vec<PlaneId> = allow_fail_planes(&update);
            if !allow_fail.is_empty() {
                let mut retry_blobs = Vec::new();
                match self.build_request(device, &update, true, &mut retry_blobs) {
                    Ok(retry) => {
                        let retry_result = self.control.atomic_commit(flags, &retry);
                        if retry_result.is_ok() {
                            debug!(
                                planes = ?allow_fail,
                                "commit succeeded without allow-fail planes"
                            );
                            failed_planes = allow_fail;
                        }
                        result = retry_result;
                    }
                    Err(_) => {}
                }
                self.destroy_blobs(&retry_blobs);
            }
        }

        self.destroy_blobs(&blobs);

        match result {
            Ok(()) => {
                let feedback = CommitFeedback {
                    error: None,
                    failed_planes,
                };
                self.dispatch_result(update, &feedback, mode);
                Ok(())
            }
            Err(err) => {
                if err.is_permission_denied() {
                    // expected while we are not DRM master (VT switch)
                    debug!("commit rejected without DRM master");
                } else if mode != CommitMode::TestOnly {
                    warn!(?err, "atomic commit failed");
                }
                let feedback_err = clone_device_error(&err);
                self.dispatch_failure_with(update, feedback_err);
                Err(Error::Device(err))
            }
        }
    }

    fn submit_legacy(&self, _device: &KmsDevice, mut update: Update) -> Result<(), Error> {
        // the legacy path only understands primary plane flips and
        // blocking mode sets; everything else in the batch is dropped
        let mut result = Ok(());
        let mut mode_set_crtcs = Vec::new();
        let mut flipped_crtcs = Vec::new();

        for mode_set in std::mem::take(&mut update.mode_sets) {
            let fb = update.plane_ops.iter().find_map(|op| match op {
                PlaneOp::Assign(assignment) if assignment.crtc == mode_set.crtc => Some(assignment.fb),
                _ => None,
            });
            let timings = mode_set.mode.as_ref().map(|m| m.timings);
            result = self
                .control
                .set_crtc(mode_set.crtc, fb, &mode_set.connectors, timings.as_ref())
                .map_err(Error::Device);
            if result.is_err() {
                break;
            }
            mode_set_crtcs.push(mode_set.crtc);
        }

        if result.is_ok() {
            for op in &update.plane_ops {
                if let PlaneOp::Assign(assignment) = op {
                    if mode_set_crtcs.contains(&assignment.crtc) {
                        continue;
                    }
                    result = self
                        .control
                        .page_flip(assignment.crtc, assignment.fb)
                        .map_err(Error::Device);
                    if result.is_err() {
                        break;
                    }
                    flipped_crtcs.push(assignment.crtc);
                }
            }
        }

        let feedback = CommitFeedback {
            error: match &result {
                Ok(()) => None,
                Err(Error::Device(err)) => Some(clone_device_error(err)),
                Err(_) => None,
            },
            failed_planes: Vec::new(),
        };

        let result_listeners = std::mem::take(&mut update.result_listeners);
        let flip_listeners = std::mem::take(&mut update.flip_listeners);
        drop(update);

        for listener in result_listeners {
            listener(&feedback);
        }
        for (crtc, listener) in flip_listeners {
            if feedback.error.is_some() {
                listener.discarded(crtc, feedback.error.as_ref());
            } else if mode_set_crtcs.contains(&crtc) {
                listener.mode_set_fallback(crtc);
            } else if flipped_crtcs.contains(&crtc) {
                self.track_inflight(crtc, listener);
            } else {
                listener.ready(crtc);
            }
        }

        result
    }

    fn track_inflight(&self, crtc: CrtcId, listener: Arc<dyn PageFlipListener>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .inflight
            .entry(crtc)
            .or_insert_with(|| Inflight {
                listeners: Vec::new(),
            })
            .listeners
            .push(listener);
    }

    /// Deliver commit feedback and either arm the page flip bookkeeping
    /// (async) or complete the flip listeners right away.
    fn dispatch_result(&self, mut update: Update, feedback: &CommitFeedback, mode: CommitMode) {
        let result_listeners = std::mem::take(&mut update.result_listeners);
        let flip_listeners = std::mem::take(&mut update.flip_listeners);
        drop(update);

        for listener in result_listeners {
            listener(feedback);
        }

        if mode == CommitMode::TestOnly {
            return;
        }

        for (crtc, listener) in flip_listeners {
            match mode {
                CommitMode::Async => self.track_inflight(crtc, listener),
                // a blocking commit is acknowledged without a flip event
                CommitMode::Sync => listener.ready(crtc),
                CommitMode::TestOnly => unreachable!(),
            }
        }
    }

    fn dispatch_failure_with(&self, update: Update, error: DeviceError) {
        let feedback = CommitFeedback {
            error: Some(error),
            failed_planes: Vec::new(),
        };
        self.complete_discarded(update, feedback);
    }

    /// Symbolic completion: the frame clock must keep ticking even when
    /// no pixels reached the display.
    fn complete_discarded(&self, mut update: Update, feedback: CommitFeedback) {
        let result_listeners = std::mem::take(&mut update.result_listeners);
        let flip_listeners = std::mem::take(&mut update.flip_listeners);
        drop(update);

        for listener in result_listeners {
            listener(&feedback);
        }
        for (crtc, listener) in flip_listeners {
            listener.discarded(crtc, feedback.error.as_ref());
        }
    }

    /// Route a page flip event to the listeners of the commit that
    /// caused it.
    pub fn dispatch_flip_event(&self, crtc: CrtcId, sequence: u32, time: FlipTimestamp) {
        let inflight = self.inner.lock().unwrap().inflight.remove(&crtc);
        if let Some(inflight) = inflight {
            for listener in inflight.listeners {
                listener.flipped(crtc, sequence, time);
            }
        } else {
            trace!(?crtc, "page flip event without inflight commit");
        }
    }

    /// Discard all inflight bookkeeping, delivering symbolic completions.
    /// Used on shutdown and when DRM master is lost.
    pub fn discard_inflight(&self) {
        let inflight = std::mem::take(&mut self.inner.lock().unwrap().inflight);
        for (crtc, entry) in inflight {
            for listener in entry.listeners {
                listener.discarded(crtc, None);
            }
        }
    }

    fn destroy_blobs(&self, blobs: &[BlobId]) {
        for blob in blobs {
            if let Err(err) = self.control.destroy_blob(*blob) {
                debug!(?blob, ?err, "failed to destroy property blob");
            }
        }
    }

    /// Translate an update into raw property tuples.
    ///
    /// Blobs created along the way are appended to `blobs`; the kernel
    /// keeps the contents alive once committed, so they are destroyed
    /// again right after the ioctl.
    fn build_request(
        &self,
        device: &KmsDevice,
        update: &Update,
        drop_allow_fail: bool,
        blobs: &mut Vec<BlobId>,
    ) -> Result<AtomicRequest, Error> {
        let mut req = AtomicRequest::new();

        for mode_set in &update.mode_sets {
            let crtc = device.crtc(mode_set.crtc).ok_or(Error::UnknownCrtc(mode_set.crtc))?;
            match &mode_set.mode {
                Some(mode) => {
                    let blob = self.control.create_mode_blob(&mode.timings)?;
                    blobs.push(blob);
                    for conn in &mode_set.connectors {
                        let connector = device
                            .connector(*conn)
                            .ok_or(Error::UnknownConnector(*conn))?;
                        let prop = connector
                            .prop("CRTC_ID")
                            .ok_or(Error::MissingProperty {
                                object: conn.0,
                                name: "CRTC_ID",
                            })?;
                        req.add_property(*conn, prop, mode_set.crtc.0 as u64);
                    }
                    req.add_property(mode_set.crtc, crtc.require_prop("MODE_ID")?, blob.0 as u64);
                    req.add_property(mode_set.crtc, crtc.require_prop("ACTIVE")?, 1);
                }
                None => {
                    for conn in &mode_set.connectors {
                        let connector = device
                            .connector(*conn)
                            .ok_or(Error::UnknownConnector(*conn))?;
                        let prop = connector
                            .prop("CRTC_ID")
                            .ok_or(Error::MissingProperty {
                                object: conn.0,
                                name: "CRTC_ID",
                            })?;
                        req.add_property(*conn, prop, 0);
                    }
                    req.add_property(mode_set.crtc, crtc.require_prop("ACTIVE")?, 0);
                    req.add_property(mode_set.crtc, crtc.require_prop("MODE_ID")?, 0);
                }
            }
        }

        for op in &update.plane_ops {
            match op {
                PlaneOp::Assign(assignment) => {
                    if drop_allow_fail && assignment.flags.contains(crate::update::AssignPlaneFlags::ALLOW_FAIL) {
                        continue;
                    }
                    let plane = device
                        .plane(assignment.plane)
                        .ok_or(Error::UnknownPlane(assignment.plane))?;
                    let id = assignment.plane;

                    req.add_property(id, plane.require_prop("CRTC_ID")?, assignment.crtc.0 as u64);
                    req.add_property(id, plane.require_prop("FB_ID")?, assignment.fb.0 as u64);
                    // src rects are 16.16 fixed point
                    req.add_property(id, plane.require_prop("SRC_X")?, to_fixed(assignment.src.loc.x) as u64);
                    req.add_property(id, plane.require_prop("SRC_Y")?, to_fixed(assignment.src.loc.y) as u64);
                    req.add_property(id, plane.require_prop("SRC_W")?, to_fixed(assignment.src.size.w) as u64);
                    req.add_property(id, plane.require_prop("SRC_H")?, to_fixed(assignment.src.size.h) as u64);
                    req.add_property(id, plane.require_prop("CRTC_X")?, assignment.dst.loc.x as i64 as u64);
                    req.add_property(id, plane.require_prop("CRTC_Y")?, assignment.dst.loc.y as i64 as u64);
                    req.add_property(id, plane.require_prop("CRTC_W")?, assignment.dst.size.w as u64);
                    req.add_property(id, plane.require_prop("CRTC_H")?, assignment.dst.size.h as u64);

                    if let Some(rotation) = assignment.rotation {
                        if let Some(prop) = plane.prop("rotation") {
                            req.add_property(id, prop, rotation);
                        }
                    }
                    if let Some(prop) = plane.prop("IN_FENCE_FD") {
                        let value = assignment
                            .fence
                            .as_ref()
                            .map(|fence| fence.as_raw_fd() as i64)
                            .unwrap_or(-1);
                        req.add_property(id, prop, value as u64);
                    } else if assignment.fence.is_some() {
                        return Err(Error::MissingProperty {
                            object: id.0,
                            name: "IN_FENCE_FD",
                        });
                    }
                    if let Some(hotspot) = assignment.hotspot {
                        if let (Some(x), Some(y)) = (plane.prop("HOTSPOT_X"), plane.prop("HOTSPOT_Y")) {
                            req.add_property(id, x, hotspot.x as i64 as u64);
                            req.add_property(id, y, hotspot.y as i64 as u64);
                        }
                    }
                }
                PlaneOp::Unassign { plane } => {
                    let model = device.plane(*plane).ok_or(Error::UnknownPlane(*plane))?;
                    append_reset_plane(&mut req, model)?;
                }
            }
        }

        for prop in &update.connector_props {
            req.add_property(prop.connector, prop.prop, prop.value);
        }
        for prop in &update.crtc_props {
            req.add_property(prop.crtc, prop.prop, prop.value);
        }
        for prop in &update.plane_props {
            req.add_property(prop.plane, prop.prop, prop.value);
        }

        for gamma in &update.gamma_ops {
            let crtc = device.crtc(gamma.crtc).ok_or(Error::UnknownCrtc(gamma.crtc))?;
            let Some(prop) = crtc.prop("GAMMA_LUT") else {
                debug!(crtc = ?gamma.crtc, "no gamma support, dropping LUT write");
                continue;
            };
            match &gamma.lut {
                Some(lut) => {
                    let data = Crtc::serialize_gamma(lut);
                    let blob = self.control.create_blob(&data)?;
                    blobs.push(blob);
                    req.add_property(gamma.crtc, prop, blob.0 as u64);
                }
                None => req.add_property(gamma.crtc, prop, 0),
            }
        }

        Ok(req)
    }
}

fn allow_fail_planes(update: &Update) -> Vec<PlaneId> {
    update
        .plane_ops
        .iter()
        .filter_map(|op| match op {
            PlaneOp::Assign(assignment)
                if assignment
                    .flags
                    .contains(crate::update::AssignPlaneFlags::ALLOW_FAIL) =>
            {
                Some(assignment.plane)
            }
            _ => None,
        })
        .collect()
}

fn append_reset_plane(req: &mut AtomicRequest, plane: &crate::device::plane::Plane) -> Result<(), Error> {
    let id = plane.id();
    req.add_property(id, plane.require_prop("CRTC_ID")?, 0);
    req.add_property(id, plane.require_prop("FB_ID")?, 0);
    req.add_property(id, plane.require_prop("SRC_X")?, 0);
    req.add_property(id, plane.require_prop("SRC_Y")?, 0);
    req.add_property(id, plane.require_prop("SRC_W")?, 0);
    req.add_property(id, plane.require_prop("SRC_H")?, 0);
    req.add_property(id, plane.require_prop("CRTC_X")?, 0);
    req.add_property(id, plane.require_prop("CRTC_Y")?, 0);
    req.add_property(id, plane.require_prop("CRTC_W")?, 0);
    req.add_property(id, plane.require_prop("CRTC_H")?, 0);
    Ok(())
}

/// Device errors are not `Clone`; feedback needs its own instance while
/// the original propagates to the caller.
fn clone_device_error(err: &DeviceError) -> DeviceError {
    match err {
        DeviceError::Access { errmsg, dev, source } => DeviceError::Access {
            errmsg,
            dev: dev.clone(),
            source: source
                .raw_os_error()
                .map(std::io::Error::from_raw_os_error)
                .unwrap_or_else(|| std::io::Error::new(source.kind(), source.to_string())),
        },
        DeviceError::UnknownObject(id) => DeviceError::UnknownObject(*id),
        DeviceError::Unsupported(what) => DeviceError::Unsupported(what),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::control::fake::{FakeDevice, FakeTopology};
    use crate::control::{ConnectorId, DeviceControl, GpuId};
    use crate::device::{GpuFlags, KmsDevice};
    use crate::update::AssignPlaneFlags;
    use crate::utils::{Point, Rectangle, Size};

    struct RecordingListener {
        flipped: AtomicUsize,
        ready: AtomicUsize,
        discarded: AtomicUsize,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(RecordingListener {
                flipped: AtomicUsize::new(0),
                ready: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
            })
        }
    }

    impl PageFlipListener for RecordingListener {
        fn flipped(&self, _crtc: CrtcId, _sequence: u32, _time: FlipTimestamp) {
            self.flipped.fetch_add(1, Ordering::SeqCst);
        }
        fn ready(&self, _crtc: CrtcId) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }
        fn mode_set_fallback(&self, _crtc: CrtcId) {}
        fn discarded(&self, _crtc: CrtcId, _error: Option<&DeviceError>) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rect_f64() -> Rectangle<f64> {
        Rectangle {
            loc: Point::new(0.0, 0.0),
            size: Size::new(64.0, 64.0),
        }
    }

    fn setup() -> (Arc<FakeDevice>, Arc<KmsDevice>, CrtcId, PlaneId, PlaneId, ConnectorId) {
        let mut topo = FakeTopology::new();
        let (crtc, primary, cursor, connector) = topo.add_output(true);
        let fake = topo.build();
        let device = KmsDevice::new(
            GpuId(1),
            GpuFlags::empty(),
            fake.clone() as Arc<dyn DeviceControl>,
        )
        .unwrap();
        (fake, device, crtc, primary, cursor.unwrap(), connector)
    }

    #[test]
    fn pending_update_accumulates_until_flush() {
        let (fake, device, crtc, primary, cursor, _) = setup();

        device.with_pending_update(|update| {
            update.assign_plane(
                crtc,
                primary,
                crate::control::FramebufferId(500),
                rect_f64(),
                Rectangle::new((0, 0), (64, 64)),
                AssignPlaneFlags::empty(),
            );
        });
        device.with_pending_update(|update| {
            update.assign_plane(
                crtc,
                cursor,
                crate::control::FramebufferId(501),
                rect_f64(),
                Rectangle::new((0, 0), (64, 64)),
                AssignPlaneFlags::empty(),
            );
        });
        assert!(device.has_pending_update());
        assert!(fake.commits().is_empty());

        device.post_pending_update(CommitMode::Sync).unwrap();
        assert!(!device.has_pending_update());

        let commits = fake.commits();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].touches(primary.0));
        assert!(commits[0].touches(cursor.0));
    }

    #[test]
    fn allow_fail_plane_is_dropped_and_reported() {
        let (fake, device, crtc, primary, cursor, _) = setup();
        fake.fail_commits_touching(cursor.0);

        let feedback = Arc::new(Mutex::new(None));
        let feedback_clone = feedback.clone();

        device.with_pending_update(|update| {
            update.assign_plane(
                crtc,
                primary,
                crate::control::FramebufferId(500),
                rect_f64(),
                Rectangle::new((0, 0), (64, 64)),
                AssignPlaneFlags::empty(),
            );
            update.assign_plane(
                crtc,
                cursor,
                crate::control::FramebufferId(501),
                rect_f64(),
                Rectangle::new((0, 0), (64, 64)),
                AssignPlaneFlags::ALLOW_FAIL,
            );
            update.add_result_listener(Box::new(move |result| {
                *feedback_clone.lock().unwrap() = Some(result.failed_planes.clone());
            }));
        });
        device.post_pending_update(CommitMode::Async).unwrap();

        // first commit failed, the retry without the cursor went through
        let commits = fake.commits();
        assert_eq!(commits.len(), 2);
        assert!(commits[0].touches(cursor.0));
        assert!(!commits[1].touches(cursor.0));
        assert_eq!(feedback.lock().unwrap().clone(), Some(vec![cursor]));
    }

    #[test]
    fn failed_commit_completes_symbolically() {
        let (fake, device, crtc, primary, _, _) = setup();
        fake.fail_all_commits(true);

        let listener = RecordingListener::new();
        device.with_pending_update(|update| {
            update.assign_plane(
                crtc,
                primary,
                crate::control::FramebufferId(500),
                rect_f64(),
                Rectangle::new((0, 0), (64, 64)),
                AssignPlaneFlags::empty(),
            );
            update.add_page_flip_listener(crtc, listener.clone());
        });
        assert!(device.post_pending_update(CommitMode::Async).is_err());
        assert_eq!(listener.discarded.load(Ordering::SeqCst), 1);
        assert_eq!(listener.flipped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn async_completion_arrives_with_the_flip_event() {
        let (fake, device, crtc, primary, _, _) = setup();

        let listener = RecordingListener::new();
        device.with_pending_update(|update| {
            update.assign_plane(
                crtc,
                primary,
                crate::control::FramebufferId(500),
                rect_f64(),
                Rectangle::new((0, 0), (64, 64)),
                AssignPlaneFlags::empty(),
            );
            update.add_page_flip_listener(crtc, listener.clone());
        });
        device.post_pending_update(CommitMode::Async).unwrap();
        assert_eq!(listener.flipped.load(Ordering::SeqCst), 0);
        assert!(device.is_crtc_flushing(crtc));

        fake.queue_flip(crtc, 7);
        device.process_events().unwrap();
        assert_eq!(listener.flipped.load(Ordering::SeqCst), 1);
        assert!(!device.is_crtc_flushing(crtc));
    }

    #[test]
    fn sync_commit_reports_ready() {
        let (_fake, device, crtc, primary, _, _) = setup();

        let listener = RecordingListener::new();
        device.with_pending_update(|update| {
            update.assign_plane(
                crtc,
                primary,
                crate::control::FramebufferId(500),
                rect_f64(),
                Rectangle::new((0, 0), (64, 64)),
                AssignPlaneFlags::empty(),
            );
            update.add_page_flip_listener(crtc, listener.clone());
        });
        device.post_pending_update(CommitMode::Sync).unwrap();
        assert_eq!(listener.ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_only_commits_leave_no_trace() {
        let (fake, device, crtc, primary, _, _) = setup();

        let mut update = Update::new(device.id());
        update.assign_plane(
            crtc,
            primary,
            crate::control::FramebufferId(500),
            rect_f64(),
            Rectangle::new((0, 0), (64, 64)),
            AssignPlaneFlags::empty(),
        );
        device.test_update(update).unwrap();
        assert!(fake.commits().is_empty());
    }
}
