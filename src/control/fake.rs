//! Scripted [`DeviceControl`] double for tests.
//!
//! Provides a synthetic topology, records every atomic commit, and can
//! be told to fail commits touching specific objects, which is how the
//! allow-fail and feature-downgrade paths are exercised.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drm_fourcc::DrmFourcc;

use super::{
    AtomicRequest, BlobId, ClockSource, CommitFlags, ConnectorId, ConnectorInfo, ConnectorMode,
    CrtcId, CrtcInfo, DeviceCaps, DeviceControl, DeviceError, DmabufHandle, DumbBufferId,
    DumbBufferInfo, FlipEvent, FramebufferId, LesseeId, ModeTimings, ObjectId, PlaneId, PlaneInfo,
    PlaneKind, PropInfo, PropertyId, ResourceTopology,
};
use crate::utils::Size;

/// One recorded atomic commit.
#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub flags: CommitFlags,
    pub props: Vec<(ObjectId, PropertyId, u64)>,
}

impl RecordedCommit {
    pub fn touches(&self, object: u32) -> bool {
        self.props.iter().any(|(obj, _, _)| obj.raw() == object)
    }
}

struct FakeDumb {
    info: DumbBufferInfo,
    data: Vec<u8>,
}

struct FakeInner {
    topology: ResourceTopology,
    commits: Vec<RecordedCommit>,
    fail_objects: HashSet<u32>,
    fail_all: bool,
    permission_denied: bool,
    dumb: Vec<FakeDumb>,
    lessees: Vec<LesseeId>,
    events: VecDeque<FlipEvent>,
}

/// Test double with a scripted topology.
pub struct FakeDevice {
    caps: DeviceCaps,
    inner: Mutex<FakeInner>,
    next_id: AtomicU32,
}

impl std::fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDevice").finish_non_exhaustive()
    }
}

fn prop(id: u32, name: &str, value: u64) -> PropInfo {
    PropInfo {
        id: PropertyId(id),
        name: name.to_owned(),
        value,
        enum_values: Vec::new(),
    }
}

fn enum_prop(id: u32, name: &str, value: u64, entries: &[(&str, u64)]) -> PropInfo {
    PropInfo {
        id: PropertyId(id),
        name: name.to_owned(),
        value,
        enum_values: entries
            .iter()
            .map(|(name, value)| ((*name).to_owned(), *value))
            .collect(),
    }
}

/// 1920x1080@60
pub fn test_mode() -> ModeTimings {
    ModeTimings {
        clock: 148500,
        hdisplay: 1920,
        hsync_start: 2008,
        hsync_end: 2052,
        htotal: 2200,
        vdisplay: 1080,
        vsync_start: 1084,
        vsync_end: 1089,
        vtotal: 1125,
        flags: 0,
    }
}

/// Builder for synthetic device topologies.
pub struct FakeTopology {
    topology: ResourceTopology,
    next_id: u32,
}

impl FakeTopology {
    pub fn new() -> Self {
        FakeTopology {
            topology: ResourceTopology::default(),
            next_id: 1,
        }
    }

    fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Add a CRTC with a primary plane, optionally a cursor plane, and
    /// one connected connector. Returns (crtc, primary, cursor,
    /// connector) ids.
    pub fn add_output(
        &mut self,
        with_cursor: bool,
    ) -> (CrtcId, PlaneId, Option<PlaneId>, ConnectorId) {
        let index = self.topology.crtcs.len();
        let crtc = CrtcId(self.id());
        let crtc_props = vec![
            prop(self.id(), "ACTIVE", 0),
            prop(self.id(), "MODE_ID", 0),
            prop(self.id(), "GAMMA_LUT", 0),
            prop(self.id(), "GAMMA_LUT_SIZE", 256),
            prop(self.id(), "VRR_ENABLED", 0),
        ];
        self.topology.crtcs.push(CrtcInfo {
            id: crtc,
            index,
            active: false,
            current_mode: None,
            props: crtc_props,
        });

        let primary = self.add_plane(index, PlaneKind::Primary);
        let cursor = with_cursor.then(|| self.add_plane(index, PlaneKind::Cursor));
        let connector = self.add_connector(index, false);

        (crtc, primary, cursor, connector)
    }

    pub fn add_plane(&mut self, crtc_index: usize, kind: PlaneKind) -> PlaneId {
        self.add_plane_with_mask(1 << crtc_index, kind)
    }

    pub fn add_plane_with_mask(&mut self, crtc_mask: u32, kind: PlaneKind) -> PlaneId {
        let plane = PlaneId(self.id());
        let type_value = match kind {
            PlaneKind::Overlay => 0,
            PlaneKind::Primary => 1,
            PlaneKind::Cursor => 2,
        };
        let mut props = vec![
            prop(self.id(), "type", type_value),
            prop(self.id(), "CRTC_ID", 0),
            prop(self.id(), "FB_ID", 0),
            prop(self.id(), "SRC_X", 0),
            prop(self.id(), "SRC_Y", 0),
            prop(self.id(), "SRC_W", 0),
            prop(self.id(), "SRC_H", 0),
            prop(self.id(), "CRTC_X", 0),
            prop(self.id(), "CRTC_Y", 0),
            prop(self.id(), "CRTC_W", 0),
            prop(self.id(), "CRTC_H", 0),
            prop(self.id(), "IN_FENCE_FD", 0),
            enum_prop(
                self.id(),
                "rotation",
                1,
                &[
                    ("rotate-0", 0),
                    ("rotate-90", 1),
                    ("rotate-180", 2),
                    ("rotate-270", 3),
                ],
            ),
        ];
        if kind == PlaneKind::Cursor {
            props.push(prop(self.id(), "HOTSPOT_X", 0));
            props.push(prop(self.id(), "HOTSPOT_Y", 0));
        }
        self.topology.planes.push(PlaneInfo {
            id: plane,
            kind,
            crtc_mask,
            formats: vec![DrmFourcc::Xrgb8888, DrmFourcc::Argb8888],
            modifiers: Vec::new(),
            props,
        });
        plane
    }

    pub fn add_connector(&mut self, crtc_index: usize, non_desktop: bool) -> ConnectorId {
        let connector = ConnectorId(self.id());
        let props = vec![
            prop(self.id(), "CRTC_ID", 0),
            prop(self.id(), "non-desktop", non_desktop as u64),
            enum_prop(self.id(), "underscan", 0, &[("off", 0), ("on", 1), ("auto", 2)]),
            prop(self.id(), "underscan hborder", 0),
            prop(self.id(), "underscan vborder", 0),
            enum_prop(
                self.id(),
                "privacy-screen sw-state",
                0,
                &[("Disabled", 0), ("Enabled", 1)],
            ),
            prop(self.id(), "max bpc", 10),
            enum_prop(
                self.id(),
                "Broadcast RGB",
                0,
                &[("Automatic", 0), ("Full", 1), ("Limited 16:235", 2)],
            ),
            enum_prop(
                self.id(),
                "Colorspace",
                0,
                &[("Default", 0), ("BT2020_RGB", 9)],
            ),
            prop(self.id(), "vrr_capable", 1),
        ];
        let n = self.topology.connectors.len();
        self.topology.connectors.push(ConnectorInfo {
            id: connector,
            interface: format!("DP-{}", n + 1),
            connected: true,
            crtc_mask: 1 << crtc_index,
            current_crtc: None,
            modes: vec![ConnectorMode {
                timings: test_mode(),
                name: "1920x1080".into(),
                preferred: true,
            }],
            props,
        });
        connector
    }

    pub fn build(self) -> Arc<FakeDevice> {
        FakeDevice::with_caps(
            self,
            DeviceCaps {
                atomic: true,
                universal_planes: true,
                clock: ClockSource::Monotonic,
                cursor_size: Size::new(64, 64),
                addfb2_modifiers: true,
                prime_import: false,
            },
        )
    }
}

impl FakeDevice {
    pub fn with_caps(topology: FakeTopology, caps: DeviceCaps) -> Arc<Self> {
        let next = topology.next_id + 1000;
        Arc::new(FakeDevice {
            caps,
            inner: Mutex::new(FakeInner {
                topology: topology.topology,
                commits: Vec::new(),
                fail_objects: HashSet::new(),
                fail_all: false,
                permission_denied: false,
                dumb: Vec::new(),
                lessees: Vec::new(),
                events: VecDeque::new(),
            }),
            next_id: AtomicU32::new(next),
        })
    }

    fn alloc_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Commits touching `object` fail until cleared
    pub fn fail_commits_touching(&self, object: u32) {
        self.inner.lock().unwrap().fail_objects.insert(object);
    }

    /// Every commit fails until cleared
    pub fn fail_all_commits(&self, fail: bool) {
        self.inner.lock().unwrap().fail_all = fail;
    }

    /// Commits fail with `EACCES`, simulating a lost DRM master
    pub fn set_permission_denied(&self, denied: bool) {
        self.inner.lock().unwrap().permission_denied = denied;
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_objects.clear();
        inner.fail_all = false;
        inner.permission_denied = false;
    }

    /// All commits recorded so far
    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.inner.lock().unwrap().commits.clone()
    }

    /// Queue a page flip event for [`DeviceControl::receive_events`]
    pub fn queue_flip(&self, crtc: CrtcId, sequence: u32) {
        self.inner.lock().unwrap().events.push_back(FlipEvent {
            crtc,
            sequence,
            time: Duration::from_millis(16 * sequence as u64),
        });
    }

    /// Drop a lessee from the live list, simulating a crashed client
    pub fn kill_lessee(&self, lessee: LesseeId) {
        self.inner.lock().unwrap().lessees.retain(|id| *id != lessee);
    }

    /// Remove a connector from future topology/connector reads
    pub fn unplug_connector(&self, connector: ConnectorId) -> ConnectorInfo {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .topology
            .connectors
            .iter()
            .position(|info| info.id == connector)
            .expect("connector exists");
        inner.topology.connectors.remove(pos)
    }

    /// Re-add a previously removed connector
    pub fn replug_connector(&self, info: ConnectorInfo) {
        self.inner.lock().unwrap().topology.connectors.push(info);
    }

    fn null_fd() -> OwnedFd {
        File::open("/dev/null").expect("open /dev/null").into()
    }
}

impl DeviceControl for FakeDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("/dev/dri/fake"))
    }

    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn topology(&self) -> Result<ResourceTopology, DeviceError> {
        Ok(self.inner.lock().unwrap().topology.clone())
    }

    fn connectors(&self) -> Result<Vec<ConnectorInfo>, DeviceError> {
        Ok(self.inner.lock().unwrap().topology.connectors.clone())
    }

    fn atomic_commit(&self, flags: CommitFlags, req: &AtomicRequest) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        let commit = RecordedCommit {
            flags,
            props: req.iter().cloned().collect(),
        };

        let failing = inner.permission_denied
            || inner.fail_all
            || commit
                .props
                .iter()
                .any(|(obj, _, _)| inner.fail_objects.contains(&obj.raw()));
        if !flags.contains(CommitFlags::TEST_ONLY) {
            inner.commits.push(commit);
        }
        if failing {
            let errno = if inner.permission_denied {
                libc::EACCES
            } else {
                libc::EINVAL
            };
            return Err(DeviceError::Access {
                errmsg: "fake commit failure",
                dev: self.dev_path(),
                source: std::io::Error::from_raw_os_error(errno),
            });
        }
        Ok(())
    }

    fn create_mode_blob(&self, _mode: &ModeTimings) -> Result<BlobId, DeviceError> {
        Ok(BlobId(self.alloc_id()))
    }

    fn create_blob(&self, _data: &[u8]) -> Result<BlobId, DeviceError> {
        Ok(BlobId(self.alloc_id()))
    }

    fn destroy_blob(&self, _blob: BlobId) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_crtc(
        &self,
        _crtc: CrtcId,
        _fb: Option<FramebufferId>,
        _connectors: &[ConnectorId],
        _mode: Option<&ModeTimings>,
    ) -> Result<(), DeviceError> {
        Ok(())
    }

    fn page_flip(&self, crtc: CrtcId, _fb: FramebufferId) -> Result<(), DeviceError> {
        self.queue_flip(crtc, 1);
        Ok(())
    }

    fn create_dumb_buffer(&self, size: Size<u32>, format: DrmFourcc) -> Result<DumbBufferInfo, DeviceError> {
        let pitch = size.w * 4;
        let info = DumbBufferInfo {
            id: DumbBufferId(self.alloc_id() as u64),
            fb: FramebufferId(self.alloc_id()),
            size,
            format,
            pitch,
        };
        self.inner.lock().unwrap().dumb.push(FakeDumb {
            info,
            data: vec![0; (pitch * size.h) as usize],
        });
        Ok(info)
    }

    fn write_dumb_buffer(
        &self,
        buffer: DumbBufferId,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .dumb
            .iter_mut()
            .find(|entry| entry.info.id == buffer)
            .ok_or(DeviceError::UnknownObject(buffer.0 as u32))?;
        f(&mut entry.data);
        Ok(())
    }

    fn destroy_dumb_buffer(&self, buffer: DumbBufferId) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.dumb.retain(|entry| entry.info.id != buffer);
        Ok(())
    }

    fn import_dmabuf(&self, _dmabuf: &DmabufHandle) -> Result<FramebufferId, DeviceError> {
        if !self.caps.prime_import {
            return Err(DeviceError::Unsupported("prime import disabled"));
        }
        Ok(FramebufferId(self.alloc_id()))
    }

    fn destroy_framebuffer(&self, _fb: FramebufferId) -> Result<(), DeviceError> {
        Ok(())
    }

    fn create_lease(&self, objects: &[u32], _flags: u32) -> Result<(LesseeId, OwnedFd), DeviceError> {
        assert!(!objects.is_empty());
        let lessee = LesseeId(self.alloc_id());
        self.inner.lock().unwrap().lessees.push(lessee);
        Ok((lessee, Self::null_fd()))
    }

    fn revoke_lease(&self, lessee: LesseeId) -> Result<(), DeviceError> {
        self.inner.lock().unwrap().lessees.retain(|id| *id != lessee);
        Ok(())
    }

    fn list_lessees(&self) -> Result<Vec<LesseeId>, DeviceError> {
        Ok(self.inner.lock().unwrap().lessees.clone())
    }

    fn receive_events(&self) -> Result<Vec<FlipEvent>, DeviceError> {
        Ok(self.inner.lock().unwrap().events.drain(..).collect())
    }
}
