//! [`DeviceControl`] over an open DRM node.
//!
//! The only module that marshals ioctls, built on the `drm`/`drm-ffi`
//! crates. Typed kernel handles never leave this file; discovery caches
//! the raw-id to handle mappings all later calls resolve through.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::num::NonZeroU32;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use drm::control::{
    atomic::AtomicModeReq, connector, crtc, dumbbuffer::DumbBuffer as DrmDumbBuffer, framebuffer,
    property, AtomicCommitFlags, Device as ControlDevice, Event, Mode, ModeTypeFlags,
    PageFlipFlags, ResourceHandle,
};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info, trace, warn};

use super::{
    AtomicRequest, BlobId, ClockSource, CommitFlags, ConnectorId, ConnectorInfo, ConnectorMode,
    CrtcId, CrtcInfo, DeviceCaps, DeviceControl, DeviceError, DmabufHandle, DumbBufferId,
    DumbBufferInfo, FlipEvent, FramebufferId, GpuId, LesseeId, ModeTimings, PlaneId, PlaneInfo,
    PlaneKind, PropInfo, ResourceTopology,
};
use crate::format::{get_bpp, get_depth};
use crate::utils::Size;

/// Bit positions of the kernel's rotation bitmask property. These are
/// stable kernel ABI; the property only reports them as enum entries,
/// which the `drm` crate does not expose for bitmask properties.
const ROTATION_BITS: &[(&str, u64)] = &[
    ("rotate-0", 0),
    ("rotate-90", 1),
    ("rotate-180", 2),
    ("rotate-270", 3),
    ("reflect-x", 4),
    ("reflect-y", 5),
];

struct Inner {
    fd: OwnedFd,
    privileged: bool,
}

impl AsFd for Inner {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for Inner {}
impl ControlDevice for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                warn!(?err, "failed to drop DRM master");
            }
        }
    }
}

struct DumbEntry {
    db: DrmDumbBuffer,
    fb: framebuffer::Handle,
}

#[derive(Default)]
struct HandleCache {
    props: HashMap<u32, property::Handle>,
    crtcs: HashMap<u32, crtc::Handle>,
    connectors: HashMap<u32, connector::Handle>,
    framebuffers: HashMap<u32, framebuffer::Handle>,
}

struct FdState {
    handles: HandleCache,
    dumb: HashMap<u64, DumbEntry>,
    next_dumb: u64,
}

struct FdInner {
    dev: Inner,
    caps: DeviceCaps,
    path: Option<PathBuf>,
    state: Mutex<FdState>,
    #[cfg(feature = "backend_gbm")]
    gbm: Option<gbm::Device<OwnedFd>>,
}

/// Shared handle to an open DRM device node.
#[derive(Clone)]
pub struct DrmDeviceFd(Arc<FdInner>);

impl fmt::Debug for DrmDeviceFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmDeviceFd")
            .field("path", &self.0.path)
            .field("caps", &self.0.caps)
            .finish()
    }
}

impl DrmDeviceFd {
    /// Wrap an open DRM node.
    ///
    /// Tries to become DRM master (only needed on older kernels, newer
    /// ones grant implicitly when nobody else is master) and probes the
    /// device capabilities.
    pub fn new(fd: OwnedFd) -> Result<Self, DeviceError> {
        let path = fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).ok();
        let mut dev = Inner {
            fd,
            privileged: false,
        };
        if dev.acquire_master_lock().is_err() {
            warn!("unable to become DRM master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        let atomic = dev.set_client_capability(ClientCapability::Atomic, true).is_ok();
        let universal_planes = dev
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_ok();
        let monotonic = dev
            .get_driver_capability(DriverCapability::MonotonicTimestamp)
            .unwrap_or(0)
            == 1;
        let cursor_width = dev
            .get_driver_capability(DriverCapability::CursorWidth)
            .unwrap_or(64) as u32;
        let cursor_height = dev
            .get_driver_capability(DriverCapability::CursorHeight)
            .unwrap_or(64) as u32;
        let addfb2_modifiers = dev
            .get_driver_capability(DriverCapability::AddFB2Modifiers)
            .unwrap_or(0)
            == 1;
        let prime_import = dev
            .get_driver_capability(DriverCapability::Prime)
            .map(|caps| caps & 0x1 != 0)
            .unwrap_or(false);

        let caps = DeviceCaps {
            atomic,
            universal_planes,
            clock: if monotonic {
                ClockSource::Monotonic
            } else {
                ClockSource::Realtime
            },
            cursor_size: Size::new(cursor_width, cursor_height),
            addfb2_modifiers,
            prime_import,
        };
        info!(?path, ?caps, "opened DRM device");

        #[cfg(feature = "backend_gbm")]
        let gbm_device = match dev.fd.try_clone() {
            Ok(dup) => match gbm::Device::new(dup) {
                Ok(gbm) => Some(gbm),
                Err(err) => {
                    debug!(?err, "no gbm device, dmabuf import disabled");
                    None
                }
            },
            Err(err) => {
                debug!(?err, "could not duplicate device fd for gbm");
                None
            }
        };

        Ok(DrmDeviceFd(Arc::new(FdInner {
            dev,
            caps,
            path,
            state: Mutex::new(FdState {
                handles: HandleCache::default(),
                dumb: HashMap::new(),
                next_dumb: 1,
            }),
            #[cfg(feature = "backend_gbm")]
            gbm: gbm_device,
        })))
    }

    /// Identity of the device derived from its `dev_t`
    pub fn gpu_id(&self) -> Result<GpuId, DeviceError> {
        let stat = rustix::fs::fstat(&self.0.dev).map_err(|errno| self.access_err(
            "Failed to stat device",
            io::Error::from_raw_os_error(errno.raw_os_error()),
        ))?;
        Ok(GpuId(stat.st_rdev as u64))
    }

    fn access_err(&self, errmsg: &'static str, source: io::Error) -> DeviceError {
        DeviceError::Access {
            errmsg,
            dev: self.0.path.clone(),
            source,
        }
    }

    /// Attach a framebuffer to a locally allocated gbm buffer object.
    #[cfg(feature = "backend_gbm")]
    pub(crate) fn register_bo_framebuffer(
        &self,
        bo: &gbm::BufferObject<()>,
    ) -> Result<FramebufferId, DeviceError> {
        use drm::buffer::PlanarBuffer;

        struct BoWrapper<'a>(&'a gbm::BufferObject<()>);
        impl PlanarBuffer for BoWrapper<'_> {
            fn size(&self) -> (u32, u32) {
                PlanarBuffer::size(self.0)
            }
            fn format(&self) -> DrmFourcc {
                PlanarBuffer::format(self.0)
            }
            fn modifier(&self) -> Option<DrmModifier> {
                match self.0.modifier().unwrap_or(DrmModifier::Invalid) {
                    DrmModifier::Invalid => None,
                    modifier => Some(modifier),
                }
            }
            fn pitches(&self) -> [u32; 4] {
                PlanarBuffer::pitches(self.0)
            }
            fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
                PlanarBuffer::handles(self.0)
            }
            fn offsets(&self) -> [u32; 4] {
                PlanarBuffer::offsets(self.0)
            }
        }

        let wrapper = BoWrapper(bo);
        let flags = if wrapper.modifier().is_some() {
            drm::control::FbCmd2Flags::MODIFIERS
        } else {
            drm::control::FbCmd2Flags::empty()
        };
        let fb = self
            .0
            .dev
            .add_planar_framebuffer(&wrapper, flags)
            .map_err(|source| self.access_err("Failed to add framebuffer for bo", source))?;

        let mut state = self.0.state.lock().unwrap();
        state.handles.framebuffers.insert(fb.into(), fb);
        Ok(FramebufferId(fb.into()))
    }

    /// The gbm device of this node, when one could be created.
    #[cfg(feature = "backend_gbm")]
    pub(crate) fn gbm(&self) -> Option<&gbm::Device<OwnedFd>> {
        self.0.gbm.as_ref()
    }

    fn read_props<T>(&self, handle: T, cache: &mut HandleCache) -> Result<Vec<PropInfo>, DeviceError>
    where
        T: ResourceHandle,
    {
        let set = self
            .0
            .dev
            .get_properties(handle)
            .map_err(|source| self.access_err("Error reading properties", source))?;
        let (prop_handles, values) = set.as_props_and_values();

        let mut props = Vec::with_capacity(prop_handles.len());
        for (prop, value) in prop_handles.iter().zip(values.iter()) {
            let Ok(prop_info) = self.0.dev.get_property(*prop) else {
                continue;
            };
            let name = prop_info.name().to_string_lossy().into_owned();
            cache.props.insert((*prop).into(), *prop);

            let enum_values = match prop_info.value_type() {
                property::ValueType::Enum(values) => {
                    let (_, enums) = values.values();
                    enums
                        .iter()
                        .map(|entry| (entry.name().to_string_lossy().into_owned(), entry.value()))
                        .collect()
                }
                property::ValueType::Bitmask if name == "rotation" => ROTATION_BITS
                    .iter()
                    .map(|(name, bit)| ((*name).to_owned(), *bit))
                    .collect(),
                _ => Vec::new(),
            };

            props.push(PropInfo {
                id: super::PropertyId((*prop).into()),
                name,
                value: *value,
                enum_values,
            });
        }
        Ok(props)
    }

    fn connector_infos(&self, cache: &mut HandleCache) -> Result<Vec<ConnectorInfo>, DeviceError> {
        let res = self
            .0
            .dev
            .resource_handles()
            .map_err(|source| self.access_err("Error loading resource handles", source))?;

        let mut infos = Vec::new();
        for handle in res.connectors() {
            let info = self
                .0
                .dev
                .get_connector(*handle, false)
                .map_err(|source| self.access_err("Error loading connector info", source))?;
            cache.connectors.insert((*handle).into(), *handle);

            let mut crtc_mask = 0u32;
            let mut current_crtc = None;
            for encoder in info.encoders() {
                if let Ok(enc_info) = self.0.dev.get_encoder(*encoder) {
                    let compatible = res.filter_crtcs(enc_info.possible_crtcs());
                    for (index, crtc) in res.crtcs().iter().enumerate() {
                        if compatible.contains(crtc) {
                            crtc_mask |= 1 << index;
                        }
                    }
                }
            }
            if let Some(encoder) = info.current_encoder() {
                if let Ok(enc_info) = self.0.dev.get_encoder(encoder) {
                    current_crtc = enc_info.crtc().map(|crtc| CrtcId(crtc.into()));
                }
            }

            let modes = info
                .modes()
                .iter()
                .map(|mode| ConnectorMode {
                    timings: mode_to_timings(mode),
                    name: mode.name().to_string_lossy().into_owned(),
                    preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
                })
                .collect();

            let props = self.read_props(*handle, cache)?;
            infos.push(ConnectorInfo {
                id: ConnectorId((*handle).into()),
                interface: format!("{:?}-{}", info.interface(), info.interface_id()),
                connected: info.state() == connector::State::Connected,
                crtc_mask,
                current_crtc,
                modes,
                props,
            });
        }
        Ok(infos)
    }

    fn plane_modifiers(
        &self,
        props: &[PropInfo],
        formats: &[DrmFourcc],
    ) -> Vec<(DrmFourcc, Vec<DrmModifier>)> {
        let Some(blob_id) = props
            .iter()
            .find(|prop| prop.name == "IN_FORMATS")
            .map(|prop| prop.value)
        else {
            return Vec::new();
        };
        if blob_id == 0 {
            return Vec::new();
        }

        let mut data = Vec::new();
        if drm_ffi::mode::get_property_blob(self.0.dev.as_fd(), blob_id as u32, Some(&mut data))
            .is_err()
        {
            return Vec::new();
        }
        parse_in_formats(&data, formats)
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8).map(|b| {
        u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

/// Parse a `drm_format_modifier_blob` into per-format modifier lists.
fn parse_in_formats(data: &[u8], known: &[DrmFourcc]) -> Vec<(DrmFourcc, Vec<DrmModifier>)> {
    let Some(count_formats) = read_u32(data, 8) else {
        return Vec::new();
    };
    let Some(formats_offset) = read_u32(data, 12) else {
        return Vec::new();
    };
    let Some(count_modifiers) = read_u32(data, 16) else {
        return Vec::new();
    };
    let Some(modifiers_offset) = read_u32(data, 20) else {
        return Vec::new();
    };

    let mut formats = Vec::with_capacity(count_formats as usize);
    for i in 0..count_formats as usize {
        let Some(raw) = read_u32(data, formats_offset as usize + i * 4) else {
            return Vec::new();
        };
        formats.push(DrmFourcc::try_from(raw).ok());
    }

    let mut result: Vec<(DrmFourcc, Vec<DrmModifier>)> = known
        .iter()
        .map(|format| (*format, Vec::new()))
        .collect();

    // each entry: u64 format bitmask, u32 offset, u32 pad, u64 modifier
    for i in 0..count_modifiers as usize {
        let base = modifiers_offset as usize + i * 24;
        let Some(mask) = read_u64(data, base) else {
            return result;
        };
        let Some(first) = read_u32(data, base + 8) else {
            return result;
        };
        let Some(modifier) = read_u64(data, base + 16) else {
            return result;
        };
        for bit in 0..64usize {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let index = first as usize + bit;
            let Some(Some(format)) = formats.get(index) else {
                continue;
            };
            if let Some((_, modifiers)) = result.iter_mut().find(|(f, _)| f == format) {
                modifiers.push(DrmModifier::from(modifier));
            }
        }
    }
    result.retain(|(_, modifiers)| !modifiers.is_empty());
    result
}

fn mode_to_timings(mode: &Mode) -> ModeTimings {
    let (hdisplay, vdisplay) = mode.size();
    let (hsync_start, hsync_end, htotal) = mode.hsync();
    let (vsync_start, vsync_end, vtotal) = mode.vsync();
    ModeTimings {
        clock: mode.clock(),
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        flags: mode.flags().bits(),
    }
}

fn timings_to_mode(timings: &ModeTimings) -> Mode {
    let mut info: drm_ffi::drm_mode_modeinfo = unsafe { std::mem::zeroed() };
    info.clock = timings.clock;
    info.hdisplay = timings.hdisplay;
    info.hsync_start = timings.hsync_start;
    info.hsync_end = timings.hsync_end;
    info.htotal = timings.htotal;
    info.vdisplay = timings.vdisplay;
    info.vsync_start = timings.vsync_start;
    info.vsync_end = timings.vsync_end;
    info.vtotal = timings.vtotal;
    info.vrefresh = timings.refresh_mhz() / 1000;
    info.flags = timings.flags;

    let name = format!("{}x{}", timings.hdisplay, timings.vdisplay);
    for (dst, src) in info.name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as _;
    }

    Mode::from(info)
}

impl DeviceControl for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        self.0.path.clone()
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.0.dev.as_fd())
    }

    fn caps(&self) -> DeviceCaps {
        self.0.caps
    }

    fn topology(&self) -> Result<ResourceTopology, DeviceError> {
        let mut state = self.0.state.lock().unwrap();
        let cache = &mut state.handles;

        let res = self
            .0
            .dev
            .resource_handles()
            .map_err(|source| self.access_err("Error loading resource handles", source))?;
        let plane_handles = self
            .0
            .dev
            .plane_handles()
            .map_err(|source| self.access_err("Error loading planes", source))?;

        let mut crtcs = Vec::new();
        for (index, handle) in res.crtcs().iter().enumerate() {
            cache.crtcs.insert((*handle).into(), *handle);
            let props = self.read_props(*handle, cache)?;
            let info = self
                .0
                .dev
                .get_crtc(*handle)
                .map_err(|source| self.access_err("Error loading crtc info", source))?;
            let active = props
                .iter()
                .find(|prop| prop.name == "ACTIVE")
                .map(|prop| prop.value == 1)
                .unwrap_or_else(|| info.mode().is_some());
            crtcs.push(CrtcInfo {
                id: CrtcId((*handle).into()),
                index,
                active,
                current_mode: info.mode().map(|mode| mode_to_timings(&mode)),
                props,
            });
        }

        let mut planes = Vec::new();
        for handle in &plane_handles {
            let info = self
                .0
                .dev
                .get_plane(*handle)
                .map_err(|source| self.access_err("Error loading plane info", source))?;
            let props = self.read_props(*handle, cache)?;

            let kind = match props
                .iter()
                .find(|prop| prop.name == "type")
                .map(|prop| prop.value)
            {
                Some(1) => PlaneKind::Primary,
                Some(2) => PlaneKind::Cursor,
                _ => PlaneKind::Overlay,
            };

            let compatible = res.filter_crtcs(info.possible_crtcs());
            let mut crtc_mask = 0u32;
            for (index, crtc) in res.crtcs().iter().enumerate() {
                if compatible.contains(crtc) {
                    crtc_mask |= 1 << index;
                }
            }

            let formats: Vec<DrmFourcc> = info
                .formats()
                .iter()
                .filter_map(|raw| DrmFourcc::try_from(*raw).ok())
                .collect();
            let modifiers = self.plane_modifiers(&props, &formats);

            planes.push(PlaneInfo {
                id: PlaneId((*handle).into()),
                kind,
                crtc_mask,
                formats,
                modifiers,
                props,
            });
        }

        let connectors = self.connector_infos(cache)?;

        Ok(ResourceTopology {
            crtcs,
            planes,
            connectors,
        })
    }

    fn connectors(&self) -> Result<Vec<ConnectorInfo>, DeviceError> {
        let mut state = self.0.state.lock().unwrap();
        self.connector_infos(&mut state.handles)
    }

    #[profiling::function]
    fn atomic_commit(&self, flags: CommitFlags, req: &AtomicRequest) -> Result<(), DeviceError> {
        let state = self.0.state.lock().unwrap();

        let mut raw_req = AtomicModeReq::new();
        for (object, prop, value) in req.iter() {
            let object_handle = NonZeroU32::new(object.raw())
                .ok_or(DeviceError::UnknownObject(object.raw()))?;
            let prop_handle = state
                .handles
                .props
                .get(&prop.0)
                .copied()
                .ok_or(DeviceError::UnknownObject(prop.0))?;
            raw_req.add_raw_property(object_handle, prop_handle, *value);
        }
        drop(state);

        let mut raw_flags = AtomicCommitFlags::empty();
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            raw_flags |= AtomicCommitFlags::PAGE_FLIP_EVENT;
        }
        if flags.contains(CommitFlags::NONBLOCK) {
            raw_flags |= AtomicCommitFlags::NONBLOCK;
        }
        if flags.contains(CommitFlags::ALLOW_MODESET) {
            raw_flags |= AtomicCommitFlags::ALLOW_MODESET;
        }
        if flags.contains(CommitFlags::TEST_ONLY) {
            raw_flags |= AtomicCommitFlags::TEST_ONLY;
        }

        trace!(?raw_flags, props = req.len(), "atomic commit");
        self.0
            .dev
            .atomic_commit(raw_flags, raw_req)
            .map_err(|source| self.access_err("Atomic commit failed", source))
    }

    fn create_mode_blob(&self, mode: &ModeTimings) -> Result<BlobId, DeviceError> {
        let mode = timings_to_mode(mode);
        let value = self
            .0
            .dev
            .create_property_blob(&mode)
            .map_err(|source| self.access_err("Failed to create mode blob", source))?;
        match value {
            property::Value::Blob(id) => Ok(BlobId(id as u32)),
            _ => Err(DeviceError::Unsupported("unexpected blob value type")),
        }
    }

    fn create_blob(&self, data: &[u8]) -> Result<BlobId, DeviceError> {
        let mut bytes = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.0.dev.as_fd(), &mut bytes)
            .map_err(|source| self.access_err("Failed to create property blob", source))?;
        Ok(BlobId(blob.blob_id))
    }

    fn destroy_blob(&self, blob: BlobId) -> Result<(), DeviceError> {
        self.0
            .dev
            .destroy_property_blob(blob.0 as u64)
            .map_err(|source| self.access_err("Failed to destroy property blob", source))
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        fb: Option<FramebufferId>,
        connectors: &[ConnectorId],
        mode: Option<&ModeTimings>,
    ) -> Result<(), DeviceError> {
        let state = self.0.state.lock().unwrap();
        let crtc_handle = state
            .handles
            .crtcs
            .get(&crtc.0)
            .copied()
            .ok_or(DeviceError::UnknownObject(crtc.0))?;
        let fb_handle = match fb {
            Some(fb) => Some(
                state
                    .handles
                    .framebuffers
                    .get(&fb.0)
                    .copied()
                    .ok_or(DeviceError::UnknownObject(fb.0))?,
            ),
            None => None,
        };
        let connector_handles: Vec<connector::Handle> = connectors
            .iter()
            .map(|id| {
                state
                    .handles
                    .connectors
                    .get(&id.0)
                    .copied()
                    .ok_or(DeviceError::UnknownObject(id.0))
            })
            .collect::<Result<_, _>>()?;
        drop(state);

        self.0
            .dev
            .set_crtc(
                crtc_handle,
                fb_handle,
                (0, 0),
                &connector_handles,
                mode.map(timings_to_mode),
            )
            .map_err(|source| self.access_err("Legacy mode set failed", source))
    }

    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> Result<(), DeviceError> {
        let state = self.0.state.lock().unwrap();
        let crtc_handle = state
            .handles
            .crtcs
            .get(&crtc.0)
            .copied()
            .ok_or(DeviceError::UnknownObject(crtc.0))?;
        let fb_handle = state
            .handles
            .framebuffers
            .get(&fb.0)
            .copied()
            .ok_or(DeviceError::UnknownObject(fb.0))?;
        drop(state);

        self.0
            .dev
            .page_flip(crtc_handle, fb_handle, PageFlipFlags::EVENT, None)
            .map_err(|source| self.access_err("Page flip failed", source))
    }

    fn create_dumb_buffer(&self, size: Size<u32>, format: DrmFourcc) -> Result<DumbBufferInfo, DeviceError> {
        let bpp = get_bpp(format).ok_or(DeviceError::Unsupported("format without known bpp"))?;
        let depth = get_depth(format).ok_or(DeviceError::Unsupported("format without known depth"))?;

        let db = self
            .0
            .dev
            .create_dumb_buffer((size.w, size.h), format, bpp)
            .map_err(|source| self.access_err("Failed to create dumb buffer", source))?;
        let fb = match self.0.dev.add_framebuffer(&db, depth, bpp) {
            Ok(fb) => fb,
            Err(source) => {
                let _ = self.0.dev.destroy_dumb_buffer(db);
                return Err(self.access_err("Failed to create framebuffer", source));
            }
        };

        let pitch = db.pitch();
        let mut state = self.0.state.lock().unwrap();
        let id = DumbBufferId(state.next_dumb);
        state.next_dumb += 1;
        state.handles.framebuffers.insert(fb.into(), fb);
        state.dumb.insert(id.0, DumbEntry { db, fb });

        Ok(DumbBufferInfo {
            id,
            fb: FramebufferId(fb.into()),
            size,
            format,
            pitch,
        })
    }

    fn write_dumb_buffer(
        &self,
        buffer: DumbBufferId,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), DeviceError> {
        let mut state = self.0.state.lock().unwrap();
        let entry = state
            .dumb
            .get_mut(&buffer.0)
            .ok_or(DeviceError::UnknownObject(buffer.0 as u32))?;
        let mut mapping = self
            .0
            .dev
            .map_dumb_buffer(&mut entry.db)
            .map_err(|source| self.access_err("Failed to map dumb buffer", source))?;
        f(mapping.as_mut());
        Ok(())
    }

    fn destroy_dumb_buffer(&self, buffer: DumbBufferId) -> Result<(), DeviceError> {
        let entry = {
            let mut state = self.0.state.lock().unwrap();
            let entry = state
                .dumb
                .remove(&buffer.0)
                .ok_or(DeviceError::UnknownObject(buffer.0 as u32))?;
            state.handles.framebuffers.remove(&entry.fb.into());
            entry
        };
        let _ = self.0.dev.destroy_framebuffer(entry.fb);
        self.0
            .dev
            .destroy_dumb_buffer(entry.db)
            .map_err(|source| self.access_err("Failed to destroy dumb buffer", source))
    }

    #[cfg(feature = "backend_gbm")]
    fn import_dmabuf(&self, dmabuf: &DmabufHandle) -> Result<FramebufferId, DeviceError> {
        use drm::buffer::PlanarBuffer;

        let Some(gbm) = self.0.gbm.as_ref() else {
            return Err(DeviceError::Unsupported("no gbm device for import"));
        };

        let mut fds: [Option<BorrowedFd<'_>>; 4] = [None; 4];
        let mut strides = [0i32; 4];
        let mut offsets = [0i32; 4];
        for (i, plane) in dmabuf.planes.iter().take(4).enumerate() {
            fds[i] = Some(plane.fd.as_fd());
            strides[i] = plane.stride as i32;
            offsets[i] = plane.offset as i32;
        }

        let bo: gbm::BufferObject<()> = gbm
            .import_buffer_object_from_dma_buf_with_modifiers(
                dmabuf.planes.len() as u32,
                fds,
                dmabuf.size.w,
                dmabuf.size.h,
                dmabuf.format,
                gbm::BufferObjectFlags::SCANOUT,
                strides,
                offsets,
                dmabuf.modifier,
            )
            .map_err(|source| self.access_err("Failed to import dmabuf", source))?;

        struct ImportWrapper<'a> {
            bo: &'a gbm::BufferObject<()>,
            pitches: [u32; 4],
            offsets: [u32; 4],
        }
        impl PlanarBuffer for ImportWrapper<'_> {
            fn size(&self) -> (u32, u32) {
                PlanarBuffer::size(self.bo)
            }
            fn format(&self) -> DrmFourcc {
                PlanarBuffer::format(self.bo)
            }
            fn modifier(&self) -> Option<DrmModifier> {
                match self.bo.modifier().unwrap_or(DrmModifier::Invalid) {
                    DrmModifier::Invalid => None,
                    modifier => Some(modifier),
                }
            }
            fn pitches(&self) -> [u32; 4] {
                self.pitches
            }
            fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
                PlanarBuffer::handles(self.bo)
            }
            fn offsets(&self) -> [u32; 4] {
                self.offsets
            }
        }

        // the imported bo may report wrong pitches for buffers we did
        // not allocate, use the ones of the dmabuf
        let mut pitches = [0u32; 4];
        let mut fb_offsets = [0u32; 4];
        for (i, plane) in dmabuf.planes.iter().take(4).enumerate() {
            pitches[i] = plane.stride;
            fb_offsets[i] = plane.offset;
        }
        let wrapper = ImportWrapper {
            bo: &bo,
            pitches,
            offsets: fb_offsets,
        };

        let flags = if wrapper.modifier().is_some() {
            drm::control::FbCmd2Flags::MODIFIERS
        } else {
            drm::control::FbCmd2Flags::empty()
        };
        let fb = self
            .0
            .dev
            .add_planar_framebuffer(&wrapper, flags)
            .map_err(|source| self.access_err("Failed to add framebuffer for dmabuf", source))?;

        let mut state = self.0.state.lock().unwrap();
        state.handles.framebuffers.insert(fb.into(), fb);
        Ok(FramebufferId(fb.into()))
    }

    #[cfg(not(feature = "backend_gbm"))]
    fn import_dmabuf(&self, _dmabuf: &DmabufHandle) -> Result<FramebufferId, DeviceError> {
        Err(DeviceError::Unsupported("dmabuf import requires gbm"))
    }

    fn destroy_framebuffer(&self, fb: FramebufferId) -> Result<(), DeviceError> {
        let handle = {
            let mut state = self.0.state.lock().unwrap();
            state
                .handles
                .framebuffers
                .remove(&fb.0)
                .ok_or(DeviceError::UnknownObject(fb.0))?
        };
        self.0
            .dev
            .destroy_framebuffer(handle)
            .map_err(|source| self.access_err("Failed to destroy framebuffer", source))
    }

    fn create_lease(&self, objects: &[u32], flags: u32) -> Result<(LesseeId, OwnedFd), DeviceError> {
        let raw: Vec<drm::control::RawResourceHandle> = objects
            .iter()
            .map(|id| NonZeroU32::new(*id).ok_or(DeviceError::UnknownObject(*id)))
            .collect::<Result<_, _>>()?;
        let (lessee, fd) = self
            .0
            .dev
            .create_lease(&raw, flags)
            .map_err(|source| self.access_err("Failed to create lease", source))?;
        Ok((LesseeId(u32::from(lessee)), fd))
    }

    fn revoke_lease(&self, lessee: LesseeId) -> Result<(), DeviceError> {
        let lessee =
            NonZeroU32::new(lessee.0).ok_or(DeviceError::UnknownObject(lessee.0))?;
        self.0
            .dev
            .revoke_lease(lessee)
            .map_err(|source| self.access_err("Failed to revoke lease", source))
    }

    fn list_lessees(&self) -> Result<Vec<LesseeId>, DeviceError> {
        let lessees = self
            .0
            .dev
            .list_lessees()
            .map_err(|source| self.access_err("Failed to list lessees", source))?;
        Ok(lessees
            .into_iter()
            .map(|lessee| LesseeId(u32::from(lessee)))
            .collect())
    }

    fn receive_events(&self) -> Result<Vec<FlipEvent>, DeviceError> {
        let events = self
            .0
            .dev
            .receive_events()
            .map_err(|source| self.access_err("Error reading device events", source))?;
        let mut flips = Vec::new();
        for event in events {
            if let Event::PageFlip(event) = event {
                flips.push(FlipEvent {
                    crtc: CrtcId(event.crtc.into()),
                    sequence: event.frame,
                    time: event.duration,
                });
            }
        }
        Ok(flips)
    }
}
