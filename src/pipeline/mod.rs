//! Per-CRTC onscreen presentation.
//!
//! The pipeline receives finished buffers from the renderer, folds them
//! together with cursor plane writes and invalidated output properties
//! into the device's pending update, and keeps the frame queue moving on
//! page flip feedback. At most one frame is awaiting posting: a newer
//! submission supersedes it with an immediate symbolic completion.

use std::fmt;
use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info_span, trace, warn};

use crate::buffer::ScanoutBuffer;
use crate::commit::CommitMode;
use crate::control::{ClockSource, ConnectorId, CrtcId, DeviceError, GpuId, PropertyId};
use crate::cursor::CursorManager;
use crate::device::connector::{underscan_borders, Colorspace, RgbRange};
use crate::device::crtc::GammaLut;
use crate::device::mode::Mode;
use crate::device::KmsDevice;
use crate::error::Error;
use crate::update::{AssignPlaneFlags, FlipTimestamp, PageFlipListener, Update};
use crate::utils::{Rectangle, Size};

pub mod multigpu;

use multigpu::SecondaryGpuState;

/// How long a frame submitted during power save waits before it is
/// discarded.
const POWER_SAVE_DEFER: Duration = Duration::from_millis(100);

bitflags::bitflags! {
    /// Qualifiers of a frame completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// The timestamp comes from a real vsync
        const VSYNC_CONFIRMED = 1 << 0;
        /// No pixels reached the display for this completion
        const SYMBOLIC = 1 << 1;
        /// The timestamp is in the hardware clock domain
        const HW_CLOCK = 1 << 2;
    }
}

/// Completion report for one submitted frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameFeedback {
    /// Presentation time
    pub timestamp: Duration,
    /// Clock domain of `timestamp`
    pub clock: ClockSource,
    /// Hardware frame sequence, 0 for symbolic completions
    pub sequence: u32,
    /// Refresh rate of the active mode in millihertz
    pub refresh_mhz: u32,
    /// Completion qualifiers
    pub flags: FrameFlags,
}

/// Outcome of a frame submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// The frame was posted to the hardware
    Posted,
    /// The frame waits until the outstanding one completes
    Queued,
    /// The frame was discarded with a symbolic completion
    Discarded,
}

type FeedbackHandler = Box<dyn Fn(&FrameFeedback) + Send + Sync>;
type ScanoutFailedHandler = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputProperty {
    Gamma,
    PrivacyScreen,
    Underscan,
    MaxBpc,
    RgbRange,
    Colorspace,
}

/// One output property with edge-triggered invalidation and the frame
/// its last write rode on.
#[derive(Debug)]
struct PropSlot<T> {
    value: T,
    invalidated: bool,
    target_frame: Option<u64>,
}

impl<T: PartialEq> PropSlot<T> {
    fn new(value: T) -> Self {
        PropSlot {
            value,
            invalidated: false,
            target_frame: None,
        }
    }

    fn set(&mut self, value: T) {
        if self.value != value {
            self.value = value;
            self.invalidated = true;
        }
    }
}

#[derive(Debug)]
struct Frame {
    number: u64,
    buffer: Arc<dyn ScanoutBuffer>,
    fence: Option<OwnedFd>,
    damage: Vec<Rectangle<i32>>,
    direct: bool,
    /// Properties whose writes ride on this frame
    props: Vec<OutputProperty>,
}

struct OnscreenState {
    presented: Option<Frame>,
    posted: Option<Frame>,
    superseded: Option<Frame>,
    next: Option<Frame>,
    frame_counter: u64,
    power_on: bool,
    have_view: bool,
    deferred_deadline: Option<Instant>,
    mode: Option<Mode>,
    connectors: Vec<ConnectorId>,
    pending_mode_set: bool,
    gamma: PropSlot<Option<GammaLut>>,
    privacy: PropSlot<bool>,
    underscan: PropSlot<bool>,
    max_bpc: PropSlot<Option<u32>>,
    rgb_range: PropSlot<RgbRange>,
    colorspace: PropSlot<Colorspace>,
    vrr_requested: bool,
    discard_logged: bool,
    secondary: Option<SecondaryGpuState>,
}

struct OnscreenShared {
    this: Weak<OnscreenShared>,
    device: Arc<KmsDevice>,
    crtc: CrtcId,
    render_gpu: GpuId,
    cursor: Mutex<Option<Arc<CursorManager>>>,
    state: Mutex<OnscreenState>,
    feedback: Mutex<Option<FeedbackHandler>>,
    scanout_failed: Mutex<Option<ScanoutFailedHandler>>,
    span: tracing::Span,
}

/// Presentation pipeline of one driven CRTC.
pub struct Onscreen {
    shared: Arc<OnscreenShared>,
}

impl fmt::Debug for Onscreen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Onscreen")
            .field("crtc", &self.shared.crtc)
            .field("device", &self.shared.device.id())
            .finish_non_exhaustive()
    }
}

struct PostPlan {
    buffer: Arc<dyn ScanoutBuffer>,
    fence: Option<OwnedFd>,
    direct: bool,
    mode_set: Option<(Mode, Vec<ConnectorId>)>,
    connector_props: Vec<(ConnectorId, PropertyId, u64)>,
    gamma: Option<Option<GammaLut>>,
    vrr: Option<(PropertyId, bool)>,
    dst: Rectangle<i32>,
}

impl Onscreen {
    /// Create the pipeline for `crtc`, rendering and displaying on the
    /// same device.
    pub fn new(device: Arc<KmsDevice>, crtc: CrtcId) -> Result<Self, Error> {
        let render_gpu = device.id();
        Self::with_render_device(device, crtc, render_gpu, None)
    }

    /// Create the pipeline with a distinct render GPU. `sharing` carries
    /// the cross-GPU hand-off state.
    pub fn with_render_device(
        device: Arc<KmsDevice>,
        crtc: CrtcId,
        render_gpu: GpuId,
        sharing: Option<SecondaryGpuState>,
    ) -> Result<Self, Error> {
        device.crtc(crtc).ok_or(Error::UnknownCrtc(crtc))?;
        let span = info_span!("onscreen", crtc = ?crtc);

        Ok(Onscreen {
            shared: Arc::new_cyclic(|this| OnscreenShared {
                this: this.clone(),
                device,
                crtc,
                render_gpu,
                cursor: Mutex::new(None),
                state: Mutex::new(OnscreenState {
                    presented: None,
                    posted: None,
                    superseded: None,
                    next: None,
                    frame_counter: 0,
                    power_on: true,
                    have_view: true,
                    deferred_deadline: None,
                    mode: None,
                    connectors: Vec::new(),
                    pending_mode_set: false,
                    gamma: PropSlot::new(None),
                    privacy: PropSlot::new(false),
                    underscan: PropSlot::new(false),
                    max_bpc: PropSlot::new(None),
                    rgb_range: PropSlot::new(RgbRange::Automatic),
                    colorspace: PropSlot::new(Colorspace::Default),
                    vrr_requested: false,
                    discard_logged: false,
                    secondary: sharing,
                }),
                feedback: Mutex::new(None),
                scanout_failed: Mutex::new(None),
                span,
            }),
        })
    }

    /// CRTC this pipeline drives
    pub fn crtc(&self) -> CrtcId {
        self.shared.crtc
    }

    /// Device this pipeline displays on
    pub fn device(&self) -> &Arc<KmsDevice> {
        &self.shared.device
    }

    /// Attach the cursor manager so cursor plane writes join each frame
    pub fn set_cursor_manager(&self, cursor: Arc<CursorManager>) {
        *self.shared.cursor.lock().unwrap() = Some(cursor);
    }

    /// Install the frame completion handler
    pub fn set_feedback_handler(&self, handler: FeedbackHandler) {
        *self.shared.feedback.lock().unwrap() = Some(handler);
    }

    /// Install the handler called when a direct scanout frame failed
    /// asynchronously and the compositor must redraw
    pub fn set_scanout_failed_handler(&self, handler: ScanoutFailedHandler) {
        *self.shared.scanout_failed.lock().unwrap() = Some(handler);
    }

    /// Supported formats of the primary plane, as (format, modifiers)
    pub fn scanout_formats(&self) -> Vec<(DrmFourcc, Vec<DrmModifier>)> {
        let Some(primary) = self
            .shared
            .device
            .crtc(self.shared.crtc)
            .and_then(|crtc| crtc.primary_plane())
        else {
            return Vec::new();
        };
        let Some(plane) = self.shared.device.plane(primary) else {
            return Vec::new();
        };
        plane
            .formats()
            .into_iter()
            .map(|format| (format, plane.modifiers_for(format)))
            .collect()
    }

    /// Program `mode` on the next posted frame.
    pub fn set_mode(&self, mode: Mode, connectors: Vec<ConnectorId>) {
        let mut state = self.shared.state.lock().unwrap();
        state.mode = Some(mode);
        state.connectors = connectors;
        state.pending_mode_set = true;
        if let Some(crtc) = self.shared.device.crtc(self.shared.crtc) {
            crtc.state_mut().active = true;
        }
    }

    /// Disable the CRTC with a blocking commit and discard queued frames.
    pub fn disable(&self) -> Result<(), Error> {
        let _guard = self.shared.span.enter();
        let connectors = {
            let mut state = self.shared.state.lock().unwrap();
            state.mode = None;
            state.pending_mode_set = false;
            state.connectors.clone()
        };
        self.shared.discard_queued();

        let mut update = Update::new(self.shared.device.id());
        update.set_mode(self.shared.crtc, None, connectors);
        if let Some(crtc) = self.shared.device.crtc(self.shared.crtc) {
            crtc.state_mut().active = false;
        }
        self.shared.device.post_update(update, CommitMode::Sync)
    }

    /// Propagate display power state. Turning power off discards queued
    /// frames; turning it on posts the next frame if one is waiting.
    pub fn set_power_on(&self, on: bool) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.power_on == on {
                return;
            }
            state.power_on = on;
            state.deferred_deadline = None;
        }
        if on {
            self.shared.maybe_post_next_frame();
        } else {
            self.shared.discard_queued();
        }
    }

    /// Whether a rendered view exists for this output
    pub fn set_have_view(&self, have_view: bool) {
        self.shared.state.lock().unwrap().have_view = have_view;
        if have_view {
            self.shared.maybe_post_next_frame();
        }
    }

    /// Replace the gamma ramp; written with the next posted frame
    pub fn set_gamma(&self, lut: Option<GammaLut>) {
        self.shared.state.lock().unwrap().gamma.set(lut);
    }

    /// Toggle the privacy screen; written with the next posted frame
    pub fn set_privacy_screen(&self, enabled: bool) {
        self.shared.state.lock().unwrap().privacy.set(enabled);
    }

    /// Toggle underscanning; written with the next posted frame
    pub fn set_underscan(&self, enabled: bool) {
        self.shared.state.lock().unwrap().underscan.set(enabled);
    }

    /// Clamp the sink bit depth; written with the next posted frame
    pub fn set_max_bpc(&self, max_bpc: Option<u32>) {
        self.shared.state.lock().unwrap().max_bpc.set(max_bpc);
    }

    /// Select the RGB quantization range; written with the next frame
    pub fn set_rgb_range(&self, range: RgbRange) {
        self.shared.state.lock().unwrap().rgb_range.set(range);
    }

    /// Select the colorspace; written with the next posted frame
    pub fn set_colorspace(&self, colorspace: Colorspace) {
        self.shared.state.lock().unwrap().colorspace.set(colorspace);
    }

    /// Request variable refresh. Takes effect only on VRR capable CRTCs
    /// and is written on edge changes only.
    pub fn set_vrr_requested(&self, requested: bool) {
        self.shared.state.lock().unwrap().vrr_requested = requested;
    }

    /// Whether `buffer` can bypass composition onto the primary plane.
    ///
    /// Checks opacity and format compatibility, then validates the
    /// assignment with a blocking test-only commit. A `true` answer is
    /// no transaction: the following real commit can still fail and will
    /// then report through the scanout-failed handler.
    #[profiling::function]
    pub fn test_scanout_compatibility(&self, buffer: &Arc<dyn ScanoutBuffer>) -> bool {
        let _guard = self.shared.span.enter();
        if !buffer.is_opaque() {
            return false;
        }
        let Some(primary) = self
            .shared
            .device
            .crtc(self.shared.crtc)
            .and_then(|crtc| crtc.primary_plane())
        else {
            return false;
        };
        let Some(plane) = self.shared.device.plane(primary) else {
            return false;
        };
        if !plane.supports_format(buffer.format(), Some(buffer.modifier())) {
            return false;
        }

        let dst = match self.shared.state.lock().unwrap().mode.as_ref() {
            Some(mode) => {
                let size = mode.timings.size().to_i32();
                Rectangle::new((0, 0), (size.w, size.h))
            }
            None => return false,
        };

        let mut update = Update::new(self.shared.device.id());
        let size = buffer.size().to_i32();
        update.assign_plane(
            self.shared.crtc,
            primary,
            buffer.framebuffer(),
            Rectangle::new((0.0, 0.0), (size.w as f64, size.h as f64)),
            dst,
            AssignPlaneFlags::empty(),
        );
        match self.shared.device.test_update(update) {
            Ok(()) => true,
            Err(err) => {
                trace!(?err, "direct scanout test rejected");
                false
            }
        }
    }

    /// Hand a finished frame to the pipeline.
    ///
    /// `direct` marks a client buffer going straight to the primary
    /// plane, previously validated with
    /// [`test_scanout_compatibility`](Self::test_scanout_compatibility).
    #[profiling::function]
    pub fn submit_frame(
        &self,
        buffer: Arc<dyn ScanoutBuffer>,
        damage: Vec<Rectangle<i32>>,
        fence: Option<OwnedFd>,
        direct: bool,
    ) -> SubmitStatus {
        let _guard = self.shared.span.enter();

        if self.shared.device.is_shutting_down() {
            self.shared.emit_symbolic(0);
            return SubmitStatus::Discarded;
        }

        // cross-GPU: get the buffer into display reachable memory first
        let (buffer, direct) = if self.shared.render_gpu != self.shared.device.id() {
            let plane_formats: Vec<DrmFourcc> = self
                .scanout_formats()
                .into_iter()
                .map(|(format, _)| format)
                .collect();
            let mut state = self.shared.state.lock().unwrap();
            match state.secondary.as_mut() {
                Some(secondary) => match secondary.prepare(&buffer, &damage, &plane_formats) {
                    Ok(local) => (local, false),
                    Err(err) => {
                        drop(state);
                        warn!(?err, "cross-GPU frame hand-off failed");
                        self.shared.emit_symbolic(0);
                        return SubmitStatus::Discarded;
                    }
                },
                None => {
                    drop(state);
                    warn!("no sharing state for cross-GPU output");
                    self.shared.emit_symbolic(0);
                    return SubmitStatus::Discarded;
                }
            }
        } else {
            (buffer, direct)
        };

        let superseded_number = {
            let mut state = self.shared.state.lock().unwrap();
            let frame = Frame {
                number: 0,
                buffer,
                fence,
                damage,
                direct,
                props: Vec::new(),
            };
            // at most one frame may await posting
            let superseded = state.next.replace(frame);
            let number = superseded.as_ref().map(|frame| frame.number);
            if let Some(old) = superseded {
                trace!("superseding queued frame");
                state.superseded = Some(old);
            }
            number
        };
        if superseded_number.is_some() {
            self.shared.emit_symbolic(0);
        }

        self.shared.maybe_post_next_frame();

        let state = self.shared.state.lock().unwrap();
        if state.next.is_none() && state.posted.is_some() {
            SubmitStatus::Posted
        } else {
            SubmitStatus::Queued
        }
    }

    /// Post the queued frame if the pipeline is idle.
    pub fn maybe_post_next_frame(&self) {
        self.shared.maybe_post_next_frame();
    }

    /// Deadline of the power-save defer timer, if armed
    pub fn deferred_deadline(&self) -> Option<Instant> {
        self.shared.state.lock().unwrap().deferred_deadline
    }

    /// The defer timer expired: discard the waiting frame gracefully
    pub fn on_deferred_timer(&self) {
        let discarded = {
            let mut state = self.shared.state.lock().unwrap();
            state.deferred_deadline = None;
            state.next.take()
        };
        if discarded.is_some() {
            debug!("discarding frame deferred across power save");
            self.shared.emit_symbolic(0);
        }
    }

    /// Discard all queued frames with symbolic completions. Called on
    /// shutdown and when the session loses the display.
    pub fn reset_queue(&self) {
        self.shared.discard_queued();
    }
}

impl OnscreenShared {
    fn refresh_mhz(state: &OnscreenState) -> u32 {
        state
            .mode
            .as_ref()
            .map(|mode| mode.timings.refresh_mhz())
            .unwrap_or(0)
    }

    fn emit(&self, feedback: FrameFeedback) {
        if let Some(handler) = self.feedback.lock().unwrap().as_ref() {
            handler(&feedback);
        }
    }

    /// Completion without pixels: keeps the frame clock ticking.
    fn emit_symbolic(&self, sequence: u32) {
        let refresh = Self::refresh_mhz(&self.state.lock().unwrap());
        self.emit(FrameFeedback {
            timestamp: self.device.now(),
            clock: self.device.clock(),
            sequence,
            refresh_mhz: refresh,
            flags: FrameFlags::SYMBOLIC,
        });
    }

    fn discard_queued(&self) {
        let discarded = {
            let mut state = self.state.lock().unwrap();
            let mut count = 0;
            if state.next.take().is_some() {
                count += 1;
            }
            if state.superseded.take().is_some() {
                count += 1;
            }
            count
        };
        for _ in 0..discarded {
            self.emit_symbolic(0);
        }
    }

    #[profiling::function]
    fn maybe_post_next_frame(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let plan = {
            let mut state = self.state.lock().unwrap();
            if state.posted.is_some() || !state.have_view || self.device.is_shutting_down() {
                return;
            }
            if !state.power_on {
                if state.next.is_some() && state.deferred_deadline.is_none() {
                    state.deferred_deadline = Some(Instant::now() + POWER_SAVE_DEFER);
                }
                return;
            }
            let Some(mut frame) = state.next.take() else {
                return;
            };

            state.frame_counter += 1;
            frame.number = state.frame_counter;

            let plan = self.build_post_plan(&mut state, &mut frame);
            state.posted = Some(frame);
            plan
        };

        let Some(plan) = plan else {
            // nothing to scan out, complete the frame symbolically
            let number = {
                let mut state = self.state.lock().unwrap();
                state.posted.take().map(|frame| frame.number)
            };
            if number.is_some() {
                self.emit_symbolic(0);
            }
            return;
        };

        let cursor = self.cursor.lock().unwrap().clone();
        let listener: Arc<dyn PageFlipListener> = this;
        let crtc = self.crtc;
        let device = self.device.clone();

        device.with_pending_update(|update| {
            if let Some((mode, connectors)) = plan.mode_set {
                update.set_mode(crtc, Some(mode), connectors);
                device.apply_transform(crtc, update);
            }

            if let Some(primary) = device.crtc(crtc).and_then(|model| model.primary_plane()) {
                let size = plan.buffer.size().to_i32();
                let mut flags = AssignPlaneFlags::empty();
                if plan.direct && plan.fence.is_some() {
                    flags |= AssignPlaneFlags::DISABLE_IMPLICIT_SYNC;
                }
                let assignment = update.assign_plane(
                    crtc,
                    primary,
                    plan.buffer.framebuffer(),
                    Rectangle::new((0.0, 0.0), (size.w as f64, size.h as f64)),
                    plan.dst,
                    flags,
                );
                assignment.fence = plan.fence;
            }

            for (connector, prop, value) in plan.connector_props {
                update.set_connector_property(connector, prop, value);
            }
            if let Some(lut) = plan.gamma {
                update.set_gamma(crtc, lut);
            }
            if let Some((prop, enabled)) = plan.vrr {
                update.set_crtc_property(crtc, prop, enabled as u64);
            }

            if let Some(cursor) = cursor.as_ref() {
                cursor.update_for_crtc(crtc, update);
            }

            update.add_page_flip_listener(crtc, listener);
        });

        // failures surface through the discarded feedback, keeping the
        // frame clock alive
        let _ = device.post_pending_update(CommitMode::Async);
    }

    /// Assemble everything the posted frame carries besides the buffer.
    fn build_post_plan(&self, state: &mut OnscreenState, frame: &mut Frame) -> Option<PostPlan> {
        let mode = state.mode.clone()?;
        let size = mode.timings.size().to_i32();
        let dst = Rectangle::new((0, 0), (size.w, size.h));

        let mode_set = if state.pending_mode_set {
            state.pending_mode_set = false;
            Some((mode.clone(), state.connectors.clone()))
        } else {
            None
        };

        let connectors = state.connectors.clone();
        let mut connector_props = Vec::new();
        let mut props = Vec::new();

        if state.privacy.invalidated {
            state.privacy.invalidated = false;
            state.privacy.target_frame = Some(frame.number);
            props.push(OutputProperty::PrivacyScreen);
            self.privacy_writes(&connectors, state.privacy.value, &mut connector_props);
        }
        if state.underscan.invalidated {
            state.underscan.invalidated = false;
            state.underscan.target_frame = Some(frame.number);
            props.push(OutputProperty::Underscan);
            self.underscan_writes(
                &connectors,
                state.underscan.value,
                mode.timings.size(),
                &mut connector_props,
            );
        }
        if state.max_bpc.invalidated {
            state.max_bpc.invalidated = false;
            state.max_bpc.target_frame = Some(frame.number);
            props.push(OutputProperty::MaxBpc);
            if let Some(max_bpc) = state.max_bpc.value {
                self.prop_writes(&connectors, "max bpc", max_bpc as u64, &mut connector_props);
            }
        }
        if state.rgb_range.invalidated {
            state.rgb_range.invalidated = false;
            state.rgb_range.target_frame = Some(frame.number);
            props.push(OutputProperty::RgbRange);
            self.rgb_range_writes(&connectors, state.rgb_range.value, &mut connector_props);
        }
        if state.colorspace.invalidated {
            state.colorspace.invalidated = false;
            state.colorspace.target_frame = Some(frame.number);
            props.push(OutputProperty::Colorspace);
            self.colorspace_writes(&connectors, state.colorspace.value, &mut connector_props);
        }

        let gamma = if state.gamma.invalidated {
            state.gamma.invalidated = false;
            state.gamma.target_frame = Some(frame.number);
            props.push(OutputProperty::Gamma);
            // cache on the CRTC so the ramp survives later mode sets
            if let Some(crtc) = self.device.crtc(self.crtc) {
                crtc.state_mut().gamma = state.gamma.value.clone();
            }
            Some(state.gamma.value.clone())
        } else {
            None
        };

        let vrr = self.vrr_write(state);

        frame.props = props;
        Some(PostPlan {
            buffer: frame.buffer.clone(),
            fence: frame.fence.take(),
            direct: frame.direct,
            mode_set,
            connector_props,
            gamma,
            vrr,
            dst,
        })
    }

    /// VRR is written only on edge changes of (request && capability).
    fn vrr_write(&self, state: &OnscreenState) -> Option<(PropertyId, bool)> {
        let crtc = self.device.crtc(self.crtc)?;
        let effective = state.vrr_requested && crtc.is_vrr_capable();
        if crtc.state().vrr_enabled == effective {
            return None;
        }
        let prop = crtc.prop("VRR_ENABLED")?;
        crtc.state_mut().vrr_enabled = effective;
        Some((prop, effective))
    }

    fn for_each_connector(
        &self,
        connectors: &[ConnectorId],
        f: &mut dyn FnMut(&crate::device::connector::Connector),
    ) {
        for id in connectors {
            if let Some(connector) = self.device.connector(*id) {
                f(&connector);
            }
        }
    }

    fn prop_writes(
        &self,
        connectors: &[ConnectorId],
        name: &str,
        value: u64,
        out: &mut Vec<(ConnectorId, PropertyId, u64)>,
    ) {
        self.for_each_connector(connectors, &mut |connector| {
            if let Some(prop) = connector.prop(name) {
                out.push((connector.id(), prop, value));
            }
        });
    }

    fn privacy_writes(
        &self,
        connectors: &[ConnectorId],
        enabled: bool,
        out: &mut Vec<(ConnectorId, PropertyId, u64)>,
    ) {
        self.for_each_connector(connectors, &mut |connector| {
            if !connector.supports_privacy_screen() {
                return;
            }
            let entry = if enabled { "Enabled" } else { "Disabled" };
            if let (Some(prop), Some(value)) = (
                connector.prop("privacy-screen sw-state"),
                connector.enum_value("privacy-screen sw-state", entry),
            ) {
                out.push((connector.id(), prop, value));
            }
        });
    }

    fn underscan_writes(
        &self,
        connectors: &[ConnectorId],
        enabled: bool,
        mode_size: Size<u32>,
        out: &mut Vec<(ConnectorId, PropertyId, u64)>,
    ) {
        self.for_each_connector(connectors, &mut |connector| {
            if !connector.supports_underscanning() {
                return;
            }
            let entry = if enabled { "on" } else { "off" };
            let Some(value) = connector.enum_value("underscan", entry) else {
                return;
            };
            let Some(mode_prop) = connector.prop("underscan") else {
                return;
            };
            out.push((connector.id(), mode_prop, value));
            if enabled {
                let (hborder, vborder) = underscan_borders(mode_size);
                if let Some(prop) = connector.prop("underscan hborder") {
                    out.push((connector.id(), prop, hborder as u64));
                }
                if let Some(prop) = connector.prop("underscan vborder") {
                    out.push((connector.id(), prop, vborder as u64));
                }
            }
        });
    }

    fn rgb_range_writes(
        &self,
        connectors: &[ConnectorId],
        range: RgbRange,
        out: &mut Vec<(ConnectorId, PropertyId, u64)>,
    ) {
        self.for_each_connector(connectors, &mut |connector| {
            if let (Some(prop), Some(value)) = (
                connector.prop("Broadcast RGB"),
                connector.rgb_range_value(range),
            ) {
                out.push((connector.id(), prop, value));
            }
        });
    }

    fn colorspace_writes(
        &self,
        connectors: &[ConnectorId],
        colorspace: Colorspace,
        out: &mut Vec<(ConnectorId, PropertyId, u64)>,
    ) {
        self.for_each_connector(connectors, &mut |connector| {
            if let (Some(prop), Some(value)) = (
                connector.prop("Colorspace"),
                connector.colorspace_value(colorspace),
            ) {
                out.push((connector.id(), prop, value));
            }
        });
    }

    /// Queue advancement shared by all four completion paths.
    fn advance(&self, completed: Option<u64>, success: bool) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        // the superseded frame was completed symbolically when it was
        // replaced; its buffer is safe to release now
        state.superseded = None;
        if success {
            if let Some(number) = completed {
                for slot in [
                    &mut state.gamma.target_frame,
                    &mut state.privacy.target_frame,
                    &mut state.underscan.target_frame,
                    &mut state.max_bpc.target_frame,
                    &mut state.rgb_range.target_frame,
                    &mut state.colorspace.target_frame,
                ] {
                    if *slot == Some(number) {
                        *slot = None;
                    }
                }
            }
            state.discard_logged = false;
        }
    }
}

impl PageFlipListener for OnscreenShared {
    fn flipped(&self, _crtc: CrtcId, sequence: u32, time: FlipTimestamp) {
        let feedback = {
            let mut state = self.state.lock().unwrap();
            let frame = state.posted.take();
            let number = frame.as_ref().map(|f| f.number);
            // the previously presented buffer is no longer scanned out
            state.presented = frame;
            let mut flags = FrameFlags::VSYNC_CONFIRMED;
            if time.clock == ClockSource::Monotonic {
                flags |= FrameFlags::HW_CLOCK;
            }
            let feedback = FrameFeedback {
                timestamp: time.time,
                clock: time.clock,
                sequence,
                refresh_mhz: Self::refresh_mhz(&state),
                flags,
            };
            drop(state);
            self.advance(number, true);
            feedback
        };
        self.emit(feedback);
        self.maybe_post_next_frame();
    }

    fn ready(&self, _crtc: CrtcId) {
        let number = {
            let mut state = self.state.lock().unwrap();
            let frame = state.posted.take();
            let number = frame.as_ref().map(|f| f.number);
            state.presented = frame;
            number
        };
        self.advance(number, true);
        self.emit_symbolic(0);
        self.maybe_post_next_frame();
    }

    fn mode_set_fallback(&self, _crtc: CrtcId) {
        let (number, refresh) = {
            let mut state = self.state.lock().unwrap();
            let frame = state.posted.take();
            let number = frame.as_ref().map(|f| f.number);
            state.presented = frame;
            (number, Self::refresh_mhz(&state))
        };
        self.advance(number, true);
        // no flip event exists for a blocking legacy mode set
        self.emit(FrameFeedback {
            timestamp: self.device.now(),
            clock: self.device.clock(),
            sequence: 0,
            refresh_mhz: refresh,
            flags: FrameFlags::empty(),
        });
        self.maybe_post_next_frame();
    }

    fn discarded(&self, _crtc: CrtcId, error: Option<&DeviceError>) {
        let (number, direct, reinvalidate) = {
            let mut state = self.state.lock().unwrap();
            let frame = state.posted.take();
            let number = frame.as_ref().map(|f| f.number);
            let direct = frame.as_ref().map(|f| f.direct).unwrap_or(false);
            let props = frame.map(|f| f.props).unwrap_or_default();
            (number, direct, props)
        };

        {
            // a late failure re-invalidates only the properties that
            // rode on the failed frame
            let mut state = self.state.lock().unwrap();
            for prop in &reinvalidate {
                let slot_invalidated = match prop {
                    OutputProperty::Gamma => &mut state.gamma.invalidated,
                    OutputProperty::PrivacyScreen => &mut state.privacy.invalidated,
                    OutputProperty::Underscan => &mut state.underscan.invalidated,
                    OutputProperty::MaxBpc => &mut state.max_bpc.invalidated,
                    OutputProperty::RgbRange => &mut state.rgb_range.invalidated,
                    OutputProperty::Colorspace => &mut state.colorspace.invalidated,
                };
                *slot_invalidated = true;
            }

            let permission_denied = error.map(|err| err.is_permission_denied()).unwrap_or(false);
            if permission_denied {
                debug!("frame discarded without DRM master");
            } else if !state.discard_logged {
                state.discard_logged = true;
                warn!(?error, "frame discarded");
            }
        }

        self.advance(number, false);
        if direct {
            // the client buffer did not reach the screen, composite and
            // redraw instead
            if let Some(handler) = self.scanout_failed.lock().unwrap().as_ref() {
                handler();
            }
        }
        self.emit_symbolic(0);
        self.maybe_post_next_frame();
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::buffer::test_support::TestBuffer;
    use crate::control::fake::{FakeDevice, FakeTopology};
    use crate::control::{DeviceControl, FlipEvent, GpuId};
    use crate::device::{GpuFlags, KmsDevice};

    fn setup() -> (Arc<FakeDevice>, Arc<KmsDevice>, Onscreen, Arc<StdMutex<Vec<FrameFeedback>>>) {
        let mut topo = FakeTopology::new();
        let (crtc, _primary, _cursor, connector) = topo.add_output(true);
        let fake = topo.build();
        let device = KmsDevice::new(
            GpuId(1),
            GpuFlags::empty(),
            fake.clone() as Arc<dyn DeviceControl>,
        )
        .unwrap();

        let onscreen = Onscreen::new(device.clone(), crtc).unwrap();
        let feedbacks = Arc::new(StdMutex::new(Vec::new()));
        let sink = feedbacks.clone();
        onscreen.set_feedback_handler(Box::new(move |feedback| {
            sink.lock().unwrap().push(*feedback);
        }));

        let mode = {
            let connector = device.connector(connector).unwrap();
            let mode = connector.state().modes[0].clone();
            mode
        };
        onscreen.set_mode(mode, vec![connector]);

        (fake, device, onscreen, feedbacks)
    }

    fn flip(device: &Arc<KmsDevice>, crtc: CrtcId, sequence: u32) {
        device.dispatch_event(FlipEvent {
            crtc,
            sequence,
            time: Duration::from_millis(16 * sequence as u64),
        });
    }

    #[test]
    fn second_queued_frame_supersedes_the_first() {
        let (fake, device, onscreen, feedbacks) = setup();
        let crtc = onscreen.crtc();

        assert_eq!(
            onscreen.submit_frame(TestBuffer::new(100), Vec::new(), None, false),
            SubmitStatus::Posted
        );
        assert_eq!(
            onscreen.submit_frame(TestBuffer::new(101), Vec::new(), None, false),
            SubmitStatus::Queued
        );
        // the queued frame is replaced before it ever posted
        assert_eq!(
            onscreen.submit_frame(TestBuffer::new(102), Vec::new(), None, false),
            SubmitStatus::Queued
        );

        {
            let feedbacks = feedbacks.lock().unwrap();
            assert_eq!(feedbacks.len(), 1);
            assert!(feedbacks[0].flags.contains(FrameFlags::SYMBOLIC));
        }

        // only the first commit went to the hardware so far
        assert_eq!(fake.commits().len(), 1);

        flip(&device, crtc, 1);

        let feedbacks = feedbacks.lock().unwrap();
        assert_eq!(feedbacks.len(), 2);
        assert!(feedbacks[1].flags.contains(FrameFlags::VSYNC_CONFIRMED));
        assert!(feedbacks[1].flags.contains(FrameFlags::HW_CLOCK));
        assert_eq!(feedbacks[1].refresh_mhz, 60_000);

        // the superseding frame, not the superseded one, was posted
        let commits = fake.commits();
        assert_eq!(commits.len(), 2);
        let fbs: Vec<u64> = commits[1]
            .props
            .iter()
            .filter(|(_, _, value)| *value == 100 || *value == 102)
            .map(|(_, _, value)| *value)
            .collect();
        assert_eq!(fbs, vec![102]);
    }

    #[test]
    fn discarded_frame_completes_symbolically_and_unblocks() {
        let (fake, device, onscreen, feedbacks) = setup();
        let crtc = onscreen.crtc();

        // drain the mode set of the first frame
        onscreen.submit_frame(TestBuffer::new(100), Vec::new(), None, false);
        flip(&device, crtc, 1);
        feedbacks.lock().unwrap().clear();

        fake.fail_all_commits(true);
        onscreen.submit_frame(TestBuffer::new(101), Vec::new(), None, false);
        {
            let feedbacks = feedbacks.lock().unwrap();
            assert_eq!(feedbacks.len(), 1);
            assert!(feedbacks[0].flags.contains(FrameFlags::SYMBOLIC));
        }

        // the queue is not wedged: the next frame posts again
        fake.fail_all_commits(false);
        assert_eq!(
            onscreen.submit_frame(TestBuffer::new(102), Vec::new(), None, false),
            SubmitStatus::Posted
        );
    }

    #[test]
    fn power_save_defers_and_discards() {
        let (_fake, _device, onscreen, feedbacks) = setup();

        onscreen.set_power_on(false);
        assert_eq!(
            onscreen.submit_frame(TestBuffer::new(100), Vec::new(), None, false),
            SubmitStatus::Queued
        );
        assert!(onscreen.deferred_deadline().is_some());

        onscreen.on_deferred_timer();
        let feedbacks = feedbacks.lock().unwrap();
        assert_eq!(feedbacks.len(), 1);
        assert!(feedbacks[0].flags.contains(FrameFlags::SYMBOLIC));
    }

    #[test]
    fn output_properties_ride_one_frame_and_reinvalidate_on_failure() {
        let (fake, device, onscreen, _feedbacks) = setup();
        let crtc = onscreen.crtc();

        onscreen.set_privacy_screen(true);
        onscreen.submit_frame(TestBuffer::new(100), Vec::new(), None, false);
        flip(&device, crtc, 1);

        let writes = |commit: &crate::control::fake::RecordedCommit| {
            commit
                .props
                .iter()
                .filter(|(obj, _, _)| matches!(obj, crate::control::ObjectId::Connector(_)))
                .count()
        };
        let commits = fake.commits();
        // mode set CRTC_ID write plus the privacy screen write
        assert!(writes(&commits[0]) >= 2);

        // the next frame does not re-write the property
        onscreen.submit_frame(TestBuffer::new(101), Vec::new(), None, false);
        flip(&device, crtc, 2);
        let commits = fake.commits();
        assert_eq!(writes(&commits[1]), 0);

        // a failed frame re-invalidates only what rode on it
        onscreen.set_privacy_screen(false);
        fake.fail_all_commits(true);
        onscreen.submit_frame(TestBuffer::new(102), Vec::new(), None, false);
        fake.fail_all_commits(false);
        onscreen.submit_frame(TestBuffer::new(103), Vec::new(), None, false);
        let commits = fake.commits();
        let last = commits.last().unwrap();
        assert!(writes(last) >= 1);
    }

    #[test]
    fn vrr_writes_only_on_edges() {
        let (fake, device, onscreen, _feedbacks) = setup();
        let crtc = onscreen.crtc();
        let vrr_prop = device.crtc(crtc).unwrap().prop("VRR_ENABLED").unwrap();

        onscreen.set_vrr_requested(true);
        onscreen.submit_frame(TestBuffer::new(100), Vec::new(), None, false);
        flip(&device, crtc, 1);
        onscreen.submit_frame(TestBuffer::new(101), Vec::new(), None, false);
        flip(&device, crtc, 2);

        let commits = fake.commits();
        let vrr_writes = |commit: &crate::control::fake::RecordedCommit| {
            commit
                .props
                .iter()
                .filter(|(_, prop, _)| *prop == vrr_prop)
                .count()
        };
        assert_eq!(vrr_writes(&commits[0]), 1);
        assert_eq!(vrr_writes(&commits[1]), 0);
    }

    #[test]
    fn direct_scanout_test_rejects_unsupported_formats() {
        let (_fake, _device, onscreen, _feedbacks) = setup();

        let good = TestBuffer::new(100);
        assert!(onscreen.test_scanout_compatibility(&(good as Arc<dyn ScanoutBuffer>)));

        let bad = Arc::new(crate::buffer::test_support::TestBuffer {
            fb: crate::control::FramebufferId(101),
            size: Size::new(1920, 1080),
            format: DrmFourcc::Nv12,
        });
        assert!(!onscreen.test_scanout_compatibility(&(bad as Arc<dyn ScanoutBuffer>)));
    }

    #[test]
    fn scanout_failure_notifies_the_owner() {
        let (fake, _device, onscreen, _feedbacks) = setup();

        let failed = Arc::new(StdMutex::new(0usize));
        let failed_clone = failed.clone();
        onscreen.set_scanout_failed_handler(Box::new(move || {
            *failed_clone.lock().unwrap() += 1;
        }));

        fake.fail_all_commits(true);
        onscreen.submit_frame(TestBuffer::new(100), Vec::new(), None, true);
        assert_eq!(*failed.lock().unwrap(), 1);
    }

    #[test]
    fn modes_with_equal_timings_share_ids() {
        let (_fake, device, _onscreen, _feedbacks) = setup();
        let mode = crate::control::fake::test_mode();
        let a = device.intern_mode(mode);
        let b = device.intern_mode(mode);
        assert_eq!(a, b);
    }
}
