//! Hardware cursor plane management.
//!
//! Decides per frame whether the pointer sprite can ride a cursor plane
//! or must fall back to software composition, and owns the cursor buffer
//! rings. Scanout is asynchronous: a buffer replaced by a commit may
//! still be read by the hardware after the commit returns, so each
//! (sprite, GPU) pair triple-buffers its images, which leaves at least a
//! full vblank of margin before a slot is reused.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use drm_fourcc::DrmFourcc;
use tracing::{debug, trace, warn};

use crate::buffer::{DumbSlot, ScanoutBuffer};
use crate::control::{CrtcId, FramebufferId, GpuId, PlaneId};
use crate::device::KmsDevice;
use crate::update::{
    AssignPlaneFlags, CommitFeedback, FlipTimestamp, PageFlipListener, Update,
};
use crate::utils::{Point, Rectangle, Size, Transform};

const CURSOR_BUFFER_COUNT: usize = 3;

/// Identity of a cursor sprite. A new sprite gets a new id; the id is
/// what ties buffer rings and animation state to a sprite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpriteId(pub u64);

/// The pointer sprite as provided by the compositor.
pub trait CursorSource: fmt::Debug + Send + Sync {
    /// Identity of this sprite
    fn id(&self) -> SpriteId;

    /// Size of the sprite in native pixels
    fn size(&self) -> Size<u32>;

    /// Hotspot offset within the sprite
    fn hotspot(&self) -> Point<f64>;

    /// Whether the sprite has a realized texture to upload
    fn has_texture(&self) -> bool;

    /// Whether the sprite can be rasterized at a different scale or
    /// transform on the CPU
    fn can_preprocess(&self) -> bool;

    /// Write the native ARGB8888 pixels into `dst`
    fn write_native(&self, dst: &mut [u8], dst_pitch: u32) -> bool;

    /// Write a scaled and transformed ARGB8888 copy into `dst`
    fn write_scaled(
        &self,
        scale: f64,
        transform: Transform,
        dst_size: Size<u32>,
        dst: &mut [u8],
        dst_pitch: u32,
    ) -> bool;

    /// Whether the sprite is animated
    fn is_animated(&self) -> bool {
        false
    }

    /// Duration of the current animation frame
    fn frame_duration(&self) -> Option<Duration> {
        None
    }

    /// Advance to the next animation frame
    fn advance_frame(&self) {}
}

/// One output the cursor may overlap.
#[derive(Debug, Clone)]
pub struct CursorViewport {
    /// Device owning the CRTC
    pub device: Arc<KmsDevice>,
    /// CRTC of the output
    pub crtc: CrtcId,
    /// Layout of the output in compositor coordinates
    pub layout: Rectangle<f64>,
    /// Output scale
    pub scale: f64,
    /// Output transform
    pub transform: Transform,
}

/// Notifications the manager emits towards the renderer.
#[derive(Debug, Clone, Copy)]
pub enum CursorEvent {
    /// The hardware cursor was presented on `crtc`
    PaintedHw {
        /// CRTC the cursor appeared on
        crtc: CrtcId,
    },
    /// The hardware cursor became unusable on `gpu`, software
    /// composition must take over
    HwCursorUnusable {
        /// Affected GPU
        gpu: GpuId,
    },
}

type EventHandler = Box<dyn Fn(CursorEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingBufferState {
    None,
    Set,
    Invalidated,
}

/// Triple-buffered cursor images of one (sprite, GPU) pair.
struct CursorGpuState {
    bos: [Option<Arc<DumbSlot>>; CURSOR_BUFFER_COUNT],
    active: usize,
    pending_state: PendingBufferState,
}

impl CursorGpuState {
    fn new() -> Self {
        CursorGpuState {
            bos: [None, None, None],
            active: 0,
            pending_state: PendingBufferState::None,
        }
    }

    fn pending_index(&self) -> usize {
        (self.active + 1) % CURSOR_BUFFER_COUNT
    }

    fn active_buffer(&self) -> Option<&Arc<DumbSlot>> {
        self.bos[self.active].as_ref()
    }

    fn pending_buffer(&self) -> Option<&Arc<DumbSlot>> {
        match self.pending_state {
            PendingBufferState::Set => self.bos[self.pending_index()].as_ref(),
            _ => None,
        }
    }

    fn set_pending(&mut self, buffer: Arc<DumbSlot>) {
        let index = self.pending_index();
        self.bos[index] = Some(buffer);
        self.pending_state = PendingBufferState::Set;
    }

    /// Promote the pending slot after its frame was confirmed posted.
    /// Advances `active` by exactly one slot.
    fn promote(&mut self) {
        if self.pending_state == PendingBufferState::Set {
            self.active = self.pending_index();
            self.pending_state = PendingBufferState::None;
        }
    }

    fn invalidate(&mut self) {
        self.pending_state = PendingBufferState::Invalidated;
    }

    fn has_valid_buffer(&self) -> bool {
        match self.pending_state {
            PendingBufferState::Set => true,
            PendingBufferState::Invalidated => false,
            PendingBufferState::None => self.active_buffer().is_some(),
        }
    }
}

impl fmt::Debug for CursorGpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorGpuState")
            .field("active", &self.active)
            .field("pending_state", &self.pending_state)
            .finish()
    }
}

#[derive(Debug, Default)]
struct GpuData {
    /// Set for the rest of the session when a commit failed on the
    /// cursor plane of this GPU.
    broken: bool,
}

#[derive(Debug, Clone)]
struct CommittedCursor {
    fb: FramebufferId,
    dst: Rectangle<i32>,
}

struct CursorInner {
    sprite: Option<Arc<dyn CursorSource>>,
    position: Point<f64>,
    inhibited: bool,
    viewports: Vec<CursorViewport>,
    gpu_data: HashMap<GpuId, GpuData>,
    sprite_states: HashMap<(SpriteId, GpuId), CursorGpuState>,
    committed: HashMap<CrtcId, CommittedCursor>,
    hw_cursor_on: HashMap<CrtcId, bool>,
    invalidated: bool,
    animation_deadline: Option<Instant>,
    animation_sprite: Option<SpriteId>,
}

/// Decides hardware vs software cursor per frame and owns the cursor
/// buffer rings.
pub struct CursorManager {
    inner: Mutex<CursorInner>,
    events: Mutex<Option<EventHandler>>,
}

impl fmt::Debug for CursorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorManager").finish_non_exhaustive()
    }
}

impl Default for CursorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorManager {
    /// Create a manager with no sprite and no outputs
    pub fn new() -> Self {
        CursorManager {
            inner: Mutex::new(CursorInner {
                sprite: None,
                position: Point::new(0.0, 0.0),
                inhibited: false,
                viewports: Vec::new(),
                gpu_data: HashMap::new(),
                sprite_states: HashMap::new(),
                committed: HashMap::new(),
                hw_cursor_on: HashMap::new(),
                invalidated: true,
                animation_deadline: None,
                animation_sprite: None,
            }),
            events: Mutex::new(None),
        }
    }

    /// Install the handler for cursor notifications
    pub fn set_event_handler(&self, handler: EventHandler) {
        *self.events.lock().unwrap() = Some(handler);
    }

    fn emit(&self, event: CursorEvent) {
        if let Some(handler) = self.events.lock().unwrap().as_ref() {
            handler(event);
        }
    }

    /// Replace the current sprite. Passing the same sprite is cheap.
    pub fn set_sprite(&self, sprite: Option<Arc<dyn CursorSource>>) {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.sprite.as_ref().map(|s| s.id());
        let new = sprite.as_ref().map(|s| s.id());
        let changed = old != new;
        inner.sprite = sprite;
        if changed {
            inner.invalidated = true;
            self.rearm_animation(&mut inner, true);
        }
    }

    /// The sprite's texture changed, buffers must be re-uploaded
    pub fn notify_texture_changed(&self) {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.sprite.as_ref().map(|s| s.id());
        if let Some(sprite) = current {
            for ((id, _), state) in inner.sprite_states.iter_mut() {
                if *id == sprite {
                    state.invalidate();
                }
            }
        }
        inner.invalidated = true;
    }

    /// Move the cursor
    pub fn set_position(&self, position: Point<f64>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.position != position {
            inner.position = position;
            inner.invalidated = true;
        }
    }

    /// Globally inhibit the hardware cursor (e.g. for screen capture)
    pub fn set_inhibited(&self, inhibited: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.inhibited != inhibited {
            inner.inhibited = inhibited;
            inner.invalidated = true;
        }
    }

    /// Update the set of outputs the cursor can appear on
    pub fn set_viewports(&self, viewports: Vec<CursorViewport>) {
        let mut inner = self.inner.lock().unwrap();
        inner.viewports = viewports;
        inner.invalidated = true;
    }

    /// Whether the hardware cursor was marked broken for `gpu`
    pub fn is_gpu_broken(&self, gpu: GpuId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .gpu_data
            .get(&gpu)
            .map(|data| data.broken)
            .unwrap_or(false)
    }

    /// Evaluate all conditions for putting the current sprite on
    /// hardware cursor planes this frame.
    pub fn should_have_hw_cursor(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.evaluate(&mut inner).is_some()
    }

    /// Candidate GPUs and the agreed (scale, transform), or `None` when
    /// the sprite must be composited in software.
    fn evaluate(&self, inner: &mut CursorInner) -> Option<(Vec<Arc<KmsDevice>>, f64, Transform)> {
        if inner.inhibited {
            return None;
        }
        let sprite = inner.sprite.clone()?;
        if !sprite.has_texture() {
            return None;
        }

        let cursor_rect = logical_cursor_rect(inner.position, &sprite);
        let overlapped: Vec<CursorViewport> = inner
            .viewports
            .iter()
            .filter(|viewport| viewport.layout.overlaps_f64(cursor_rect))
            .cloned()
            .collect();
        if overlapped.is_empty() {
            return None;
        }

        // every overlapped output needs a cursor capable plane
        for viewport in &overlapped {
            let crtc = viewport.device.crtc(viewport.crtc)?;
            crtc.cursor_plane()?;
        }

        let mut gpus: Vec<Arc<KmsDevice>> = Vec::new();
        for viewport in &overlapped {
            if !gpus.iter().any(|dev| dev.id() == viewport.device.id()) {
                gpus.push(viewport.device.clone());
            }
        }
        if gpus
            .iter()
            .any(|dev| inner.gpu_data.get(&dev.id()).map(|d| d.broken).unwrap_or(false))
        {
            return None;
        }

        // all overlapped outputs must agree on one scale and transform;
        // anything but (1.0, normal) additionally needs CPU preprocessing
        let scale = overlapped[0].scale;
        let transform = overlapped[0].transform;
        if overlapped
            .iter()
            .any(|viewport| viewport.scale != scale || viewport.transform != transform)
        {
            return None;
        }
        if (scale != 1.0 || transform != Transform::Normal) && !sprite.can_preprocess() {
            return None;
        }

        // every candidate GPU must hold a valid buffer for the sprite
        for device in &gpus {
            self.ensure_sprite_buffer(inner, &sprite, device, scale, transform);
            let state = inner.sprite_states.get(&(sprite.id(), device.id()))?;
            if !state.has_valid_buffer() {
                return None;
            }
        }

        Some((gpus, scale, transform))
    }

    /// Upload the sprite into the pending ring slot of `device` if the
    /// slot does not already hold a valid image.
    fn ensure_sprite_buffer(
        &self,
        inner: &mut CursorInner,
        sprite: &Arc<dyn CursorSource>,
        device: &Arc<KmsDevice>,
        scale: f64,
        transform: Transform,
    ) {
        let key = (sprite.id(), device.id());
        let state = inner
            .sprite_states
            .entry(key)
            .or_insert_with(CursorGpuState::new);
        if state.has_valid_buffer() {
            return;
        }

        let preprocess = scale != 1.0 || transform != Transform::Normal;
        let buffer_size = if preprocess {
            device.cursor_size()
        } else {
            sprite.size()
        };

        let slot = match DumbSlot::new(device.control().clone(), buffer_size, DrmFourcc::Argb8888) {
            Ok(slot) => Arc::new(slot),
            Err(err) => {
                warn!(gpu = ?device.id(), ?err, "failed to allocate cursor buffer");
                return;
            }
        };

        let pitch = slot.pitch();
        let mut ok = false;
        let write_result = slot.write(&mut |data| {
            data.fill(0);
            ok = if preprocess {
                sprite.write_scaled(scale, transform, buffer_size, data, pitch)
            } else {
                sprite.write_native(data, pitch)
            };
        });

        match write_result {
            Ok(()) if ok => state.set_pending(slot),
            Ok(()) => debug!(gpu = ?device.id(), "sprite declined to draw"),
            Err(err) => warn!(gpu = ?device.id(), ?err, "failed to fill cursor buffer"),
        }
    }

    /// Write this frame's cursor plane state for `crtc` into `update`.
    ///
    /// Called by the presentation pipeline while it builds the frame's
    /// batch. A no-op when nothing changed since the last commit.
    #[profiling::function]
    pub fn update_for_crtc(self: &Arc<Self>, crtc: CrtcId, update: &mut Update) {
        let mut inner = self.inner.lock().unwrap();

        let viewport = match inner.viewports.iter().find(|v| v.crtc == crtc) {
            Some(viewport) => viewport.clone(),
            None => return,
        };
        let Some(cursor_plane) = viewport
            .device
            .crtc(crtc)
            .and_then(|model| model.cursor_plane())
        else {
            return;
        };

        let evaluated = self.evaluate(&mut inner);
        let sprite = inner.sprite.clone();

        let placement = match (&evaluated, &sprite) {
            (Some((_, scale, _)), Some(sprite)) => {
                cursor_rect_for_viewport(&inner, &viewport, sprite, *scale)
            }
            _ => None,
        };

        let should_have = evaluated.is_some() && placement.is_some();
        let did_have = inner.hw_cursor_on.get(&crtc).copied().unwrap_or(false);
        inner.hw_cursor_on.insert(crtc, should_have);

        if !should_have {
            if did_have {
                trace!(?crtc, "removing hardware cursor");
                update.unassign_plane(cursor_plane);
                inner.committed.remove(&crtc);
                self.add_listeners(&inner, update, crtc, cursor_plane, &viewport, false);
            }
            return;
        }

        let sprite = sprite.expect("placement requires a sprite");
        let state = inner
            .sprite_states
            .get(&(sprite.id(), viewport.device.id()))
            .expect("evaluate ensured a buffer");
        let used_pending = state.pending_buffer().is_some();
        let buffer = state
            .pending_buffer()
            .or_else(|| state.active_buffer())
            .expect("evaluate ensured a buffer")
            .clone();

        let dst = placement.expect("checked above");
        let mut flags = AssignPlaneFlags::ALLOW_FAIL;
        if let Some(committed) = inner.committed.get(&crtc) {
            if committed.fb == buffer.framebuffer() {
                if !inner.invalidated && committed.dst == dst {
                    // nothing changed since the last commit
                    return;
                }
                flags |= AssignPlaneFlags::FB_UNCHANGED;
            }
        }

        let size = buffer.size().to_i32();
        trace!(?crtc, ?dst, "assigning cursor plane");
        let assignment = update.assign_plane(
            crtc,
            cursor_plane,
            buffer.framebuffer(),
            Rectangle::new((0.0, 0.0), (size.w as f64, size.h as f64)),
            dst,
            flags,
        );
        let hotspot = sprite.hotspot().round();
        if viewport
            .device
            .plane(cursor_plane)
            .map(|plane| plane.supports_hotspot())
            .unwrap_or(false)
        {
            assignment.hotspot = Some(hotspot);
        }

        inner.committed.insert(
            crtc,
            CommittedCursor {
                fb: buffer.framebuffer(),
                dst,
            },
        );
        self.add_listeners(&inner, update, crtc, cursor_plane, &viewport, used_pending);
    }

    fn add_listeners(
        self: &Arc<Self>,
        inner: &CursorInner,
        update: &mut Update,
        crtc: CrtcId,
        cursor_plane: PlaneId,
        viewport: &CursorViewport,
        used_pending: bool,
    ) {
        let sprite = inner.sprite.as_ref().map(|s| s.id());
        let handler = Arc::new(CursorCrtcHandler {
            manager: Arc::downgrade(self),
            gpu: viewport.device.id(),
            sprite,
            used_pending,
        });
        update.add_page_flip_listener(crtc, handler.clone());

        let result_handler = handler;
        let plane = cursor_plane;
        update.add_result_listener(Box::new(move |feedback| {
            result_handler.commit_result(plane, feedback);
        }));
    }

    fn on_commit_result(
        &self,
        gpu: GpuId,
        sprite: Option<SpriteId>,
        used_pending: bool,
        cursor_plane: PlaneId,
        feedback: &CommitFeedback,
    ) {
        if feedback.failed_planes.contains(&cursor_plane) {
            // this GPU cannot drive its cursor plane, stop trying for
            // the rest of the session
            warn!(?gpu, "cursor plane commit failed, falling back to software cursor");
            let mut inner = self.inner.lock().unwrap();
            inner.gpu_data.entry(gpu).or_default().broken = true;
            inner.invalidated = true;
            drop(inner);
            self.emit(CursorEvent::HwCursorUnusable { gpu });
            return;
        }
        if !feedback.passed() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.invalidated = false;
        if let Some(sprite) = sprite {
            if used_pending {
                if let Some(state) = inner.sprite_states.get_mut(&(sprite, gpu)) {
                    state.promote();
                }
            }
        }
    }

    /// Drop buffer rings of sprites other than the current one and of
    /// GPUs that disappeared.
    pub fn retire_unused(&self, live_gpus: &[GpuId]) {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.sprite.as_ref().map(|s| s.id());
        inner.sprite_states.retain(|(sprite, gpu), _| {
            Some(*sprite) == current && live_gpus.contains(gpu)
        });
        inner.gpu_data.retain(|gpu, _| live_gpus.contains(gpu));
    }

    /// Deadline of the armed animation timer, if any
    pub fn animation_deadline(&self) -> Option<Instant> {
        self.inner.lock().unwrap().animation_deadline
    }

    /// The single-shot animation timer expired: advance the sprite's
    /// animation frame, force re-evaluation, and re-arm.
    pub fn on_animation_timer(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.animation_deadline = None;
        let Some(sprite) = inner.sprite.clone() else {
            return;
        };
        if !sprite.is_animated() {
            return;
        }
        sprite.advance_frame();
        inner.invalidated = true;
        let id = sprite.id();
        for ((sprite_id, _), state) in inner.sprite_states.iter_mut() {
            if *sprite_id == id {
                state.invalidate();
            }
        }
        self.rearm_animation(&mut inner, true);
    }

    /// At most one outstanding timer; re-arm only on sprite identity
    /// change or when no timer is armed.
    fn rearm_animation(&self, inner: &mut CursorInner, cursor_changed: bool) {
        let sprite = inner.sprite.clone();
        let new_id = sprite.as_ref().map(|s| s.id());
        if !cursor_changed && inner.animation_deadline.is_some() && inner.animation_sprite == new_id {
            return;
        }

        inner.animation_deadline = None;
        inner.animation_sprite = new_id;
        if let Some(sprite) = sprite {
            if sprite.is_animated() {
                if let Some(delay) = sprite.frame_duration() {
                    if !delay.is_zero() {
                        inner.animation_deadline = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }
}

struct CursorCrtcHandler {
    manager: Weak<CursorManager>,
    gpu: GpuId,
    sprite: Option<SpriteId>,
    used_pending: bool,
}

impl CursorCrtcHandler {
    fn commit_result(&self, cursor_plane: PlaneId, feedback: &CommitFeedback) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_commit_result(self.gpu, self.sprite, self.used_pending, cursor_plane, feedback);
        }
    }
}

impl PageFlipListener for CursorCrtcHandler {
    fn flipped(&self, crtc: CrtcId, _sequence: u32, _time: FlipTimestamp) {
        if let Some(manager) = self.manager.upgrade() {
            manager.emit(CursorEvent::PaintedHw { crtc });
        }
    }

    fn ready(&self, _crtc: CrtcId) {}

    fn mode_set_fallback(&self, crtc: CrtcId) {
        if let Some(manager) = self.manager.upgrade() {
            manager.emit(CursorEvent::PaintedHw { crtc });
        }
    }

    fn discarded(&self, _crtc: CrtcId, _error: Option<&crate::control::DeviceError>) {}
}

/// Cursor extent in compositor coordinates, used for the overlap test.
fn logical_cursor_rect(position: Point<f64>, sprite: &Arc<dyn CursorSource>) -> Rectangle<f64> {
    let size = sprite.size();
    let hotspot = sprite.hotspot();
    Rectangle {
        loc: Point::new(position.x - hotspot.x, position.y - hotspot.y),
        size: Size::new(size.w as f64, size.h as f64),
    }
}

/// Destination rectangle on one CRTC, or `None` when the cursor is off
/// that output.
fn cursor_rect_for_viewport(
    inner: &CursorInner,
    viewport: &CursorViewport,
    sprite: &Arc<dyn CursorSource>,
    scale: f64,
) -> Option<Rectangle<i32>> {
    let state = inner
        .sprite_states
        .get(&(sprite.id(), viewport.device.id()))?;
    let buffer = state.pending_buffer().or_else(|| state.active_buffer())?;
    let buffer_size = buffer.size().to_i32();

    let crtc_x = (inner.position.x - viewport.layout.loc.x) * scale;
    let crtc_y = (inner.position.y - viewport.layout.loc.y) * scale;
    let crtc_size = Size::new(
        (viewport.layout.size.w * scale).round() as i32,
        (viewport.layout.size.h * scale).round() as i32,
    );
    let point = viewport.transform.transform_point(
        crtc_size,
        Point::new(crtc_x.round() as i32, crtc_y.round() as i32),
    );
    let crtc_size = viewport.transform.transform_size(crtc_size);

    let hotspot = sprite.hotspot();
    let rect = Rectangle::new(
        (
            point.x - hotspot.x.round() as i32,
            point.y - hotspot.y.round() as i32,
        ),
        (buffer_size.w, buffer_size.h),
    );

    let visible = rect.loc.x + rect.size.w > 0
        && rect.loc.y + rect.size.h > 0
        && rect.loc.x < crtc_size.w
        && rect.loc.y < crtc_size.h;
    visible.then_some(rect)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::commit::CommitMode;
    use crate::control::fake::FakeTopology;
    use crate::control::{DeviceControl, GpuId};
    use crate::device::{GpuFlags, KmsDevice};
    use crate::update::PlaneOp;

    #[derive(Debug)]
    struct TestSprite {
        id: u64,
        size: Size<u32>,
        hotspot: Point<f64>,
        preprocess: bool,
        frames_advanced: AtomicU64,
    }

    impl TestSprite {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(TestSprite {
                id,
                size: Size::new(32, 32),
                hotspot: Point::new(4.0, 4.0),
                preprocess: false,
                frames_advanced: AtomicU64::new(0),
            })
        }

        fn with_preprocess(id: u64) -> Arc<Self> {
            Arc::new(TestSprite {
                id,
                size: Size::new(32, 32),
                hotspot: Point::new(4.0, 4.0),
                preprocess: true,
                frames_advanced: AtomicU64::new(0),
            })
        }
    }

    impl CursorSource for TestSprite {
        fn id(&self) -> SpriteId {
            SpriteId(self.id)
        }
        fn size(&self) -> Size<u32> {
            self.size
        }
        fn hotspot(&self) -> Point<f64> {
            self.hotspot
        }
        fn has_texture(&self) -> bool {
            true
        }
        fn can_preprocess(&self) -> bool {
            self.preprocess
        }
        fn write_native(&self, dst: &mut [u8], _dst_pitch: u32) -> bool {
            dst.fill(0xff);
            true
        }
        fn write_scaled(
            &self,
            _scale: f64,
            _transform: Transform,
            _dst_size: Size<u32>,
            dst: &mut [u8],
            _dst_pitch: u32,
        ) -> bool {
            dst.fill(0xee);
            true
        }
        fn is_animated(&self) -> bool {
            false
        }
        fn advance_frame(&self) {
            self.frames_advanced.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(scale: f64) -> (Arc<KmsDevice>, Arc<CursorManager>, CrtcId, PlaneId) {
        let mut topo = FakeTopology::new();
        let (crtc, _primary, cursor, _connector) = topo.add_output(true);
        let fake = topo.build();
        let device = KmsDevice::new(
            GpuId(1),
            GpuFlags::empty(),
            fake as Arc<dyn DeviceControl>,
        )
        .unwrap();

        let manager = Arc::new(CursorManager::new());
        manager.set_viewports(vec![CursorViewport {
            device: device.clone(),
            crtc,
            layout: Rectangle {
                loc: Point::new(0.0, 0.0),
                size: Size::new(1920.0, 1080.0),
            },
            scale,
            transform: Transform::Normal,
        }]);
        (device, manager, crtc, cursor.unwrap())
    }

    #[test]
    fn ring_keeps_pending_one_ahead_of_active() {
        let mut state = CursorGpuState::new();
        assert_eq!(state.pending_index(), 1);

        // promoting without a pending buffer must not advance
        state.promote();
        assert_eq!(state.active, 0);

        for round in 0..10 {
            let before = state.active;
            state.pending_state = PendingBufferState::Set;
            state.promote();
            // one commit advances active by exactly one slot
            assert_eq!(state.active, (before + 1) % CURSOR_BUFFER_COUNT, "round {}", round);
            assert_eq!(state.pending_index(), (state.active + 1) % CURSOR_BUFFER_COUNT);
        }
    }

    #[test]
    fn plain_sprite_rides_the_hardware_plane() {
        let (_device, manager, crtc, cursor_plane) = setup(1.0);
        manager.set_sprite(Some(TestSprite::new(1)));
        manager.set_position(Point::new(100.5, 50.25));

        assert!(manager.should_have_hw_cursor());

        let mut update = Update::new(GpuId(1));
        manager.update_for_crtc(crtc, &mut update);

        let assignment = update
            .plane_ops
            .iter()
            .find_map(|op| match op {
                PlaneOp::Assign(assignment) if assignment.plane == cursor_plane => Some(assignment),
                _ => None,
            })
            .expect("cursor plane assigned");
        assert!(assignment.flags.contains(AssignPlaneFlags::ALLOW_FAIL));
        // destination is the hotspot adjusted, rounded position
        assert_eq!(assignment.dst.loc, Point::new(97, 46));
        assert_eq!(assignment.dst.size, Size::new(32, 32));
        assert_eq!(assignment.hotspot, Some(Point::new(4, 4)));
    }

    #[test]
    fn scaled_output_needs_preprocessing() {
        let (_device, manager, _crtc, _plane) = setup(2.0);
        manager.set_sprite(Some(TestSprite::new(1)));
        manager.set_position(Point::new(100.0, 50.0));
        assert!(!manager.should_have_hw_cursor());

        // the same sprite with CPU preprocessing is fine
        let (_device, manager, _crtc, _plane) = setup(2.0);
        manager.set_sprite(Some(TestSprite::with_preprocess(2)));
        manager.set_position(Point::new(100.0, 50.0));
        assert!(manager.should_have_hw_cursor());
    }

    #[test]
    fn cursor_plane_failure_marks_the_gpu_broken() {
        let mut topo = FakeTopology::new();
        let (crtc, primary, cursor, _connector) = topo.add_output(true);
        let cursor_plane = cursor.unwrap();
        let fake = topo.build();
        let device = KmsDevice::new(
            GpuId(1),
            GpuFlags::empty(),
            fake.clone() as Arc<dyn DeviceControl>,
        )
        .unwrap();

        let manager = Arc::new(CursorManager::new());
        manager.set_viewports(vec![CursorViewport {
            device: device.clone(),
            crtc,
            layout: Rectangle {
                loc: Point::new(0.0, 0.0),
                size: Size::new(1920.0, 1080.0),
            },
            scale: 1.0,
            transform: Transform::Normal,
        }]);
        manager.set_sprite(Some(TestSprite::new(1)));
        manager.set_position(Point::new(10.0, 10.0));

        fake.fail_commits_touching(cursor_plane.0);

        let mut update = Update::new(device.id());
        // a primary plane write keeps the commit alive without the cursor
        update.assign_plane(
            crtc,
            primary,
            crate::control::FramebufferId(500),
            Rectangle {
                loc: Point::new(0.0, 0.0),
                size: Size::new(1920.0, 1080.0),
            },
            Rectangle::new((0, 0), (1920, 1080)),
            AssignPlaneFlags::empty(),
        );
        manager.update_for_crtc(crtc, &mut update);
        device.post_update(update, CommitMode::Async).unwrap();

        assert!(manager.is_gpu_broken(device.id()));
        assert!(!manager.should_have_hw_cursor());

        // later updates never touch the hardware plane again
        let mut update = Update::new(device.id());
        manager.update_for_crtc(crtc, &mut update);
        let uses_hw = update.plane_ops.iter().any(|op| {
            matches!(op, PlaneOp::Assign(assignment) if assignment.plane == cursor_plane)
        });
        assert!(!uses_hw);
    }

    #[test]
    fn unchanged_cursor_skips_the_recommit() {
        let (device, manager, crtc, cursor_plane) = setup(1.0);
        manager.set_sprite(Some(TestSprite::new(1)));
        manager.set_position(Point::new(100.0, 100.0));

        let mut update = Update::new(device.id());
        manager.update_for_crtc(crtc, &mut update);
        assert!(!update.is_empty());
        device.post_update(update, CommitMode::Async).unwrap();

        // nothing changed since the successful commit
        let mut update = Update::new(device.id());
        manager.update_for_crtc(crtc, &mut update);
        assert!(update.is_empty());

        // a moved cursor recommits with the unchanged buffer flagged
        manager.set_position(Point::new(150.0, 100.0));
        let mut update = Update::new(device.id());
        manager.update_for_crtc(crtc, &mut update);
        let assignment = update
            .plane_ops
            .iter()
            .find_map(|op| match op {
                PlaneOp::Assign(assignment) if assignment.plane == cursor_plane => Some(assignment),
                _ => None,
            })
            .expect("cursor plane assigned");
        assert!(assignment.flags.contains(AssignPlaneFlags::FB_UNCHANGED));
    }
}
