//! Cross-GPU buffer hand-off.
//!
//! When the rendering GPU differs from the displaying GPU the finished
//! frame has to reach display-local memory. Three mechanisms exist, in
//! priority order: importing the render buffer directly (zero-copy),
//! blitting with the display GPU's own context into round-robin scanout
//! buffers, and blitting/reading back on the render GPU into
//! CPU-writable dumb buffers. Downgrades are sticky for the session;
//! a failed import falls down to the CPU path within the same frame.

use std::fmt;
use std::sync::Arc;

use drm_fourcc::DrmFourcc;
use tracing::{debug, info, warn};

use crate::buffer::{DumbSlot, ScanoutBuffer, ScanoutAllocator};
use crate::control::{DeviceControl, DeviceError, FramebufferId};
use crate::device::KmsDevice;
use crate::format::READBACK_PREFERENCE;
use crate::utils::{Rectangle, Size};

/// Above this many damage rectangles a full-frame copy is cheaper than
/// per-rectangle bookkeeping.
const MAX_DAMAGE_RECTS: usize = 16;

/// Number of display-local buffers cycled through by the copy paths.
const SHARED_BUFFER_COUNT: usize = 2;

/// Errors of the buffer hand-off.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Allocating or importing a display-local buffer failed
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// The render device could not produce the copy
    #[error("copy backend failed: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The buffer cannot be shared across devices
    #[error("buffer is not exportable")]
    NotExportable,
}

/// Render-device operations the hand-off delegates to the renderer.
pub trait BlitBackend: fmt::Debug + Send {
    /// Blit `src` into the display-local `dst` using the display GPU's
    /// own context
    fn blit(
        &mut self,
        src: &Arc<dyn ScanoutBuffer>,
        dst: &Arc<dyn ScanoutBuffer>,
        damage: &[Rectangle<i32>],
    ) -> Result<(), CopyError>;

    /// Copy the damaged rows of `src` into a CPU mapping, converting to
    /// `format`
    fn read_pixels(
        &mut self,
        src: &Arc<dyn ScanoutBuffer>,
        damage: &[Rectangle<i32>],
        format: DrmFourcc,
        dst: &mut [u8],
        dst_pitch: u32,
    ) -> Result<(), CopyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyMode {
    /// Import the render buffer directly
    Zero,
    /// Blit on the display GPU into its own scanout buffers
    SecondaryBlit,
    /// Blit/readback on the render GPU into dumb buffers
    PrimaryCpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImportStatus {
    None,
    Ok,
    Failed,
}

/// A dma-buf imported for scanout on the display device.
struct ImportedBuffer {
    control: Arc<dyn DeviceControl>,
    fb: FramebufferId,
    size: Size<u32>,
    format: DrmFourcc,
}

impl fmt::Debug for ImportedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedBuffer")
            .field("fb", &self.fb)
            .field("size", &self.size)
            .finish()
    }
}

impl ScanoutBuffer for ImportedBuffer {
    fn framebuffer(&self) -> FramebufferId {
        self.fb
    }

    fn size(&self) -> Size<u32> {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }
}

impl Drop for ImportedBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.control.destroy_framebuffer(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy imported framebuffer");
        }
    }
}

/// Sharing state between one render GPU and one display CRTC.
pub struct SecondaryGpuState {
    display: Arc<KmsDevice>,
    allocator: Option<Box<dyn ScanoutAllocator>>,
    blit: Option<Box<dyn BlitBackend>>,
    copy_mode: CopyMode,
    import_status: ImportStatus,
    shared: [Option<Arc<dyn ScanoutBuffer>>; SHARED_BUFFER_COUNT],
    shared_index: usize,
    dumb: [Option<Arc<DumbSlot>>; SHARED_BUFFER_COUNT],
    dumb_index: usize,
    cpu_format: Option<DrmFourcc>,
}

impl fmt::Debug for SecondaryGpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryGpuState")
            .field("copy_mode", &self.copy_mode)
            .field("import_status", &self.import_status)
            .finish_non_exhaustive()
    }
}

impl SecondaryGpuState {
    /// Create the sharing state.
    ///
    /// With a display-GPU allocator and working acceleration the blit
    /// path is used from the start; otherwise zero-copy import is tried
    /// first with the CPU path as the sticky fallback.
    pub fn new(
        display: Arc<KmsDevice>,
        allocator: Option<Box<dyn ScanoutAllocator>>,
        blit: Option<Box<dyn BlitBackend>>,
        display_accelerated: bool,
    ) -> Self {
        let copy_mode = if display_accelerated && allocator.is_some() && blit.is_some() {
            CopyMode::SecondaryBlit
        } else if display.caps().prime_import {
            CopyMode::Zero
        } else {
            CopyMode::PrimaryCpu
        };
        debug!(?copy_mode, "initialized cross-GPU sharing");

        SecondaryGpuState {
            display,
            allocator,
            blit,
            copy_mode,
            import_status: ImportStatus::None,
            shared: [None, None],
            shared_index: 0,
            dumb: [None, None],
            dumb_index: 0,
            cpu_format: None,
        }
    }

    /// Turn a render-GPU buffer into one the display CRTC can scan out.
    ///
    /// `plane_formats` are the formats of the target primary plane, used
    /// to pick the CPU copy format.
    #[profiling::function]
    pub fn prepare(
        &mut self,
        buffer: &Arc<dyn ScanoutBuffer>,
        damage: &[Rectangle<i32>],
        plane_formats: &[DrmFourcc],
    ) -> Result<Arc<dyn ScanoutBuffer>, CopyError> {
        match self.copy_mode {
            CopyMode::Zero => match self.import(buffer) {
                Ok(imported) => Ok(imported),
                Err(err) => {
                    // sticky downgrade, then retry within the same frame
                    info!(
                        ?err,
                        "zero-copy import failed, falling back to CPU copies for this session"
                    );
                    self.import_status = ImportStatus::Failed;
                    self.copy_mode = CopyMode::PrimaryCpu;
                    self.cpu_copy(buffer, damage, plane_formats)
                }
            },
            CopyMode::SecondaryBlit => self.gpu_copy(buffer, damage),
            CopyMode::PrimaryCpu => self.cpu_copy(buffer, damage, plane_formats),
        }
    }

    fn import(&mut self, buffer: &Arc<dyn ScanoutBuffer>) -> Result<Arc<dyn ScanoutBuffer>, CopyError> {
        let dmabuf = buffer.dmabuf().ok_or(CopyError::NotExportable)?;
        let fb = self.display.control().import_dmabuf(dmabuf)?;
        if self.import_status != ImportStatus::Ok {
            debug!("zero-copy import established");
            self.import_status = ImportStatus::Ok;
        }
        Ok(Arc::new(ImportedBuffer {
            control: self.display.control().clone(),
            fb,
            size: buffer.size(),
            format: buffer.format(),
        }))
    }

    fn gpu_copy(
        &mut self,
        buffer: &Arc<dyn ScanoutBuffer>,
        damage: &[Rectangle<i32>],
    ) -> Result<Arc<dyn ScanoutBuffer>, CopyError> {
        let size = buffer.size();
        let slot = &mut self.shared[self.shared_index];
        let needs_alloc = slot
            .as_ref()
            .map(|existing| existing.size() != size)
            .unwrap_or(true);
        if needs_alloc {
            let allocator = self
                .allocator
                .as_ref()
                .expect("blit mode requires an allocator");
            *slot = Some(allocator.create_scanout_buffer(
                size,
                &[buffer.format(), DrmFourcc::Xrgb8888],
            )?);
        }
        let dst = slot.as_ref().expect("just allocated").clone();

        let blit = self.blit.as_mut().expect("blit mode requires a backend");
        blit.blit(buffer, &dst, damage)?;

        self.shared_index = (self.shared_index + 1) % SHARED_BUFFER_COUNT;
        Ok(dst)
    }

    fn cpu_copy(
        &mut self,
        buffer: &Arc<dyn ScanoutBuffer>,
        damage: &[Rectangle<i32>],
        plane_formats: &[DrmFourcc],
    ) -> Result<Arc<dyn ScanoutBuffer>, CopyError> {
        let blit = self
            .blit
            .as_mut()
            .ok_or(CopyError::Backend("no copy backend".into()))?;

        let size = buffer.size();
        let format = match self.cpu_format {
            Some(format) => format,
            None => {
                let format = READBACK_PREFERENCE
                    .iter()
                    .copied()
                    .find(|candidate| plane_formats.contains(candidate))
                    .or_else(|| plane_formats.first().copied())
                    .ok_or(CopyError::Device(DeviceError::Unsupported(
                        "primary plane reports no formats",
                    )))?;
                debug!(?format, "CPU copies use readback format");
                self.cpu_format = Some(format);
                format
            }
        };

        let slot_ref = &mut self.dumb[self.dumb_index];
        let needs_alloc = slot_ref
            .as_ref()
            .map(|existing| existing.size() != size)
            .unwrap_or(true);
        if needs_alloc {
            *slot_ref = Some(Arc::new(DumbSlot::new(
                self.display.control().clone(),
                size,
                format,
            )?));
        }
        let slot = slot_ref.as_ref().expect("just allocated").clone();

        let full_frame = [Rectangle::new((0, 0), (size.w as i32, size.h as i32))];
        let rects: &[Rectangle<i32>] = if damage.is_empty() || damage.len() > MAX_DAMAGE_RECTS {
            &full_frame
        } else {
            damage
        };

        let pitch = slot.pitch();
        let mut copy_result = Ok(());
        slot.write(&mut |data| {
            copy_result = blit.read_pixels(buffer, rects, format, data, pitch);
        })?;
        copy_result?;

        self.dumb_index = (self.dumb_index + 1) % SHARED_BUFFER_COUNT;
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::buffer::test_support::TestBuffer;
    use crate::buffer::ScanoutBuffer;
    use crate::control::fake::FakeTopology;
    use crate::control::{ClockSource, DeviceCaps, DeviceControl, GpuId};
    use crate::device::{GpuFlags, KmsDevice};

    #[derive(Debug, Default)]
    struct StubBlit {
        reads: Arc<AtomicUsize>,
        last_rects: Arc<Mutex<usize>>,
    }

    impl BlitBackend for StubBlit {
        fn blit(
            &mut self,
            _src: &Arc<dyn ScanoutBuffer>,
            _dst: &Arc<dyn ScanoutBuffer>,
            _damage: &[Rectangle<i32>],
        ) -> Result<(), CopyError> {
            Ok(())
        }

        fn read_pixels(
            &mut self,
            _src: &Arc<dyn ScanoutBuffer>,
            damage: &[Rectangle<i32>],
            _format: DrmFourcc,
            dst: &mut [u8],
            _dst_pitch: u32,
        ) -> Result<(), CopyError> {
            dst.fill(0xaa);
            self.reads.fetch_add(1, Ordering::SeqCst);
            *self.last_rects.lock().unwrap() = damage.len();
            Ok(())
        }
    }

    fn display_device(prime_import: bool) -> Arc<KmsDevice> {
        let mut topo = FakeTopology::new();
        let _ = topo.add_output(false);
        let fake = crate::control::fake::FakeDevice::with_caps(
            topo,
            DeviceCaps {
                atomic: true,
                universal_planes: true,
                clock: ClockSource::Monotonic,
                cursor_size: Size::new(64, 64),
                addfb2_modifiers: true,
                prime_import,
            },
        );
        KmsDevice::new(GpuId(2), GpuFlags::empty(), fake as Arc<dyn DeviceControl>).unwrap()
    }

    #[test]
    fn failed_import_downgrades_to_cpu_within_the_frame() {
        let display = display_device(true);
        let reads = Arc::new(AtomicUsize::new(0));
        let last_rects = Arc::new(Mutex::new(0));
        let blit = StubBlit {
            reads: reads.clone(),
            last_rects: last_rects.clone(),
        };
        let mut sharing = SecondaryGpuState::new(display, None, Some(Box::new(blit)), false);
        assert_eq!(sharing.copy_mode, CopyMode::Zero);

        // the render buffer is not exportable, so the import fails and
        // the CPU path must produce the frame right away
        let buffer = TestBuffer::new(100) as Arc<dyn ScanoutBuffer>;
        let damage = vec![Rectangle::new((0, 0), (64, 64))];
        let first = sharing
            .prepare(&buffer, &damage, &[DrmFourcc::Xrgb8888])
            .unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(sharing.copy_mode, CopyMode::PrimaryCpu);
        assert_eq!(first.format(), DrmFourcc::Xrgb8888);

        // the downgrade is sticky and the dumb ring rotates
        let second = sharing
            .prepare(&buffer, &damage, &[DrmFourcc::Xrgb8888])
            .unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_ne!(first.framebuffer(), second.framebuffer());
    }

    #[test]
    fn excessive_damage_collapses_to_a_full_frame_copy() {
        let display = display_device(false);
        let reads = Arc::new(AtomicUsize::new(0));
        let last_rects = Arc::new(Mutex::new(0));
        let blit = StubBlit {
            reads: reads.clone(),
            last_rects: last_rects.clone(),
        };
        let mut sharing = SecondaryGpuState::new(display, None, Some(Box::new(blit)), false);
        assert_eq!(sharing.copy_mode, CopyMode::PrimaryCpu);

        let buffer = TestBuffer::new(100) as Arc<dyn ScanoutBuffer>;
        let damage: Vec<Rectangle<i32>> = (0..20)
            .map(|i| Rectangle::new((i * 8, 0), (8, 8)))
            .collect();
        sharing
            .prepare(&buffer, &damage, &[DrmFourcc::Xrgb8888])
            .unwrap();
        assert_eq!(*last_rects.lock().unwrap(), 1);

        let damage: Vec<Rectangle<i32>> = (0..4)
            .map(|i| Rectangle::new((i * 8, 0), (8, 8)))
            .collect();
        sharing
            .prepare(&buffer, &damage, &[DrmFourcc::Xrgb8888])
            .unwrap();
        assert_eq!(*last_rects.lock().unwrap(), 4);
    }
}
