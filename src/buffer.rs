//! Scanout buffer abstractions.
//!
//! The renderer hands the pipeline finished buffers as
//! `Arc<dyn ScanoutBuffer>`; the only allocation the backend performs
//! itself are dumb buffers for the CPU copy path and for cursor images.

use std::fmt;
use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::warn;

use crate::control::{DeviceControl, DeviceError, DmabufHandle, DumbBufferInfo, FramebufferId};
use crate::format::has_alpha;
use crate::utils::Size;

/// A buffer that can be assigned to a hardware plane.
///
/// Implementations are shared as `Arc<dyn ScanoutBuffer>`; the trait is
/// deliberately small so renderer-owned buffer types can implement it
/// without the backend knowing their allocation story.
pub trait ScanoutBuffer: fmt::Debug + Send + Sync {
    /// Framebuffer attached to this buffer on its owning device
    fn framebuffer(&self) -> FramebufferId;

    /// Buffer dimensions
    fn size(&self) -> Size<u32>;

    /// Pixel format
    fn format(&self) -> DrmFourcc;

    /// Format modifier the buffer was allocated with
    fn modifier(&self) -> DrmModifier {
        DrmModifier::Invalid
    }

    /// Whether every pixel of the buffer is opaque
    fn is_opaque(&self) -> bool {
        !has_alpha(self.format())
    }

    /// Cross-device handle, if the buffer can be exported
    fn dmabuf(&self) -> Option<&DmabufHandle> {
        None
    }
}

/// A CPU-writable dumb buffer with an attached framebuffer.
///
/// Destroys the allocation when dropped.
pub struct DumbSlot {
    control: Arc<dyn DeviceControl>,
    info: DumbBufferInfo,
}

impl fmt::Debug for DumbSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbSlot").field("info", &self.info).finish()
    }
}

impl DumbSlot {
    /// Allocate a new dumb buffer on `control`
    pub fn new(
        control: Arc<dyn DeviceControl>,
        size: Size<u32>,
        format: DrmFourcc,
    ) -> Result<Self, DeviceError> {
        let info = control.create_dumb_buffer(size, format)?;
        Ok(DumbSlot { control, info })
    }

    /// Row pitch in bytes
    pub fn pitch(&self) -> u32 {
        self.info.pitch
    }

    /// Run `f` over the CPU mapping of the buffer
    pub fn write(&self, f: &mut dyn FnMut(&mut [u8])) -> Result<(), DeviceError> {
        self.control.write_dumb_buffer(self.info.id, f)
    }
}

impl ScanoutBuffer for DumbSlot {
    fn framebuffer(&self) -> FramebufferId {
        self.info.fb
    }

    fn size(&self) -> Size<u32> {
        self.info.size
    }

    fn format(&self) -> DrmFourcc {
        self.info.format
    }

    fn modifier(&self) -> DrmModifier {
        DrmModifier::Linear
    }
}

impl Drop for DumbSlot {
    fn drop(&mut self) {
        if let Err(err) = self.control.destroy_dumb_buffer(self.info.id) {
            warn!(buffer = ?self.info.id, ?err, "failed to destroy dumb buffer");
        }
    }
}

/// Allocator for display-local scanout buffers, used by the
/// secondary-GPU blit path.
pub trait ScanoutAllocator: fmt::Debug + Send {
    /// Allocate a scanout-capable buffer in one of the given formats
    fn create_scanout_buffer(
        &self,
        size: Size<u32>,
        formats: &[DrmFourcc],
    ) -> Result<Arc<dyn ScanoutBuffer>, DeviceError>;
}

/// [`ScanoutAllocator`] backed by dumb buffers. The last resort when the
/// display device has no accelerated allocation path.
#[derive(Debug)]
pub struct DumbAllocator {
    control: Arc<dyn DeviceControl>,
}

impl DumbAllocator {
    /// Create a new allocator on `control`
    pub fn new(control: Arc<dyn DeviceControl>) -> Self {
        DumbAllocator { control }
    }
}

impl ScanoutAllocator for DumbAllocator {
    fn create_scanout_buffer(
        &self,
        size: Size<u32>,
        formats: &[DrmFourcc],
    ) -> Result<Arc<dyn ScanoutBuffer>, DeviceError> {
        let mut last_err = None;
        for format in formats {
            match DumbSlot::new(self.control.clone(), size, *format) {
                Ok(slot) => return Ok(Arc::new(slot)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(DeviceError::Unsupported("no formats to allocate from")))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Renderer-owned buffer stand-in for tests.
    #[derive(Debug)]
    pub(crate) struct TestBuffer {
        pub fb: FramebufferId,
        pub size: Size<u32>,
        pub format: DrmFourcc,
    }

    impl TestBuffer {
        pub(crate) fn new(fb: u32) -> Arc<Self> {
            Arc::new(TestBuffer {
                fb: FramebufferId(fb),
                size: Size::new(1920, 1080),
                format: DrmFourcc::Xrgb8888,
            })
        }
    }

    impl ScanoutBuffer for TestBuffer {
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
}
