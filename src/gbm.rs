//! gbm-backed scanout buffer allocation.
//!
//! Used by the cross-GPU blit path to allocate display-local buffers
//! the display GPU's own context renders into.

use std::fmt;
use std::sync::Arc;

use drm::buffer::PlanarBuffer;
use drm_fourcc::{DrmFourcc, DrmModifier};
use gbm::BufferObjectFlags;
use tracing::warn;

use crate::buffer::{ScanoutAllocator, ScanoutBuffer};
use crate::control::fd::DrmDeviceFd;
use crate::control::{DeviceControl, DeviceError, FramebufferId};
use crate::utils::Size;

/// A gbm buffer object with an attached framebuffer.
pub struct GbmScanoutBuffer {
    device: DrmDeviceFd,
    // keeps the allocation alive as long as the kernel may scan it out
    _bo: gbm::BufferObject<()>,
    fb: FramebufferId,
    size: Size<u32>,
    format: DrmFourcc,
    modifier: DrmModifier,
}

impl fmt::Debug for GbmScanoutBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmScanoutBuffer")
            .field("fb", &self.fb)
            .field("size", &self.size)
            .field("format", &self.format)
            .finish()
    }
}

impl ScanoutBuffer for GbmScanoutBuffer {
    fn framebuffer(&self) -> FramebufferId {
        self.fb
    }

    fn size(&self) -> Size<u32> {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> DrmModifier {
        self.modifier
    }
}

impl Drop for GbmScanoutBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_framebuffer(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy framebuffer");
        }
    }
}

/// [`ScanoutAllocator`] allocating through gbm.
pub struct GbmAllocator {
    device: DrmDeviceFd,
}

impl fmt::Debug for GbmAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmAllocator").finish_non_exhaustive()
    }
}

impl GbmAllocator {
    /// Create an allocator on `device`. Fails when the node has no gbm
    /// device.
    pub fn new(device: &DrmDeviceFd) -> Result<Self, DeviceError> {
        if device.gbm().is_none() {
            return Err(DeviceError::Unsupported("device has no gbm support"));
        }
        Ok(GbmAllocator {
            device: device.clone(),
        })
    }
}

impl ScanoutAllocator for GbmAllocator {
    fn create_scanout_buffer(
        &self,
        size: Size<u32>,
        formats: &[DrmFourcc],
    ) -> Result<Arc<dyn ScanoutBuffer>, DeviceError> {
        let gbm = self
            .device
            .gbm()
            .ok_or(DeviceError::Unsupported("device has no gbm support"))?;

        let mut last_err = None;
        for format in formats {
            let bo: Result<gbm::BufferObject<()>, _> = gbm.create_buffer_object(
                size.w,
                size.h,
                *format,
                BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
            );
            let bo = match bo {
                Ok(bo) => bo,
                Err(err) => {
                    last_err = Some(DeviceError::Access {
                        errmsg: "Failed to allocate gbm buffer",
                        dev: self.device.dev_path(),
                        source: err,
                    });
                    continue;
                }
            };

            let modifier = bo.modifier().unwrap_or(DrmModifier::Invalid);
            match self.device.register_bo_framebuffer(&bo) {
                Ok(fb) => {
                    return Ok(Arc::new(GbmScanoutBuffer {
                        device: self.device.clone(),
                        format: PlanarBuffer::format(&bo),
                        _bo: bo,
                        fb,
                        size,
                        modifier,
                    }))
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(DeviceError::Unsupported("no formats to allocate from")))
    }
}
