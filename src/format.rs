//! Pixel format helpers for the handful of scanout formats the backend
//! deals with.

use drm_fourcc::DrmFourcc;

/// Bits per pixel of a format, if known
pub fn get_bpp(format: DrmFourcc) -> Option<u32> {
    match format {
        DrmFourcc::Argb8888
        | DrmFourcc::Xrgb8888
        | DrmFourcc::Abgr8888
        | DrmFourcc::Xbgr8888
        | DrmFourcc::Argb2101010
        | DrmFourcc::Xrgb2101010
        | DrmFourcc::Abgr2101010
        | DrmFourcc::Xbgr2101010 => Some(32),
        DrmFourcc::Rgb565 => Some(16),
        DrmFourcc::Rgb888 | DrmFourcc::Bgr888 => Some(24),
        _ => None,
    }
}

/// Color depth of a format, if known
pub fn get_depth(format: DrmFourcc) -> Option<u32> {
    match format {
        DrmFourcc::Argb8888 | DrmFourcc::Abgr8888 => Some(32),
        DrmFourcc::Xrgb8888 | DrmFourcc::Xbgr8888 => Some(24),
        DrmFourcc::Argb2101010
        | DrmFourcc::Xrgb2101010
        | DrmFourcc::Abgr2101010
        | DrmFourcc::Xbgr2101010 => Some(30),
        DrmFourcc::Rgb565 => Some(16),
        DrmFourcc::Rgb888 | DrmFourcc::Bgr888 => Some(24),
        _ => None,
    }
}

/// Whether the format carries an alpha channel
pub fn has_alpha(format: DrmFourcc) -> bool {
    matches!(
        format,
        DrmFourcc::Argb8888 | DrmFourcc::Abgr8888 | DrmFourcc::Argb2101010 | DrmFourcc::Abgr2101010
    )
}

/// The opaque sibling of a format, if one exists
pub fn get_opaque(format: DrmFourcc) -> Option<DrmFourcc> {
    match format {
        DrmFourcc::Argb8888 => Some(DrmFourcc::Xrgb8888),
        DrmFourcc::Abgr8888 => Some(DrmFourcc::Xbgr8888),
        DrmFourcc::Argb2101010 => Some(DrmFourcc::Xrgb2101010),
        DrmFourcc::Abgr2101010 => Some(DrmFourcc::Xbgr2101010),
        _ => None,
    }
}

/// Formats preferred for CPU readback, cheapest conversion first.
pub const READBACK_PREFERENCE: &[DrmFourcc] = &[DrmFourcc::Xrgb8888, DrmFourcc::Xbgr8888];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_strips_alpha() {
        assert_eq!(get_opaque(DrmFourcc::Argb8888), Some(DrmFourcc::Xrgb8888));
        assert!(!has_alpha(DrmFourcc::Xrgb8888));
        assert!(has_alpha(DrmFourcc::Argb8888));
    }
}
