//! Logical display modes.
//!
//! Connectors frequently report the same timings under different names,
//! and the same timings reappear across connectors of one device. The
//! [`ModeCache`] deduplicates them by timing parameters and hands out
//! stable logical ids that survive hotplug rescans.

use std::fmt;

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::control::ModeTimings;

/// Stable logical id of a mode within one device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModeId(pub u32);

impl fmt::Debug for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModeId({})", self.0)
    }
}

/// A deduplicated display mode.
#[derive(Debug, Clone)]
pub struct Mode {
    /// Logical id, stable across rescans
    pub id: ModeId,
    /// Raw timings
    pub timings: ModeTimings,
    /// Display name of the first connector that reported the timings
    pub name: String,
    /// Whether any connector marks this mode preferred
    pub preferred: bool,
}

/// Interns mode timings into stable logical ids.
///
/// Entries are never evicted; a mode that disappears on rescan keeps its
/// id so a later re-appearance resolves identically.
#[derive(Debug, Default)]
pub struct ModeCache {
    by_timings: IndexMap<ModeTimings, ModeId>,
}

impl ModeCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve timings to their logical id, allocating one on first sight.
    ///
    /// The mode name takes no part in the lookup.
    pub fn intern(&mut self, timings: ModeTimings) -> ModeId {
        let next = ModeId(self.by_timings.len() as u32);
        *self.by_timings.entry(timings).or_insert(next)
    }

    /// Number of distinct modes seen so far
    pub fn len(&self) -> usize {
        self.by_timings.len()
    }

    /// Whether no mode was interned yet
    pub fn is_empty(&self) -> bool {
        self.by_timings.is_empty()
    }
}

fn simple_mode(
    clock: u32,
    hdisplay: u16,
    hsync_start: u16,
    hsync_end: u16,
    htotal: u16,
    vdisplay: u16,
    vsync_start: u16,
    vsync_end: u16,
    vtotal: u16,
) -> ModeTimings {
    ModeTimings {
        clock,
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        flags: 0,
    }
}

/// Common timings used when a connector reports no modes of its own
/// (e.g. a VGA display without EDID).
pub static FALLBACK_MODES: Lazy<Vec<(ModeTimings, &'static str)>> = Lazy::new(|| {
    vec![
        (
            simple_mode(25175, 640, 656, 752, 800, 480, 490, 492, 525),
            "640x480",
        ),
        (
            simple_mode(40000, 800, 840, 968, 1056, 600, 601, 605, 628),
            "800x600",
        ),
        (
            simple_mode(65000, 1024, 1048, 1184, 1344, 768, 771, 777, 806),
            "1024x768",
        ),
        (
            simple_mode(108000, 1280, 1328, 1440, 1688, 1024, 1025, 1028, 1066),
            "1280x1024",
        ),
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_1080p() -> ModeTimings {
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

    #[test]
    fn identical_timings_share_an_id() {
        let mut cache = ModeCache::new();
        // Same timings, reported by two connectors under different names,
        // must resolve to the same logical id.
        let a = cache.intern(mode_1080p());
        let b = cache.intern(mode_1080p());
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_timings_get_fresh_ids() {
        let mut cache = ModeCache::new();
        let a = cache.intern(mode_1080p());
        let mut other = mode_1080p();
        other.clock = 74250; // same geometry at half the clock
        let b = cache.intern(other);
        assert_ne!(a, b);
    }

    #[test]
    fn fallback_table_is_sane() {
        for (timings, name) in FALLBACK_MODES.iter() {
            assert!(timings.refresh_mhz() > 50_000, "{} too slow", name);
            assert!(timings.refresh_mhz() < 90_000, "{} too fast", name);
        }
    }
}
