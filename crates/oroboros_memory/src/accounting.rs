//! # Usage Accounting
//!
//! Global byte counters maintained by every allocation path.
//!
//! - **used**: logical bytes handed out to callers
//! - **physical**: bytes obtained from the system allocator, overhead included
//!
//! Both carry peaks. Used bytes are additionally bucketed by tag prefix
//! (`W3D_`, `STL_`, ...), with everything unmatched landing in `Misc`.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Name of the catch-all usage bucket.
pub const MISC_CATEGORY: &str = "Misc";

/// Point-in-time copy of the global counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Logical bytes in use.
    pub used_bytes: usize,
    /// Physical bytes in use.
    pub physical_bytes: usize,
    /// Highest logical usage seen.
    pub peak_used_bytes: usize,
    /// Highest physical usage seen.
    pub peak_physical_bytes: usize,
}

/// Usage of one tag-prefix bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryUsage {
    /// Tag prefix, or `Misc`.
    pub prefix: String,
    /// Logical bytes in use.
    pub used_bytes: usize,
    /// Highest logical usage seen.
    pub peak_used_bytes: usize,
}

#[derive(Debug)]
struct CategoryCounter {
    prefix: String,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl CategoryCounter {
    fn new(prefix: String) -> Self {
        Self {
            prefix,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

/// Lock-free counters. Callers already hold the allocation-path lock that
/// orders their updates.
#[derive(Debug)]
pub(crate) struct UsageTotals {
    used: AtomicUsize,
    physical: AtomicUsize,
    peak_used: AtomicUsize,
    peak_physical: AtomicUsize,
    /// Index 0 is the catch-all.
    categories: Vec<CategoryCounter>,
}

#[inline]
fn apply(counter: &AtomicUsize, peak: &AtomicUsize, delta: isize) {
    if delta >= 0 {
        let delta = delta.unsigned_abs();
        let now = counter.fetch_add(delta, Ordering::Relaxed) + delta;
        peak.fetch_max(now, Ordering::Relaxed);
    } else {
        counter.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
    }
}

impl UsageTotals {
    pub(crate) fn new(prefixes: &[String]) -> Self {
        let categories = std::iter::once(MISC_CATEGORY.to_string())
            .chain(prefixes.iter().cloned())
            .map(CategoryCounter::new)
            .collect();
        Self {
            used: AtomicUsize::new(0),
            physical: AtomicUsize::new(0),
            peak_used: AtomicUsize::new(0),
            peak_physical: AtomicUsize::new(0),
            categories,
        }
    }

    fn category_for(&self, tag: &str) -> &CategoryCounter {
        self.categories
            .iter()
            .skip(1)
            .find(|category| tag.starts_with(category.prefix.as_str()))
            .unwrap_or(&self.categories[0])
    }

    /// Applies signed deltas to the global and per-category counters.
    pub(crate) fn adjust(&self, tag: &str, used_delta: isize, physical_delta: isize) {
        if used_delta != 0 {
            apply(&self.used, &self.peak_used, used_delta);
            let category = self.category_for(tag);
            apply(&category.used, &category.peak, used_delta);
        }
        if physical_delta != 0 {
            apply(&self.physical, &self.peak_physical, physical_delta);
        }
    }

    pub(crate) fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            used_bytes: self.used.load(Ordering::Relaxed),
            physical_bytes: self.physical.load(Ordering::Relaxed),
            peak_used_bytes: self.peak_used.load(Ordering::Relaxed),
            peak_physical_bytes: self.peak_physical.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn categories(&self) -> Vec<CategoryUsage> {
        self.categories
            .iter()
            .map(|category| CategoryUsage {
                prefix: category.prefix.clone(),
                used_bytes: category.used.load(Ordering::Relaxed),
                peak_used_bytes: category.peak.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Replaces current usage with recounted values after a reset.
    ///
    /// Peaks are kept; category usage restarts from zero.
    pub(crate) fn rederive(&self, used: usize, physical: usize) {
        self.used.store(used, Ordering::Relaxed);
        self.physical.store(physical, Ordering::Relaxed);
        self.peak_used.fetch_max(used, Ordering::Relaxed);
        self.peak_physical.fetch_max(physical, Ordering::Relaxed);
        for category in &self.categories {
            category.used.store(0, Ordering::Relaxed);
        }
    }
}

/// Converts a byte count into a signed delta.
#[inline]
pub(crate) fn signed(bytes: usize) -> isize {
    isize::try_from(bytes).unwrap_or(isize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals() -> UsageTotals {
        UsageTotals::new(&["W3D_".to_string(), "STL_".to_string()])
    }

    #[test]
    fn test_adjust_tracks_peaks() {
        let totals = totals();
        totals.adjust("W3D_Mesh", 100, 200);
        totals.adjust("W3D_Mesh", -60, -50);

        let snapshot = totals.snapshot();
        assert_eq!(snapshot.used_bytes, 40);
        assert_eq!(snapshot.physical_bytes, 150);
        assert_eq!(snapshot.peak_used_bytes, 100);
        assert_eq!(snapshot.peak_physical_bytes, 200);
    }

    #[test]
    fn test_categories_by_prefix() {
        let totals = totals();
        totals.adjust("STL_vector", 32, 0);
        totals.adjust("global operator new", 16, 0);

        let categories = totals.categories();
        assert_eq!(categories[0].prefix, MISC_CATEGORY);
        assert_eq!(categories[0].used_bytes, 16);
        assert_eq!(categories[1].used_bytes, 0);
        assert_eq!(categories[2].prefix, "STL_");
        assert_eq!(categories[2].used_bytes, 32);
    }

    #[test]
    fn test_rederive_keeps_peaks() {
        let totals = totals();
        totals.adjust("x", 500, 1000);
        totals.rederive(0, 400);

        let snapshot = totals.snapshot();
        assert_eq!(snapshot.used_bytes, 0);
        assert_eq!(snapshot.physical_bytes, 400);
        assert_eq!(snapshot.peak_used_bytes, 500);
        assert_eq!(totals.categories()[0].used_bytes, 0);
    }
}
