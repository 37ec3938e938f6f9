//! Process-wide memory semaphore (spec §4.3).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use crate::availability::{AvailabilityReason, AvailabilityTracker};
use crate::semaphore::Semaphore;

/// Injectable probe wrapping the one piece of process state spec §9 singles
/// out as the exception to "no global mutable state" — kept behind a
/// `Fn` so tests can supply a deterministic value.
pub type MemoryProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Default probe: reads `MemAvailable` from `/proc/meminfo` on Linux; a
/// fixed fallback constant elsewhere. No new dependency is justified for a
/// single optional syscall wrapper (SPEC_FULL §4.3).
pub fn default_memory_probe() -> MemoryProbe {
    Arc::new(|| read_proc_meminfo_kb().unwrap_or(8 * 1024 * 1024))
}

#[cfg(target_os = "linux")]
fn read_proc_meminfo_kb() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            return digits.parse().ok();
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_proc_meminfo_kb() -> Option<u64> {
    None
}

fn clamp(value: u64, min: u64, max: u64) -> u64 {
    value.clamp(min, max)
}

pub struct MemoryManager {
    semaphore: Arc<Semaphore>,
    probe: MemoryProbe,
    free_ratio: f64,
    min_capacity: u64,
    max_capacity: u64,
}

impl MemoryManager {
    pub fn new(probe: MemoryProbe, free_ratio: f64, min_capacity: u64, max_capacity: u64) -> Self {
        let initial = Self::compute_capacity(&probe, free_ratio, min_capacity, max_capacity);
        MemoryManager {
            semaphore: Arc::new(Semaphore::new(initial)),
            probe,
            free_ratio,
            min_capacity,
            max_capacity,
        }
    }

    fn compute_capacity(probe: &MemoryProbe, free_ratio: f64, min_capacity: u64, max_capacity: u64) -> u64 {
        let available_kb = probe();
        let scaled = (available_kb as f64 * free_ratio) as u64;
        clamp(scaled, min_capacity, max_capacity)
    }

    /// Recomputes the target capacity and resizes if it differs, emitting
    /// an availability change with reason `memory` (spec §4.3, §4.5).
    #[instrument(level = "debug", skip(self, tracker))]
    pub fn recalculate(&self, tracker: &AvailabilityTracker) {
        let target = Self::compute_capacity(&self.probe, self.free_ratio, self.min_capacity, self.max_capacity);
        if target != self.semaphore.max() {
            info!(new_max = target, old_max = self.semaphore.max(), "resizing memory semaphore");
            self.semaphore.resize(target);
            tracker.notify_mutation(AvailabilityReason::Memory);
        }
    }

    /// `0` ⇒ skip (job type declared no memory estimate).
    pub async fn acquire(&self, estimated_kb: u64) {
        if estimated_kb == 0 {
            return;
        }
        self.semaphore.acquire(estimated_kb).await;
    }

    pub fn release(&self, estimated_kb: u64) {
        if estimated_kb == 0 {
            return;
        }
        self.semaphore.release(estimated_kb);
    }

    pub fn available_kb(&self) -> u64 {
        self.semaphore.available()
    }

    pub fn max_kb(&self) -> u64 {
        self.semaphore.max()
    }

    pub fn has_capacity(&self, estimated_kb: u64) -> bool {
        estimated_kb == 0 || self.semaphore.has_capacity(estimated_kb)
    }

    /// Spawns the periodic recalculation loop (spec §4.3
    /// `recalculation_interval_ms`). The returned handle should be aborted
    /// on `RateLimiter::stop()`.
    pub fn spawn_recalculation_loop(
        self: &Arc<Self>,
        tracker: Arc<AvailabilityTracker>,
        interval_ms: u64,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            loop {
                ticker.tick().await;
                this.recalculate(&tracker);
            }
        })
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("available_kb", &self.available_kb())
            .field("max_kb", &self.max_kb())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::AvailabilityTracker;

    fn fixed_probe(kb: u64) -> MemoryProbe {
        Arc::new(move || kb)
    }

    #[test]
    fn clamps_to_min_and_max() {
        let mm = MemoryManager::new(fixed_probe(100), 1.0, 50, 80);
        assert_eq!(mm.max_kb(), 80);
        let mm = MemoryManager::new(fixed_probe(10), 1.0, 50, 80);
        assert_eq!(mm.max_kb(), 50);
    }

    #[tokio::test]
    async fn acquire_zero_is_noop() {
        let mm = MemoryManager::new(fixed_probe(1000), 1.0, 1, 1000);
        mm.acquire(0).await;
        assert_eq!(mm.available_kb(), 1000);
    }

    #[tokio::test]
    async fn acquire_and_release_round_trip() {
        let mm = MemoryManager::new(fixed_probe(1000), 1.0, 1, 1000);
        mm.acquire(400).await;
        assert_eq!(mm.available_kb(), 600);
        mm.release(400);
        assert_eq!(mm.available_kb(), 1000);
    }

    #[test]
    fn recalculate_resizes_when_probe_reading_changes() {
        use std::sync::atomic::{AtomicU64, Ordering};
        let reading = Arc::new(AtomicU64::new(1000));
        let probe: MemoryProbe = {
            let reading = reading.clone();
            Arc::new(move || reading.load(Ordering::SeqCst))
        };

        let tracker = AvailabilityTracker::new();
        let mm = MemoryManager::new(probe, 1.0, 1, 5000);
        assert_eq!(mm.max_kb(), 1000);

        reading.store(3000, Ordering::SeqCst);
        mm.recalculate(&tracker);
        assert_eq!(mm.max_kb(), 3000);
    }
}
