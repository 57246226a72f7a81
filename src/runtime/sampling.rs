//! Event sampling (`sampling_rate`).
//!
//! Each block descriptor carries a per-thread counter array; the runtime
//! uses a racy "skip N of M" scheme — inaccuracy is accepted in exchange for
//! lock-free fast paths. A relaxed `fetch_add` is cheap enough to sit on the
//! hot path of every traced memory access; losing the occasional count to a
//! race is the deliberate trade.

use std::sync::atomic::{AtomicU32, Ordering};

pub struct SamplingCounters {
    rate: u32,
    counters: Vec<AtomicU32>,
}

impl SamplingCounters {
    /// `rate == 0` disables sampling entirely (every event reports).
    /// `thread_slots` sizes the per-thread counter array to the session's
    /// configured thread-index ceiling.
    pub fn new(rate: u32, thread_slots: usize) -> Self {
        let counters = (0..thread_slots).map(|_| AtomicU32::new(0)).collect();
        SamplingCounters { rate, counters }
    }

    pub fn enabled(&self) -> bool {
        self.rate != 0
    }

    /// Whether the caller on `thread_index` should report this event. Racy
    /// by design: concurrent callers on the same slot may both observe a
    /// multiple of `rate` and both report, or the counter may skip past one,
    /// and neither is treated as a bug.
    pub fn should_report(&self, thread_index: usize) -> bool {
        if !self.enabled() {
            return true;
        }
        let Some(counter) = self.counters.get(thread_index) else { return true };
        let prev = counter.fetch_add(1, Ordering::Relaxed);
        prev % self.rate == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sampling_always_reports() {
        let s = SamplingCounters::new(0, 1);
        for _ in 0..5 {
            assert!(s.should_report(0));
        }
    }

    #[test]
    fn rate_of_two_reports_every_other_call() {
        let s = SamplingCounters::new(2, 1);
        let reports: Vec<bool> = (0..4).map(|_| s.should_report(0)).collect();
        assert_eq!(reports, vec![true, false, true, false]);
    }

    #[test]
    fn out_of_range_thread_index_falls_back_to_reporting() {
        let s = SamplingCounters::new(2, 1);
        assert!(s.should_report(5));
    }
}
