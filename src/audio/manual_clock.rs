//! Output device driven by a manual clock, for tests.
//!
//! Shared by the unit tests and the integration tests, so it only names
//! items through `super`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{DeviceTime, OnEnded, OutputDevice};

struct PendingBuffer {
    start: DeviceTime,
    len: u64,
    on_ended: Option<OnEnded>,
}

/// Output device whose clock only moves when told to. Buffers "finish" once
/// the clock reaches their end; nothing is rendered.
pub struct ManualClockOutput {
    sample_rate: u32,
    now: AtomicU64,
    pending: Mutex<Vec<PendingBuffer>>,
    starts: Mutex<Vec<(DeviceTime, u64)>>,
}

impl ManualClockOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            now: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock to `time` and run completions of buffers that ended.
    pub fn advance_to(&self, time: DeviceTime) {
        self.now.fetch_max(time, Ordering::AcqRel);
        let now = self.now.load(Ordering::Acquire);
        let ended: Vec<OnEnded> = {
            let mut pending = self.lock_pending();
            let mut ended = Vec::new();
            pending.retain_mut(|b| {
                if b.start + b.len <= now {
                    if let Some(cb) = b.on_ended.take() {
                        ended.push(cb);
                    }
                    false
                } else {
                    true
                }
            });
            ended
        };
        for cb in ended {
            cb();
        }
    }

    pub fn advance_by(&self, frames: u64) {
        self.advance_to(self.current_time() + frames);
    }

    /// `(start, length)` of every buffer scheduled so far, in order.
    pub fn scheduled(&self) -> Vec<(DeviceTime, u64)> {
        match self.starts.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<PendingBuffer>> {
        match self.pending.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OutputDevice for ManualClockOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> DeviceTime {
        self.now.load(Ordering::Acquire)
    }

    fn schedule(&self, samples: Vec<f32>, start_at: DeviceTime, on_ended: OnEnded) {
        // A start in the past begins now, as on the real device.
        let start = start_at.max(self.current_time());
        let len = samples.len() as u64;
        match self.starts.lock() {
            Ok(mut s) => s.push((start_at, len)),
            Err(poisoned) => poisoned.into_inner().push((start_at, len)),
        }
        self.lock_pending().push(PendingBuffer {
            start,
            len,
            on_ended: Some(on_ended),
        });
    }

    fn cancel_all(&self) {
        self.lock_pending().clear();
    }
}
