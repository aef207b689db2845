//! Sliding-window bitrate accumulator

use std::collections::VecDeque;

/// Moving average of bytes seen over the last `window_ms`.
///
/// Samples older than the window are pruned on every record; the sample count
/// is also capped so bursts at very high packet rates cannot grow it unbounded.
#[derive(Debug, Clone)]
pub(crate) struct BitrateAccumulator {
    /// Recent samples: (arrival ms, bytes)
    samples: VecDeque<(u64, usize)>,
    window_ms: u64,
    max_samples: usize,
}

impl BitrateAccumulator {
    pub(crate) fn new(window_ms: u64, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window_ms: window_ms.max(1),
            max_samples: max_samples.max(1),
        }
    }

    pub(crate) fn record(&mut self, now_ms: u64, bytes: usize) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back((now_ms, bytes));
        self.prune(now_ms);
    }

    fn prune(&mut self, now_ms: u64) {
        while let Some(&(at, _)) = self.samples.front() {
            if at + self.window_ms <= now_ms {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bits per second averaged over the window ending at `now_ms`
    pub(crate) fn bitrate_bps(&self, now_ms: u64) -> u64 {
        let bytes: u64 = self
            .samples
            .iter()
            .filter(|(at, _)| at + self.window_ms > now_ms)
            .map(|(_, bytes)| *bytes as u64)
            .sum();
        bytes * 8 * 1000 / self.window_ms
    }
}
