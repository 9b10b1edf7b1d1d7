//! Lost-sample estimation from device timestamps.
//!
//! Each packet carries a 16-bit millisecond timestamp that wraps every
//! 65536 ms. Comparing the gap between consecutive packets of a channel with
//! the time its rows should span gives an estimate of dropped samples. The
//! estimate is only reported; nothing is retransmitted or gap-filled.

use std::collections::HashMap;

use log::warn;

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    last_timestamp: Option<u16>,
    emitted: u64,
}

/// Outcome of observing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuityReport {
    /// Index of the block's first sample since monitoring (re)started.
    pub first_sample: u64,
    /// Estimated samples lost before this block. Negative when the block
    /// arrived earlier than expected.
    pub lost_samples: i64,
}

/// Estimate lost samples between two packets.
///
/// `rows` is the row count of the current packet and `rate` the nominal
/// sample rate in Hz. Deviations of up to one sample period count as zero.
pub fn estimate_lost(previous: u16, current: u16, rows: usize, rate: u16) -> i64 {
    if rate == 0 {
        return 0;
    }
    let period_ms = 1000.0 / f64::from(rate);
    let expected_ms = rows as f64 * period_ms;
    let observed_ms = f64::from(current.wrapping_sub(previous));
    let drift = observed_ms - expected_ms;
    if drift.abs() > period_ms {
        (drift / period_ms).round() as i64
    } else {
        0
    }
}

/// Per-channel timestamp tracking.
#[derive(Debug, Default)]
pub struct ContinuityMonitor {
    channels: HashMap<String, ChannelState>,
}

impl ContinuityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet of `rows` samples stamped `timestamp`.
    pub fn observe(&mut self, channel: &str, timestamp: u16, rows: usize, rate: u16) -> ContinuityReport {
        let state = self.channels.entry(channel.to_string()).or_default();

        let lost_samples = state
            .last_timestamp
            .map_or(0, |previous| estimate_lost(previous, timestamp, rows, rate));
        if lost_samples != 0 {
            warn!("{channel}: detected ~{lost_samples} lost samples");
        }

        let report = ContinuityReport {
            first_sample: state.emitted,
            lost_samples,
        };
        state.last_timestamp = Some(timestamp);
        state.emitted += rows as u64;
        report
    }

    /// Samples emitted for `channel` since the last reset.
    pub fn emitted(&self, channel: &str) -> u64 {
        self.channels.get(channel).map_or(0, |s| s.emitted)
    }

    /// Forget all history, e.g. when a new recording starts.
    pub fn reset(&mut self) {
        self.channels.clear();
    }

    pub fn reset_channel(&mut self, channel: &str) {
        self.channels.remove(channel);
    }
}
