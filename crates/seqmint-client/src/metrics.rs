//! Per-client request metrics.
//!
//! Every [`Client`](crate::Client) owns one [`Metrics`] block; there is no
//! process-wide state. Counters are incremented with relaxed ordering - they
//! are diagnostics, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    /// Sends that failed or wrote fewer bytes than one frame.
    pub send_error: AtomicU64,
    /// Replies whose datagram size was not exactly one frame.
    pub invalid_size: AtomicU64,
    /// Replies from an address other than the queried agent.
    pub unexpected_peer: AtomicU64,
    /// `RESPONSE_ERROR` frames received.
    pub response_error: AtomicU64,
    /// Replies of the wrong response type.
    pub wrong_type: AtomicU64,
    /// Replies whose echo did not match the request.
    pub mismatch_echo: AtomicU64,
    /// Replies failing the magic check.
    pub illegal_magic: AtomicU64,
    /// Label values outside 1..=254.
    pub invalid_label: AtomicU64,
    /// Receive timeouts.
    pub receive_timeout: AtomicU64,
    /// Other socket errors.
    pub io_error: AtomicU64,
    /// Attempts beyond the first across all requests.
    pub retries: AtomicU64,
}

/// A plain copy of all counters, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub send_error: u64,
    pub invalid_size: u64,
    pub unexpected_peer: u64,
    pub response_error: u64,
    pub wrong_type: u64,
    pub mismatch_echo: u64,
    pub illegal_magic: u64,
    pub invalid_label: u64,
    pub receive_timeout: u64,
    pub io_error: u64,
    pub retries: u64,
}

impl Metrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            send_error: self.send_error.load(Ordering::Relaxed),
            invalid_size: self.invalid_size.load(Ordering::Relaxed),
            unexpected_peer: self.unexpected_peer.load(Ordering::Relaxed),
            response_error: self.response_error.load(Ordering::Relaxed),
            wrong_type: self.wrong_type.load(Ordering::Relaxed),
            mismatch_echo: self.mismatch_echo.load(Ordering::Relaxed),
            illegal_magic: self.illegal_magic.load(Ordering::Relaxed),
            invalid_label: self.invalid_label.load(Ordering::Relaxed),
            receive_timeout: self.receive_timeout.load(Ordering::Relaxed),
            io_error: self.io_error.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
