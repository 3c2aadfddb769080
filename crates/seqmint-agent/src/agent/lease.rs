//! # Label lease client
//!
//! An agent's label is a lease granted by one of several masters. Steady
//! state is fire-and-forget: once per `interval` the dispatcher sends a
//! `REQUEST_LABEL` carrying the current label to a master picked round-robin
//! and keeps serving; the master's `RESPONSE_LABEL` is handled whenever it
//! arrives on the same socket. Startup is the one synchronous path: without a
//! live lease the agent has nothing to mint with, so acquisition blocks and
//! failure is fatal.

use seqmint::{ErrCode, Frame, LABEL_MAX, MsgType};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// How long the synchronous startup acquisition waits for one reply.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("no master nodes configured")]
    NoMasters,
    #[error("no usable reply from master within {ACQUIRE_TIMEOUT:?}")]
    Timeout,
    #[error("master refused the lease: {0}")]
    Refused(ErrCode),
    #[error("master refused the lease with unknown code {0}")]
    RefusedUnknown(u32),
    #[error("master leased out-of-range label {0}")]
    InvalidLabel(u32),
    #[error("sending lease request: {0}")]
    Send(#[source] io::Error),
    #[error("receiving lease reply: {0}")]
    Recv(#[source] io::Error),
}

/// Lease renewal state. Owned by the dispatcher; only the round-robin index
/// is shared-safe, and the order it yields under concurrent callers is
/// unspecified.
pub struct LeaseClient {
    masters: Vec<SocketAddr>,
    next_master: AtomicUsize,
    interval: u64,
    expire: u64,
    last_rent_send: u64,
    echo: u32,
}

impl LeaseClient {
    pub fn new(masters: Vec<SocketAddr>, interval: u64, expire: u64) -> Self {
        Self {
            masters,
            next_master: AtomicUsize::new(0),
            interval,
            expire,
            last_rent_send: 0,
            echo: 0,
        }
    }

    pub fn has_masters(&self) -> bool {
        !self.masters.is_empty()
    }

    /// Whether the lease is dead: masters are configured and the last
    /// renewal is more than `expire` seconds old. A local-mode agent (no
    /// masters) never expires.
    pub fn label_expired(&self, renewed_at: u64, now: u64) -> bool {
        if self.masters.is_empty() {
            return false;
        }
        let expired = now.saturating_sub(renewed_at) > self.expire;
        if expired {
            tracing::error!(renewed_at, now, expire = self.expire, "label lease expired");
        }
        expired
    }

    /// Sends one renewal if the interval elapsed. Fire and forget: the reply
    /// arrives later through the dispatcher's normal receive path.
    pub async fn maybe_renew(&mut self, socket: &UdpSocket, label: u8, now: u64) {
        if self.masters.is_empty() || now.saturating_sub(self.last_rent_send) <= self.interval {
            return;
        }
        self.renew_now(socket, label, now).await;
    }

    /// Sends one renewal unconditionally (also the recovery path after a
    /// master reported `LABEL_NOT_HOLD`).
    pub async fn renew_now(&mut self, socket: &UdpSocket, label: u8, now: u64) {
        if self.masters.is_empty() {
            return;
        }
        self.last_rent_send = now;
        let master = self.next_master();
        let request = self.rent_request(label);
        match socket.send_to(&request.encode(), master).await {
            Ok(_) => tracing::debug!(%master, label, "sent label renewal"),
            Err(err) => tracing::error!(%master, %err, "sending label renewal failed"),
        }
    }

    /// Synchronously leases a label at startup.
    ///
    /// Sends a `REQUEST_LABEL` carrying `cached_label` (0 when unleased) and
    /// waits up to [`ACQUIRE_TIMEOUT`] for the matching reply, discarding
    /// unrelated datagrams. A `LABEL_NOT_HOLD` refusal clears the cached
    /// label and retries once; anything else fails startup.
    pub async fn acquire(
        &mut self,
        socket: &UdpSocket,
        cached_label: u8,
        now: u64,
    ) -> Result<u8, AcquireError> {
        if self.masters.is_empty() {
            return Err(AcquireError::NoMasters);
        }

        let mut label = cached_label;
        let mut last_err = AcquireError::Timeout;
        for attempt in 0..2 {
            let master = self.next_master();
            let request = self.rent_request(label);
            self.last_rent_send = now;
            socket
                .send_to(&request.encode(), master)
                .await
                .map_err(AcquireError::Send)?;

            match self.await_lease_reply(socket, request.echo).await {
                Ok(leased) => {
                    tracing::info!(label = leased, attempt, %master, "leased label");
                    return Ok(leased);
                }
                Err(AcquireError::Refused(ErrCode::LabelNotHold)) => {
                    // Someone else holds our cached label; ask for a fresh one.
                    tracing::warn!(label, %master, "cached label held elsewhere, clearing");
                    label = 0;
                    last_err = AcquireError::Refused(ErrCode::LabelNotHold);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    fn rent_request(&mut self, label: u8) -> Frame {
        let echo = self.echo;
        self.echo = self.echo.wrapping_add(1);
        Frame::new(MsgType::RequestLabel, echo, u32::from(label), 0, 0)
    }

    async fn await_lease_reply(
        &self,
        socket: &UdpSocket,
        echo: u32,
    ) -> Result<u8, AcquireError> {
        let deadline = tokio::time::Instant::now() + ACQUIRE_TIMEOUT;
        let mut buf = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(AcquireError::Timeout);
            }
            let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => return Err(AcquireError::Timeout),
                Ok(Err(err)) => return Err(AcquireError::Recv(err)),
                Ok(Ok(received)) => received,
            };
            let frame = match Frame::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(%from, %err, "ignoring undecodable datagram during acquisition");
                    continue;
                }
            };
            match MsgType::from_code(frame.kind) {
                Some(MsgType::ResponseError) => {
                    return Err(match ErrCode::from_code(frame.value1) {
                        Some(code) => AcquireError::Refused(code),
                        None => AcquireError::RefusedUnknown(frame.value1),
                    });
                }
                Some(MsgType::ResponseLabel) if frame.echo == echo => {
                    if (1..=u32::from(LABEL_MAX)).contains(&frame.value1) {
                        return Ok(frame.value1 as u8);
                    }
                    return Err(AcquireError::InvalidLabel(frame.value1));
                }
                _ => {
                    // Stale client traffic or a mismatched echo; keep waiting.
                    tracing::debug!(%from, kind = frame.kind, echo = frame.echo, "ignoring datagram during acquisition");
                }
            }
        }
    }

    fn next_master(&self) -> SocketAddr {
        let index = self.next_master.fetch_add(1, Ordering::Relaxed);
        self.masters[index % self.masters.len()]
    }
}
