//! # Request dispatcher
//!
//! A single task owns the UDP socket and every piece of sequence and label
//! state, so the hot path needs no locks. Each loop iteration waits up to
//! ten seconds for the socket to become readable, refreshes the cached
//! wall-clock second, gives the lease a chance to renew, then drains the
//! socket with bounded non-blocking receives.
//!
//! One socket carries both roles: client requests (answered in place) and
//! master replies to earlier renewals (absorbed into the lease state, never
//! answered).

use super::lease::LeaseClient;
use super::store::SequenceStore;
use seqmint::{AssembleError, ErrCode, Frame, IdAssembler, LABEL_MAX, MsgType, WallClock};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Upper bound on datagrams drained per wakeup, so a flood cannot starve
/// lease renewal.
pub const MAX_DRAIN: usize = 10_000;

/// How long one iteration waits for socket readability.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive buffer; larger than a frame so oversized datagrams are seen at
/// their true length and dropped instead of being silently truncated.
const RECV_BUF_LEN: usize = 256;

pub struct Dispatcher<C> {
    socket: UdpSocket,
    store: SequenceStore,
    lease: LeaseClient,
    assembler: IdAssembler,
    clock: C,
    now: u64,
}

impl<C: WallClock> Dispatcher<C> {
    pub fn new(socket: UdpSocket, store: SequenceStore, lease: LeaseClient, clock: C) -> Self {
        let now = clock.now_seconds();
        Self {
            socket,
            store,
            lease,
            assembler: IdAssembler::new(),
            clock,
            now,
        }
    }

    /// Runs the event loop until `shutdown` fires.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                ready = tokio::time::timeout(POLL_TIMEOUT, self.socket.readable()) => {
                    if let Ok(Err(err)) = ready {
                        tracing::error!(%err, "waiting for socket readability failed");
                    }
                }
            }

            // Second granularity is enough for everything time-based here.
            self.now = self.clock.now_seconds();
            let label = self.store.label();
            self.lease.maybe_renew(&self.socket, label, self.now).await;

            for _ in 0..MAX_DRAIN {
                match self.socket.try_recv_from(&mut buf) {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        tracing::error!(%err, "receive failed");
                        break;
                    }
                }
            }
        }
        tracing::info!("dispatcher stopped");
    }

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                // Illegal datagrams never get a reply.
                tracing::error!(%from, %err, "dropping datagram");
                return;
            }
        };
        tracing::debug!(%from, kind = frame.kind, echo = frame.echo, "received");

        let reply = match MsgType::from_code(frame.kind) {
            Some(MsgType::RequestLabel) => self.prepare_label(&frame),
            Some(MsgType::RequestUniqId) => self.prepare_uniq_id(&frame),
            Some(MsgType::RequestUniqSeq) => self.prepare_uniq_seq(&frame),
            Some(MsgType::RequestLabelAndSeq) => self.prepare_label_and_seq(&frame),
            Some(MsgType::ResponseLabel) => {
                self.on_master_label(&frame, from);
                return;
            }
            Some(MsgType::ResponseError) => {
                self.on_master_error(&frame, from).await;
                return;
            }
            _ => {
                tracing::error!(%from, kind = frame.kind, "invalid message type");
                Err(ErrCode::InvalidType)
            }
        };

        let reply = reply.unwrap_or_else(|code| {
            Frame::new(MsgType::ResponseError, frame.echo, code.code(), 0, 0)
        });
        if let Err(err) = self.socket.send_to(&reply.encode(), from).await {
            tracing::error!(%from, %err, "sending reply failed");
        }
    }

    /// The gate every id-issuing request passes first: an expired lease wins
    /// over a latched store, and both win over doing any allocation work.
    fn gate(&self) -> Result<(), ErrCode> {
        if self
            .lease
            .label_expired(self.store.block().timestamp, self.now)
        {
            Err(ErrCode::LabelExpired)
        } else if self.store.io_error() {
            Err(ErrCode::StoreSeq)
        } else {
            Ok(())
        }
    }

    fn prepare_label(&mut self, request: &Frame) -> Result<Frame, ErrCode> {
        self.gate()?;
        Ok(Frame::new(
            MsgType::ResponseLabel,
            request.echo,
            u32::from(self.store.label()),
            0,
            0,
        ))
    }

    fn prepare_uniq_seq(&mut self, request: &Frame) -> Result<Frame, ErrCode> {
        self.gate()?;
        let count = request.value1 as u16;
        let start = self.store.allocate(count).map_err(|err| {
            tracing::error!(%err, "sequence allocation failed");
            ErrCode::StoreSeq
        })?;
        Ok(Frame::new(
            MsgType::ResponseUniqSeq,
            request.echo,
            start,
            0,
            0,
        ))
    }

    fn prepare_uniq_id(&mut self, request: &Frame) -> Result<Frame, ErrCode> {
        self.gate()?;
        let seq = self.store.allocate(1).map_err(|err| {
            tracing::error!(%err, "sequence allocation failed");
            ErrCode::StoreSeq
        })?;
        let user = request.value1 as u8;
        let seconds = if request.value3 == 0 {
            self.now
        } else {
            request.value3
        };
        let id = self
            .assembler
            .assemble(user, self.store.label(), seq, seconds)
            .map_err(|err| {
                tracing::error!(%err, "id assembly failed");
                match err {
                    AssembleError::Overflow => ErrCode::Overflow,
                    _ => ErrCode::Parameter,
                }
            })?;
        Ok(Frame::new(
            MsgType::ResponseUniqId,
            request.echo,
            0,
            0,
            id.to_raw(),
        ))
    }

    fn prepare_label_and_seq(&mut self, request: &Frame) -> Result<Frame, ErrCode> {
        self.gate()?;
        let count = request.value1 as u16;
        let start = self.store.allocate(count).map_err(|err| {
            tracing::error!(%err, "sequence allocation failed");
            ErrCode::StoreSeq
        })?;
        Ok(Frame::new(
            MsgType::ResponseLabelAndSeq,
            request.echo,
            u32::from(self.store.label()),
            start,
            0,
        ))
    }

    /// A master answered an earlier renewal: refresh the lease, rewriting
    /// the block when the label itself changed.
    fn on_master_label(&mut self, response: &Frame, from: SocketAddr) {
        tracing::info!(%from, label = response.value1, "label renewal response");
        if !(1..=u32::from(LABEL_MAX)).contains(&response.value1) {
            tracing::error!(%from, label = response.value1, "ignoring out-of-range label");
            return;
        }
        if let Err(err) = self.store.renew_label(response.value1 as u8, self.now) {
            tracing::error!(%err, "persisting renewed label failed");
        }
    }

    async fn on_master_error(&mut self, response: &Frame, from: SocketAddr) {
        tracing::error!(%from, code = response.value1, "error response from master");
        if response.value1 == ErrCode::LabelNotHold.code() {
            // Our label belongs to someone else now; drop it and re-lease.
            self.store.clear_label();
            self.lease.renew_now(&self.socket, 0, self.now).await;
        }
    }
}
