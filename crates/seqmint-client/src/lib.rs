//! # seqmint client
//!
//! The thin side of the seqmint wire contract: a blocking UDP requester that
//! talks to a pool of agents. Every call stamps its request with a fresh
//! echo token, waits up to the configured timeout for the matching reply and
//! retries against another agent on any failure. Timeouts are reported as
//! their own error variant so callers can meter them separately from
//! protocol errors.
//!
//! ```no_run
//! use seqmint_client::Client;
//!
//! let client = Client::new("192.168.31.21:6200,192.168.31.22:6200", 300, 3, true)?;
//! let id = client.get_uniq_id(0, 0)?;
//! println!("minted {id}");
//! # Ok::<(), seqmint_client::ClientError>(())
//! ```

mod metrics;
pub mod txid;

pub use crate::metrics::{Metrics, MetricsSnapshot};
pub use crate::txid::{TxArg, TxIdError, TxTime};

use rand::Rng;
use seqmint::{
    CivilTime, ErrCode, FRAME_LEN, Frame, FrameError, LABEL_MAX, MsgType, SystemClock, UniqId,
    WallClock,
};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Lowest echo value a client uses; smaller values are reserved so stale
/// traffic from restarted clients is unlikely to correlate.
pub const ECHO_START: u32 = 1000;

/// Ceiling on the configurable retry count.
pub const RETRY_MAX: u8 = 100;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid agent node list: {0}")]
    Parameter(String),
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error("sending request: {0}")]
    Send(#[source] io::Error),
    #[error("short send: {sent}/{FRAME_LEN} bytes")]
    ShortSend { sent: usize },
    #[error("no reply within the timeout")]
    Timeout,
    #[error("receiving reply: {0}")]
    Recv(#[source] io::Error),
    #[error("reply from unexpected peer {from}")]
    UnexpectedPeer { from: SocketAddr },
    #[error("illegal reply: {0}")]
    Illegal(#[from] FrameError),
    #[error("agent reported {0}")]
    Agent(ErrCode),
    #[error("agent reported unknown error code {0}")]
    AgentUnknown(u32),
    #[error("reply type {got} does not answer request type {want}")]
    WrongType { got: u16, want: u16 },
    #[error("reply echo does not match the request")]
    EchoMismatch,
    #[error("agent presented out-of-range label {0}")]
    InvalidLabel(u32),
    #[error("timestamp cannot be decomposed: {0}")]
    Assemble(#[from] seqmint::AssembleError),
    #[error(transparent)]
    TxId(#[from] TxIdError),
}

/// A blocking client over a pool of agent nodes.
///
/// Cheap to share behind an `Arc`: the socket is thread-safe and all mutable
/// state is atomic. When several threads issue requests concurrently, the
/// order they visit agents in is unspecified.
pub struct Client {
    agents: Vec<SocketAddr>,
    socket: UdpSocket,
    retry_times: u8,
    polling: bool,
    echo: AtomicU32,
    next_agent: AtomicUsize,
    metrics: Metrics,
}

impl Client {
    /// Creates a client over a comma-separated `host:port` agent list.
    ///
    /// `timeout_ms` bounds each wait for a reply; `retry_times` is how many
    /// *additional* agents are tried after a failure (0 disables retries);
    /// `polling` selects agents round-robin instead of at random.
    ///
    /// # Errors
    ///
    /// [`ClientError::Parameter`] for an empty or unresolvable node list,
    /// [`ClientError::Socket`] if the local socket cannot be set up.
    pub fn new(
        agent_nodes: &str,
        timeout_ms: u64,
        retry_times: u8,
        polling: bool,
    ) -> Result<Self, ClientError> {
        let mut agents = Vec::new();
        for node in agent_nodes
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            let addr = node
                .to_socket_addrs()
                .map_err(|_| ClientError::Parameter(format!("{node:?} does not resolve")))?
                .next()
                .ok_or_else(|| ClientError::Parameter(format!("{node:?} has no address")))?;
            agents.push(addr);
        }
        if agents.is_empty() {
            return Err(ClientError::Parameter("no agent nodes given".into()));
        }

        let socket = UdpSocket::bind("0.0.0.0:0").map_err(ClientError::Socket)?;
        socket
            .set_read_timeout(Some(Duration::from_millis(timeout_ms.max(1))))
            .map_err(ClientError::Socket)?;

        // Start each client instance at a different echo so parallel clients
        // behind NAT do not correlate each other's replies.
        let echo = ECHO_START + rand::rng().random_range(0..1236);
        Ok(Self {
            agents,
            socket,
            retry_times: retry_times.min(RETRY_MAX),
            polling,
            echo: AtomicU32::new(echo),
            next_agent: AtomicUsize::new(0),
            metrics: Metrics::default(),
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Asks an agent which label it currently holds.
    pub fn get_label(&self) -> Result<u8, ClientError> {
        let reply = self.request(MsgType::RequestLabel, MsgType::ResponseLabel, 0, 0, 0)?;
        self.check_label(reply.value1)
    }

    /// Allocates `num` consecutive raw sequence values (0 means 1) and
    /// returns the first. The agent's `--steps` must be at least `num`;
    /// keeping it at ten times the largest batch is a good rule.
    pub fn get_uniq_seq(&self, num: u16) -> Result<u32, ClientError> {
        let reply = self.request(
            MsgType::RequestUniqSeq,
            MsgType::ResponseUniqSeq,
            u32::from(num),
            0,
            0,
        )?;
        Ok(reply.value1)
    }

    /// Mints one id on the agent. `user` is the caller prefix (0..=63);
    /// `current_seconds` of 0 lets the agent use its own clock. Callers that
    /// can exhaust an hour's sequence space should fold the minute into
    /// `user`.
    pub fn get_uniq_id(&self, user: u8, current_seconds: u64) -> Result<UniqId, ClientError> {
        let reply = self.request(
            MsgType::RequestUniqId,
            MsgType::ResponseUniqId,
            u32::from(user),
            0,
            current_seconds,
        )?;
        Ok(UniqId::from_raw(reply.value3))
    }

    /// Fetches the agent's label together with `num` fresh sequence values.
    pub fn get_label_and_seq(&self, num: u16) -> Result<(u8, u32), ClientError> {
        let reply = self.request(
            MsgType::RequestLabelAndSeq,
            MsgType::ResponseLabelAndSeq,
            u32::from(num),
            0,
            0,
        )?;
        let label = self.check_label(reply.value1)?;
        Ok((label, reply.value2))
    }

    /// Like [`Client::get_uniq_id`], but only label and sequence come from
    /// the agent; the id is packed locally, shifting that work off the
    /// agent.
    pub fn get_local_uniq_id(&self, user: u8, current_seconds: u64) -> Result<UniqId, ClientError> {
        Ok(self.get_local_uniq_ids(1, user, current_seconds)?[0])
    }

    /// Batch variant of [`Client::get_local_uniq_id`]: one round-trip, `num`
    /// locally assembled ids with consecutive sequence values.
    pub fn get_local_uniq_ids(
        &self,
        num: u16,
        user: u8,
        current_seconds: u64,
    ) -> Result<Vec<UniqId>, ClientError> {
        let (label, start) = self.get_label_and_seq(num.max(1))?;
        let seconds = if current_seconds == 0 {
            SystemClock.now_seconds()
        } else {
            current_seconds
        };
        let civil = CivilTime::from_seconds_local(seconds)?;
        Ok((0..u32::from(num.max(1)))
            .map(|offset| {
                UniqId::from_parts(
                    user,
                    label,
                    civil.year,
                    civil.month,
                    civil.day,
                    civil.hour,
                    start.wrapping_add(offset),
                )
            })
            .collect())
    }

    /// Renders one transaction id from a fresh `(label, seq)` pair; see
    /// [`txid`] for the directive table.
    pub fn transaction_id(&self, format: &str, args: &[TxArg<'_>]) -> Result<String, ClientError> {
        Ok(self.transaction_ids(1, format, args)?.remove(0))
    }

    /// Renders `num` transaction ids with consecutive sequence values from a
    /// single agent round-trip.
    pub fn transaction_ids(
        &self,
        num: u16,
        format: &str,
        args: &[TxArg<'_>],
    ) -> Result<Vec<String>, ClientError> {
        let num = num.max(1);
        let (label, start) = self.get_label_and_seq(num)?;
        let time = TxTime::now();
        let mut ids = Vec::with_capacity(usize::from(num));
        for offset in 0..u32::from(num) {
            ids.push(txid::format_transaction_id(
                format,
                args,
                label,
                start.wrapping_add(offset),
                &time,
            )?);
        }
        Ok(ids)
    }

    fn check_label(&self, label: u32) -> Result<u8, ClientError> {
        if (1..=u32::from(LABEL_MAX)).contains(&label) {
            Ok(label as u8)
        } else {
            Metrics::bump(&self.metrics.invalid_label);
            Err(ClientError::InvalidLabel(label))
        }
    }

    /// One logical request: a single echo, up to `retry_times + 1` attempts,
    /// each against the next agent.
    fn request(
        &self,
        kind: MsgType,
        expect: MsgType,
        value1: u32,
        value2: u32,
        value3: u64,
    ) -> Result<Frame, ClientError> {
        let echo = self.next_echo();
        let request = Frame::new(kind, echo, value1, value2, value3);
        let bytes = request.encode();

        let attempts = u32::from(self.retry_times) + 1;
        let mut last_err = ClientError::Timeout;
        for attempt in 0..attempts {
            if attempt > 0 {
                Metrics::bump(&self.metrics.retries);
            }
            let agent = self.pick_agent();
            match self.attempt(&bytes, agent, expect, echo) {
                Ok(reply) => return Ok(reply),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    fn attempt(
        &self,
        bytes: &[u8; FRAME_LEN],
        agent: SocketAddr,
        expect: MsgType,
        echo: u32,
    ) -> Result<Frame, ClientError> {
        let sent = self.socket.send_to(bytes, agent).map_err(|err| {
            Metrics::bump(&self.metrics.send_error);
            ClientError::Send(err)
        })?;
        if sent != FRAME_LEN {
            Metrics::bump(&self.metrics.send_error);
            return Err(ClientError::ShortSend { sent });
        }

        // One byte larger than a frame so oversized replies are detectable.
        let mut buf = [0u8; FRAME_LEN + 1];
        let (len, from) = self.socket.recv_from(&mut buf).map_err(|err| {
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ) {
                Metrics::bump(&self.metrics.receive_timeout);
                ClientError::Timeout
            } else {
                Metrics::bump(&self.metrics.io_error);
                ClientError::Recv(err)
            }
        })?;

        if from != agent {
            Metrics::bump(&self.metrics.unexpected_peer);
            return Err(ClientError::UnexpectedPeer { from });
        }
        let reply = Frame::decode(&buf[..len]).map_err(|err| {
            match err {
                FrameError::SizeMismatch { .. } | FrameError::LenFieldMismatch { .. } => {
                    Metrics::bump(&self.metrics.invalid_size);
                }
                FrameError::VersionMismatch { .. } | FrameError::BadMagic { .. } => {
                    Metrics::bump(&self.metrics.illegal_magic);
                }
            }
            ClientError::Illegal(err)
        })?;

        if reply.kind == MsgType::ResponseError.code() {
            Metrics::bump(&self.metrics.response_error);
            return Err(match ErrCode::from_code(reply.value1) {
                Some(code) => ClientError::Agent(code),
                None => ClientError::AgentUnknown(reply.value1),
            });
        }
        if reply.kind != expect.code() {
            Metrics::bump(&self.metrics.wrong_type);
            return Err(ClientError::WrongType {
                got: reply.kind,
                want: expect.code(),
            });
        }
        if reply.echo != echo {
            Metrics::bump(&self.metrics.mismatch_echo);
            return Err(ClientError::EchoMismatch);
        }
        Ok(reply)
    }

    /// Echo discipline: monotonic, never below [`ECHO_START`], and never a
    /// multiple of ten (those collide most often with hand-crafted test
    /// traffic).
    fn next_echo(&self) -> u32 {
        let mut echo = self.echo.fetch_add(1, Ordering::Relaxed);
        if echo < ECHO_START {
            // Post-wrap (or mis-seeded): jump back into the usable range.
            echo = ECHO_START + rand::rng().random_range(0..1236);
            self.echo.store(echo + 1, Ordering::Relaxed);
        } else if echo.is_multiple_of(10) {
            echo = self.echo.fetch_add(1, Ordering::Relaxed);
        }
        echo
    }

    fn pick_agent(&self) -> SocketAddr {
        if self.agents.len() == 1 {
            return self.agents[0];
        }
        let index = if self.polling {
            self.next_agent.fetch_add(1, Ordering::Relaxed)
        } else {
            rand::rng().random_range(0..self.agents.len())
        };
        self.agents[index % self.agents.len()]
    }
}
