//! End-to-end dispatcher tests over a real socket pair.
//!
//! Each test runs a full agent (dispatcher + store + lease + fsync thread)
//! on a loopback socket with a controllable clock, and drives it with raw
//! wire frames or the client library.

use seqmint::{CivilTime, ErrCode, Frame, MsgType, SeqBlock, UniqId, WallClock};
use seqmint_agent::agent::dispatch::Dispatcher;
use seqmint_agent::agent::lease::LeaseClient;
use seqmint_agent::agent::store::OpenStore;
use seqmint_agent::agent::sync::{SyncShared, SyncTask};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const T0: u64 = 1_700_000_000;

#[derive(Clone)]
struct MockClock(Arc<AtomicU64>);

impl MockClock {
    fn new(seconds: u64) -> Self {
        Self(Arc::new(AtomicU64::new(seconds)))
    }

    fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl WallClock for MockClock {
    fn now_seconds(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

struct Harness {
    addr: SocketAddr,
    clock: MockClock,
    seq_path: PathBuf,
    shutdown: CancellationToken,
    dispatcher: tokio::task::JoinHandle<()>,
    sync: SyncTask,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn spawn(label: u8, steps: u32, masters: Vec<SocketAddr>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let seq_path = dir.path().join(".uniq.seq");
        let open = OpenStore::open(&seq_path).unwrap();
        let shared = SyncShared::new();
        let store = open
            .activate(label, T0, steps, Arc::clone(&shared))
            .unwrap();
        let sync = SyncTask::spawn(store.file(), shared);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let clock = MockClock::new(T0);
        let lease = LeaseClient::new(masters, 600, 3600);
        let shutdown = CancellationToken::new();

        let mut dispatcher = Dispatcher::new(socket, store, lease, clock.clone());
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(token).await });

        Self {
            addr,
            clock,
            seq_path,
            shutdown,
            dispatcher: handle,
            sync,
            _dir: dir,
        }
    }

    fn disk_block(&self) -> SeqBlock {
        SeqBlock::decode(&std::fs::read(&self.seq_path).unwrap()).unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.dispatcher.await.unwrap();
        self.sync.stop();
    }
}

/// A raw wire-frame client with its own echo counter.
struct RawClient {
    socket: UdpSocket,
    agent: SocketAddr,
    echo: u32,
}

impl RawClient {
    async fn connect(agent: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            socket,
            agent,
            echo: 5000,
        }
    }

    /// Sends one request and awaits its reply, asserting echo correlation.
    async fn call(&mut self, kind: MsgType, value1: u32, value3: u64) -> Frame {
        self.echo += 1;
        let request = Frame::new(kind, self.echo, value1, 0, value3);
        self.socket
            .send_to(&request.encode(), self.agent)
            .await
            .unwrap();
        let reply = self.recv().await.expect("agent did not reply");
        assert_eq!(reply.echo, self.echo, "reply echo must match the request");
        reply
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.socket.send_to(bytes, self.agent).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 64];
        match timeout(Duration::from_millis(500), self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(Frame::decode(&buf[..len]).unwrap()),
            _ => None,
        }
    }

    async fn uniq_seq(&mut self, num: u16) -> u32 {
        let reply = self.call(MsgType::RequestUniqSeq, u32::from(num), 0).await;
        assert_eq!(reply.kind, MsgType::ResponseUniqSeq.code());
        reply.value1
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequences_issue_from_steps_and_rewrite_at_the_ceiling() {
    let agent = Harness::spawn(7, 100, Vec::new()).await;
    let mut client = RawClient::connect(agent.addr).await;

    // Fresh store with --steps 100: the first value issued is 100 and the
    // first allocation pushes the persisted ceiling a reservation ahead.
    assert_eq!(client.uniq_seq(1).await, 100);
    assert_eq!(agent.disk_block().sequence, 200);

    for expected in 101..200 {
        assert_eq!(client.uniq_seq(1).await, expected);
    }

    // The 101st request crosses the ceiling: observable block rewrite.
    assert_eq!(client.uniq_seq(1).await, 200);
    assert_eq!(agent.disk_block().sequence, 300);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn minted_id_packs_the_request_fields() {
    let agent = Harness::spawn(7, 100, Vec::new()).await;
    let mut client = RawClient::connect(agent.addr).await;

    let reply = client.call(MsgType::RequestUniqId, 5, T0).await;
    assert_eq!(reply.kind, MsgType::ResponseUniqId.code());

    let id = UniqId::from_raw(reply.value3);
    let civil = CivilTime::from_seconds_local(T0).unwrap();
    assert_eq!(id.user(), 5);
    assert_eq!(id.label(), 7);
    assert_eq!(id.year(), civil.year);
    assert_eq!(id.month(), civil.month);
    assert_eq!(id.day(), civil.day);
    assert_eq!(id.hour(), civil.hour);
    assert!(id.seq() >= 100);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_seconds_means_the_agent_clock() {
    let agent = Harness::spawn(7, 100, Vec::new()).await;
    let mut client = RawClient::connect(agent.addr).await;

    let reply = client.call(MsgType::RequestUniqId, 0, 0).await;
    let id = UniqId::from_raw(reply.value3);
    let civil = CivilTime::from_seconds_local(T0).unwrap();
    assert_eq!(id.hour(), civil.hour);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_lease_gates_every_issuing_request() {
    // A master is configured but never answers renewals.
    let silent_master = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let agent = Harness::spawn(7, 100, vec![silent_master.local_addr().unwrap()]).await;
    let mut client = RawClient::connect(agent.addr).await;

    // Lease starts fresh (renewed at T0), so service works.
    assert_eq!(client.uniq_seq(1).await, 100);

    agent.clock.advance(3601);
    for kind in [
        MsgType::RequestUniqId,
        MsgType::RequestUniqSeq,
        MsgType::RequestLabelAndSeq,
        MsgType::RequestLabel,
    ] {
        let reply = client.call(kind, 1, 0).await;
        assert_eq!(reply.kind, MsgType::ResponseError.code());
        assert_eq!(reply.value1, ErrCode::LabelExpired.code());
    }

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_mode_never_expires() {
    let agent = Harness::spawn(7, 100, Vec::new()).await;
    let mut client = RawClient::connect(agent.addr).await;

    agent.clock.advance(100 * 3600);
    assert_eq!(client.uniq_seq(1).await, 100);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupted_magic_draws_no_reply() {
    let agent = Harness::spawn(7, 100, Vec::new()).await;
    let mut client = RawClient::connect(agent.addr).await;

    let mut frame = Frame::new(MsgType::RequestUniqSeq, 9999, 1, 0, 0);
    frame.magic ^= 0xDEAD;
    client.send_raw(&frame.encode()).await;
    assert!(client.recv().await.is_none(), "corrupt frame must be dropped");

    // Undersized and oversized datagrams are dropped the same way.
    client.send_raw(&[0u8; 10]).await;
    assert!(client.recv().await.is_none());
    client.send_raw(&[0u8; 40]).await;
    assert!(client.recv().await.is_none());

    // The agent is still alive and still answers well-formed frames.
    assert_eq!(client.uniq_seq(1).await, 100);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_and_seq_reserves_the_full_batch() {
    let agent = Harness::spawn(7, 2000, Vec::new()).await;
    let mut client = RawClient::connect(agent.addr).await;

    let reply = client.call(MsgType::RequestLabelAndSeq, 1000, 0).await;
    assert_eq!(reply.kind, MsgType::ResponseLabelAndSeq.code());
    assert_eq!(reply.value1, 7);
    let start = reply.value2;
    assert_eq!(start, 2000);

    // The whole range [start, start + 1000) belongs to the caller: the next
    // allocation starts past it.
    assert_eq!(client.uniq_seq(1).await, start + 1000);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_type_gets_invalid_type() {
    let agent = Harness::spawn(7, 100, Vec::new()).await;
    let mut client = RawClient::connect(agent.addr).await;

    let mut frame = Frame::new(MsgType::RequestLabel, 4242, 0, 0, 0);
    frame.kind = 77;
    frame.update_magic();
    client.send_raw(&frame.encode()).await;
    let reply = client.recv().await.expect("well-formed frames get replies");
    assert_eq!(reply.kind, MsgType::ResponseError.code());
    assert_eq!(reply.value1, ErrCode::InvalidType.code());
    assert_eq!(reply.echo, 4242);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn master_renewal_updates_label_and_disk() {
    let master = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let master_addr = master.local_addr().unwrap();
    let agent = Harness::spawn(7, 100, vec![master_addr]).await;
    let mut client = RawClient::connect(agent.addr).await;

    // Wake the dispatcher; its next iteration sends the periodic renewal.
    client.uniq_seq(1).await;
    let mut buf = [0u8; 64];
    let (len, agent_from) = timeout(Duration::from_secs(5), master.recv_from(&mut buf))
        .await
        .expect("agent never sent a renewal")
        .unwrap();
    let renewal = Frame::decode(&buf[..len]).unwrap();
    assert_eq!(renewal.kind, MsgType::RequestLabel.code());
    assert_eq!(renewal.value1, 7);

    // Master moves the agent to label 9.
    let grant = Frame::new(MsgType::ResponseLabel, renewal.echo, 9, 0, 0);
    master.send_to(&grant.encode(), agent_from).await.unwrap();

    // Label changes are applied and persisted; poll until the dispatcher
    // absorbed the grant.
    let mut label = 0;
    for _ in 0..50 {
        let reply = client.call(MsgType::RequestLabel, 0, 0).await;
        assert_eq!(reply.kind, MsgType::ResponseLabel.code());
        label = reply.value1;
        if label == 9 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(label, 9);
    assert_eq!(agent.disk_block().label, 9);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_not_hold_triggers_an_immediate_re_lease() {
    let master = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let master_addr = master.local_addr().unwrap();
    let agent = Harness::spawn(7, 100, vec![master_addr]).await;
    let mut client = RawClient::connect(agent.addr).await;

    // Drain the initial periodic renewal.
    client.uniq_seq(1).await;
    let mut buf = [0u8; 64];
    let (_, agent_from) = timeout(Duration::from_secs(5), master.recv_from(&mut buf))
        .await
        .expect("agent never sent a renewal")
        .unwrap();

    // Master disowns the agent's label.
    let disown = Frame::new(
        MsgType::ResponseError,
        0,
        ErrCode::LabelNotHold.code(),
        0,
        0,
    );
    master.send_to(&disown.encode(), agent_from).await.unwrap();

    // The agent clears its label and immediately asks for a fresh lease.
    let (len, _) = timeout(Duration::from_secs(5), master.recv_from(&mut buf))
        .await
        .expect("agent never re-leased")
        .unwrap();
    let request = Frame::decode(&buf[..len]).unwrap();
    assert_eq!(request.kind, MsgType::RequestLabel.code());
    assert_eq!(request.value1, 0, "cleared label must be sent as 0");

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_library_talks_to_a_real_agent() {
    let agent = Harness::spawn(7, 1000, Vec::new()).await;
    let addr = agent.addr;

    let ids = tokio::task::spawn_blocking(move || {
        let client = seqmint_client::Client::new(&addr.to_string(), 500, 2, true).unwrap();
        assert_eq!(client.get_label().unwrap(), 7);
        let start = client.get_uniq_seq(10).unwrap();
        assert!(start >= 1000);
        let (label, _) = client.get_label_and_seq(5).unwrap();
        assert_eq!(label, 7);
        let local = client.get_local_uniq_ids(3, 2, 0).unwrap();
        let remote = client.get_uniq_id(2, 0).unwrap();
        (local, remote)
    })
    .await
    .unwrap();

    let (local, remote) = ids;
    assert_eq!(local.len(), 3);
    for id in &local {
        assert_eq!(id.label(), 7);
        assert_eq!(id.user(), 2);
    }
    assert_eq!(remote.label(), 7);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_duplicates_across_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let seq_path = dir.path().join(".uniq.seq");
    let mut issued = Vec::new();

    for _incarnation in 0..2 {
        let open = OpenStore::open(&seq_path).unwrap();
        let shared = SyncShared::new();
        let store = open.activate(7, T0, 50, Arc::clone(&shared)).unwrap();
        let sync = SyncTask::spawn(store.file(), shared);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let mut dispatcher = Dispatcher::new(
            socket,
            store,
            LeaseClient::new(Vec::new(), 600, 3600),
            MockClock::new(T0),
        );
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(token).await });

        let mut client = RawClient::connect(addr).await;
        for _ in 0..75 {
            issued.push(client.uniq_seq(1).await);
        }

        shutdown.cancel();
        handle.await.unwrap();
        sync.stop();
    }

    let mut deduped = issued.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), issued.len(), "a sequence value was reissued");
}
