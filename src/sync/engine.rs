//! Session driver.
//!
//! One session owns one live connection. After the handshake it runs a
//! small crew of tasks:
//!
//! - a **receiver** with a rolling read deadline, processing incoming
//!   batches and queueing protocol replies,
//! - a **sender** that drains, in priority order: pings, queued
//!   payloads, then the peer's request queue,
//! - a **ticker** enforcing the online deadline, the maximum online
//!   time, the lost-peer cutoff, and keepalive pings,
//! - a **rescan** task advertising packets that appear mid-session,
//! - a bounded pool of **checksum workers** verifying deferred files.
//!
//! All of them share [`SharedState`] behind one lock held only for map
//! and queue manipulation. Teardown is an idempotent cancellation token:
//! every loop observes it, and every exit path fires it.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blake2::Digest;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Ctx;
use crate::core::{
    CHECKER_WORKERS, DEFAULT_DEADLINE, HandshakeError, MAX_SP_SIZE, NOCK_SUFFIX, PART_SUFFIX,
    PING_TIMEOUT, SEEN_SUFFIX, SENDER_IDLE_SLEEP, SessionError, TICK_INTERVAL, TransportError,
};
use crate::crypto::{
    Blake2b256, CipherPair, HandshakeInitiator, HandshakeResponder, NodeId, Peer, RecvCipher,
    SendCipher, identify_peer,
};
use crate::spool::{DirLock, Direction, Job, Spool, dir_sync};
use crate::transport::{read_frame, write_frame};

use super::message::{MAX_FILE_CHUNK, PktHash, SpMessage, split_payloads};
use super::state::{AdvertisedInfo, Counters, SessionStats, SharedState};

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Niceness ceiling: packets above it are neither advertised nor
    /// requested.
    pub nice: u8,
    /// Rolling per-operation socket deadline.
    pub deadline: Duration,
    /// Keepalive interval; twice this with no traffic at all kills the
    /// session.
    pub keepalive: Duration,
    /// When set, only these packets are requested or served.
    pub only_pkts: Option<HashSet<PktHash>>,
    /// Restrict the session to one transfer direction.
    pub xx_only: Option<Direction>,
    /// Disable the in-session checksum workers; completed files stay in
    /// the deferred state for an offline verification pass.
    pub no_check: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            nice: u8::MAX,
            deadline: DEFAULT_DEADLINE,
            keepalive: PING_TIMEOUT,
            only_pkts: None,
            xx_only: None,
            no_check: false,
        }
    }
}

fn rx_allowed(cfg: &SessionConfig) -> bool {
    cfg.xx_only != Some(Direction::Tx)
}

fn tx_allowed(cfg: &SessionConfig) -> bool {
    cfg.xx_only != Some(Direction::Rx)
}

/// Advisory locks held for the whole session; releasing is their drop.
struct DirLocks {
    _rx: Option<DirLock>,
    _tx: Option<DirLock>,
}

fn acquire_locks(
    spool: &Spool,
    node: &NodeId,
    cfg: &SessionConfig,
) -> Result<DirLocks, SessionError> {
    let rx = if rx_allowed(cfg) { Some(spool.lock_dir(node, Direction::Rx)?) } else { None };
    let tx = if tx_allowed(cfg) { Some(spool.lock_dir(node, Direction::Tx)?) } else { None };
    Ok(DirLocks { _rx: rx, _tx: tx })
}

/// State shared by all of a session's tasks.
struct Inner {
    ctx: Arc<Ctx>,
    peer: Peer,
    cfg: SessionConfig,
    shared: RwLock<SharedState>,
    counters: Mutex<Counters>,
    dead: CancellationToken,
    started: Instant,
    payload_tx: mpsc::Sender<Vec<u8>>,
    checker_tx: Option<mpsc::Sender<PktHash>>,
}

/// Queue a payload for transmission, giving up on teardown.
async fn send_payload(inner: &Inner, payload: Vec<u8>) {
    tokio::select! {
        _ = inner.dead.cancelled() => {}
        res = inner.payload_tx.send(payload) => { let _ = res; }
    }
}

/// Turn a spool scan into advertisement batches, marking everything
/// advertised as seen. Jobs above the niceness ceiling are left for a
/// politer session.
fn build_infos(
    node: &NodeId,
    jobs: Vec<Job>,
    ceiling: u8,
    seen: &mut HashMap<PktHash, u8>,
) -> Vec<Vec<u8>> {
    let mut infos: Vec<(u8, u64, PktHash)> = Vec::new();
    let mut total = 0u64;
    for job in jobs {
        if job.nice > ceiling {
            continue;
        }
        if seen.contains_key(&job.hash) {
            continue;
        }
        total += job.size;
        seen.insert(job.hash, job.nice);
        infos.push((job.nice, job.size, job.hash));
    }
    infos.sort_by_key(|(nice, _, _)| *nice);

    let payloads: Vec<Vec<u8>> = infos
        .into_iter()
        .map(|(nice, size, hash)| {
            debug!(node = %node, pkt = %hex::encode(hash), size, nice, "advertising");
            SpMessage::Info { nice, size, hash }.encode()
        })
        .collect();
    if total > 0 {
        info!(node = %node, pkts = payloads.len(), size = total, "queued packets to advertise");
    }
    split_payloads(payloads)
}

/// Pad the first handshake payload with no-op messages so an observer
/// cannot tell how many packets are queued.
fn pad_first_payload(mut payload: Vec<u8>) -> Vec<u8> {
    let halt = SpMessage::Halt.encode();
    while payload.len() + halt.len() <= MAX_SP_SIZE {
        payload.extend_from_slice(&halt);
    }
    payload
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Dial side: run a session as the handshake initiator.
///
/// The returned stats cover the whole session; errors are only returned
/// for failures before the worker loops start (handshake, locking,
/// first-payload processing). Later failures tear the session down and
/// are reported through the log.
pub async fn call<T>(
    ctx: Arc<Ctx>,
    peer_id: &NodeId,
    conn: T,
    cfg: SessionConfig,
) -> Result<SessionStats, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = ctx
        .find_peer(peer_id)
        .cloned()
        .ok_or_else(|| HandshakeError::UnknownPeer { id: peer_id.to_string() })?;
    ctx.spool.ensure_rx_dir(&peer.id)?;
    let locks = acquire_locks(&ctx.spool, &peer.id, &cfg)?;

    let started = Instant::now();
    let mut counters = Counters::new(started);
    let mut seen = HashMap::new();
    let infos = if tx_allowed(&cfg) {
        let jobs = ctx.spool.jobs(&peer.id, Direction::Tx)?;
        build_infos(&peer.id, jobs, cfg.nice, &mut seen)
    } else {
        Vec::new()
    };
    let first = pad_first_payload(infos.first().cloned().unwrap_or_default());

    let mut hs = HandshakeInitiator::new(&ctx.local, &peer.noise_pub)?;
    let msg1 = hs.write_message(&first)?;
    let (mut rd, mut wr) = tokio::io::split(conn);
    debug!(node = %peer.id, nice = cfg.nice, "sending first message");
    let sent = write_frame(&mut wr, &msg1, cfg.deadline).await?;
    counters.note_tx(sent, false);

    debug!(node = %peer.id, "waiting for first message");
    let (buf, got) = read_frame(&mut rd, cfg.deadline).await?;
    counters.note_rx(got);
    let (their_payload, ciphers) = hs.read_message(&buf)?;

    debug!(node = %peer.id, "starting workers");
    run_session(
        ctx, peer, cfg, rd, wr, ciphers, infos, their_payload, seen, counters, locks, started,
    )
    .await
}

/// Listen side: run a session as the handshake responder.
///
/// The caller is identified by its revealed static key; unknown peers
/// are rejected before any spool state is touched.
pub async fn serve<T>(
    ctx: Arc<Ctx>,
    conn: T,
    cfg: SessionConfig,
) -> Result<SessionStats, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();
    let mut hs = HandshakeResponder::new(&ctx.local)?;
    let (mut rd, mut wr) = tokio::io::split(conn);

    debug!("waiting for first message");
    let (buf, got) = read_frame(&mut rd, cfg.deadline).await?;
    let (their_payload, remote_static) = hs.read_message(&buf)?;
    let peer = identify_peer(&ctx.peers, &remote_static)
        .cloned()
        .ok_or_else(|| HandshakeError::UnknownPeer { id: hex::encode(remote_static) })?;
    info!(node = %peer.id, "peer identified");

    ctx.spool.ensure_rx_dir(&peer.id)?;
    let locks = acquire_locks(&ctx.spool, &peer.id, &cfg)?;
    let mut counters = Counters::new(started);
    counters.note_rx(got);

    let mut seen = HashMap::new();
    let infos = if tx_allowed(&cfg) {
        let jobs = ctx.spool.jobs(&peer.id, Direction::Tx)?;
        build_infos(&peer.id, jobs, cfg.nice, &mut seen)
    } else {
        Vec::new()
    };
    let first = pad_first_payload(infos.first().cloned().unwrap_or_default());

    debug!(node = %peer.id, "sending first message");
    let (msg2, ciphers) = hs.write_message(&first)?;
    let sent = write_frame(&mut wr, &msg2, cfg.deadline).await?;
    counters.note_tx(sent, false);

    debug!(node = %peer.id, "starting workers");
    run_session(
        ctx, peer, cfg, rd, wr, ciphers, infos, their_payload, seen, counters, locks, started,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_session<R, W>(
    ctx: Arc<Ctx>,
    peer: Peer,
    cfg: SessionConfig,
    rd: R,
    wr: W,
    ciphers: CipherPair,
    infos: Vec<Vec<u8>>,
    first_their_payload: Vec<u8>,
    seen: HashMap<PktHash, u8>,
    counters: Counters,
    locks: DirLocks,
    started: Instant,
) -> Result<SessionStats, SessionError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (send_cipher, recv_cipher) = ciphers.split();
    let (payload_tx, payload_rx) = mpsc::channel::<Vec<u8>>(8);
    let (ping_tx, ping_rx) = mpsc::channel::<()>(1);
    let (checker_tx, checker_rx) = if cfg.no_check {
        (None, None)
    } else {
        let (tx, rx) = mpsc::channel::<PktHash>(64);
        (Some(tx), Some(rx))
    };

    let mut shared = SharedState::new();
    shared.infos_our_seen = seen;

    let inner = Arc::new(Inner {
        ctx,
        peer,
        cfg,
        shared: RwLock::new(shared),
        counters: Mutex::new(counters),
        dead: CancellationToken::new(),
        started,
        payload_tx,
        checker_tx,
    });
    let peer_id = inner.peer.id;

    // The peer's first batch is processed before the loops start, so its
    // replies are at the front of the send queue.
    let mut processor = Processor {
        inner: Arc::clone(&inner),
        fds: HashMap::new(),
        hashers: HashMap::new(),
    };
    let replies = processor.process_sp(&first_their_payload).await?;
    if !replies.is_empty() {
        let inner2 = Arc::clone(&inner);
        tokio::spawn(async move {
            for reply in replies {
                send_payload(&inner2, reply).await;
            }
        });
    }

    let mut tasks = JoinSet::new();

    if infos.len() > 1 {
        let inner2 = Arc::clone(&inner);
        let rest: Vec<Vec<u8>> = infos[1..].to_vec();
        tasks.spawn(async move {
            for payload in rest {
                send_payload(&inner2, payload).await;
            }
        });
    }

    tasks.spawn(ticker_loop(Arc::clone(&inner), ping_tx));
    if tx_allowed(&inner.cfg) {
        tasks.spawn(rescan_loop(Arc::clone(&inner)));
    }
    if let Some(rx) = checker_rx {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..CHECKER_WORKERS {
            tasks.spawn(checker_loop(Arc::clone(&inner), Arc::clone(&rx)));
        }
        tasks.spawn(nock_backfill(Arc::clone(&inner)));
    }
    tasks.spawn(sender_loop(Arc::clone(&inner), wr, send_cipher, payload_rx, ping_rx));
    tasks.spawn(receiver_loop(processor, rd, recv_cipher));

    while tasks.join_next().await.is_some() {}

    let final_counters = *inner.counters.lock();
    let stats = SessionStats::from_counters(peer_id, started, &final_counters);
    info!(
        node = %peer_id,
        duration = ?stats.duration,
        rx_bytes = stats.rx_bytes,
        tx_bytes = stats.tx_bytes,
        rx_speed = stats.rx_speed,
        tx_speed = stats.tx_speed,
        "session finished"
    );
    drop(locks);
    Ok(stats)
}

/// Deadline, lost-peer, and keepalive enforcement.
///
/// Two cadences: deadline checks run every second, keepalives on their
/// own interval so short keepalive settings still produce traffic
/// between deadline checks.
async fn ticker_loop(inner: Arc<Inner>, ping_tx: mpsc::Sender<()>) {
    let mut deadline_tick = interval(TICK_INTERVAL);
    let mut ping_tick = interval(inner.cfg.keepalive);
    let online_deadline = inner.peer.online_deadline;
    let max_online = inner.peer.max_online_time;
    loop {
        tokio::select! {
            _ = inner.dead.cancelled() => return,
            _ = deadline_tick.tick() => {
                let now = Instant::now();
                let c = *inner.counters.lock();
                let idle = now.duration_since(c.rx_last_nonping) >= online_deadline
                    && now.duration_since(c.tx_last_nonping) >= online_deadline;
                let over = max_online.is_some_and(|max| now.duration_since(inner.started) >= max);
                let lost = now.duration_since(c.rx_last_seen) >= inner.cfg.keepalive * 2;
                if idle || over || lost {
                    info!(node = %inner.peer.id, idle, over, lost, "tearing session down");
                    inner.dead.cancel();
                    return;
                }
            }
            _ = ping_tick.tick() => {
                let tx_last_seen = inner.counters.lock().tx_last_seen;
                if Instant::now().duration_since(tx_last_seen) >= inner.cfg.keepalive {
                    let _ = ping_tx.try_send(());
                }
            }
        }
    }
}

/// Advertise outbound packets that appear while the session is running.
async fn rescan_loop(inner: Arc<Inner>) {
    let mut tick = interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = inner.dead.cancelled() => return,
            _ = tick.tick() => {}
        }
        let jobs = match inner.ctx.spool.jobs(&inner.peer.id, Direction::Tx) {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(node = %inner.peer.id, %err, "spool rescan failed");
                continue;
            }
        };
        let payloads = {
            let mut shared = inner.shared.write();
            build_infos(&inner.peer.id, jobs, inner.cfg.nice, &mut shared.infos_our_seen)
        };
        for payload in payloads {
            debug!(node = %inner.peer.id, size = payload.len(), "queueing new info batch");
            send_payload(&inner, payload).await;
        }
    }
}

/// One deferred-checksum worker.
async fn checker_loop(
    inner: Arc<Inner>,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<PktHash>>>,
) {
    loop {
        let job = tokio::select! {
            _ = inner.dead.cancelled() => return,
            job = async { jobs.lock().await.recv().await } => job,
        };
        let Some(hash) = job else { return };
        let node = inner.peer.id;
        debug!(node = %node, pkt = %hex::encode(hash), "checking");
        let spool = inner.ctx.spool.clone();
        match tokio::task::spawn_blocking(move || spool.check_nock(&node, &hash)).await {
            Ok(Ok(size)) => {
                info!(node = %node, pkt = %hex::encode(hash), size, "checksummed");
                send_payload(&inner, SpMessage::Done { hash }.encode()).await;
            }
            Ok(Err(err)) => error!(node = %node, pkt = %hex::encode(hash), %err, "check failed"),
            Err(err) => error!(node = %node, %err, "checker task failed"),
        }
    }
}

/// Feed files left unverified by previous sessions to the checkers.
async fn nock_backfill(inner: Arc<Inner>) {
    let jobs = match inner.ctx.spool.jobs_nock(&inner.peer.id) {
        Ok(jobs) => jobs,
        Err(err) => {
            warn!(node = %inner.peer.id, %err, "listing unchecksummed files failed");
            return;
        }
    };
    let Some(tx) = inner.checker_tx.clone() else { return };
    for (hash, _size) in jobs {
        tokio::select! {
            _ = inner.dead.cancelled() => return,
            res = tx.send(hash) => { let _ = res; }
        }
    }
}

enum ServeOutcome {
    Chunk(Vec<u8>),
    Idle,
    Failed,
}

/// Read one chunk for the head of the peer's request queue.
///
/// The source file is opened, read, and closed per chunk; the queue is
/// only touched under the lock, and a head that changed while we were
/// reading drops the stale result.
async fn serve_queue_head(inner: &Inner) -> ServeOutcome {
    let head = {
        let shared = inner.shared.read();
        shared.queue_their.first().map(|f| (f.hash, f.offset))
    };
    let Some((hash, offset)) = head else { return ServeOutcome::Idle };

    if inner.peer.tx_rate > 0 {
        sleep(Duration::from_secs(1) / inner.peer.tx_rate).await;
    }

    let path = inner.ctx.spool.file_path(&inner.peer.id, Direction::Tx, &hash);
    let (chunk, full_size) = match read_chunk(&path, offset) {
        Ok(read) => read,
        Err(err) => {
            error!(node = %inner.peer.id, pkt = %hex::encode(hash), %err, "serving failed");
            return ServeOutcome::Failed;
        }
    };
    let our_size = offset + chunk.len() as u64;
    debug!(
        node = %inner.peer.id,
        pkt = %hex::encode(hash),
        offset,
        size = our_size,
        full_size,
        "read chunk"
    );
    let msg = SpMessage::File { hash, offset, payload: chunk };
    {
        let mut shared = inner.shared.write();
        match shared.queue_their.first_mut() {
            Some(head) if head.hash == hash => {
                if our_size >= full_size {
                    debug!(node = %inner.peer.id, pkt = %hex::encode(hash), "served fully");
                    shared.queue_their.remove(0);
                } else {
                    head.offset = our_size;
                }
            }
            _ => {
                debug!(node = %inner.peer.id, pkt = %hex::encode(hash), "queue head changed, dropping stale chunk");
                return ServeOutcome::Idle;
            }
        }
    }
    ServeOutcome::Chunk(msg.encode())
}

fn read_chunk(path: &Path, offset: u64) -> std::io::Result<(Vec<u8>, u64)> {
    let mut fd = File::open(path)?;
    let full_size = fd.metadata()?.len();
    let mut chunk = Vec::new();
    if offset < full_size {
        fd.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; MAX_FILE_CHUNK];
        let mut filled = 0usize;
        loop {
            match fd.read(&mut buf[filled..])? {
                0 => break,
                n => {
                    filled += n;
                    if filled == buf.len() {
                        break;
                    }
                }
            }
        }
        buf.truncate(filled);
        chunk = buf;
    }
    Ok((chunk, full_size))
}

/// Transmit loop. Priority order: pings, queued payloads, then serving
/// the request queue; idle otherwise.
async fn sender_loop<W>(
    inner: Arc<Inner>,
    mut wr: W,
    cipher: SendCipher,
    mut payload_rx: mpsc::Receiver<Vec<u8>>,
    mut ping_rx: mpsc::Receiver<()>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let ping_bytes = SpMessage::Ping.encode();
    loop {
        if inner.dead.is_cancelled() {
            break;
        }
        let (payload, ping) = if ping_rx.try_recv().is_ok() {
            debug!(node = %inner.peer.id, "got ping");
            (ping_bytes.clone(), true)
        } else if let Ok(payload) = payload_rx.try_recv() {
            debug!(node = %inner.peer.id, size = payload.len(), "got payload");
            (payload, false)
        } else {
            match serve_queue_head(&inner).await {
                ServeOutcome::Chunk(payload) => (payload, false),
                ServeOutcome::Idle => {
                    tokio::select! {
                        _ = inner.dead.cancelled() => break,
                        _ = sleep(SENDER_IDLE_SLEEP) => {}
                    }
                    continue;
                }
                ServeOutcome::Failed => break,
            }
        };

        let sealed = match cipher.seal(&payload) {
            Ok(sealed) => sealed,
            Err(err) => {
                error!(node = %inner.peer.id, %err, "sealing frame failed");
                break;
            }
        };
        match write_frame(&mut wr, &sealed, inner.cfg.deadline).await {
            Ok(sent) => inner.counters.lock().note_tx(sent, ping),
            Err(err) => {
                error!(node = %inner.peer.id, %err, "transmit failed");
                break;
            }
        }
    }
    inner.dead.cancel();
}

/// Receive loop: frames in, batches decrypted, messages processed,
/// replies queued back to the sender.
async fn receiver_loop<R>(mut processor: Processor, mut rd: R, cipher: RecvCipher)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let inner = Arc::clone(&processor.inner);
    loop {
        if inner.dead.is_cancelled() {
            break;
        }
        let res = tokio::select! {
            _ = inner.dead.cancelled() => break,
            res = read_frame(&mut rd, inner.cfg.deadline) => res,
        };
        let (buf, got) = match res {
            Ok(frame) => frame,
            Err(TransportError::Timeout) => continue,
            Err(TransportError::Disconnected) => {
                debug!(node = %inner.peer.id, "peer disconnected");
                break;
            }
            Err(err) => {
                error!(node = %inner.peer.id, %err, "receive failed");
                break;
            }
        };
        inner.counters.lock().note_rx(got);
        let payload = match cipher.open(&buf) {
            Ok(payload) => payload,
            Err(err) => {
                error!(node = %inner.peer.id, %err, "frame decryption failed");
                break;
            }
        };
        let replies = match processor.process_sp(&payload).await {
            Ok(replies) => replies,
            Err(err) => {
                error!(node = %inner.peer.id, %err, "processing failed");
                break;
            }
        };
        if !replies.is_empty() {
            let inner2 = Arc::clone(&inner);
            tokio::spawn(async move {
                for reply in replies {
                    send_payload(&inner2, reply).await;
                }
            });
        }
        if inner.peer.rx_rate > 0 {
            sleep(Duration::from_secs(1) / inner.peer.rx_rate).await;
        }
    }
    inner.dead.cancel();
}

struct HasherAndOffset {
    hasher: Blake2b256,
    offset: u64,
}

/// Receive-side message processor. Owns the partial-file handles and the
/// incremental hashers; both are task-local by design.
struct Processor {
    inner: Arc<Inner>,
    fds: HashMap<PathBuf, File>,
    hashers: HashMap<PathBuf, HasherAndOffset>,
}

impl Processor {
    fn close_fd(&mut self, path: &Path) {
        self.fds.remove(path);
    }

    /// Process one decrypted batch, returning reply batches.
    async fn process_sp(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, SessionError> {
        let inner = Arc::clone(&self.inner);
        let mut replies: Vec<Vec<u8>> = Vec::new();
        let mut infos_got = false;
        let mut rest = payload;
        while !rest.is_empty() {
            let (msg, consumed) = SpMessage::decode(rest)?;
            rest = &rest[consumed..];
            if !msg.is_ping() {
                inner.counters.lock().note_rx_nonping();
            }
            match msg {
                SpMessage::Halt => {
                    debug!(node = %inner.peer.id, "halt");
                    inner.shared.write().clear_queue();
                }
                SpMessage::Ping => {
                    debug!(node = %inner.peer.id, "ping");
                }
                SpMessage::Info { nice, size, hash } => {
                    infos_got = true;
                    self.process_info(nice, size, hash, &mut replies);
                }
                SpMessage::File { hash, offset, payload } => {
                    self.process_file(hash, offset, &payload, &mut replies).await?;
                }
                SpMessage::Done { hash } => {
                    let pkt = hex::encode(hash);
                    match inner.ctx.spool.remove_tx(&inner.peer.id, &hash) {
                        Ok(true) => info!(node = %inner.peer.id, pkt = %pkt, "peer confirmed receipt"),
                        Ok(false) => debug!(node = %inner.peer.id, pkt = %pkt, "already removed"),
                        Err(err) => {
                            error!(node = %inner.peer.id, pkt = %pkt, %err, "removing confirmed packet failed");
                        }
                    }
                }
                SpMessage::Freq { hash, offset } => {
                    let pkt = hex::encode(hash);
                    let nice = inner.shared.read().infos_our_seen.get(&hash).copied();
                    match nice {
                        None => debug!(node = %inner.peer.id, pkt = %pkt, "freq for unadvertised packet"),
                        Some(nice) => {
                            let allowed = inner
                                .cfg
                                .only_pkts
                                .as_ref()
                                .map_or(true, |set| set.contains(&hash));
                            if allowed {
                                debug!(node = %inner.peer.id, pkt = %pkt, offset, "queueing freq");
                                inner.shared.write().enqueue_freq(hash, offset, nice);
                            } else {
                                debug!(node = %inner.peer.id, pkt = %pkt, "freq restricted, skipping");
                            }
                        }
                    }
                }
            }
        }
        if infos_got {
            let (pkts, size) = {
                let shared = inner.shared.read();
                (
                    shared.infos_their.len(),
                    shared.infos_their.values().map(|i| i.size).sum::<u64>(),
                )
            };
            info!(node = %inner.peer.id, pkts, size, "candidate transfer set");
        }
        Ok(split_payloads(replies))
    }

    /// Advertisement handling: decide whether to request the packet and
    /// from which resume offset.
    fn process_info(&mut self, nice: u8, size: u64, hash: PktHash, replies: &mut Vec<Vec<u8>>) {
        let inner = &self.inner;
        let pkt = hex::encode(hash);
        if nice > inner.cfg.nice {
            debug!(node = %inner.peer.id, pkt = %pkt, nice, "too nice");
            return;
        }
        if inner.cfg.xx_only == Some(Direction::Tx) {
            return;
        }
        inner.shared.write().infos_their.insert(hash, AdvertisedInfo { nice, size });

        let final_path = inner.ctx.spool.file_path(&inner.peer.id, Direction::Rx, &hash);
        if final_path.exists() {
            info!(node = %inner.peer.id, pkt = %pkt, "already done");
            replies.push(SpMessage::Done { hash }.encode());
            return;
        }
        if with_suffix(&final_path, SEEN_SUFFIX).exists() {
            info!(node = %inner.peer.id, pkt = %pkt, "already seen");
            replies.push(SpMessage::Done { hash }.encode());
            return;
        }
        if with_suffix(&final_path, NOCK_SUFFIX).exists() {
            info!(node = %inner.peer.id, pkt = %pkt, "not yet checksummed, deferring");
            return;
        }
        let offset = std::fs::metadata(with_suffix(&final_path, PART_SUFFIX))
            .map(|m| m.len())
            .unwrap_or(0);
        if !inner.ctx.spool.is_enough_space(size.saturating_sub(offset)) {
            info!(node = %inner.peer.id, pkt = %pkt, size, "not enough space");
            return;
        }
        info!(node = %inner.peer.id, pkt = %pkt, size, offset, "will request");
        let allowed = inner.cfg.only_pkts.as_ref().map_or(true, |set| set.contains(&hash));
        if allowed {
            replies.push(SpMessage::Freq { hash, offset }.encode());
        }
    }

    /// Chunk handling: write at offset, track the incremental hash, and
    /// finalize once the advertised size is reached.
    async fn process_file(
        &mut self,
        hash: PktHash,
        offset: u64,
        payload: &[u8],
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        let inner = Arc::clone(&self.inner);
        let pkt = hex::encode(hash);
        let dir = inner.ctx.spool.dir(&inner.peer.id, Direction::Rx);
        let final_path = dir.join(&pkt);
        let part_path = with_suffix(&final_path, PART_SUFFIX);

        if !self.fds.contains_key(&part_path) {
            debug!(node = %inner.peer.id, pkt = %pkt, "opening part file");
            let fd = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&part_path)?;
            self.fds.insert(part_path.clone(), fd);
            if offset == 0 {
                self.hashers.insert(
                    final_path.clone(),
                    HasherAndOffset { hasher: Blake2b256::new(), offset: 0 },
                );
            }
        }
        let Some(fd) = self.fds.get_mut(&part_path) else { return Ok(()) };

        if let Err(err) = fd.seek(SeekFrom::Start(offset)).and_then(|_| fd.write_all(payload)) {
            self.close_fd(&part_path);
            return Err(err.into());
        }

        if let Some(state) = self.hashers.get_mut(&final_path) {
            if state.offset == offset {
                state.hasher.update(payload);
                state.offset += payload.len() as u64;
            } else {
                warn!(
                    node = %inner.peer.id,
                    pkt = %pkt,
                    expected = state.offset,
                    got = offset,
                    "chunk offset differs, dropping incremental hasher"
                );
                self.hashers.remove(&final_path);
            }
        }

        let our_size = offset + payload.len() as u64;
        let full_size = inner.shared.read().infos_their.get(&hash).map(|i| i.size);
        let Some(full_size) = full_size else { return Ok(()) };
        debug!(node = %inner.peer.id, pkt = %pkt, size = our_size, full_size, "written");
        if our_size != full_size {
            return Ok(());
        }

        let fd = self.fds.get_mut(&part_path);
        if let Some(fd) = fd {
            if let Err(err) = fd.sync_all() {
                error!(node = %inner.peer.id, pkt = %pkt, %err, "sync failed");
                self.close_fd(&part_path);
                return Ok(());
            }
        }

        match self.hashers.remove(&final_path) {
            Some(state) => {
                let digest: [u8; 32] = state.hasher.finalize().into();
                self.close_fd(&part_path);
                if digest != hash {
                    error!(node = %inner.peer.id, pkt = %pkt, "checksum mismatch, keeping partial");
                    return Ok(());
                }
                if let Err(err) = std::fs::rename(&part_path, &final_path) {
                    error!(node = %inner.peer.id, pkt = %pkt, %err, "rename failed");
                    return Ok(());
                }
                if let Err(err) = dir_sync(&dir) {
                    error!(node = %inner.peer.id, pkt = %pkt, %err, "directory sync failed");
                    return Ok(());
                }
                info!(node = %inner.peer.id, pkt = %pkt, size = full_size, "done");
                replies.push(SpMessage::Done { hash }.encode());
                inner.shared.write().infos_their.remove(&hash);
            }
            None => {
                self.close_fd(&part_path);
                let nock_path = with_suffix(&final_path, NOCK_SUFFIX);
                if let Err(err) = std::fs::rename(&part_path, &nock_path) {
                    error!(node = %inner.peer.id, pkt = %pkt, %err, "rename failed");
                    return Ok(());
                }
                if let Err(err) = dir_sync(&dir) {
                    error!(node = %inner.peer.id, pkt = %pkt, %err, "directory sync failed");
                    return Ok(());
                }
                info!(node = %inner.peer.id, pkt = %pkt, size = full_size, "downloaded, checksum deferred");
                inner.shared.write().infos_their.remove(&hash);
                if let Some(tx) = inner.checker_tx.clone() {
                    tokio::select! {
                        _ = inner.dead.cancelled() => {}
                        res = tx.send(hash) => { let _ = res; }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_payload_is_padded_to_max() {
        let padded = pad_first_payload(Vec::new());
        assert_eq!(padded.len(), MAX_SP_SIZE);
        assert!(padded.iter().all(|&b| b == SpMessage::Halt.encode()[0]));

        let info = SpMessage::Info { nice: 1, size: 2, hash: [3; 32] }.encode();
        let padded = pad_first_payload(info.clone());
        assert_eq!(padded.len(), MAX_SP_SIZE);
        assert_eq!(&padded[..info.len()], &info[..]);
    }

    #[test]
    fn build_infos_filters_sorts_and_marks_seen() {
        let node = NodeId::from_bytes([9; 32]);
        let jobs = vec![
            Job { hash: [5; 32], nice: 5, size: 50, path: "/x/5".into() },
            Job { hash: [1; 32], nice: 1, size: 10, path: "/x/1".into() },
            Job { hash: [200; 32], nice: 200, size: 99, path: "/x/200".into() },
            Job { hash: [3; 32], nice: 3, size: 30, path: "/x/3".into() },
        ];
        let mut seen = HashMap::new();
        let batches = build_infos(&node, jobs.clone(), 100, &mut seen);

        // One batch, ordered ascending by niceness, ceiling enforced.
        assert_eq!(batches.len(), 1);
        let mut nices = Vec::new();
        let mut rest = &batches[0][..];
        while !rest.is_empty() {
            let (msg, consumed) = SpMessage::decode(rest).unwrap();
            if let SpMessage::Info { nice, .. } = msg {
                nices.push(nice);
            }
            rest = &rest[consumed..];
        }
        assert_eq!(nices, vec![1, 3, 5]);
        assert!(!seen.contains_key(&[200; 32]));

        // A second scan advertises nothing new.
        assert!(build_infos(&node, jobs, 100, &mut seen).is_empty());
    }

    #[test]
    fn suffixed_paths_share_the_stem() {
        let path = PathBuf::from("/spool/n/rx/abcd");
        assert_eq!(with_suffix(&path, PART_SUFFIX), PathBuf::from("/spool/n/rx/abcd.part"));
        assert_eq!(with_suffix(&path, NOCK_SUFFIX), PathBuf::from("/spool/n/rx/abcd.nock"));
    }

    #[test]
    fn default_config_is_permissive() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.nice, u8::MAX);
        assert!(rx_allowed(&cfg) && tx_allowed(&cfg));
        assert!(cfg.only_pkts.is_none());
        assert!(!cfg.no_check);
    }
}
