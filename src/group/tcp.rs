//! TCP process group.
//!
//! One rank per OS process. Every ordered pair of ranks (A → B) uses its own TCP
//! connection, dialed by A and accepted by B, which gives per-channel FIFO for
//! free. The group owns a small tokio runtime: one writer task per outgoing
//! connection, one reader task per incoming connection. Readers push data
//! frames into a `crossbeam` inbox drained by [`ProcessGroup::try_receive`].
//!
//! ## Frame layout
//! `[kind:1][length:4][body:length]`, little-endian. The first four bytes on
//! every connection are the dialer's rank.
//!
//! ## Barrier
//! Coordinated by rank 0: every other rank sends `BARRIER_ARRIVE(epoch)` and
//! waits for `BARRIER_RELEASE(epoch)`, which rank 0 sends once all ranks of
//! that epoch have arrived.
//!
//! ## Departure
//! A writer whose channel is closed sends `GOODBYE` before closing its
//! stream. A peer that said goodbye has left the group: every later barrier,
//! and every receive, fails. A stream that ends without a goodbye means the
//! peer died and latches a transport failure.
//!
//! `connect` and `Drop` block on the owned runtime, so a `TcpGroup` must be
//! created and dropped outside of any async context.

use super::types::{ProcessGroup, Rank};
use crate::error::{Result, WorldError};

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const FRAME_DATA: u8 = 0;
pub const FRAME_BARRIER_ARRIVE: u8 = 1;
pub const FRAME_BARRIER_RELEASE: u8 = 2;
pub const FRAME_GOODBYE: u8 = 3;

/// Kind byte plus the little-endian body length.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frames larger than this are treated as stream corruption.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const CONNECT_ATTEMPTS: usize = 40;
const BARRIER_POLL: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn encode_frame(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.push(kind);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

pub fn decode_frame_header(header: &[u8; FRAME_HEADER_SIZE]) -> std::result::Result<(u8, usize), String> {
    let kind = header[0];
    if kind > FRAME_GOODBYE {
        return Err(format!("unknown frame kind {}", kind));
    }
    let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(format!("frame of {} bytes exceeds limit {}", length, MAX_FRAME_SIZE));
    }
    Ok((kind, length))
}

/// Reads one frame. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let (kind, length) = decode_frame_header(&header).map_err(std::io::Error::other)?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    Ok(Some((kind, body)))
}

#[derive(Default)]
struct BarrierState {
    /// Arrivals counted by rank 0, per barrier epoch.
    arrivals: HashMap<u64, usize>,
    /// Highest epoch released so far.
    released: u64,
}

struct Shared {
    rank: Rank,
    size: usize,
    inbox: Sender<(Vec<u8>, Rank)>,
    barrier: Mutex<BarrierState>,
    barrier_changed: Condvar,
    failure: Mutex<Option<String>>,
    /// Peers that said goodbye.
    departed: Mutex<BTreeSet<Rank>>,
    /// Set once this rank's own group is being dropped.
    closing: AtomicBool,
}

impl Shared {
    /// Latches the first transport failure; later calls only log.
    fn fail(&self, message: String) {
        tracing::error!(rank = self.rank, "Transport failure: {}", message);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message);
        }
        drop(failure);
        self.barrier_changed.notify_all();
    }

    fn check(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(message) => Err(WorldError::Transport {
                rank: self.rank,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Like [`check`](Self::check), also failing once any peer has left.
    fn check_peers(&self) -> Result<()> {
        self.check()?;
        match self.departed.lock().first() {
            Some(peer) => Err(WorldError::Transport {
                rank: self.rank,
                message: format!("rank {} has left the group", peer),
            }),
            None => Ok(()),
        }
    }

    /// Like [`check`](Self::check), also failing once `peer` has left.
    fn check_peer(&self, peer: Rank) -> Result<()> {
        self.check()?;
        if self.departed.lock().contains(&peer) {
            return Err(WorldError::Transport {
                rank: self.rank,
                message: format!("rank {} has left the group", peer),
            });
        }
        Ok(())
    }

    fn on_frame(&self, from: Rank, kind: u8, body: Vec<u8>) -> std::result::Result<(), String> {
        match kind {
            FRAME_DATA => self
                .inbox
                .send((body, from))
                .map_err(|_| "inbox closed".to_string()),
            FRAME_BARRIER_ARRIVE => {
                let epoch = read_epoch(&body)?;
                let mut state = self.barrier.lock();
                *state.arrivals.entry(epoch).or_insert(0) += 1;
                self.barrier_changed.notify_all();
                Ok(())
            }
            FRAME_BARRIER_RELEASE => {
                let epoch = read_epoch(&body)?;
                let mut state = self.barrier.lock();
                state.released = state.released.max(epoch);
                self.barrier_changed.notify_all();
                Ok(())
            }
            FRAME_GOODBYE => {
                tracing::debug!(rank = self.rank, "Rank {} left the group", from);
                self.departed.lock().insert(from);
                let _state = self.barrier.lock();
                self.barrier_changed.notify_all();
                Ok(())
            }
            other => Err(format!("unknown frame kind {} from rank {}", other, from)),
        }
    }
}

fn read_epoch(body: &[u8]) -> std::result::Result<u64, String> {
    let bytes: [u8; 8] = body
        .try_into()
        .map_err(|_| format!("barrier frame with {} byte body", body.len()))?;
    Ok(u64::from_le_bytes(bytes))
}

pub struct TcpGroup {
    shared: Arc<Shared>,
    inbox: Receiver<(Vec<u8>, Rank)>,
    outgoing: Vec<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    writers: Vec<JoinHandle<()>>,
    barrier_epoch: AtomicU64,
    runtime: Option<Runtime>,
}

impl TcpGroup {
    /// Binds `peers[rank]`, then dials every other peer.
    ///
    /// Peers may start in any order; dialing retries with exponential backoff
    /// until the remote side is listening.
    pub fn connect(rank: Rank, peers: &[SocketAddr]) -> Result<Self> {
        let size = peers.len();
        let transport_err = |message: String| WorldError::Transport { rank, message };

        if rank >= size {
            return Err(transport_err(format!(
                "rank {} outside a group of {}",
                rank, size
            )));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("rank{}-net", rank))
            .enable_all()
            .build()
            .map_err(|e| transport_err(format!("starting network runtime: {}", e)))?;

        let (inbox_tx, inbox) = unbounded();
        let shared = Arc::new(Shared {
            rank,
            size,
            inbox: inbox_tx,
            barrier: Mutex::new(BarrierState::default()),
            barrier_changed: Condvar::new(),
            failure: Mutex::new(None),
            departed: Mutex::new(BTreeSet::new()),
            closing: AtomicBool::new(false),
        });

        let listener = runtime
            .block_on(TcpListener::bind(peers[rank]))
            .map_err(|e| transport_err(format!("binding {}: {}", peers[rank], e)))?;
        tracing::info!("Rank {} listening on {}", rank, peers[rank]);

        runtime.spawn(accept_loop(listener, size - 1, shared.clone()));

        let mut outgoing = Vec::with_capacity(size);
        let mut writers = Vec::with_capacity(size.saturating_sub(1));

        for (peer, addr) in peers.iter().enumerate() {
            if peer == rank {
                outgoing.push(None);
                continue;
            }

            let stream = runtime
                .block_on(connect_with_retry(*addr, CONNECT_ATTEMPTS))
                .map_err(|e| {
                    transport_err(format!("connecting to rank {} at {}: {}", peer, addr, e))
                })?;
            tracing::debug!("Rank {} connected to rank {} at {}", rank, peer, addr);

            let (tx, rx) = mpsc::unbounded_channel();
            writers.push(runtime.spawn(writer_loop(stream, rank, peer, rx, shared.clone())));
            outgoing.push(Some(tx));
        }

        tracing::info!("Rank {} connected to {} peers", rank, size - 1);

        Ok(Self {
            shared,
            inbox,
            outgoing,
            writers,
            barrier_epoch: AtomicU64::new(0),
            runtime: Some(runtime),
        })
    }

    fn send_frame(&self, target: Rank, kind: u8, body: &[u8]) -> Result<()> {
        self.shared.check()?;

        let Some(Some(channel)) = self.outgoing.get(target) else {
            return Err(WorldError::Transport {
                rank: self.shared.rank,
                message: format!("no connection to rank {}", target),
            });
        };

        channel
            .send(encode_frame(kind, body))
            .map_err(|_| WorldError::Transport {
                rank: self.shared.rank,
                message: format!("writer for rank {} has stopped", target),
            })
    }
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> Rank {
        self.shared.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn send(&self, target: Rank, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WorldError::Encoding(format!(
                "message of {} bytes exceeds frame limit {}",
                bytes.len(),
                MAX_FRAME_SIZE
            )));
        }
        if target == self.shared.rank {
            self.shared.check()?;
            return self
                .shared
                .inbox
                .send((bytes, target))
                .map_err(|_| WorldError::Transport {
                    rank: target,
                    message: "inbox closed".to_string(),
                });
        }
        self.send_frame(target, FRAME_DATA, &bytes)
    }

    fn try_receive(&self) -> Result<Option<(Vec<u8>, Rank)>> {
        match self.inbox.try_recv() {
            Ok(delivery) => Ok(Some(delivery)),
            Err(TryRecvError::Empty) => {
                self.shared.check_peers()?;
                Ok(None)
            }
            Err(TryRecvError::Disconnected) => Err(WorldError::Transport {
                rank: self.shared.rank,
                message: "inbox disconnected".to_string(),
            }),
        }
    }

    fn barrier(&self) -> Result<()> {
        let epoch = self.barrier_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let body = epoch.to_le_bytes();

        if self.shared.rank == 0 {
            let mut state = self.shared.barrier.lock();
            *state.arrivals.entry(epoch).or_insert(0) += 1;

            while state.arrivals.get(&epoch).copied().unwrap_or(0) < self.shared.size {
                self.shared.check_peers()?;
                self.shared.barrier_changed.wait_for(&mut state, BARRIER_POLL);
            }

            state.arrivals.remove(&epoch);
            state.released = epoch;
            drop(state);

            for peer in 1..self.shared.size {
                self.send_frame(peer, FRAME_BARRIER_RELEASE, &body)?;
            }
        } else {
            self.send_frame(0, FRAME_BARRIER_ARRIVE, &body)?;

            let mut state = self.shared.barrier.lock();
            while state.released < epoch {
                self.shared.check_peer(0)?;
                self.shared.barrier_changed.wait_for(&mut state, BARRIER_POLL);
            }
        }

        tracing::trace!(rank = self.shared.rank, epoch, "Barrier released");
        Ok(())
    }

    fn check_peers(&self) -> Result<()> {
        self.shared.check_peers()
    }
}

impl Drop for TcpGroup {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        // Closing the channels lets each writer flush what is queued, say
        // goodbye and exit.
        self.outgoing.clear();

        if let Some(runtime) = self.runtime.take() {
            let writers = std::mem::take(&mut self.writers);
            runtime.block_on(async {
                let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                    for writer in writers {
                        let _ = writer.await;
                    }
                })
                .await;
                if drained.is_err() {
                    tracing::warn!("Timed out flushing outgoing connections");
                }
            });
            runtime.shutdown_timeout(Duration::from_millis(200));
        }
    }
}

async fn connect_with_retry(addr: SocketAddr, attempts: usize) -> std::io::Result<TcpStream> {
    let mut delay_ms = 50u64;

    for attempt in 0..attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                if attempt + 1 == attempts {
                    return Err(e);
                }
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1000);
            }
        }
    }

    Err(std::io::Error::other("connect attempts exhausted"))
}

async fn accept_loop(listener: TcpListener, expected: usize, shared: Arc<Shared>) {
    for _ in 0..expected {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::trace!("Accepted connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!("Failed to disable Nagle on {}: {}", addr, e);
                }
                tokio::spawn(reader_loop(stream, shared.clone()));
            }
            Err(e) => {
                shared.fail(format!("accept failed: {}", e));
                return;
            }
        }
    }
}

async fn reader_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut handshake = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut handshake).await {
        shared.fail(format!("reading handshake: {}", e));
        return;
    }

    let from = u32::from_le_bytes(handshake) as Rank;
    if from >= shared.size {
        shared.fail(format!("handshake announced rank {} in a group of {}", from, shared.size));
        return;
    }

    loop {
        match read_frame(&mut stream).await {
            Ok(Some((kind, body))) => {
                if let Err(message) = shared.on_frame(from, kind, body) {
                    shared.fail(message);
                    return;
                }
                if kind == FRAME_GOODBYE {
                    return;
                }
            }
            Ok(None) => {
                if shared.closing.load(Ordering::SeqCst) {
                    tracing::debug!("Rank {} closed its connection", from);
                } else {
                    shared.fail(format!("rank {} closed its connection without leaving", from));
                }
                return;
            }
            Err(e) => {
                shared.fail(format!("reading from rank {}: {}", from, e));
                return;
            }
        }
    }
}

async fn writer_loop(
    stream: TcpStream,
    rank: Rank,
    peer: Rank,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let mut writer = BufWriter::new(stream);

    if let Err(e) = writer.write_all(&(rank as u32).to_le_bytes()).await {
        shared.fail(format!("handshake with rank {}: {}", peer, e));
        return;
    }

    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            shared.fail(format!("writing to rank {}: {}", peer, e));
            return;
        }
        // Batch whatever is already queued into the same flush.
        while let Ok(next) = frames.try_recv() {
            if let Err(e) = writer.write_all(&next).await {
                shared.fail(format!("writing to rank {}: {}", peer, e));
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            shared.fail(format!("flushing to rank {}: {}", peer, e));
            return;
        }
    }

    if let Err(e) = writer.write_all(&encode_frame(FRAME_GOODBYE, &[])).await {
        tracing::debug!("Goodbye to rank {} not delivered: {}", peer, e);
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}
