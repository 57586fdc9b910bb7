//! Active-Message Engine
//!
//! Owns the poller thread of one rank. The poller drains the process group,
//! decodes envelopes and dispatches them: replies complete pending requests,
//! runtime messages go to system handlers, everything else to the
//! [`HandlerRegistry`], inline or on the [`ThreadPool`].
//!
//! ## Accounting
//! Every application envelope (requests, fire-and-forget messages and their
//! replies) bumps `sent` before it is handed to the transport and `processed`
//! after its handler returned on the receiver. A handler's reply is sent
//! before its own envelope counts as processed, so the global sums can only
//! balance once the whole exchange is over. System envelopes used by
//! collectives are not counted. A send the transport rejects is uncounted
//! again, so a caught send error leaves later fences balanced.

use super::codec::Codec;
use super::protocol::{Envelope, ReplyBody};
use super::registry::{HandlerEntry, HandlerRegistry};
use super::types::{Dispatch, HandlerId, RmiStats};
use crate::config::RuntimeConfig;
use crate::error::{Result, WorldError, fatal, panic_message};
use crate::executor::future::{Future, pair};
use crate::executor::pool::ThreadPool;
use crate::group::types::{ProcessGroup, Rank};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

type ReplyCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + Sync>;

/// Runtime-protocol handler; runs inline on the poller and is never counted.
pub type SystemFn = Arc<dyn Fn(Rank, &[u8]) -> Result<()> + Send + Sync>;

/// A typed handler could not decode its arguments or encode its result.
/// Treated as a protocol failure, not as a handler error.
#[derive(Debug, Error)]
#[error("{0}")]
struct CodecFailure(WorldError);

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    processed: AtomicU64,
    inline: AtomicU64,
    pooled: AtomicU64,
    replies: AtomicU64,
}

pub struct RmiEngine {
    group: Arc<dyn ProcessGroup>,
    pool: Arc<ThreadPool>,
    registry: HandlerRegistry,
    system: DashMap<HandlerId, SystemFn>,
    /// Requests waiting for a reply, by correlation tag.
    pending: DashMap<u64, ReplyCallback>,
    next_tag: AtomicU64,
    counters: Counters,
    running: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
    poll_idle_spins: u32,
    poll_sleep: Duration,
}

impl RmiEngine {
    pub fn new(
        group: Arc<dyn ProcessGroup>,
        pool: Arc<ThreadPool>,
        config: &RuntimeConfig,
    ) -> Arc<Self> {
        let rank = group.rank();
        Arc::new(Self {
            group,
            pool,
            registry: HandlerRegistry::new(rank),
            system: DashMap::new(),
            pending: DashMap::new(),
            next_tag: AtomicU64::new(1),
            counters: Counters::default(),
            running: AtomicBool::new(false),
            poller: Mutex::new(None),
            poll_idle_spins: config.poll_idle_spins,
            poll_sleep: config.poll_sleep(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Transport health, as reported by the process group.
    pub fn check_peers(&self) -> Result<()> {
        self.group.check_peers()
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    /// Starts the poller thread. Starting a running engine is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rmi-poller-{}", self.rank()))
            .spawn(move || engine.poll_loop())
            .unwrap_or_else(|err| panic!("failed to spawn rmi poller: {}", err));
        *self.poller.lock() = Some(handle);

        tracing::info!("RMI poller started on rank {}", self.rank());
    }

    /// Stops the poller and breaks every request still waiting for a reply.
    /// Envelopes left in the transport are not dispatched.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.poller.lock().take()
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            tracing::warn!("RMI poller on rank {} exited abnormally", self.rank());
        }

        let abandoned = self.pending.len();
        self.pending.clear();
        if abandoned > 0 {
            tracing::warn!(
                "Rank {} stopped with {} requests awaiting replies",
                self.rank(),
                abandoned
            );
        }
        tracing::info!("RMI poller stopped on rank {}", self.rank());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ============================================================
    // REGISTRATION
    // ============================================================

    /// Registers a byte-level handler. Must happen identically on every rank
    /// before any peer sends to it.
    pub fn register<F>(&self, name: &str, dispatch: Dispatch, handler: F) -> Result<HandlerId>
    where
        F: Fn(Rank, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.registry.register(name, dispatch, handler)
    }

    /// Registers a handler whose argument and result go through [`Codec`].
    pub fn register_typed<A, R, F>(
        &self,
        name: &str,
        dispatch: Dispatch,
        handler: F,
    ) -> Result<HandlerId>
    where
        A: Codec + 'static,
        R: Codec + 'static,
        F: Fn(Rank, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.registry.register(name, dispatch, move |from, bytes| {
            let arg = A::decode(bytes).map_err(CodecFailure)?;
            let result = handler(from, arg)?;
            Ok(result.encode().map_err(CodecFailure)?)
        })
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        self.registry.unregister(id)
    }

    /// Installs a handler for a reserved id.
    pub(crate) fn register_system(&self, id: HandlerId, handler: SystemFn) {
        debug_assert!(id.is_system(), "{} is not a reserved id", id);
        self.system.insert(id, handler);
    }

    // ============================================================
    // SENDING
    // ============================================================

    /// Fire-and-forget. Errors raised by the remote handler are logged there.
    pub fn send(&self, target: Rank, handler: HandlerId, payload: Vec<u8>) -> Result<()> {
        self.transmit(target, handler, None, payload, true)
    }

    /// Sends a request and returns a future for the handler's encoded result.
    pub fn send_with_response(
        &self,
        target: Rank,
        handler: HandlerId,
        payload: Vec<u8>,
    ) -> Future<Vec<u8>> {
        let (promise, future) = pair();
        if let Err(err) =
            self.send_with_callback(target, handler, payload, move |result| promise.resolve(result))
        {
            return Future::failed(err);
        }
        future
    }

    /// Sends a request; `callback` runs on the poller when the reply arrives.
    /// It must be cheap and must not block.
    pub fn send_with_callback<F>(
        &self,
        target: Rank,
        handler: HandlerId,
        payload: Vec<u8>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + Sync + 'static,
    {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        // Registered first: the reply can beat the return from `transmit`.
        self.pending.insert(tag, Box::new(callback));

        if let Err(err) = self.transmit(target, handler, Some(tag), payload, true) {
            self.pending.remove(&tag);
            return Err(err);
        }
        Ok(())
    }

    /// Typed fire-and-forget.
    pub fn post<A: Codec>(&self, target: Rank, handler: HandlerId, arg: &A) -> Result<()> {
        self.send(target, handler, arg.encode()?)
    }

    /// Typed request/response.
    pub fn call<A, R>(&self, target: Rank, handler: HandlerId, arg: &A) -> Future<R>
    where
        A: Codec,
        R: Codec + Send + 'static,
    {
        let payload = match arg.encode() {
            Ok(payload) => payload,
            Err(err) => return Future::failed(err),
        };

        let (promise, future) = pair();
        let sent = self.send_with_callback(target, handler, payload, move |result| {
            promise.resolve(result.and_then(|bytes| R::decode(&bytes)))
        });
        match sent {
            Ok(()) => future,
            Err(err) => Future::failed(err),
        }
    }

    /// Sends a runtime-protocol envelope that the fence does not count.
    pub(crate) fn send_system(
        &self,
        target: Rank,
        handler: HandlerId,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.transmit(target, handler, None, payload, false)
    }

    fn transmit(
        &self,
        target: Rank,
        handler: HandlerId,
        tag: Option<u64>,
        payload: Vec<u8>,
        counted: bool,
    ) -> Result<()> {
        let envelope = Envelope {
            handler,
            sender: self.rank(),
            tag,
            payload,
        };
        let bytes = envelope.encode()?;
        tracing::trace!("Sending {} to rank {} ({} bytes)", handler, target, envelope.payload.len());

        if !counted {
            return self.group.send(target, bytes);
        }

        // Counted before the handoff: the receiver may process the message
        // before `send` returns. A send that never left is taken back.
        self.counters.sent.fetch_add(1, Ordering::SeqCst);
        let sent = self.group.send(target, bytes);
        if sent.is_err() {
            self.counters.sent.fetch_sub(1, Ordering::SeqCst);
        }
        sent
    }

    // ============================================================
    // DISPATCH
    // ============================================================

    fn poll_loop(self: Arc<Self>) {
        let span = tracing::info_span!("poller", rank = self.rank());
        let _entered = span.enter();

        let mut idle: u32 = 0;
        while self.running.load(Ordering::SeqCst) {
            match self.group.try_receive() {
                Ok(Some((bytes, from))) => {
                    idle = 0;
                    if let Err(err) = self.dispatch(&bytes, from) {
                        fatal(&err);
                    }
                }
                Ok(None) => {
                    idle = idle.saturating_add(1);
                    if idle > self.poll_idle_spins {
                        std::thread::sleep(self.poll_sleep);
                    } else {
                        std::thread::yield_now();
                    }
                }
                Err(err) => fatal(&err),
            }
        }
    }

    /// Decodes one delivery and routes it. An `Err` means the protocol is
    /// broken; the poller aborts on it.
    pub(crate) fn dispatch(self: &Arc<Self>, bytes: &[u8], from: Rank) -> Result<()> {
        let envelope = Envelope::decode(bytes, from)?;

        if envelope.handler == HandlerId::REPLY {
            return self.complete_reply(envelope);
        }

        if envelope.handler.is_system() {
            let handler = self
                .system
                .get(&envelope.handler)
                .map(|entry| entry.value().clone())
                .ok_or(WorldError::HandlerNotFound {
                    id: envelope.handler,
                    rank: self.rank(),
                })?;
            return handler(from, &envelope.payload);
        }

        let entry = self.registry.lookup(envelope.handler)?;
        tracing::trace!("Dispatching '{}' from rank {}", entry.name, from);

        match entry.dispatch {
            Dispatch::Inline => {
                self.counters.inline.fetch_add(1, Ordering::Relaxed);
                self.run_handler(&entry, envelope)
            }
            Dispatch::Pool => {
                self.counters.pooled.fetch_add(1, Ordering::Relaxed);
                let engine = self.clone();
                self.pool.execute(move || {
                    if let Err(err) = engine.run_handler(&entry, envelope) {
                        fatal(&err);
                    }
                })
            }
        }
    }

    fn run_handler(&self, entry: &HandlerEntry, envelope: Envelope) -> Result<()> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (entry.handler)(envelope.sender, &envelope.payload)
        }));

        let outcome = match outcome {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => match err.downcast::<CodecFailure>() {
                Ok(CodecFailure(codec_err)) => return Err(codec_err),
                Err(err) => Err(format!("{:#}", err)),
            },
            Err(payload) => Err(panic_message(payload.as_ref())),
        };

        match envelope.tag {
            Some(tag) => {
                let body = match outcome {
                    Ok(bytes) => ReplyBody::Ok(bytes),
                    Err(message) => ReplyBody::Err {
                        handler: entry.name.to_string(),
                        message,
                    },
                };
                self.transmit(envelope.sender, HandlerId::REPLY, Some(tag), body.encode()?, true)?;
            }
            None => {
                if let Err(message) = outcome {
                    tracing::error!(
                        "Handler '{}' failed for message from rank {}: {}",
                        entry.name,
                        envelope.sender,
                        message
                    );
                }
            }
        }

        self.counters.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn complete_reply(&self, envelope: Envelope) -> Result<()> {
        let malformed = |reason: &str| WorldError::MalformedEnvelope {
            sender: envelope.sender,
            reason: reason.to_string(),
        };

        let tag = envelope.tag.ok_or_else(|| malformed("reply without a tag"))?;
        let (_, callback) = self
            .pending
            .remove(&tag)
            .ok_or_else(|| malformed("reply for an unknown request"))?;

        let result = match ReplyBody::decode(&envelope.payload)? {
            ReplyBody::Ok(bytes) => Ok(bytes),
            ReplyBody::Err { handler, message } => Err(WorldError::RemoteHandler {
                rank: envelope.sender,
                handler,
                message,
            }),
        };
        callback(result);

        self.counters.replies.fetch_add(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    // ============================================================
    // STATISTICS
    // ============================================================

    /// Reads `processed` before `sent`, so a snapshot never shows a message
    /// as processed that it does not also show as sent.
    pub fn stats(&self) -> RmiStats {
        let processed = self.counters.processed.load(Ordering::SeqCst);
        let sent = self.counters.sent.load(Ordering::SeqCst);
        RmiStats {
            sent,
            processed,
            inline: self.counters.inline.load(Ordering::Relaxed),
            pooled: self.counters.pooled.load(Ordering::Relaxed),
            replies: self.counters.replies.load(Ordering::Relaxed),
        }
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}
