//! Subscription fulfillment engine
//!
//! A fixed pool of OS threads shares one MPMC queue of subscription requests.
//! Each worker moves the requests it dequeues into a private list, so a
//! subscription is only ever touched by the thread that admitted it. Every tick a
//! worker drains the requests queued at that moment, then walks its list once,
//! sending at most one object per cursor.

use crate::connection::{ConnectionArena, ConnectionHandle, ConnectionState};
use crate::content_store::{ContentStore, ObjectLookup};
use crate::error::MoqtError;
use crate::moqt::{
    ObjectIdentifier, ObjectStreamMessage, SubscribeErrorCode, SubscribeErrorMessage,
    SubscribeMessage, SubscribeOkMessage, SubscriptionFilter, TrackIdentifier, WireFormat,
    WireMessage,
};
use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Priority stamped on every delivered object
pub const DEFAULT_PUBLISHER_PRIORITY: u8 = 0x80;

/// Subscription engine configuration
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Number of worker threads
    pub worker_threads: usize,
    /// Sleep between ticks that made no progress
    pub idle_backoff: Duration,
    /// How long a cursor may wait for an unpublished object, `None` waits forever
    pub live_tail_timeout: Option<Duration>,
    /// Cursors hold their position while this many buffers wait for admission
    pub max_queued_objects: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            idle_backoff: Duration::from_millis(1),
            live_tail_timeout: Some(Duration::from_secs(30)),
            max_queued_objects: 64,
        }
    }
}

/// A SUBSCRIBE waiting to be picked up by a worker
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    /// Connection the subscription belongs to
    pub connection: ConnectionHandle,
    /// Token from [`ConnectionState::begin_subscription`]
    pub token: u64,
    /// The request
    pub subscribe: SubscribeMessage,
}

/// Why a subscription failed, reported to the subscriber as SUBSCRIBE_ERROR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFailure {
    /// Error code sent to the peer
    pub code: SubscribeErrorCode,
    /// Reason phrase sent to the peer
    pub reason: String,
}

impl SubscriptionFailure {
    fn new(code: SubscribeErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Result of one fulfillment step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillOutcome {
    /// More to deliver, run again next tick
    Continue,
    /// Nothing left to deliver
    Done,
    /// The connection is gone, drop without notifying anyone
    ConnectionExpired,
    /// Tear down and report to the subscriber
    ProtocolError(SubscriptionFailure),
}

/// Everything a worker needs, shared by all workers
pub struct SubscriptionContext {
    store: Arc<dyn ContentStore>,
    arena: Arc<ConnectionArena>,
    config: SubscriptionConfig,
    active: AtomicUsize,
}

impl SubscriptionContext {
    /// Create a context
    pub fn new(
        store: Arc<dyn ContentStore>,
        arena: Arc<ConnectionArena>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            store,
            arena,
            config,
            active: AtomicUsize::new(0),
        }
    }

    /// Send SUBSCRIBE_ERROR for `state` and mark it for cleanup
    pub fn notify_subscription_error(&self, state: &mut SubscriptionState, failure: SubscriptionFailure) {
        state.mark_cleanup();
        warn!(
            "Subscription {} on {} failed: {}",
            state.subscribe.subscribe_id, state.connection, failure.reason
        );

        // Peer already gone, nobody to tell
        let Some(connection) = self.arena.resolve(state.connection) else {
            return;
        };

        let message = SubscribeErrorMessage {
            subscribe_id: state.subscribe.subscribe_id,
            error_code: failure.code.code(),
            reason: failure.reason,
            track_alias: state.subscribe.track_alias,
        };
        if let Err(e) = encode(&message).and_then(|buf| connection.enqueue_control_buffer(buf)) {
            warn!("Failed to send SUBSCRIBE_ERROR: {}", e);
        }
    }
}

fn encode<M: WireMessage>(message: &M) -> Result<Bytes, MoqtError> {
    let mut buf = BytesMut::new();
    WireFormat::serialize_message(&mut buf, message)?;
    Ok(buf.freeze())
}

/// One delivery cursor
#[derive(Debug, Clone)]
pub struct MinorSubscriptionState {
    next: ObjectIdentifier,
    last: Option<ObjectIdentifier>,
    // Last object sent, checked again while the cursor waits on the live tail
    anchor: Option<ObjectIdentifier>,
    waiting_since: Option<Instant>,
}

impl MinorSubscriptionState {
    /// Cursor starting at `next`, optionally ending at `last` inclusive
    pub fn new(next: ObjectIdentifier, last: Option<ObjectIdentifier>) -> Self {
        Self {
            next,
            last,
            anchor: None,
            waiting_since: None,
        }
    }

    /// Next object to send
    pub fn next_object(&self) -> ObjectIdentifier {
        self.next
    }

    /// Terminal object, if bounded
    pub fn last_object(&self) -> Option<ObjectIdentifier> {
        self.last
    }

    fn past_end(&self) -> bool {
        self.last.is_some_and(|last| self.next > last)
    }

    fn fulfill_some_minor(
        &mut self,
        connection: &ConnectionState,
        context: &SubscriptionContext,
        subscribe: &SubscribeMessage,
    ) -> FulfillOutcome {
        let store = &context.store;

        // Hold position until admission drains the queue
        if connection.queued_data_buffers() >= context.config.max_queued_objects.max(1) {
            trace!(
                "Subscription {} waiting on {} queued buffers",
                subscribe.subscribe_id,
                connection.queued_data_buffers()
            );
            return FulfillOutcome::Continue;
        }

        match store.get_object(&self.next) {
            ObjectLookup::DoesNotExist => {
                if let Some(outcome) = self.recheck_anchor(context) {
                    return outcome;
                }
                FulfillOutcome::ProtocolError(SubscriptionFailure::new(
                    SubscribeErrorCode::TrackDoesNotExist,
                    format!("Object {} does not exist", self.next),
                ))
            }
            ObjectLookup::NotFound => {
                if let Some(outcome) = self.recheck_anchor(context) {
                    return outcome;
                }
                self.wait_for_object(context)
            }
            ObjectLookup::Available(payload) => {
                let message = ObjectStreamMessage {
                    subscribe_id: subscribe.subscribe_id,
                    track_alias: subscribe.track_alias,
                    group_id: self.next.group,
                    object_id: self.next.object,
                    publisher_priority: DEFAULT_PUBLISHER_PRIORITY,
                    payload,
                };
                let buffer = match encode(&message) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        return FulfillOutcome::ProtocolError(SubscriptionFailure::new(
                            SubscribeErrorCode::InternalError,
                            e.to_string(),
                        ))
                    }
                };

                if let Err(e) = connection.enqueue_data_buffer(buffer) {
                    warn!("Dropping subscription {}: {}", subscribe.subscribe_id, e);
                    return FulfillOutcome::ConnectionExpired;
                }
                connection.set_current_group(self.next.track, self.next.group);
                trace!("Sent object {} for subscription {}", self.next, subscribe.subscribe_id);

                let sent = self.next;
                self.waiting_since = None;
                if self.last == Some(sent) || !store.advance(&mut self.next) {
                    return FulfillOutcome::Done;
                }
                self.anchor = Some(sent);
                if self.past_end() {
                    return FulfillOutcome::Done;
                }
                FulfillOutcome::Continue
            }
        }
    }

    // The cursor may be parked on a guessed position; ask the store again from the
    // last object sent, since a newer group may have started or the track ended
    fn recheck_anchor(&mut self, context: &SubscriptionContext) -> Option<FulfillOutcome> {
        let mut candidate = self.anchor?;
        if !context.store.advance(&mut candidate) {
            return Some(FulfillOutcome::Done);
        }
        if candidate == self.next {
            return None;
        }
        self.next = candidate;
        self.waiting_since = None;
        Some(if self.past_end() {
            FulfillOutcome::Done
        } else {
            FulfillOutcome::Continue
        })
    }

    fn wait_for_object(&mut self, context: &SubscriptionContext) -> FulfillOutcome {
        let since = *self.waiting_since.get_or_insert_with(Instant::now);
        match context.config.live_tail_timeout {
            Some(timeout) if since.elapsed() >= timeout => {
                FulfillOutcome::ProtocolError(SubscriptionFailure::new(
                    SubscribeErrorCode::Timeout,
                    format!("Object {} not published within {:?}", self.next, timeout),
                ))
            }
            _ => FulfillOutcome::Continue,
        }
    }
}

/// One active subscription, owned by a single worker
#[derive(Debug)]
pub struct SubscriptionState {
    connection: ConnectionHandle,
    token: u64,
    subscribe: SubscribeMessage,
    track: Option<TrackIdentifier>,
    cursors: Vec<MinorSubscriptionState>,
    objects_sent: u64,
    cleanup: bool,
}

impl SubscriptionState {
    /// Resolve the starting position of a subscription
    ///
    /// On failure the subscriber is notified and the state comes back already
    /// marked for cleanup, with no cursor. On success SUBSCRIBE_OK is queued.
    pub fn new(request: SubscriptionRequest, context: &SubscriptionContext) -> Self {
        let mut state = Self {
            connection: request.connection,
            token: request.token,
            subscribe: request.subscribe,
            track: None,
            cursors: Vec::new(),
            objects_sent: 0,
            cleanup: false,
        };

        let Some(connection) = context.arena.resolve(state.connection) else {
            debug!("Connection {} gone before subscription started", state.connection);
            state.mark_cleanup();
            return state;
        };

        match state.resolve_cursor(&connection, context) {
            Ok(cursor) => {
                state.cursors.push(cursor);
                state.acknowledge(&connection, context);
            }
            Err(failure) => context.notify_subscription_error(&mut state, failure),
        }
        state
    }

    fn resolve_cursor(
        &mut self,
        connection: &ConnectionState,
        context: &SubscriptionContext,
    ) -> Result<MinorSubscriptionState, SubscriptionFailure> {
        let store = &context.store;
        let subscribe = &self.subscribe;

        let track = store
            .resolve_alias(subscribe.track_alias)
            .or_else(|| store.resolve_track(&subscribe.track_namespace, &subscribe.track_name))
            .ok_or_else(|| {
                SubscriptionFailure::new(
                    SubscribeErrorCode::TrackDoesNotExist,
                    format!(
                        "Unknown track {}/{}",
                        subscribe.track_namespace, subscribe.track_name
                    ),
                )
            })?;
        self.track = Some(track);

        match subscribe.filter {
            SubscriptionFilter::LatestGroup | SubscriptionFilter::LatestObject => {
                let group = connection
                    .current_group(track)
                    .or_else(|| store.first_group(track))
                    .ok_or_else(|| {
                        SubscriptionFailure::new(
                            SubscribeErrorCode::TrackDoesNotExist,
                            format!("Track {} has no group", track),
                        )
                    })?;
                let object = store.first_object(track, group).ok_or_else(|| {
                    SubscriptionFailure::new(
                        SubscribeErrorCode::TrackDoesNotExist,
                        format!("Group {} of track {} has no object", group, track),
                    )
                })?;
                Ok(MinorSubscriptionState::new(
                    ObjectIdentifier::new(track, group, object),
                    None,
                ))
            }
            SubscriptionFilter::AbsoluteStart { start } => Ok(MinorSubscriptionState::new(
                ObjectIdentifier::new(track, start.group, start.object),
                None,
            )),
            SubscriptionFilter::AbsoluteRange { start, end } => {
                if start > end {
                    return Err(SubscriptionFailure::new(
                        SubscribeErrorCode::InvalidRange,
                        format!(
                            "Range start {}/{} is after end {}/{}",
                            start.group, start.object, end.group, end.object
                        ),
                    ));
                }
                Ok(MinorSubscriptionState::new(
                    ObjectIdentifier::new(track, start.group, start.object),
                    Some(ObjectIdentifier::new(track, end.group, end.object)),
                ))
            }
        }
    }

    fn acknowledge(&mut self, connection: &ConnectionState, context: &SubscriptionContext) {
        let message = SubscribeOkMessage {
            subscribe_id: self.subscribe.subscribe_id,
            expires_ms: 0,
            largest: self.track.and_then(|track| context.store.latest_object(track)),
        };
        if let Err(e) = encode(&message).and_then(|buf| connection.enqueue_control_buffer(buf)) {
            warn!("Failed to send SUBSCRIBE_OK: {}", e);
            self.mark_cleanup();
        }
    }

    /// Advance every cursor by at most one object
    pub fn fulfill_some(&mut self, context: &SubscriptionContext) -> FulfillOutcome {
        if self.cleanup {
            return FulfillOutcome::Done;
        }

        let Some(connection) = context.arena.resolve(self.connection) else {
            return FulfillOutcome::ConnectionExpired;
        };
        if connection.is_closed() {
            return FulfillOutcome::ConnectionExpired;
        }
        if connection.is_cancelled(self.subscribe.subscribe_id, self.token) {
            debug!(
                "Subscription {} cancelled or superseded",
                self.subscribe.subscribe_id
            );
            return FulfillOutcome::Done;
        }

        let mut index = 0;
        while index < self.cursors.len() {
            let cursor = &mut self.cursors[index];
            let next = cursor.next;
            match cursor.fulfill_some_minor(&connection, context, &self.subscribe) {
                FulfillOutcome::Continue => {
                    if cursor.next != next {
                        self.objects_sent += 1;
                    }
                    index += 1;
                }
                FulfillOutcome::Done => {
                    self.objects_sent += 1;
                    self.cursors.remove(index);
                }
                outcome => return outcome,
            }
        }

        if self.cursors.is_empty() {
            FulfillOutcome::Done
        } else {
            FulfillOutcome::Continue
        }
    }

    /// Flag the subscription for removal on the next compaction
    pub fn mark_cleanup(&mut self) {
        self.cleanup = true;
    }

    /// Give the subscribe id back to its connection
    pub fn release(&self, context: &SubscriptionContext) {
        if let Some(connection) = context.arena.resolve(self.connection) {
            connection.end_subscription(self.subscribe.subscribe_id, self.token);
        }
    }

    /// Whether the subscription is flagged for removal
    pub fn is_cleanup(&self) -> bool {
        self.cleanup
    }

    /// Connection the subscription belongs to
    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// The originating SUBSCRIBE
    pub fn subscribe(&self) -> &SubscribeMessage {
        &self.subscribe
    }

    /// Live cursors
    pub fn cursors(&self) -> &[MinorSubscriptionState] {
        &self.cursors
    }

    /// Progress counter, bumped whenever a cursor moves
    pub fn progress(&self) -> u64 {
        self.objects_sent
    }
}

/// Worker loop state: the private subscription list
pub struct SubscriptionWorker {
    context: Arc<SubscriptionContext>,
    receiver: Receiver<SubscriptionRequest>,
    subscriptions: Vec<SubscriptionState>,
}

impl SubscriptionWorker {
    /// Create a worker reading from `receiver`
    pub fn new(context: Arc<SubscriptionContext>, receiver: Receiver<SubscriptionRequest>) -> Self {
        Self {
            context,
            receiver,
            subscriptions: Vec::new(),
        }
    }

    fn admit(&mut self, request: SubscriptionRequest) {
        let state = SubscriptionState::new(request, &self.context);
        if state.is_cleanup() {
            state.release(&self.context);
        } else {
            self.context.active.fetch_add(1, Ordering::Relaxed);
            self.subscriptions.push(state);
        }
    }

    /// Run one tick, returns whether any cursor made progress
    pub fn tick(&mut self) -> bool {
        // Only what is queued now; later arrivals wait for the next tick
        for _ in 0..self.receiver.len() {
            match self.receiver.try_recv() {
                Ok(request) => self.admit(request),
                Err(_) => break,
            }
        }

        let mut progressed = false;
        for state in self.subscriptions.iter_mut() {
            let before = state.progress();
            match state.fulfill_some(&self.context) {
                FulfillOutcome::Continue => {}
                FulfillOutcome::Done => {
                    debug!("Subscription {} fulfilled", state.subscribe.subscribe_id);
                    state.mark_cleanup();
                }
                FulfillOutcome::ConnectionExpired => state.mark_cleanup(),
                FulfillOutcome::ProtocolError(failure) => {
                    self.context.notify_subscription_error(state, failure)
                }
            }
            progressed |= state.progress() != before;
        }

        let before = self.subscriptions.len();
        let context = &self.context;
        self.subscriptions.retain(|state| {
            if state.is_cleanup() {
                state.release(context);
                return false;
            }
            true
        });
        let removed = before - self.subscriptions.len();
        if removed > 0 {
            self.context.active.fetch_sub(removed, Ordering::Relaxed);
        }
        progressed
    }

    /// Number of subscriptions owned by this worker
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether this worker owns no subscription
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn run(mut self, shutdown: Arc<AtomicBool>) {
        let backoff = self.context.config.idle_backoff;
        while !shutdown.load(Ordering::Relaxed) {
            let progressed = self.tick();

            if self.subscriptions.is_empty() {
                match self.receiver.recv_timeout(backoff) {
                    Ok(request) => self.admit(request),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else if !progressed {
                thread::sleep(backoff);
            }
        }
        // Subscriptions still owned here are dropped with the worker
        self.context
            .active
            .fetch_sub(self.subscriptions.len(), Ordering::Relaxed);
    }
}

/// Pool of subscription workers
pub struct SubscriptionManager {
    sender: Sender<SubscriptionRequest>,
    context: Arc<SubscriptionContext>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("workers", &self.workers.len())
            .field("active", &self.active_subscriptions())
            .finish()
    }
}

impl SubscriptionManager {
    /// Spawn the worker pool
    pub fn new(
        store: Arc<dyn ContentStore>,
        arena: Arc<ConnectionArena>,
        config: SubscriptionConfig,
    ) -> Result<Self, MoqtError> {
        let worker_threads = config.worker_threads.max(1);
        let context = Arc::new(SubscriptionContext::new(store, arena, config));
        let (sender, receiver) = channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut manager = Self {
            sender,
            context: context.clone(),
            shutdown: shutdown.clone(),
            workers: Vec::with_capacity(worker_threads),
        };

        for index in 0..worker_threads {
            let worker = SubscriptionWorker::new(context.clone(), receiver.clone());
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("moqt-subscription-{}", index))
                .spawn(move || worker.run(shutdown))
                .map_err(|e| MoqtError::WorkerSpawn {
                    reason: e.to_string(),
                })?;
            manager.workers.push(handle);
        }

        info!("Started {} subscription workers", worker_threads);
        Ok(manager)
    }

    /// Register and queue a subscription; callable from any thread
    ///
    /// Fails with [`MoqtError::ConnectionExpired`] when `connection` is no longer
    /// in the arena.
    pub fn add_subscription(
        &self,
        connection: ConnectionHandle,
        subscribe: SubscribeMessage,
    ) -> Result<(), MoqtError> {
        let state = self
            .context
            .arena
            .resolve(connection)
            .ok_or(MoqtError::ConnectionExpired)?;
        let subscribe_id = subscribe.subscribe_id;
        let token = state.begin_subscription(subscribe_id);
        debug!("Queueing subscription {} for {}", subscribe_id, connection);

        let request = SubscriptionRequest {
            connection,
            token,
            subscribe,
        };
        if self.sender.send(request).is_err() {
            state.end_subscription(subscribe_id, token);
            return Err(MoqtError::InvalidState {
                expected: "running subscription workers".to_string(),
                actual: "workers stopped".to_string(),
            });
        }
        Ok(())
    }

    /// Subscriptions currently owned by workers
    pub fn active_subscriptions(&self) -> usize {
        self.context.active.load(Ordering::Relaxed)
    }

    /// Requests not yet picked up by a worker
    pub fn pending_requests(&self) -> usize {
        self.sender.len()
    }

    /// Stop and join all workers
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Subscription worker panicked");
            }
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
