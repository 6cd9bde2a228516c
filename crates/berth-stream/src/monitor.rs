//! The event dispatcher.
//!
//! A [`Monitor`] owns at most one open event-stream connection no matter
//! how many subscriptions exist. It is inactive until the first
//! [`subscribe`](Monitor::subscribe), which opens the connection and starts
//! a reader thread; [`close`](Monitor::close) aborts the connection, waits
//! for the reader to release it, and signals every live subscription to
//! stop.
//!
//! The registry of subscription queues is the only shared mutable state.
//! It is guarded by one mutex that is never held across a queue send or a
//! network call: dispatch snapshots the matching queues under the lock,
//! releases it, and then delivers; activation opens the stream first and
//! installs it under the lock afterwards.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use berth_common::config::{MonitorConfig, OverflowPolicy};
use berth_common::constants::EVENTS_PATH;
use berth_common::error::{BerthError, Result};
use berth_common::types::{SubjectKey, SubscriptionId};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select, unbounded};

use crate::event::Event;
use crate::subscription::{DeliveryChannels, Subscription};
use crate::transport::{Closer, StreamTransport, check_status};

/// Handle to an event dispatcher.
///
/// Cloning yields another handle to the same dispatcher. One instance per
/// daemon connection is the intended usage; nothing enforces it.
#[derive(Clone)]
pub struct Monitor {
    shared: Arc<Shared>,
}

impl Monitor {
    /// Creates an inactive monitor. No connection is opened until the
    /// first subscription.
    pub fn new(transport: Arc<dyn StreamTransport>, config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                state: Mutex::new(State::default()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers interest in events for `key`.
    ///
    /// The first subscription on an inactive monitor opens the event
    /// stream; later ones only register a queue.
    ///
    /// # Errors
    ///
    /// Returns the transport or status error if the event stream cannot be
    /// opened, or an I/O error if the delivery thread cannot be spawned.
    pub fn subscribe(&self, key: SubjectKey) -> Result<Subscription> {
        let id = SubscriptionId::generate();
        let channels = if let Some(channels) = self.shared.register(id, &key) {
            channels
        } else {
            let connection = self.shared.open_events(None)?;
            let (channels, spare) = {
                let mut state = self.shared.lock();
                let spare = if state.active.is_none() {
                    self.shared.activate(&mut state, connection)?;
                    None
                } else {
                    Some(connection)
                };
                let Some(active) = state.active.as_mut() else {
                    return Err(BerthError::Transport {
                        message: "event monitor failed to activate".into(),
                    });
                };
                (self.shared.enroll(active, id, &key), spare)
            };
            if let Some(spare) = spare {
                tracing::debug!("monitor activated concurrently, dropping extra connection");
                spare.abort();
            }
            channels
        };

        tracing::debug!(%id, subject = %key, "subscription registered");
        Subscription::spawn(id, key.clone(), channels, Arc::downgrade(&self.shared)).inspect_err(
            |_| self.shared.deregister(&key, id),
        )
    }

    /// Shuts the monitor down.
    ///
    /// Aborts the event connection, clears the registry, and signals every
    /// live subscription's delivery loop to exit. Returns once the reader
    /// has released the connection, unless called from the reader itself.
    /// Closing an inactive monitor is a no-op. A later
    /// [`subscribe`](Self::subscribe) opens a fresh connection.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for symmetry with
    /// [`Subscription::cancel`].
    pub fn close(&self) -> Result<()> {
        let active = self.shared.lock().active.take();
        if let Some(active) = active {
            tracing::info!(
                generation = active.generation,
                subscribers = active.subscriber_count(),
                "event monitor closed"
            );
            active.shut_down();
        }
        Ok(())
    }

    /// Returns whether an event connection is currently held.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    /// Returns the number of registered subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .lock()
            .active
            .as_ref()
            .map_or(0, Active::subscriber_count)
    }

    /// Returns how many events were discarded by queue overflow policies.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.shared.config)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// State shared between monitor handles, the reader thread, and
/// subscriptions (which hold it weakly for deregistration).
pub(crate) struct Shared {
    transport: Arc<dyn StreamTransport>,
    config: MonitorConfig,
    state: Mutex<State>,
    dropped: AtomicU64,
}

#[derive(Default)]
struct State {
    generation: u64,
    active: Option<Active>,
}

/// Everything that exists only while the monitor is active.
///
/// Dropping it is the shutdown: the reader's stop flag is raised, its
/// current body is aborted, and the shutdown sender disconnects, which
/// every delivery loop and a reader waiting out a backoff observe.
struct Active {
    generation: u64,
    registry: HashMap<SubjectKey, Vec<QueueEntry>>,
    stop: Arc<AtomicBool>,
    /// Closer of the body the reader currently owns.
    closer: Option<Closer>,
    reader: Option<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
}

impl Active {
    fn subscriber_count(&self) -> usize {
        self.registry.values().map(Vec::len).sum()
    }

    fn signal_stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        drop(self.shutdown_tx.take());
        if let Some(closer) = &self.closer {
            closer.close();
        }
    }

    /// Stops the reader and waits until it has dropped its connection.
    fn shut_down(mut self) {
        self.signal_stop();
        let Some(reader) = self.reader.take() else {
            return;
        };
        if reader.thread().id() == thread::current().id() {
            return;
        }
        if reader.join().is_err() {
            tracing::warn!(generation = self.generation, "event reader panicked");
        }
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

/// An opened event-stream body and the handle that aborts it.
struct Connection {
    body: Box<dyn Read + Send>,
    closer: Option<Closer>,
}

impl Connection {
    fn abort(self) {
        if let Some(closer) = &self.closer {
            closer.close();
        }
    }
}

/// Dispatch-side end of one subscription's queue.
#[derive(Clone)]
struct QueueEntry {
    id: SubscriptionId,
    tx: Sender<Arc<Event>>,
    /// Receiver clone used to evict the oldest event under `DropOldest`.
    evict: Option<Receiver<Arc<Event>>>,
    /// Disconnects when the subscription's delivery loop exits.
    done: Receiver<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a queue for `id` if the monitor is already active.
    fn register(&self, id: SubscriptionId, key: &SubjectKey) -> Option<DeliveryChannels> {
        let mut state = self.lock();
        let active = state.active.as_mut()?;
        Some(self.enroll(active, id, key))
    }

    fn enroll(&self, active: &mut Active, id: SubscriptionId, key: &SubjectKey) -> DeliveryChannels {
        let (entry, channels) = self.new_queue(id, &active.shutdown_rx);
        active.registry.entry(key.clone()).or_default().push(entry);
        channels
    }

    /// Starts a reader for a new generation on an already opened stream.
    fn activate(self: &Arc<Self>, state: &mut State, connection: Connection) -> Result<()> {
        state.generation += 1;
        let generation = state.generation;
        let stop = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let Connection { body, closer } = connection;

        let reader = EventReader {
            shared: Arc::downgrade(self),
            generation,
            stop: Arc::clone(&stop),
            shutdown: shutdown_rx.clone(),
            last_time: None,
        };
        let handle = thread::Builder::new()
            .name(format!("berth-events-{generation}"))
            .spawn(move || reader.run(body))
            .map_err(|e| BerthError::io("spawning event reader thread", e))?;

        state.active = Some(Active {
            generation,
            registry: HashMap::new(),
            stop,
            closer,
            reader: Some(handle),
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
        });
        tracing::info!(generation, "event monitor active");
        Ok(())
    }

    fn open_events(&self, since: Option<&str>) -> Result<Connection> {
        let path = since.map_or_else(
            || EVENTS_PATH.to_string(),
            |since| format!("{EVENTS_PATH}?since={since}"),
        );
        let response = self.transport.open_abortable(&path)?;
        let closer = response.closer.clone();
        let body = check_status(response, "event stream", EVENTS_PATH)?;
        Ok(Connection { body, closer })
    }

    /// Records the closer of a reconnected body for `generation`.
    ///
    /// Returns false if that generation was shut down meanwhile.
    fn adopt(&self, generation: u64, closer: Option<Closer>) -> bool {
        let mut state = self.lock();
        match state.active.as_mut() {
            Some(active) if active.generation == generation => {
                active.closer = closer;
                true
            }
            _ => false,
        }
    }

    fn new_queue(&self, id: SubscriptionId, shutdown: &Receiver<()>) -> (QueueEntry, DeliveryChannels) {
        let (tx, events) = self
            .config
            .queue_capacity
            .map_or_else(unbounded, |cap| bounded(cap.max(1)));
        let (done_tx, done) = bounded(0);
        let evict = (self.config.overflow == OverflowPolicy::DropOldest).then(|| events.clone());
        (
            QueueEntry {
                id,
                tx,
                evict,
                done,
            },
            DeliveryChannels {
                events,
                shutdown: shutdown.clone(),
                done: done_tx,
            },
        )
    }

    /// Removes one subscription's queue by identity, keeping the order of
    /// the remaining entries for that subject.
    pub(crate) fn deregister(&self, key: &SubjectKey, id: SubscriptionId) {
        let mut state = self.lock();
        let Some(active) = state.active.as_mut() else {
            return;
        };
        if let Some(entries) = active.registry.get_mut(key) {
            remove_entry(entries, |e| e.id == id);
            if entries.is_empty() {
                let _ = active.registry.remove(key);
            }
        }
    }

    /// Delivers one event to every matching queue of `generation`.
    ///
    /// Returns false if that generation is no longer active. A blocking
    /// send gives up once `shutdown` disconnects.
    fn dispatch(&self, generation: u64, shutdown: &Receiver<()>, event: Event) -> bool {
        let targets: Vec<QueueEntry> = {
            let state = self.lock();
            let Some(active) = state.active.as_ref().filter(|a| a.generation == generation) else {
                return false;
            };
            let specific = SubjectKey::subject(event.id.as_str());
            let wildcard = active.registry.get(&SubjectKey::All).into_iter().flatten();
            let matching = if specific.is_wildcard() {
                None
            } else {
                active.registry.get(&specific)
            };
            wildcard.chain(matching.into_iter().flatten()).cloned().collect()
        };

        let event = Arc::new(event);
        for target in &targets {
            self.deliver(target, shutdown, Arc::clone(&event));
        }
        true
    }

    fn deliver(&self, target: &QueueEntry, shutdown: &Receiver<()>, event: Arc<Event>) {
        match self.config.overflow {
            OverflowPolicy::Block => {
                select! {
                    send(target.tx, event) -> _ => {}
                    recv(target.done) -> _ => {}
                    recv(shutdown) -> _ => {}
                }
            }
            OverflowPolicy::DropNewest => {
                if let Err(TrySendError::Full(event)) = target.tx.try_send(event) {
                    self.record_drop(target.id, &event);
                }
            }
            OverflowPolicy::DropOldest => {
                let mut pending = event;
                loop {
                    match target.tx.try_send(pending) {
                        Ok(()) | Err(TrySendError::Disconnected(_)) => break,
                        Err(TrySendError::Full(back)) => {
                            let Some(evicted) = target.evict.as_ref().and_then(|rx| rx.try_recv().ok())
                            else {
                                self.record_drop(target.id, &back);
                                break;
                            };
                            self.record_drop(target.id, &evicted);
                            pending = back;
                        }
                    }
                }
            }
        }
    }

    fn record_drop(&self, id: SubscriptionId, event: &Event) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%id, status = %event.status, subject = %event.id, "subscription queue full, event dropped");
    }

    /// Tears down `generation` after its connection could not be restored.
    fn deactivate(&self, generation: u64) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|a| a.generation == generation) {
            state.active = None;
            tracing::warn!(generation, "event stream lost, monitor deactivated");
        }
    }
}

/// Removes the first entry matching `pred`, preserving the order of the
/// rest.
fn remove_entry<T>(entries: &mut Vec<T>, pred: impl Fn(&T) -> bool) {
    if let Some(pos) = entries.iter().position(pred) {
        let _ = entries.remove(pos);
    }
}

/// Why one connection's read loop ended.
enum ReadOutcome {
    /// Close was requested or the generation is gone; exit quietly.
    Stopped,
    /// The connection ended, cleanly or not.
    Ended {
        error: Option<BerthError>,
        delivered: bool,
    },
}

/// Reads lines from the event stream of one monitor generation.
struct EventReader {
    shared: Weak<Shared>,
    generation: u64,
    stop: Arc<AtomicBool>,
    /// Disconnects when the generation shuts down; ends backoff waits early.
    shutdown: Receiver<()>,
    last_time: Option<Since>,
}

impl EventReader {
    fn run(mut self, mut body: Box<dyn Read + Send>) {
        let mut attempt = 0_u32;
        loop {
            match self.pump(body) {
                ReadOutcome::Stopped => return,
                ReadOutcome::Ended { error, delivered } => {
                    if delivered {
                        attempt = 0;
                    }
                    match error {
                        Some(e) => tracing::warn!(generation = self.generation, error = %e, "event stream failed"),
                        None => tracing::info!(generation = self.generation, "event stream closed by daemon"),
                    }
                }
            }
            if self.stop.load(Ordering::Acquire) {
                return;
            }

            let Some(next) = self.reconnect(&mut attempt) else {
                return;
            };
            body = next;
        }
    }

    /// Reads and dispatches lines until the connection ends or a stop is
    /// requested.
    fn pump(&mut self, body: Box<dyn Read + Send>) -> ReadOutcome {
        let mut reader = BufReader::new(body);
        let mut line = String::new();
        let mut delivered = false;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return ReadOutcome::Stopped;
            }
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    return ReadOutcome::Ended {
                        error: None,
                        delivered,
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    return ReadOutcome::Ended {
                        error: Some(BerthError::io("reading event stream", e)),
                        delivered,
                    };
                }
            }
            if self.stop.load(Ordering::Acquire) {
                return ReadOutcome::Stopped;
            }

            let event = match Event::parse_line(&line) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, line = line.trim(), "skipping malformed event");
                    continue;
                }
            };
            if let Some(since) = Since::after(&event) {
                self.last_time = Some(since);
            }

            let Some(shared) = self.shared.upgrade() else {
                return ReadOutcome::Stopped;
            };
            if !shared.dispatch(self.generation, &self.shutdown, event) {
                return ReadOutcome::Stopped;
            }
            delivered = true;
        }
    }

    /// Re-opens the stream with exponential backoff, resuming after the
    /// last event seen. Deactivates the monitor when retries run out.
    fn reconnect(&self, attempt: &mut u32) -> Option<Box<dyn Read + Send>> {
        loop {
            let shared = self.shared.upgrade()?;
            let policy = &shared.config.reconnect;
            *attempt += 1;
            if *attempt > policy.max_retries {
                shared.deactivate(self.generation);
                return None;
            }
            let delay = policy.backoff(*attempt);
            drop(shared);

            let _ = self.shutdown.recv_timeout(delay);
            if self.stop.load(Ordering::Acquire) {
                return None;
            }

            let shared = self.shared.upgrade()?;
            let since = self.last_time.map(Since::to_query);
            match shared.open_events(since.as_deref()) {
                Ok(connection) => {
                    if self.stop.load(Ordering::Acquire)
                        || !shared.adopt(self.generation, connection.closer.clone())
                    {
                        tracing::debug!(generation = self.generation, "closed while reconnecting");
                        connection.abort();
                        return None;
                    }
                    tracing::info!(generation = self.generation, attempt = *attempt, "event stream reconnected");
                    return Some(connection.body);
                }
                Err(e) => {
                    tracing::warn!(generation = self.generation, attempt = *attempt, error = %e, "event stream reconnect failed");
                }
            }
        }
    }
}

/// Resume point for a reconnect, just past the last event seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Since {
    Nanos(i64),
    Seconds(i64),
}

impl Since {
    fn after(event: &Event) -> Option<Self> {
        event
            .time_nano
            .map(|n| Self::Nanos(n.saturating_add(1)))
            .or_else(|| event.time.map(Self::Seconds))
    }

    /// Formats as the daemon's `since` parameter (`secs` or `secs.nanos`).
    fn to_query(self) -> String {
        match self {
            Self::Nanos(n) => {
                format!("{}.{:09}", n.div_euclid(1_000_000_000), n.rem_euclid(1_000_000_000))
            }
            Self::Seconds(s) => s.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_entry_only_entry() {
        let mut entries = vec![1];
        remove_entry(&mut entries, |e| *e == 1);
        assert!(entries.is_empty());
    }

    #[test]
    fn remove_entry_preserves_order_of_rest() {
        let mut entries = vec![1, 2, 3, 4];
        remove_entry(&mut entries, |e| *e == 2);
        assert_eq!(entries, vec![1, 3, 4]);
    }

    #[test]
    fn remove_entry_missing_is_noop() {
        let mut entries = vec![1, 2];
        remove_entry(&mut entries, |e| *e == 9);
        assert_eq!(entries, vec![1, 2]);
    }

    fn event(line: &str) -> Event {
        Event::parse_line(line).expect("parse").expect("event")
    }

    #[test]
    fn since_prefers_nanos_and_skips_past_last_event() {
        let since = Since::after(&event(r#"{"status":"a","id":"b","time":1,"timeNano":1999999999}"#))
            .expect("since");
        assert_eq!(since.to_query(), "2.000000000");
    }

    #[test]
    fn since_falls_back_to_seconds() {
        let since = Since::after(&event(r#"{"status":"a","id":"b","time":1000}"#)).expect("since");
        assert_eq!(since.to_query(), "1000");
    }

    #[test]
    fn since_absent_without_timestamps() {
        assert!(Since::after(&event(r#"{"status":"a","id":"b"}"#)).is_none());
    }
}
