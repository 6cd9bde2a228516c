//! Per-caller subscription handles and their delivery loops.
//!
//! Each subscription owns a thread that waits on three signals: an event
//! arriving on its private queue, a cancellation request, and the
//! monitor's shutdown signal. Handlers run on that thread, one event at a
//! time, in the order events were dispatched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use berth_common::error::{BerthError, Result};
use berth_common::types::{SubjectKey, SubscriptionId};
use crossbeam_channel::{Receiver, Sender, bounded, select};

use crate::event::Event;
use crate::monitor::Shared;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    by_status: HashMap<String, Handler>,
    fallback: Option<Handler>,
}

impl HandlerTable {
    fn lookup(&self, status: &str) -> Option<Handler> {
        self.by_status
            .get(status)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Channels handed from the monitor to a new subscription's loop.
pub(crate) struct DeliveryChannels {
    pub events: Receiver<Arc<Event>>,
    pub shutdown: Receiver<()>,
    /// Held by the loop; its disconnection tells dispatch the loop is gone.
    pub done: Sender<()>,
}

/// A registered interest in events for one subject or for all subjects.
///
/// Events whose status has no handler are dropped. Dropping the handle
/// cancels the subscription.
pub struct Subscription {
    id: SubscriptionId,
    key: SubjectKey,
    handlers: Arc<Mutex<HandlerTable>>,
    active: Arc<AtomicBool>,
    cancel_tx: Sender<Sender<()>>,
    monitor: Weak<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
}

impl Subscription {
    /// Starts the delivery loop for a queue the monitor already registered.
    pub(crate) fn spawn(
        id: SubscriptionId,
        key: SubjectKey,
        channels: DeliveryChannels,
        monitor: Weak<Shared>,
    ) -> Result<Self> {
        let handlers = Arc::new(Mutex::new(HandlerTable::default()));
        let active = Arc::new(AtomicBool::new(true));
        let (cancel_tx, cancel_rx) = bounded::<Sender<()>>(0);

        let loop_handlers = Arc::clone(&handlers);
        let loop_active = Arc::clone(&active);
        let worker = thread::Builder::new()
            .name(format!("berth-sub-{key}"))
            .spawn(move || delivery_loop(&channels, &cancel_rx, &loop_handlers, &loop_active))
            .map_err(|e| BerthError::io("spawning subscription thread", e))?;

        tracing::debug!(%id, subject = %key, "subscription started");
        Ok(Self {
            id,
            key,
            handlers,
            active,
            cancel_tx,
            monitor,
            worker_thread: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Registers `handler` for events whose status equals `status`,
    /// replacing any previous handler for that status.
    pub fn handle<F>(&self, status: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let _ = lock(&self.handlers).by_status.insert(status.into(), Arc::new(handler));
    }

    /// Registers a handler for statuses that have no specific handler.
    pub fn handle_all<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        lock(&self.handlers).fallback = Some(Arc::new(handler));
    }

    /// Stops delivery and removes this subscription from its monitor.
    ///
    /// Blocks until the delivery loop acknowledges, so no handler runs
    /// for this subscription once `cancel` has returned. Cancelling an
    /// inactive subscription is a no-op.
    ///
    /// When called from inside one of this subscription's own handlers the
    /// loop cannot acknowledge; the subscription is marked cancelled and
    /// the loop exits as soon as the handler returns.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for transports that
    /// need to release resources on cancellation.
    pub fn cancel(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.deregister(&self.key, self.id);
        }
        if thread::current().id() == self.worker_thread {
            tracing::debug!(id = %self.id, "subscription cancelled from its own handler");
            return Ok(());
        }

        let (ack_tx, ack_rx) = bounded::<()>(0);
        if self.cancel_tx.send(ack_tx).is_ok() {
            let _ = ack_rx.recv();
        }
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                tracing::warn!(id = %self.id, "subscription handler panicked");
            }
        }
        tracing::debug!(id = %self.id, subject = %self.key, "subscription cancelled");
        Ok(())
    }

    /// Returns the subject this subscription is keyed on.
    #[must_use]
    pub const fn subject(&self) -> &SubjectKey {
        &self.key
    }

    /// Returns this subscription's identity.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns whether the delivery loop is still running.
    ///
    /// Becomes false after [`cancel`](Self::cancel) or once the monitor has
    /// shut down.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

fn delivery_loop(
    channels: &DeliveryChannels,
    cancel: &Receiver<Sender<()>>,
    handlers: &Mutex<HandlerTable>,
    active: &AtomicBool,
) {
    loop {
        select! {
            recv(cancel) -> ack => {
                if let Ok(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }
            recv(channels.shutdown) -> _ => {
                tracing::debug!("monitor shut down, subscription loop exiting");
                break;
            }
            recv(channels.events) -> event => {
                let Ok(event) = event else { break };
                if !active.load(Ordering::Acquire) {
                    break;
                }
                let handler = lock(handlers).lookup(&event.status);
                if let Some(handler) = handler {
                    handler(&event);
                }
                if !active.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
    active.store(false, Ordering::Release);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crossbeam_channel::{RecvTimeoutError, unbounded};

    fn event(status: &str) -> Arc<Event> {
        Arc::new(
            Event::parse_line(&format!(r#"{{"status":"{status}","id":"abc"}}"#))
                .expect("parse")
                .expect("event"),
        )
    }

    fn detached(key: SubjectKey) -> (Subscription, Sender<Arc<Event>>, Sender<()>, Receiver<()>) {
        let (events_tx, events) = unbounded();
        let (shutdown_tx, shutdown) = unbounded();
        let (done, done_rx) = bounded(0);
        let sub = Subscription::spawn(
            SubscriptionId::generate(),
            key,
            DeliveryChannels {
                events,
                shutdown,
                done,
            },
            Weak::new(),
        )
        .expect("spawn");
        (sub, events_tx, shutdown_tx, done_rx)
    }

    #[test]
    fn handler_runs_for_matching_status_only() {
        let (sub, events, _shutdown, _done) = detached(SubjectKey::All);
        let (seen_tx, seen_rx) = unbounded();
        sub.handle("start", move |e| {
            let _ = seen_tx.send(e.status.clone());
        });

        events.send(event("create")).expect("send");
        events.send(event("start")).expect("send");

        let got = seen_rx.recv_timeout(Duration::from_secs(2)).expect("delivered");
        assert_eq!(got, "start");
        assert!(seen_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn fallback_handler_receives_unhandled_statuses() {
        let (sub, events, _shutdown, _done) = detached(SubjectKey::All);
        let (seen_tx, seen_rx) = unbounded();
        let specific = seen_tx.clone();
        sub.handle("die", move |_| {
            let _ = specific.send("specific");
        });
        sub.handle_all(move |_| {
            let _ = seen_tx.send("fallback");
        });

        events.send(event("die")).expect("send");
        events.send(event("oom")).expect("send");

        let timeout = Duration::from_secs(2);
        assert_eq!(seen_rx.recv_timeout(timeout).expect("first"), "specific");
        assert_eq!(seen_rx.recv_timeout(timeout).expect("second"), "fallback");
    }

    #[test]
    fn cancel_is_idempotent() {
        let (sub, _events, _shutdown, _done) = detached(SubjectKey::subject("abc"));
        sub.cancel().expect("first cancel");
        assert!(!sub.is_active());
        sub.cancel().expect("second cancel");
    }

    #[test]
    fn cancel_waits_for_running_handler() {
        let (sub, events, _shutdown, _done) = detached(SubjectKey::All);
        let (entered_tx, entered_rx) = bounded(1);
        let (finished_tx, finished_rx) = unbounded();
        sub.handle("start", move |_| {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(100));
            let _ = finished_tx.send(());
        });

        events.send(event("start")).expect("send");
        entered_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("handler entered");
        sub.cancel().expect("cancel");

        assert!(finished_rx.try_recv().is_ok(), "handler finished before cancel returned");
        let _ = events.send(event("start"));
        thread::sleep(Duration::from_millis(50));
        assert!(finished_rx.try_recv().is_err());
    }

    #[test]
    fn shutdown_signal_stops_loop_and_done_disconnects() {
        let (sub, _events, shutdown, done) = detached(SubjectKey::All);
        drop(shutdown);

        assert!(matches!(
            done.recv_timeout(Duration::from_secs(2)),
            Err(RecvTimeoutError::Disconnected)
        ));
        assert!(!sub.is_active());
        sub.cancel().expect("cancel after shutdown");
    }

    #[test]
    fn cancel_from_own_handler_does_not_deadlock() {
        let (sub, events, _shutdown, done) = detached(SubjectKey::All);
        let sub = Arc::new(sub);
        let inner = Arc::downgrade(&sub);
        sub.handle("stop", move |_| {
            if let Some(sub) = inner.upgrade() {
                sub.cancel().expect("self cancel");
            }
        });

        events.send(event("stop")).expect("send");

        assert!(matches!(
            done.recv_timeout(Duration::from_secs(2)),
            Err(RecvTimeoutError::Disconnected)
        ));
        assert!(!sub.is_active());
    }
}
