//! Per-device event queue.
//!
//! Transport callbacks never touch device state. They push a [`DeviceEvent`]
//! into a bounded queue drained by the device's own event loop. Every event is
//! stamped with a sequence number at enqueue time so the owner can tell
//! events caused by its latest fan-out from ones queued before it.
//!
//! When the bounded queue is full, events spill into an overflow that the
//! receiver drains after the queue. Timers and completions are never lost.
//! Attribute events in the overflow coalesce per `(fqdn, name)` so only the
//! latest value of each attribute is kept.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::attribute::{AttributeEvent, EventCallback};
use crate::transport::{CommandCompletion, CompletionCallback};

/// Kind of timer that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The scan duration elapsed.
    ScanDuration,
    /// A pending command ran past its budget.
    CommandTimeout,
}

/// Input to a device's event loop.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A subscribed child attribute changed.
    Attribute(AttributeEvent),
    /// An asynchronous command completed.
    Completion(CommandCompletion),
    /// A timer fired for the given generation.
    Timer {
        /// Which timer.
        kind: TimerKind,
        /// Generation the timer was armed for.
        generation: u64,
    },
}

/// An event with its enqueue sequence number.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Monotonic per-queue sequence number, starting at 1.
    pub seq: u64,
    /// The event.
    pub event: DeviceEvent,
}

/// Events that did not fit in the bounded queue, ordered by sequence number.
#[derive(Debug, Default)]
struct Spill {
    events: BTreeMap<u64, QueuedEvent>,
    /// Sequence number of the pending event for each attribute.
    attributes: HashMap<(String, String), u64>,
}

impl Spill {
    fn push(&mut self, queued: QueuedEvent) {
        if let DeviceEvent::Attribute(attr) = &queued.event {
            let key = (attr.fqdn.clone(), attr.name.clone());
            if let Some(stale) = self.attributes.insert(key, queued.seq) {
                self.events.remove(&stale);
            }
        }
        self.events.insert(queued.seq, queued);
    }

    fn pop(&mut self) -> Option<QueuedEvent> {
        let (_, queued) = self.events.pop_first()?;
        if let DeviceEvent::Attribute(attr) = &queued.event {
            self.attributes.remove(&(attr.fqdn.clone(), attr.name.clone()));
        }
        Some(queued)
    }
}

#[derive(Debug, Default)]
struct Overflow {
    spill: Mutex<Spill>,
    notify: Notify,
}

/// Sending half of a device queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    owner: Arc<str>,
    tx: mpsc::Sender<QueuedEvent>,
    seq: Arc<AtomicU64>,
    overflow: Arc<Overflow>,
}

/// Receiving half of a device queue.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<QueuedEvent>,
    overflow: Arc<Overflow>,
}

/// Create a bounded queue for the device `owner`.
#[must_use]
pub fn channel(owner: &str, capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let overflow = Arc::new(Overflow::default());
    (
        EventSender {
            owner: Arc::from(owner),
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            overflow: Arc::clone(&overflow),
        },
        EventReceiver { rx, overflow },
    )
}

impl EventSender {
    /// Enqueue an event without blocking. Returns `false` only when the
    /// receiver is gone.
    pub fn send(&self, event: DeviceEvent) -> bool {
        if self.tx.is_closed() {
            trace!(device = %self.owner, "event queue closed");
            return false;
        }
        // Sequence numbers are taken under the spill lock so that nothing
        // newer reaches the bounded queue while older events wait in the spill.
        let mut spill = self.overflow.spill.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let queued = QueuedEvent { seq, event };
        let queued = if spill.events.is_empty() {
            match self.tx.try_send(queued) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(queued)) => queued,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(device = %self.owner, "event queue closed");
                    return false;
                }
            }
        } else {
            queued
        };
        debug!(device = %self.owner, seq, "event queue full, spilling event");
        spill.push(queued);
        drop(spill);
        self.overflow.notify.notify_one();
        true
    }

    /// Sequence number of the last event handed out. Events enqueued after
    /// this call carry a larger number.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Subscription callback forwarding change events into the queue.
    #[must_use]
    pub fn attribute_callback(&self) -> EventCallback {
        let sender = self.clone();
        Arc::new(move |event| {
            sender.send(DeviceEvent::Attribute(event));
        })
    }

    /// Completion callback forwarding into the queue.
    #[must_use]
    pub fn completion_callback(&self) -> CompletionCallback {
        let sender = self.clone();
        Box::new(move |completion| {
            sender.send(DeviceEvent::Completion(completion));
        })
    }

    /// Arm a one-shot timer. Cancelling `token` disarms it.
    pub fn arm_timer(
        &self,
        kind: TimerKind,
        generation: u64,
        after: Duration,
        token: CancellationToken,
    ) {
        let sender = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    sender.send(DeviceEvent::Timer { kind, generation });
                }
            }
        });
    }
}

impl EventReceiver {
    /// Wait for the next event. Returns `None` once every sender is gone and
    /// nothing is left to deliver.
    pub async fn recv(&mut self) -> Option<QueuedEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(queued) => return Some(queued),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return self.overflow.spill.lock().pop();
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if let Some(queued) = self.overflow.spill.lock().pop() {
                return Some(queued);
            }
            tokio::select! {
                queued = self.rx.recv() => {
                    return match queued {
                        Some(queued) => Some(queued),
                        None => self.overflow.spill.lock().pop(),
                    };
                }
                () = self.overflow.notify.notified() => {}
            }
        }
    }
}
