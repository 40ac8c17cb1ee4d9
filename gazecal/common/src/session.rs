use api::{GazeSample, SampleSink, TrackerBackend, TrackerError, TrackerEvent};
use glam::Vec2;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::Error;

/// Per-subscriber queue depth. The driver thread never blocks on a slow
/// consumer; a full queue drops that consumer's sample instead.
const QUEUE_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    tx: SyncSender<TrackerEvent>,
}

struct SessionShared {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    latest: RwLock<Option<GazeSample>>,
    last_timestamp_us: AtomicI64,
    dropped: AtomicU64,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            latest: RwLock::new(None),
            last_timestamp_us: AtomicI64::new(i64::MIN),
            dropped: AtomicU64::new(0),
        }
    }

    /// Runs on the backend's driver thread: short critical sections, no I/O.
    fn dispatch(&self, event: TrackerEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        match &event {
            TrackerEvent::Sample(sample) => {
                let prev = self
                    .last_timestamp_us
                    .swap(sample.timestamp_us, Ordering::SeqCst);
                if prev != i64::MIN && sample.timestamp_us < prev {
                    use std::cell::Cell;
                    thread_local! {
                        static LAST_TS_WARN: Cell<Option<std::time::Instant>> = const { Cell::new(None) };
                    }
                    let now = std::time::Instant::now();
                    let should_log = LAST_TS_WARN.with(|cell| match cell.get() {
                        Some(last) if now.duration_since(last).as_secs() < 5 => false,
                        _ => {
                            cell.set(Some(now));
                            true
                        }
                    });
                    if should_log {
                        warn!(
                            "Sample timestamp regressed ({} -> {} us); passing through in delivery order",
                            prev, sample.timestamp_us
                        );
                    }
                }
                if let Ok(mut latest) = self.latest.write() {
                    *latest = Some(*sample);
                }
            }
            TrackerEvent::StreamClosed { reason } => {
                self.closed.store(true, Ordering::SeqCst);
                info!("Tracker stream closed: {}", reason);
            }
        }

        if let Ok(subscribers) = self.subscribers.lock() {
            for subscriber in subscribers.iter() {
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        use std::cell::Cell;
                        thread_local! {
                            static LAST_DROP_WARN: Cell<Option<std::time::Instant>> = const { Cell::new(None) };
                        }
                        let now = std::time::Instant::now();
                        let should_log = LAST_DROP_WARN.with(|cell| match cell.get() {
                            Some(last) if now.duration_since(last).as_secs() < 5 => false,
                            _ => {
                                cell.set(Some(now));
                                true
                            }
                        });
                        if should_log {
                            warn!(
                                "Subscriber {} queue full; {} sample(s) dropped so far",
                                subscriber.id, total
                            );
                        }
                    }
                    // Receiver already gone; the guard will remove the entry.
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }
    }

    fn remove(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|s| s.id != id);
        }
        debug!("Subscriber {} unregistered", id);
    }
}

struct SessionSink {
    shared: Arc<SessionShared>,
}

impl SampleSink for SessionSink {
    fn deliver(&self, event: TrackerEvent) {
        self.shared.dispatch(event);
    }
}

/// Removes the subscriber from the fan-out when dropped. Events already
/// queued remain readable on the receiver side until it is dropped too.
pub struct SubscriptionGuard {
    id: u64,
    shared: Arc<SessionShared>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.shared.remove(self.id);
    }
}

/// A consumer's live view of the sample stream.
pub struct Subscription {
    guard: SubscriptionGuard,
    events: Receiver<TrackerEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.guard.id
    }

    pub fn try_recv(&self) -> Result<TrackerEvent, TryRecvError> {
        self.events.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<TrackerEvent, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    /// Split into the removal guard and the raw receiver; used by consumers
    /// that drain on their own thread while the owner keeps cancellation.
    pub fn into_parts(self) -> (SubscriptionGuard, Receiver<TrackerEvent>) {
        (self.guard, self.events)
    }
}

/// Owns the connection to one hardware device and fans its stream out to
/// any number of concurrent consumers.
pub struct TrackerSession {
    backend: Mutex<Box<dyn TrackerBackend>>,
    shared: Arc<SessionShared>,
    streaming: AtomicBool,
}

impl TrackerSession {
    pub fn new(backend: Box<dyn TrackerBackend>) -> Self {
        info!("Tracker session opened on '{}'", backend.name());
        Self {
            backend: Mutex::new(backend),
            shared: Arc::new(SessionShared::new()),
            streaming: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = sync_channel(QUEUE_CAPACITY);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.push(Subscriber { id, tx });
        }
        debug!("Subscriber {} registered", id);
        Subscription {
            guard: SubscriptionGuard {
                id,
                shared: self.shared.clone(),
            },
            events: rx,
        }
    }

    /// Idempotent: a second start while streaming is a no-op.
    pub fn start_stream(&self) -> Result<(), Error> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Tracker(TrackerError::StreamClosed(
                "stream already closed".into(),
            )));
        }
        if self.streaming.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sink: Arc<dyn SampleSink> = Arc::new(SessionSink {
            shared: self.shared.clone(),
        });
        let result = self.with_backend(|backend| backend.start_stream(sink));
        if result.is_err() {
            self.streaming.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Idempotent: stopping a stopped stream is a no-op.
    pub fn stop_stream(&self) -> Result<(), Error> {
        if !self.streaming.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.with_backend(|backend| backend.stop_stream())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Whether the device signaled a terminal stream close.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Latest sample seen on the stream, if any.
    pub fn current_gaze(&self) -> Option<GazeSample> {
        self.shared.latest.read().ok().and_then(|latest| *latest)
    }

    /// Samples dropped across all subscribers due to full queues.
    pub fn dropped_samples(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn begin_calibration(&self) -> Result<(), Error> {
        self.with_backend(|backend| backend.begin_calibration())
    }

    pub fn collect_calibration_point(&self, target: Vec2) -> Result<(), Error> {
        self.with_backend(|backend| backend.collect_calibration_point(target))
    }

    pub fn discard_calibration_point(&self, target: Vec2) -> Result<(), Error> {
        self.with_backend(|backend| backend.discard_calibration_point(target))
    }

    pub fn apply_calibration(&self) -> Result<(), Error> {
        self.with_backend(|backend| backend.apply_calibration())
    }

    pub fn end_calibration(&self) -> Result<(), Error> {
        self.with_backend(|backend| backend.end_calibration())
    }

    fn with_backend<T>(
        &self,
        f: impl FnOnce(&mut dyn TrackerBackend) -> Result<T, TrackerError>,
    ) -> Result<T, Error> {
        let mut guard = self
            .backend
            .lock()
            .map_err(|_| Error::Tracker(TrackerError::Backend("backend lock poisoned".into())))?;
        f(guard.as_mut()).map_err(Error::from)
    }
}

impl Drop for TrackerSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop_stream() {
            warn!("Failed to stop stream on session drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{EyeGaze, GazeSample};

    fn sample(timestamp_us: i64) -> TrackerEvent {
        TrackerEvent::Sample(GazeSample {
            timestamp_us,
            left: EyeGaze::valid(Vec2::new(0.5, 0.5), 3.0),
            right: EyeGaze::valid(Vec2::new(0.5, 0.5), 3.0),
        })
    }

    #[test]
    fn fan_out_reaches_every_subscriber() {
        let shared = Arc::new(SessionShared::new());
        let (tx_a, rx_a) = sync_channel(8);
        let (tx_b, rx_b) = sync_channel(8);
        shared
            .subscribers
            .lock()
            .unwrap()
            .extend([Subscriber { id: 1, tx: tx_a }, Subscriber { id: 2, tx: tx_b }]);

        shared.dispatch(sample(10));
        shared.dispatch(sample(20));

        for rx in [rx_a, rx_b] {
            let timestamps: Vec<i64> = rx
                .try_iter()
                .map(|event| match event {
                    TrackerEvent::Sample(s) => s.timestamp_us,
                    other => panic!("unexpected event {:?}", other),
                })
                .collect();
            assert_eq!(timestamps, vec![10, 20]);
        }
    }

    #[test]
    fn removed_subscriber_receives_nothing_further() {
        let shared = Arc::new(SessionShared::new());
        let (tx, rx) = sync_channel(8);
        shared
            .subscribers
            .lock()
            .unwrap()
            .push(Subscriber { id: 7, tx });

        shared.dispatch(sample(1));
        shared.remove(7);
        shared.dispatch(sample(2));

        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let shared = Arc::new(SessionShared::new());
        let (tx, rx) = sync_channel(2);
        shared
            .subscribers
            .lock()
            .unwrap()
            .push(Subscriber { id: 3, tx });

        for i in 0..5 {
            shared.dispatch(sample(i));
        }

        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(shared.dropped.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn stream_close_latches_the_session() {
        let shared = Arc::new(SessionShared::new());
        let (tx, rx) = sync_channel(8);
        shared
            .subscribers
            .lock()
            .unwrap()
            .push(Subscriber { id: 4, tx });

        shared.dispatch(sample(1));
        shared.dispatch(TrackerEvent::StreamClosed {
            reason: "unplugged".into(),
        });
        // Nothing is delivered past the terminal event.
        shared.dispatch(sample(2));

        let events: Vec<TrackerEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TrackerEvent::StreamClosed { .. }));
        assert!(shared.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn latest_sample_is_cached() {
        let shared = Arc::new(SessionShared::new());
        shared.dispatch(sample(5));
        shared.dispatch(sample(9));
        assert_eq!(shared.latest.read().unwrap().unwrap().timestamp_us, 9);
    }
}
