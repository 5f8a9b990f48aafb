//! # Subscription Slot
//!
//! A slot connects one protocol event source to at most one external
//! subscriber. It is the only path notifications take out of the core.
//!
//! ```text
//!   event source ──publish──► [bounded queue] ──► delivery task ──► notifier
//!                  (non-blocking)                 (one per subscription)
//! ```
//!
//! ## Invariants
//!
//! - At most one subscription is active. `subscribe` on an active slot fails
//!   with [`SubscriptionError::AlreadySubscribed`]; `unsubscribe` on an idle
//!   slot fails with [`SubscriptionError::NoActiveSubscription`].
//! - The notifier runs on the delivery task, never on the publisher's task,
//!   and sees notifications in publish order.
//! - The slot's lock guards only the state flip. It is never held while a
//!   notifier runs, so a notifier may call back into its own slot.
//! - `unsubscribe` returns after the delivery task has exited; the in-flight
//!   notification (if any) completes first. The slot reads as active until
//!   then.
//! - A notifier error ends the subscription. Nothing is retried.
//!
//! While no subscriber is attached, published notifications are held in a
//! small in-memory cache and handed to the next subscriber first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{NOTIFICATION_QUEUE_CAPACITY, PENDING_NOTIFICATION_CACHE};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the subscription whose delivery task is the current task.
    static DELIVERING: u64;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("a subscription is already active")]
    AlreadySubscribed,

    #[error("no active subscription")]
    NoActiveSubscription,

    #[error("notification queue is full")]
    QueueFull,
}

/// The subscriber could not take a notification (e.g. its stream closed).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Receives notifications of type `N`.
#[async_trait]
pub trait Notifier<N>: Send + Sync + 'static {
    async fn notify(&self, notif: N) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<N, F> Notifier<N> for F
where
    N: Send + 'static,
    F: Fn(N) -> Result<(), DeliveryError> + Send + Sync + 'static,
{
    async fn notify(&self, notif: N) -> Result<(), DeliveryError> {
        (self)(notif)
    }
}

/// What happened to a published notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Published {
    /// Queued for the active subscriber.
    Queued,
    /// No subscriber; held for the next one.
    Cached,
}

enum Phase<N> {
    Idle,
    Active {
        id: u64,
        queue: mpsc::Sender<N>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
    Cancelling {
        id: u64,
    },
}

impl<N> Phase<N> {
    fn id(&self) -> Option<u64> {
        match self {
            Phase::Idle => None,
            Phase::Active { id, .. } | Phase::Cancelling { id } => Some(*id),
        }
    }
}

struct SlotState<N> {
    phase: Phase<N>,
    cache: VecDeque<N>,
}

impl<N> SlotState<N> {
    fn cache(&mut self, slot: &str, notif: N) -> Published {
        if self.cache.len() >= PENDING_NOTIFICATION_CACHE {
            self.cache.pop_front();
            warn!(slot, "notification cache full, oldest entry dropped");
        }
        self.cache.push_back(notif);
        Published::Cached
    }
}

/// Single-subscriber notification slot. See the module docs.
pub struct SubscriptionSlot<N> {
    name: String,
    state: Arc<Mutex<SlotState<N>>>,
}

impl<N: Send + 'static> SubscriptionSlot<N> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(SlotState {
                phase: Phase::Idle,
                cache: VecDeque::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True from a successful `subscribe` until its delivery task has exited.
    pub fn is_active(&self) -> bool {
        !matches!(self.state.lock().phase, Phase::Idle)
    }

    /// Notifications waiting for a subscriber.
    pub fn cached(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Attach `notifier` and start its delivery task. Must be called from
    /// within a tokio runtime.
    pub fn subscribe<T: Notifier<N>>(&self, notifier: T) -> Result<(), SubscriptionError> {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Idle) {
            return Err(SubscriptionError::AlreadySubscribed);
        }

        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY + state.cache.len());
        for notif in state.cache.drain(..) {
            // Capacity covers the whole cache.
            let _ = queue.try_send(notif);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(DELIVERING.scope(
            id,
            deliver(
                self.name.clone(),
                id,
                rx,
                notifier,
                cancel.clone(),
                Arc::clone(&self.state),
            ),
        ));
        state.phase = Phase::Active {
            id,
            queue,
            cancel,
            task,
        };
        debug!(slot = %self.name, subscription = id, "subscribed");
        Ok(())
    }

    /// Cancel the active subscription and wait for its delivery task to exit.
    ///
    /// Called from the subscription's own notifier, this only requests the
    /// cancellation: the task exits as soon as that notifier returns.
    pub async fn unsubscribe(&self) -> Result<(), SubscriptionError> {
        let (id, cancel, task) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::Active {
                    id, cancel, task, ..
                } => {
                    state.phase = Phase::Cancelling { id };
                    (id, cancel, task)
                }
                other => {
                    state.phase = other;
                    return Err(SubscriptionError::NoActiveSubscription);
                }
            }
        };
        cancel.cancel();

        if DELIVERING.try_with(|current| *current == id).unwrap_or(false) {
            debug!(slot = %self.name, subscription = id, "unsubscribed from own notifier");
            return Ok(());
        }

        if let Err(e) = task.await {
            if e.is_panic() {
                warn!(slot = %self.name, subscription = id, "notifier panicked");
            }
        }
        let mut state = self.state.lock();
        if state.phase.id() == Some(id) {
            state.phase = Phase::Idle;
        }
        debug!(slot = %self.name, subscription = id, "unsubscribed");
        Ok(())
    }

    /// Hand a notification to the subscriber without blocking.
    ///
    /// Fails only when the subscriber is too slow to keep up with the queue.
    pub fn publish(&self, notif: N) -> Result<Published, SubscriptionError> {
        let mut state = self.state.lock();
        let notif = match &state.phase {
            Phase::Active { queue, .. } => match queue.try_send(notif) {
                Ok(()) => return Ok(Published::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(slot = %self.name, "subscriber queue full, notification refused");
                    return Err(SubscriptionError::QueueFull);
                }
                // Delivery task already gone; treat the slot as idle.
                Err(mpsc::error::TrySendError::Closed(n)) => n,
            },
            Phase::Idle | Phase::Cancelling { .. } => notif,
        };
        Ok(state.cache(&self.name, notif))
    }

    /// Unsubscribe if active and drop cached notifications.
    pub async fn close(&self) {
        match self.unsubscribe().await {
            Ok(()) | Err(SubscriptionError::NoActiveSubscription) => {}
            Err(e) => warn!(slot = %self.name, error = %e, "close failed to unsubscribe"),
        }
        self.state.lock().cache.clear();
    }
}

impl<N> Drop for SubscriptionSlot<N> {
    fn drop(&mut self) {
        if let Phase::Active { cancel, .. } = &self.state.lock().phase {
            cancel.cancel();
        }
    }
}

impl<N> std::fmt::Debug for SubscriptionSlot<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionSlot")
            .field("name", &self.name)
            .field("subscription", &state.phase.id())
            .field("cached", &state.cache.len())
            .finish()
    }
}

async fn deliver<N, T>(
    slot: String,
    id: u64,
    mut rx: mpsc::Receiver<N>,
    notifier: T,
    cancel: CancellationToken,
    state: Arc<Mutex<SlotState<N>>>,
) where
    N: Send + 'static,
    T: Notifier<N>,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(notif) => {
                    if let Err(e) = notifier.notify(notif).await {
                        warn!(slot = %slot, subscription = id, error = %e, "delivery failed, ending subscription");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Anything still queued goes back to the cache for the next subscriber,
    // unless the subscription was cancelled on purpose.
    let leftovers: Vec<N> = if cancel.is_cancelled() {
        Vec::new()
    } else {
        rx.close();
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    };

    let mut st = state.lock();
    if st.phase.id() == Some(id) {
        st.phase = Phase::Idle;
        for notif in leftovers {
            st.cache(&slot, notif);
        }
    }
    debug!(slot = %slot, subscription = id, "delivery task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn collector<N: Send + 'static>(
    ) -> (impl Notifier<N>, tokio::sync::mpsc::UnboundedReceiver<N>) {
        let (tx, rx) = unbounded_channel();
        let notifier = move |n: N| tx.send(n).map_err(|e| DeliveryError(e.to_string()));
        (notifier, rx)
    }

    async fn wait_idle<N: Send + 'static>(slot: &SubscriptionSlot<N>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while slot.is_active() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("slot did not become idle");
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_state_machine() {
        let slot: SubscriptionSlot<u32> = SubscriptionSlot::new("test");

        assert_eq!(
            slot.unsubscribe().await,
            Err(SubscriptionError::NoActiveSubscription)
        );

        let (n1, _rx1) = collector();
        slot.subscribe(n1).unwrap();
        assert!(slot.is_active());

        let (n2, _rx2) = collector();
        assert_eq!(slot.subscribe(n2), Err(SubscriptionError::AlreadySubscribed));

        slot.unsubscribe().await.unwrap();
        assert!(!slot.is_active());
        assert_eq!(
            slot.unsubscribe().await,
            Err(SubscriptionError::NoActiveSubscription)
        );

        let (n3, _rx3) = collector();
        slot.subscribe(n3).unwrap();
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let slot = SubscriptionSlot::new("ordered");
        let (notifier, mut rx) = collector();
        slot.subscribe(notifier).unwrap();

        for i in 0..50u32 {
            assert_eq!(slot.publish(i), Ok(Published::Queued));
        }
        for i in 0..50u32 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn idle_slot_caches_and_replays() {
        let slot = SubscriptionSlot::new("cached");
        assert_eq!(slot.publish(1u32), Ok(Published::Cached));
        assert_eq!(slot.publish(2u32), Ok(Published::Cached));
        assert_eq!(slot.cached(), 2);

        let (notifier, mut rx) = collector();
        slot.subscribe(notifier).unwrap();
        slot.publish(3).unwrap();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(slot.cached(), 0);
    }

    #[tokio::test]
    async fn cache_drops_oldest_when_full() {
        let slot = SubscriptionSlot::new("bounded");
        for i in 0..(PENDING_NOTIFICATION_CACHE as u32 + 3) {
            slot.publish(i).unwrap();
        }
        assert_eq!(slot.cached(), PENDING_NOTIFICATION_CACHE);

        let (notifier, mut rx) = collector();
        slot.subscribe(notifier).unwrap();
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn delivery_error_ends_subscription() {
        let slot = SubscriptionSlot::new("failing");
        let notifier = |n: u32| {
            if n == 1 {
                Err(DeliveryError("stream closed".into()))
            } else {
                Ok(())
            }
        };
        slot.subscribe(notifier).unwrap();
        slot.publish(0).unwrap();
        slot.publish(1).unwrap();

        wait_idle(&slot).await;
        assert_eq!(
            slot.unsubscribe().await,
            Err(SubscriptionError::NoActiveSubscription)
        );
        let (fresh, _rx) = collector();
        slot.subscribe(fresh).unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_waits_for_in_flight_delivery() {
        struct Slow {
            started: tokio::sync::mpsc::UnboundedSender<()>,
            finished: Arc<AtomicBool>,
        }

        #[async_trait]
        impl Notifier<u32> for Slow {
            async fn notify(&self, _n: u32) -> Result<(), DeliveryError> {
                let _ = self.started.send(());
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let slot = SubscriptionSlot::new("slow");
        let (started_tx, mut started_rx) = unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        slot.subscribe(Slow {
            started: started_tx,
            finished: Arc::clone(&finished),
        })
        .unwrap();

        slot.publish(7).unwrap();
        started_rx.recv().await.unwrap();

        slot.unsubscribe().await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(!slot.is_active());
    }

    #[tokio::test]
    async fn notifier_can_reenter_its_slot() {
        struct Reentrant {
            slot: Arc<SubscriptionSlot<u32>>,
            seen: tokio::sync::mpsc::UnboundedSender<u32>,
        }

        #[async_trait]
        impl Notifier<u32> for Reentrant {
            async fn notify(&self, n: u32) -> Result<(), DeliveryError> {
                // Touching the slot from inside delivery must not deadlock.
                assert!(self.slot.is_active());
                if n == 0 {
                    self.slot.publish(1).map_err(|e| DeliveryError(e.to_string()))?;
                } else {
                    self.slot
                        .unsubscribe()
                        .await
                        .map_err(|e| DeliveryError(e.to_string()))?;
                }
                let _ = self.seen.send(n);
                Ok(())
            }
        }

        let slot = Arc::new(SubscriptionSlot::new("reentrant"));
        let (seen_tx, mut seen_rx) = unbounded_channel();
        slot.subscribe(Reentrant {
            slot: Arc::clone(&slot),
            seen: seen_tx,
        })
        .unwrap();
        slot.publish(0).unwrap();

        assert_eq!(seen_rx.recv().await, Some(0));
        assert_eq!(seen_rx.recv().await, Some(1));
        wait_idle(&slot).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribe_exactly_one_wins() {
        for _ in 0..200 {
            let slot = Arc::new(SubscriptionSlot::<u32>::new("race"));
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let attempts: Vec<_> = (0..2)
                .map(|_| {
                    let slot = Arc::clone(&slot);
                    let barrier = Arc::clone(&barrier);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        slot.subscribe(|_n: u32| -> Result<(), DeliveryError> { Ok(()) })
                    })
                })
                .collect();

            let mut ok = 0;
            let mut already = 0;
            for handle in attempts {
                match handle.await.unwrap() {
                    Ok(()) => ok += 1,
                    Err(SubscriptionError::AlreadySubscribed) => already += 1,
                    Err(other) => panic!("unexpected error {:?}", other),
                }
            }
            assert_eq!((ok, already), (1, 1));
            slot.unsubscribe().await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_clears_everything() {
        let slot = SubscriptionSlot::new("closing");
        slot.publish(1u32).unwrap();
        slot.close().await;
        assert_eq!(slot.cached(), 0);

        let (notifier, _rx) = collector();
        slot.subscribe(notifier).unwrap();
        slot.close().await;
        assert!(!slot.is_active());
    }
}
