//! Subscription batching shared by every connector.
//!
//! Operator-driven subscribe/unsubscribe calls are queued and flushed
//! together after a fixed interval, compressing bursts into one or two
//! protocol frames per connector. The timer is armed only when idle and is
//! never reset by later calls, which bounds the worst-case queue delay by
//! the batch interval.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// What a connector does when the batch fires. Unsubscribe is applied before
/// subscribe so a symbol moved between sets is never doubly subscribed.
#[async_trait]
pub trait SubscriptionSink: Send + Sync {
    async fn apply_subscribe(&self, tokens: Vec<String>);
    async fn apply_unsubscribe(&self, tokens: Vec<String>);

    /// Reconnect-style connectors restart their transport here; sticky
    /// connectors leave it as the default no-op.
    async fn after_subscription_flush(&self) {}
}

struct BatchState {
    pending_sub: HashSet<String>,
    pending_unsub: HashSet<String>,
    timer_active: bool,
    timer: Option<JoinHandle<()>>,
}

pub struct SubscriptionBatcher {
    interval: Duration,
    state: Mutex<BatchState>,
    sink: Mutex<Option<Weak<dyn SubscriptionSink>>>,
}

impl SubscriptionBatcher {
    pub fn new(interval_secs: f64) -> Arc<Self> {
        Arc::new(Self {
            interval: Duration::from_secs_f64(interval_secs),
            state: Mutex::new(BatchState {
                pending_sub: HashSet::new(),
                pending_unsub: HashSet::new(),
                timer_active: false,
                timer: None,
            }),
            sink: Mutex::new(None),
        })
    }

    /// Wires the owning connector in after construction (the connector owns
    /// the batcher, so the reference must be weak).
    pub fn bind(&self, sink: Weak<dyn SubscriptionSink>) {
        *self.sink.lock() = Some(sink);
    }

    pub fn subscribe(self: &Arc<Self>, tokens: &[String]) {
        if tokens.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for token in tokens {
            state.pending_sub.insert(token.clone());
            state.pending_unsub.remove(token);
        }
        self.arm_locked(&mut state);
    }

    pub fn unsubscribe(self: &Arc<Self>, tokens: &[String]) {
        if tokens.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for token in tokens {
            state.pending_unsub.insert(token.clone());
            state.pending_sub.remove(token);
        }
        self.arm_locked(&mut state);
    }

    fn arm_locked(self: &Arc<Self>, state: &mut BatchState) {
        if state.timer_active {
            return;
        }
        state.timer_active = true;
        let batcher = Arc::clone(self);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(batcher.interval).await;
            batcher.flush().await;
        }));
    }

    /// Snapshot-and-clear under the lock, then apply outside it.
    async fn flush(&self) {
        let (to_sub, to_unsub) = {
            let mut state = self.state.lock();
            state.timer_active = false;
            state.timer = None;
            (
                state.pending_sub.drain().collect::<Vec<_>>(),
                state.pending_unsub.drain().collect::<Vec<_>>(),
            )
        };
        if to_sub.is_empty() && to_unsub.is_empty() {
            return;
        }
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            if !to_unsub.is_empty() {
                sink.apply_unsubscribe(to_unsub).await;
            }
            if !to_sub.is_empty() {
                sink.apply_subscribe(to_sub).await;
            }
            sink.after_subscription_flush().await;
        }
    }

    /// Cancels the timer and forgets queued operations. Idempotent; called
    /// from `stop()`.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer_active = false;
        state.pending_sub.clear();
        state.pending_unsub.clear();
    }

    #[cfg(test)]
    fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.pending_sub.len(), state.pending_unsub.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: StdMutex<Vec<(String, Vec<String>)>>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SubscriptionSink for RecordingSink {
        async fn apply_subscribe(&self, mut tokens: Vec<String>) {
            tokens.sort();
            self.calls.lock().unwrap().push(("sub".to_string(), tokens));
        }

        async fn apply_unsubscribe(&self, mut tokens: Vec<String>) {
            tokens.sort();
            self.calls.lock().unwrap().push(("unsub".to_string(), tokens));
        }

        async fn after_subscription_flush(&self) {
            self.calls.lock().unwrap().push(("flush".to_string(), vec![]));
        }
    }

    fn wired(interval: f64) -> (Arc<SubscriptionBatcher>, Arc<RecordingSink>) {
        let batcher = SubscriptionBatcher::new(interval);
        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn SubscriptionSink> = sink.clone();
        batcher.bind(Arc::downgrade(&dyn_sink));
        // Keep the sink alive through the test via the returned Arc.
        std::mem::forget(dyn_sink);
        (batcher, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_subscribe_flushes_once() {
        let (batcher, sink) = wired(4.0);
        for _ in 0..5 {
            batcher.subscribe(&["BTC/USDT".to_string()]);
        }
        batcher.subscribe(&["ETH/USDT".to_string()]);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let calls = sink.calls();
        assert_eq!(
            calls,
            vec![
                (
                    "sub".to_string(),
                    vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]
                ),
                ("flush".to_string(), vec![]),
            ]
        );
        assert_eq!(batcher.pending(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_wins_over_earlier_subscribe() {
        let (batcher, sink) = wired(4.0);
        batcher.subscribe(&["BTC/USDT".to_string(), "ETH/USDT".to_string()]);
        batcher.unsubscribe(&["BTC/USDT".to_string()]);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let calls = sink.calls();
        // Unsubscribe applied before subscribe.
        assert_eq!(calls[0], ("unsub".to_string(), vec!["BTC/USDT".to_string()]));
        assert_eq!(calls[1], ("sub".to_string(), vec!["ETH/USDT".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_not_reset_by_later_calls() {
        let (batcher, sink) = wired(4.0);
        batcher.subscribe(&["A".to_string()]);
        tokio::time::sleep(Duration::from_secs(3)).await;
        // A second call 3s in must not push the flush past the original arm.
        batcher.subscribe(&["B".to_string()]);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sink.calls().len(), 2); // one sub + one flush marker
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending() {
        let (batcher, sink) = wired(4.0);
        batcher.subscribe(&["A".to_string()]);
        batcher.cancel();
        batcher.cancel(); // idempotent
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sink.calls().is_empty());
        assert_eq!(batcher.pending(), (0, 0));
    }
}
