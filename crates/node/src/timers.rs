//! Timer management for the replica runtime.
//!
//! Each armed timer is a tokio task that sleeps and then pushes the
//! corresponding event onto the unified timer channel. Re-arming an id
//! cancels the previous task.

use keygrid_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Convert a timer id into the event its expiry produces.
fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Heartbeat => Event::HeartbeatTimer,
        TimerId::Suspicion => Event::SuspicionTimer,
        TimerId::Request(request_digest) => Event::RequestTimer { request_digest },
        TimerId::ViewChangeRetransmit => Event::ViewChangeRetransmitTimer,
    }
}

/// Manages the replica's timers.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm a timer; an already-armed timer with the same id is replaced.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "timer fired");
            let _ = event_tx.send(timer_event(id)).await;
        });
        self.timers.insert(id, handle);
        debug!(?id, ?duration, "timer set");
    }

    /// Cancel a timer; a no-op if it is not armed or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            debug!(?id, "timer cancelled");
        }
    }

    /// Cancel everything; used at shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "timer cancelled (shutdown)");
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_types::Digest;

    #[tokio::test]
    async fn timer_fires_with_its_event() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Suspicion, Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::SuspicionTimer));
    }

    #[tokio::test]
    async fn request_timer_carries_its_digest() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mut manager = TimerManager::new(event_tx);
        let digest = Digest::of_bytes(b"req");

        manager.set_timer(TimerId::Request(digest), Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        match event {
            Event::RequestTimer { request_digest } => assert_eq!(request_digest, digest),
            other => panic!("unexpected event {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Heartbeat, Duration::from_millis(30));
        manager.cancel_timer(TimerId::Heartbeat);

        let result = tokio::time::timeout(Duration::from_millis(100), event_rx.recv()).await;
        assert!(result.is_err(), "cancelled timer must not fire");
    }

    #[tokio::test]
    async fn rearming_replaces_the_previous_timer() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Heartbeat, Duration::from_secs(60));
        manager.set_timer(TimerId::Heartbeat, Duration::from_millis(10));
        assert_eq!(manager.active_count(), 1);

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("the short replacement should fire")
            .expect("channel closed");
        assert!(matches!(event, Event::HeartbeatTimer));
    }
}
