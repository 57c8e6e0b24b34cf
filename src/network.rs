//! Connectivity tracking
//!
//! The host platform reports online/offline transitions through
//! [`NetworkMonitor::set_online`]. Consumers either watch the state channel
//! (the reconciler does) or register plain callbacks for one event type.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub online: bool,
    /// Unix ms of the last transition in either direction
    pub last_changed_at: Option<u64>,
    /// Unix ms of the last offline -> online transition
    pub last_connected_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEvent {
    Online,
    Offline,
}

pub type SubscriptionId = u64;

type Listener = Arc<dyn Fn(NetworkEvent) + Send + Sync>;

struct Subscription {
    /// `None` receives both events
    filter: Option<NetworkEvent>,
    listener: Listener,
}

pub struct NetworkMonitor {
    state: watch::Sender<ConnectivityState>,
    listeners: Mutex<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    clock: SharedClock,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool, clock: SharedClock) -> Self {
        let now = clock.now_millis();
        let (state, _) = watch::channel(ConnectivityState {
            online: initially_online,
            last_changed_at: None,
            last_connected_at: initially_online.then_some(now),
        });

        Self {
            state,
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().online
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Record a transition reported by the host. Returns `false` when the
    /// state did not change, in which case no listener fires.
    pub fn set_online(&self, online: bool) -> bool {
        let now = self.clock.now_millis();
        let changed = self.state.send_if_modified(|s| {
            if s.online == online {
                return false;
            }
            s.online = online;
            s.last_changed_at = Some(now);
            if online {
                s.last_connected_at = Some(now);
            }
            true
        });

        if !changed {
            return false;
        }

        let event = if online {
            tracing::info!("Network connection restored");
            NetworkEvent::Online
        } else {
            tracing::info!("Network connection lost, entering offline mode");
            NetworkEvent::Offline
        };

        // Call listeners without holding the registry lock so they may unsubscribe
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .values()
            .filter(|s| s.filter.map_or(true, |f| f == event))
            .map(|s| s.listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
        true
    }

    /// Watch channel over the full state; the receiver sees the current value immediately
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn on_online<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Some(NetworkEvent::Online), Arc::new(move |_| f()))
    }

    pub fn on_offline<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Some(NetworkEvent::Offline), Arc::new(move |_| f()))
    }

    pub fn on_change<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(NetworkEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(f))
    }

    /// Returns whether the id was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    fn register(&self, filter: Option<NetworkEvent>, listener: Listener) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .insert(id, Subscription { filter, listener });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn monitor(online: bool) -> (NetworkMonitor, ManualClock) {
        let clock = ManualClock::new(1_000);
        (NetworkMonitor::new(online, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_transitions_update_state() {
        let (monitor, clock) = monitor(false);
        assert!(!monitor.is_online());
        assert_eq!(monitor.state().last_connected_at, None);

        clock.set(2_000);
        assert!(monitor.set_online(true));
        let state = monitor.state();
        assert!(state.online);
        assert_eq!(state.last_changed_at, Some(2_000));
        assert_eq!(state.last_connected_at, Some(2_000));

        clock.set(3_000);
        assert!(monitor.set_online(false));
        let state = monitor.state();
        assert_eq!(state.last_changed_at, Some(3_000));
        assert_eq!(state.last_connected_at, Some(2_000));
    }

    #[test]
    fn test_repeated_signal_is_not_a_transition() {
        let (monitor, _) = monitor(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!monitor.set_online(true));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_filtered_listeners_and_unsubscribe() {
        let (monitor, _) = monitor(false);
        let online = Arc::new(AtomicUsize::new(0));
        let offline = Arc::new(AtomicUsize::new(0));

        let on = online.clone();
        let online_id = monitor.on_online(move || {
            on.fetch_add(1, Ordering::SeqCst);
        });
        let off = offline.clone();
        monitor.on_offline(move || {
            off.fetch_add(1, Ordering::SeqCst);
        });

        monitor.set_online(true);
        monitor.set_online(false);
        assert_eq!(online.load(Ordering::SeqCst), 1);
        assert_eq!(offline.load(Ordering::SeqCst), 1);

        assert!(monitor.unsubscribe(online_id));
        assert!(!monitor.unsubscribe(online_id));
        monitor.set_online(true);
        assert_eq!(online.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_transition() {
        let (monitor, _) = monitor(false);
        let mut rx = monitor.subscribe();
        assert!(!rx.borrow().online);

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().online);
    }
}
