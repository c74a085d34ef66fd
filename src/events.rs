//! Lifecycle events and their fan-out to subscribers.
//!
//! `ProcessEvent` covers everything the supervisor pushes to observers.
//! `EventBus` delivers each event to every live subscriber from inside the
//! emitting call; subscribers receive through unbounded channels so the
//! emitter never waits on a slow reader.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::output::OutputEntry;

/// A lifecycle event for one command identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProcessEvent {
    /// A process was spawned.
    #[serde(rename_all = "camelCase")]
    Started { command_id: String, pid: u32 },
    /// A chunk of output was captured from a service.
    #[serde(rename_all = "camelCase")]
    Output { command_id: String, entry: OutputEntry },
    /// A process exited. `exit_code` is `None` when it was killed by a signal.
    #[serde(rename_all = "camelCase")]
    Exit {
        command_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// The OS reported an error for a launched process.
    #[serde(rename_all = "camelCase")]
    Error { command_id: String, message: String },
    /// Listening ports were discovered for a service.
    #[serde(rename_all = "camelCase")]
    Ports { command_id: String, ports: Vec<u16> },
}

impl ProcessEvent {
    pub fn command_id(&self) -> &str {
        match self {
            ProcessEvent::Started { command_id, .. }
            | ProcessEvent::Output { command_id, .. }
            | ProcessEvent::Exit { command_id, .. }
            | ProcessEvent::Error { command_id, .. }
            | ProcessEvent::Ports { command_id, .. } => command_id,
        }
    }
}

pub type SubscriptionId = u64;

/// Handle returned by `EventBus::subscribe`.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

#[derive(Debug, Default)]
struct BusState {
    next_id: SubscriptionId,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<ProcessEvent>)>,
}

#[derive(Debug, Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push((id, tx));
        Subscription { id, events: rx }
    }

    /// Removes a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.subscribers.len();
        state.subscribers.retain(|(sid, _)| *sid != id);
        state.subscribers.len() != before
    }

    /// Delivers `event` to every subscriber, pruning closed receivers.
    pub fn emit(&self, event: ProcessEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> ProcessEvent {
        ProcessEvent::Started {
            command_id: id.into(),
            pid: 7,
        }
    }

    #[test]
    fn every_subscriber_receives_each_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(started("x"));
        assert_eq!(a.events.try_recv().unwrap(), started("x"));
        assert_eq!(b.events.try_recv().unwrap(), started("x"));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        assert!(bus.unsubscribe(a.id));
        assert!(!bus.unsubscribe(a.id));
        bus.emit(started("x"));
        assert!(a.events.try_recv().is_err());
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        drop(a);
        bus.emit(started("x"));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(ProcessEvent::Ports {
            command_id: "api".into(),
            ports: vec![3000],
        })
        .unwrap();
        assert_eq!(json["event"], "ports");
        assert_eq!(json["commandId"], "api");
        assert_eq!(json["ports"][0], 3000);
    }
}
