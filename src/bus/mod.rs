//! In-process pub/sub for session/tab/batch/log events.
//!
//! Every mutation the serialization thread (see [`crate::supervisor`] and
//! [`crate::session`]) makes to engine state is published here exactly
//! once, in the order observed for that session. The GUI, the remote
//! gateway, and the history writer each hold an independent subscription;
//! a slow or absent subscriber never blocks the publisher (broadcast
//! channels drop lagging receivers rather than backpressure the sender).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::{SessionId, TabId};

/// Capacity of the global broadcast channel. A subscriber that falls this
/// far behind the publisher receives `RecvError::Lagged` and should treat
/// it as a cue to re-fetch a snapshot (the gateway does exactly this on
/// reconnect by replaying the session list).
const BUS_CAPACITY: usize = 4096;

/// Where a log entry's text originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    User,
    Stdout,
    Stderr,
    System,
}

/// A tagged engine event. Dynamic/polymorphic payloads from the source are
/// modeled as a discriminated union here rather than an untyped blob, parsed once at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A session was created.
    SessionAdded { session_id: SessionId },
    /// A session was deleted.
    SessionRemoved { session_id: SessionId },
    /// A session's coarse state changed (agent spawned/exited, cwd
    /// changed, etc.) — subscribers re-fetch the session snapshot.
    SessionStateChange { session_id: SessionId },
    /// Raw agent output appended to a tab's log.
    SessionOutput {
        session_id: SessionId,
        tab_id: TabId,
        source: LogSource,
        text: String,
    },
    /// Local GUI input, echoed for remote clients.
    UserInput {
        session_id: SessionId,
        tab_id: TabId,
        command: String,
    },
    /// The session's tab list or active tab changed.
    TabsChanged {
        session_id: SessionId,
        active_tab_id: Option<TabId>,
    },
    /// A tab transitioned busy/idle/error.
    TabStateChanged { session_id: SessionId, tab_id: TabId },
    /// The foregrounded session changed (local GUI navigation).
    ActiveSessionChanged { session_id: Option<SessionId> },
    /// An Auto Run batch's `BatchRunState` changed, or ended (`None`).
    AutorunStateChange { session_id: SessionId },
    /// Theme preference changed (passthrough from the GUI side; the
    /// gateway relays it to remote clients without interpreting it).
    ThemeUpdate,
    /// The set of custom slash commands changed.
    CustomCommands,
    /// A history entry was appended for a session (drives badge/leaderboard
    /// observers, which never block the run itself on the result).
    HistoryWritten { session_id: SessionId },
}

impl Event {
    /// The session this event concerns, if any — used to preserve the
    /// per-session ordering guarantee when fanning out.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Event::SessionAdded { session_id }
            | Event::SessionRemoved { session_id }
            | Event::SessionStateChange { session_id }
            | Event::SessionOutput { session_id, .. }
            | Event::UserInput { session_id, .. }
            | Event::TabsChanged { session_id, .. }
            | Event::TabStateChanged { session_id, .. }
            | Event::AutorunStateChange { session_id }
            | Event::HistoryWritten { session_id } => Some(session_id),
            Event::ActiveSessionChanged { session_id } => session_id.as_ref(),
            Event::ThemeUpdate | Event::CustomCommands => None,
        }
    }
}

/// A published event with the wall-clock time it was observed, used by
/// history and by debug logging; not part of the wire envelope itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// The process-wide event bus. Cheap to clone (wraps a `broadcast::Sender`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Never blocks; a publish with zero subscribers is
    /// a no-op (broadcast semantics), which is fine — the gateway and
    /// history writer each subscribe independently at startup.
    pub fn publish(&self, event: Event) {
        let envelope = Envelope {
            at: Utc::now(),
            event,
        };
        // `send` only errors when there are no receivers; every publish
        // path here is fire-and-forget so that's not a failure.
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::SessionAdded {
            session_id: SessionId::from("s1"),
        });

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a.event.session_id(), Some(&SessionId::from("s1")));
        assert_eq!(got_b.event.session_id(), Some(&SessionId::from("s1")));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::ThemeUpdate);
    }

    #[test]
    fn session_id_extraction_is_none_for_global_events() {
        assert_eq!(Event::ThemeUpdate.session_id(), None);
        assert_eq!(Event::CustomCommands.session_id(), None);
    }
}
