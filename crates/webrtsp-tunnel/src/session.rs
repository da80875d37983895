//! Per-generation session state
//!
//! One [`SessionMap`] exists per connection generation. It is the single
//! synchronization point for session lifecycle: the multiplexer's receive
//! loop, connector completions, and relay completions all mutate it under
//! the same lock.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;
use webrtsp_proto::SessionId;

/// Connection generation counter value; every session and relay is tagged
/// with the generation it belongs to.
pub type Generation = u64;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Local connect in progress
    Connecting,
    /// Relay running
    Established,
    /// Remote sent close, relay draining
    Closing,
    /// Closed by either side, drained
    Closed,
    /// Local connect failed
    Failed,
    /// Generation torn down while the session was live
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Closed | SessionState::Failed | SessionState::Aborted
        )
    }

    /// Legal state machine steps. A remote close may land while the local
    /// connect is still in flight, so Closing is reachable from Connecting
    /// too. Aborted is the only transition that may skip intermediate
    /// states, and only out of a non-terminal state.
    pub fn can_advance(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Established)
            | (Connecting, Closing)
            | (Established, Closing)
            | (Closing, Closed)
            | (Established, Closed)
            | (Connecting, Failed) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Where an inbound data frame should go
pub enum DataRoute {
    /// Session established, deliver to its relay
    Stream(mpsc::Sender<Bytes>),
    /// Session is closing; late data is dropped
    Draining,
    /// No such session this generation
    Unknown,
}

struct SessionEntry {
    state: SessionState,
    data_tx: Option<mpsc::Sender<Bytes>>,
}

/// Session table for one connection generation
pub struct SessionMap {
    inner: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a broker-announced session in `Connecting` state.
    /// Returns false (and changes nothing) if the id is already active.
    pub fn open(&self, id: SessionId, data_tx: mpsc::Sender<Bytes>) -> bool {
        let Ok(mut map) = self.inner.lock() else {
            return false;
        };
        if map.contains_key(&id) {
            return false;
        }
        map.insert(
            id,
            SessionEntry {
                state: SessionState::Connecting,
                data_tx: Some(data_tx),
            },
        );
        true
    }

    /// Local connect succeeded: `Connecting -> Established`.
    /// Returns false if the session vanished or the remote already closed
    /// it while the connect was in flight.
    pub fn establish(&self, id: SessionId) -> bool {
        let Ok(mut map) = self.inner.lock() else {
            return false;
        };
        let Some(entry) = map.get_mut(&id) else {
            return false;
        };
        match entry.state {
            SessionState::Connecting => {
                entry.state = SessionState::Established;
                true
            }
            // Expected race: CloseSession beat the connect.
            SessionState::Closing => false,
            other => {
                warn!(session_id = id, state = ?other, "invalid establish transition");
                false
            }
        }
    }

    /// Remote close received: `-> Closing`, dropping the data sender so the
    /// relay sees end-of-stream once buffered frames are drained.
    pub fn begin_close(&self, id: SessionId) -> bool {
        let Ok(mut map) = self.inner.lock() else {
            return false;
        };
        let Some(entry) = map.get_mut(&id) else {
            return false;
        };
        if !entry.state.can_advance(SessionState::Closing) {
            warn!(session_id = id, state = ?entry.state, "invalid close transition");
            return false;
        }
        entry.state = SessionState::Closing;
        entry.data_tx = None;
        true
    }

    /// Local connect failed: `Connecting -> Failed`, session removed.
    /// Returns true if the entry existed, i.e. the caller owes the broker
    /// exactly one failure notification.
    pub fn fail(&self, id: SessionId) -> bool {
        let Ok(mut map) = self.inner.lock() else {
            return false;
        };
        match map.get(&id) {
            Some(entry) if entry.state.can_advance(SessionState::Failed) => {
                map.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Relay finished: remove the session.
    pub fn finish(&self, id: SessionId) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&id);
        }
    }

    /// Sender for inbound data frames of this session, if it accepts any.
    pub fn route_data(&self, id: SessionId) -> DataRoute {
        let Ok(map) = self.inner.lock() else {
            return DataRoute::Unknown;
        };
        match map.get(&id) {
            Some(entry) => match &entry.data_tx {
                Some(tx) => DataRoute::Stream(tx.clone()),
                None => DataRoute::Draining,
            },
            None => DataRoute::Unknown,
        }
    }

    /// Generation teardown: every live session becomes `Aborted`, all data
    /// senders drop (which unblocks relays), the table empties.
    /// Returns how many sessions were aborted.
    pub fn abort_all(&self) -> usize {
        let Ok(mut map) = self.inner.lock() else {
            return 0;
        };
        let aborted = map
            .values()
            .filter(|e| e.state.can_advance(SessionState::Aborted))
            .count();
        map.clear();
        aborted
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.inner.lock().ok()?.get(&id).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<Bytes> {
        mpsc::channel(1).0
    }

    #[test]
    fn test_state_machine_steps() {
        use SessionState::*;

        assert!(Connecting.can_advance(Established));
        assert!(Connecting.can_advance(Closing));
        assert!(Established.can_advance(Closing));
        assert!(Closing.can_advance(Closed));
        assert!(Connecting.can_advance(Failed));

        // No skipping forward
        assert!(!Connecting.can_advance(Closed));
        assert!(!Established.can_advance(Failed));
        assert!(!Closing.can_advance(Established));

        // Aborted escape from any non-terminal state
        assert!(Connecting.can_advance(Aborted));
        assert!(Established.can_advance(Aborted));
        assert!(Closing.can_advance(Aborted));
        assert!(!Closed.can_advance(Aborted));
        assert!(!Failed.can_advance(Aborted));
        assert!(!Aborted.can_advance(Aborted));
    }

    #[test]
    fn test_open_duplicate() {
        let map = SessionMap::new();
        assert!(map.open(1, sender()));
        assert!(!map.open(1, sender()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_lifecycle() {
        let map = SessionMap::new();
        assert!(map.open(1, sender()));
        assert_eq!(map.state(1), Some(SessionState::Connecting));

        assert!(map.establish(1));
        assert_eq!(map.state(1), Some(SessionState::Established));

        assert!(map.begin_close(1));
        assert_eq!(map.state(1), Some(SessionState::Closing));
        assert!(matches!(map.route_data(1), DataRoute::Draining));

        map.finish(1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_close_while_connecting_blocks_establish() {
        let map = SessionMap::new();
        assert!(map.open(1, sender()));

        // Remote close lands before the local connect finished; the late
        // establish must not revive the session.
        assert!(map.begin_close(1));
        assert_eq!(map.state(1), Some(SessionState::Closing));
        assert!(!map.establish(1));

        map.finish(1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_fail_notifies_once() {
        let map = SessionMap::new();
        assert!(map.open(1, sender()));
        assert!(map.fail(1));
        // Entry gone; a second failure report owes nothing.
        assert!(!map.fail(1));
    }

    #[test]
    fn test_route_unknown() {
        let map = SessionMap::new();
        assert!(matches!(map.route_data(9), DataRoute::Unknown));
    }

    #[test]
    fn test_abort_all() {
        let map = SessionMap::new();
        map.open(1, sender());
        map.open(2, sender());
        map.open(3, sender());
        map.establish(2);

        assert_eq!(map.abort_all(), 3);
        assert!(map.is_empty());
        assert_eq!(map.abort_all(), 0);
    }

    #[tokio::test]
    async fn test_abort_unblocks_receiver() {
        let map = SessionMap::new();
        let (tx, mut rx) = mpsc::channel::<Bytes>(1);
        map.open(1, tx);

        map.abort_all();
        // All senders dropped with the table; the relay side sees EOF.
        assert!(rx.recv().await.is_none());
    }
}
