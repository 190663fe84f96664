//! Live-user registry and broadcast fan-out
//!
//! Holds every registered session keyed by username in a sharded concurrent
//! map. Session tasks add, remove and broadcast from many threads at once;
//! no lock is held while messages are handed to recipients.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::RegistrationConflict;
use crate::message::Message;
use crate::session::Session;

/// Shared set of live sessions
#[derive(Debug, Default)]
pub struct Registry {
    /// Username -> Session
    sessions: DashMap<String, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session without any uniqueness check
    ///
    /// A session already stored under the same username is replaced.
    pub fn add(&self, session: Arc<Session>) {
        debug!("Adding session {} as '{}'", session.id(), session.username());
        self.sessions.insert(session.username().to_string(), session);
    }

    /// Insert a session unless its username is taken
    ///
    /// `welcome` is queued on the session before it becomes visible to
    /// broadcasts, so it is always the first thing the session receives.
    pub fn register(
        &self,
        session: Arc<Session>,
        welcome: &Message,
    ) -> Result<(), RegistrationConflict> {
        match self.sessions.entry(session.username().to_string()) {
            Entry::Occupied(_) => Err(RegistrationConflict(session.username().to_string())),
            Entry::Vacant(slot) => {
                session.send_message(welcome);
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Look up a registered session by username
    pub fn find(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(username)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    /// Remove this exact session
    ///
    /// No-op if it is absent or its username now belongs to another session.
    /// Returns true if something was removed.
    pub fn remove(&self, session: &Session) -> bool {
        self.sessions
            .remove_if(session.username(), |_, held| held.id() == session.id())
            .is_some()
    }

    /// Send to every registered session
    pub fn broadcast(&self, message: &Message) -> usize {
        self.broadcast_where(message, |_| true)
    }

    /// Send to every registered session matching `predicate`
    ///
    /// Returns the number of sessions the message was handed to. Sessions
    /// already closed are skipped.
    pub fn broadcast_where<P>(&self, message: &Message, predicate: P) -> usize
    where
        P: Fn(&Session) -> bool,
    {
        let recipients: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| predicate(entry.value().as_ref()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        for session in recipients.iter().filter(|s| s.is_connected()) {
            session.send_message(message);
            delivered += 1;
        }

        debug!("Broadcast {} to {} session(s)", message, delivered);
        delivered
    }

    /// Cleanup for a session that reported its own termination
    pub fn on_death(&self, session: &Session) {
        if !self.remove(session) {
            debug!("Session {} was not registered", session.id());
            return;
        }

        info!(
            "'{}' left, {} user(s) remaining",
            session.username(),
            self.sessions.len()
        );
        self.broadcast(&Message::disconnected(session.username()));
    }

    /// Teardown: close the sessions that are not marked connected
    pub fn close(&self) {
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_connected())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in stale {
            if !session.close() {
                debug!("Session {} was already closed", session.id());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Usernames currently registered, in no particular order
    pub fn usernames(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::message::MessageIntent;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
    use tokio::time::timeout;

    type Peer = Lines<BufReader<DuplexStream>>;

    fn member(username: &str) -> (Arc<Session>, Peer) {
        let (client, server) = tokio::io::duplex(4096);
        let session = Session::new(server, username, None, &SessionConfig::default());
        (Arc::new(session), BufReader::new(client).lines())
    }

    async fn next(peer: &mut Peer) -> Option<Message> {
        let line = timeout(Duration::from_secs(2), peer.next_line())
            .await
            .ok()?
            .ok()??;
        Message::from_line(&line).ok()
    }

    async fn nothing_pending(peer: &mut Peer) -> bool {
        timeout(Duration::from_millis(100), peer.next_line())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_register_sends_welcome() {
        let registry = Registry::new();
        let (alice, mut alice_peer) = member("alice");

        registry
            .register(Arc::clone(&alice), &Message::registration_ok())
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("alice"));
        assert_eq!(next(&mut alice_peer).await, Some(Message::registration_ok()));
    }

    #[tokio::test]
    async fn test_register_conflict() {
        let registry = Registry::new();
        let (bob, _bob_peer) = member("bob");
        let (impostor, mut impostor_peer) = member("bob");

        registry.register(Arc::clone(&bob), &Message::registration_ok()).unwrap();
        let result = registry.register(Arc::clone(&impostor), &Message::registration_ok());

        assert_eq!(result, Err(RegistrationConflict("bob".to_string())));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("bob").unwrap().id(), bob.id());
        assert!(nothing_pending(&mut impostor_peer).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let registry = Registry::new();
        let (alice, mut alice_peer) = member("alice");
        let (bob, mut bob_peer) = member("bob");
        registry.add(alice);
        registry.add(bob);

        let msg = Message::new("alice", MessageIntent::Send, "hi all");
        assert_eq!(registry.broadcast(&msg), 2);

        assert_eq!(next(&mut alice_peer).await, Some(msg.clone()));
        assert_eq!(next(&mut bob_peer).await, Some(msg));
    }

    #[tokio::test]
    async fn test_broadcast_where_filters() {
        let registry = Registry::new();
        let (alice, mut alice_peer) = member("alice");
        let (bob, mut bob_peer) = member("bob");
        registry.add(alice);
        registry.add(bob);

        let joined = Message::joined("bob");
        let delivered = registry.broadcast_where(&joined, |s| s.username() != "bob");

        assert_eq!(delivered, 1);
        assert_eq!(next(&mut alice_peer).await, Some(joined));
        assert!(nothing_pending(&mut bob_peer).await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_sessions() {
        let registry = Registry::new();
        let (alice, mut alice_peer) = member("alice");
        let (bob, mut bob_peer) = member("bob");
        registry.add(Arc::clone(&alice));
        registry.add(bob);

        alice.close();
        let msg = Message::new("bob", MessageIntent::Send, "anyone?");
        assert_eq!(registry.broadcast(&msg), 1);

        assert_eq!(next(&mut bob_peer).await, Some(msg));
        // Closed session's stream just ends
        assert_eq!(next(&mut alice_peer).await, None);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let (alice, _alice_peer) = member("alice");
        let (bob, _bob_peer) = member("bob");
        registry.add(Arc::clone(&alice));
        registry.add(bob);

        assert!(registry.remove(&alice));
        assert!(!registry.remove(&alice));

        assert_eq!(registry.usernames(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_ignores_stale_session() {
        let registry = Registry::new();
        let (old, _old_peer) = member("bob");
        let (new, _new_peer) = member("bob");
        registry.add(Arc::clone(&new));

        assert!(!registry.remove(&old));
        assert_eq!(registry.find("bob").unwrap().id(), new.id());
    }

    #[tokio::test]
    async fn test_on_death_announces_departure() {
        let registry = Registry::new();
        let (alice, mut alice_peer) = member("alice");
        let (bob, mut bob_peer) = member("bob");
        registry.add(alice);
        registry.add(Arc::clone(&bob));

        bob.close();
        registry.on_death(&bob);

        assert_eq!(registry.len(), 1);
        assert_eq!(next(&mut alice_peer).await, Some(Message::disconnected("bob")));
        assert_eq!(next(&mut bob_peer).await, None);

        // A second report changes nothing and announces nothing
        registry.on_death(&bob);
        assert_eq!(registry.len(), 1);
        assert!(nothing_pending(&mut alice_peer).await);
    }

    #[tokio::test]
    async fn test_close_leaves_connected_sessions() {
        let registry = Registry::new();
        let (alice, _alice_peer) = member("alice");
        let (bob, _bob_peer) = member("bob");
        registry.add(Arc::clone(&alice));
        registry.add(Arc::clone(&bob));
        bob.close();

        registry.close();

        assert!(alice.is_connected());
        assert!(!bob.is_connected());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_is_unique() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();

        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                // Every name is contended by two sessions
                let (session, peer) = member(&format!("user{}", i % 16));
                let accepted = registry
                    .register(session, &Message::registration_ok())
                    .is_ok();
                // Chatter racing with the other registrations
                registry.broadcast(&Message::new("noise", MessageIntent::Send, "x"));
                accepted.then_some(peer)
            }));
        }

        let mut winners = Vec::new();
        for task in tasks {
            if let Some(peer) = task.await.unwrap() {
                winners.push(peer);
            }
        }

        assert_eq!(winners.len(), 16);
        assert_eq!(registry.len(), 16);

        // The welcome is always the first thing a winner sees
        for peer in winners.iter_mut() {
            assert_eq!(next(peer).await, Some(Message::registration_ok()));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_remove_broadcast() {
        let registry = Arc::new(Registry::new());
        let mut keepers = Vec::new();
        for i in 0..8 {
            let (session, peer) = member(&format!("keep{}", i));
            registry.add(session);
            keepers.push(peer);
        }

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (session, _peer) = member(&format!("temp{}", i));
                registry.add(Arc::clone(&session));
                registry.broadcast(&Message::new("temp", MessageIntent::Send, "x"));
                registry.remove(&session);
                registry.remove(&session);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 8);
        let mut names = registry.usernames();
        names.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("keep{}", i)).collect();
        assert_eq!(names, expected);
    }
}
