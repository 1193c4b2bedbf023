use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::peer::{PeerHandle, RemoteStream};
use crate::signaling::{Participant, Role};

/// The one rule deciding who starts negotiation for a pairing.
/// Hosts offer to candidates; nobody else initiates, so two sides can
/// never both believe they are the offerer.
pub fn should_initiate(local: Role, remote: Role) -> bool {
    matches!((local, remote), (Role::Host, Role::Candidate))
}

pub struct PeerEntry {
    pub participant: Participant,
    pub peer: Arc<dyn PeerHandle>,
    pub generation: u64,
    pub stream: Option<RemoteStream>,
    pub connected: bool,
    /// Last warning level the remote candidate reported.
    pub warning_level: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub socket_id: String,
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub connected: bool,
    pub has_stream: bool,
    pub packets_received: u64,
    pub warning_level: Option<u32>,
}

/// Room roster plus the live peer for each remote that has one.
pub struct ParticipantRegistry {
    members: Arc<RwLock<HashMap<String, Participant>>>,
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self {
            members: Arc::new(RwLock::new(HashMap::new())),
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns false if the socket was already on the roster.
    pub async fn add_member(&self, participant: Participant) -> bool {
        let mut members = self.members.write().await;
        let socket_id = participant.socket_id.clone();
        let is_new = !members.contains_key(&socket_id);
        members.insert(socket_id, participant);
        is_new
    }

    pub async fn member(&self, socket_id: &str) -> Option<Participant> {
        self.members.read().await.get(socket_id).cloned()
    }

    pub async fn member_ids(&self) -> Vec<String> {
        self.members.read().await.keys().cloned().collect()
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Departures name either a socket id or a user id.
    pub async fn resolve(&self, id: &str) -> Option<String> {
        let members = self.members.read().await;
        if members.contains_key(id) {
            return Some(id.to_string());
        }
        members
            .values()
            .find(|p| p.identity.user_id == id)
            .map(|p| p.socket_id.clone())
    }

    pub async fn remove_member(&self, socket_id: &str) -> Option<Participant> {
        self.members.write().await.remove(socket_id)
    }

    pub async fn clear_members(&self) {
        self.members.write().await.clear();
    }

    /// Registers a peer unless one already exists for that remote.
    pub async fn insert_peer(
        &self,
        participant: Participant,
        peer: Arc<dyn PeerHandle>,
        generation: u64,
    ) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&participant.socket_id) {
            return false;
        }
        tracing::debug!(peer_id = %participant.socket_id, generation, "Peer registered");
        peers.insert(
            participant.socket_id.clone(),
            PeerEntry {
                participant,
                peer,
                generation,
                stream: None,
                connected: false,
                warning_level: None,
            },
        );
        true
    }

    pub async fn has_peer(&self, socket_id: &str) -> bool {
        self.peers.read().await.contains_key(socket_id)
    }

    pub async fn peer(&self, socket_id: &str) -> Option<Arc<dyn PeerHandle>> {
        self.peers.read().await.get(socket_id).map(|e| e.peer.clone())
    }

    /// The registered peer, but only if it is still the given generation.
    pub async fn current_peer(&self, socket_id: &str, generation: u64) -> Option<Arc<dyn PeerHandle>> {
        self.peers
            .read()
            .await
            .get(socket_id)
            .filter(|e| e.generation == generation)
            .map(|e| e.peer.clone())
    }

    pub async fn all_peers(&self) -> Vec<Arc<dyn PeerHandle>> {
        self.peers.read().await.values().map(|e| e.peer.clone()).collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn remove_peer(&self, socket_id: &str) -> Option<PeerEntry> {
        let removed = self.peers.write().await.remove(socket_id);
        if removed.is_some() {
            tracing::debug!(peer_id = %socket_id, "Peer removed");
        }
        removed
    }

    /// Removes the entry only if it still holds the given generation.
    pub async fn retire_peer(&self, socket_id: &str, generation: u64) -> Option<PeerEntry> {
        let mut peers = self.peers.write().await;
        if peers.get(socket_id).map(|e| e.generation) != Some(generation) {
            return None;
        }
        let removed = peers.remove(socket_id);
        tracing::debug!(peer_id = %socket_id, generation, "Peer retired");
        removed
    }

    pub async fn drain_peers(&self) -> Vec<PeerEntry> {
        self.peers.write().await.drain().map(|(_, e)| e).collect()
    }

    pub async fn mark_connected(&self, socket_id: &str) {
        if let Some(entry) = self.peers.write().await.get_mut(socket_id) {
            entry.connected = true;
        }
    }

    pub async fn set_stream(&self, socket_id: &str, stream: RemoteStream) {
        if let Some(entry) = self.peers.write().await.get_mut(socket_id) {
            entry.stream = Some(stream);
        }
    }

    pub async fn set_warning_level(&self, socket_id: &str, level: u32) {
        if let Some(entry) = self.peers.write().await.get_mut(socket_id) {
            entry.warning_level = Some(level);
        }
    }

    pub async fn summaries(&self) -> Vec<PeerSummary> {
        let peers = self.peers.read().await;
        let mut summaries: Vec<PeerSummary> = peers
            .values()
            .map(|entry| PeerSummary {
                socket_id: entry.participant.socket_id.clone(),
                user_id: entry.participant.identity.user_id.clone(),
                name: entry.participant.display_name().to_string(),
                role: entry.participant.role(),
                connected: entry.connected,
                has_stream: entry.stream.is_some(),
                packets_received: entry
                    .stream
                    .as_ref()
                    .map(RemoteStream::packets_received)
                    .unwrap_or(0),
                warning_level: entry.warning_level,
            })
            .collect();
        summaries.sort_by(|a, b| a.socket_id.cmp(&b.socket_id));
        summaries
    }
}

impl Default for ParticipantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::Identity;

    fn participant(socket_id: &str, user_id: &str, role: Role) -> Participant {
        Participant {
            socket_id: socket_id.to_string(),
            identity: Identity {
                user_id: user_id.to_string(),
                role,
                name: None,
                email: None,
            },
        }
    }

    #[test]
    fn test_only_hosts_initiate_toward_candidates() {
        assert!(should_initiate(Role::Host, Role::Candidate));
        assert!(!should_initiate(Role::Candidate, Role::Host));
        assert!(!should_initiate(Role::Host, Role::Host));
        assert!(!should_initiate(Role::Candidate, Role::Candidate));
    }

    #[tokio::test]
    async fn test_resolve_by_socket_or_user_id() {
        let registry = ParticipantRegistry::new();
        assert!(registry.add_member(participant("s1", "u1", Role::Candidate)).await);
        assert!(!registry.add_member(participant("s1", "u1", Role::Candidate)).await);

        assert_eq!(registry.resolve("s1").await.as_deref(), Some("s1"));
        assert_eq!(registry.resolve("u1").await.as_deref(), Some("s1"));
        assert_eq!(registry.resolve("nobody").await, None);
        assert_eq!(registry.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_retire_replacement() {
        use crate::room::peer::{PeerFactory, PeerOptions};
        use crate::testing::FakePeerFactory;

        let factory = FakePeerFactory::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = ParticipantRegistry::new();
        let candidate = participant("s1", "u1", Role::Candidate);

        for generation in [1, 2] {
            let peer = factory
                .create(
                    PeerOptions {
                        peer_id: "s1".into(),
                        generation,
                        initiator: true,
                        local_stream: None,
                    },
                    tx.clone(),
                )
                .await
                .unwrap();
            registry.remove_peer("s1").await;
            assert!(registry.insert_peer(candidate.clone(), peer, generation).await);
        }

        assert!(registry.current_peer("s1", 1).await.is_none());
        assert!(registry.retire_peer("s1", 1).await.is_none());
        assert_eq!(registry.peer_count().await, 1);

        assert!(registry.current_peer("s1", 2).await.is_some());
        assert_eq!(registry.retire_peer("s1", 2).await.map(|e| e.generation), Some(2));
        assert_eq!(registry.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_missing_member_is_none() {
        let registry = ParticipantRegistry::new();
        assert!(registry.remove_member("ghost").await.is_none());
        assert!(registry.remove_peer("ghost").await.is_none());
    }
}
