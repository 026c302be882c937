//! Seams toward the messaging-network side of the bridge.
//!
//! The application-service transport that actually speaks to the messaging
//! network lives outside this crate; the bridge only needs to join rooms
//! and emit call events as one of its virtual identities, and to remember
//! which identity a room belongs to.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to join room {room_id}: {reason}")]
    JoinFailed { room_id: String, reason: String },
    #[error("failed to send event in room {room_id}: {reason}")]
    SendFailed { room_id: String, reason: String },
}

/// Outbound operations on the messaging network, performed as a given
/// bridge identity.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn join_room(&self, identity: &str, room_id: &str) -> Result<(), MessagingError>;

    /// Relays the media server's answer back to the calling side.
    async fn send_answer(
        &self,
        identity: &str,
        room_id: &str,
        call_id: &str,
        sdp: &str,
    ) -> Result<(), MessagingError>;

    /// Tells the calling side the media server hung up.
    async fn send_hangup(
        &self,
        identity: &str,
        room_id: &str,
        call_id: &str,
    ) -> Result<(), MessagingError>;
}

/// Room-to-identity directory: which bridge identity was invited into which
/// room, i.e. which callable destination the room represents.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn associate(&self, room_id: &str, identity: &str);
    async fn identity_for(&self, room_id: &str) -> Option<String>;
}

/// Process-local directory. Associations live as long as the process; a
/// deployment backed by a persistent room store can swap in its own
/// implementation.
#[derive(Default)]
pub struct InMemoryDirectory {
    rooms: DashMap<String, String>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomDirectory for InMemoryDirectory {
    async fn associate(&self, room_id: &str, identity: &str) {
        self.rooms.insert(room_id.to_string(), identity.to_string());
    }

    async fn identity_for(&self, room_id: &str) -> Option<String> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_round_trip() {
        let directory = InMemoryDirectory::new();
        assert_eq!(directory.identity_for("!r:example.org").await, None);

        directory.associate("!r:example.org", "voip_5551234").await;
        assert_eq!(
            directory.identity_for("!r:example.org").await.as_deref(),
            Some("voip_5551234")
        );
    }

    #[tokio::test]
    async fn test_directory_reassociation_overwrites() {
        let directory = InMemoryDirectory::new();
        directory.associate("!r:example.org", "voip_1").await;
        directory.associate("!r:example.org", "voip_2").await;
        assert_eq!(
            directory.identity_for("!r:example.org").await.as_deref(),
            Some("voip_2")
        );
    }
}
