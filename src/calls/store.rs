//! Multi-key index over active calls.

use super::call::Call;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const LOG: &str = "Calls/Store";

pub type SharedCall = Arc<Mutex<Call>>;

#[derive(Default)]
struct Indexes {
    by_local_id: HashMap<String, SharedCall>,
    by_remote_id: HashMap<String, SharedCall>,
    by_room_id: HashMap<String, SharedCall>,
}

/// In-memory store of active calls, reachable by the caller's call id, the
/// bridge-assigned media-server call id, or the room id.
///
/// The three indexes always move together: insertion and removal update all
/// of them under one lock, so any reader sees either the whole call or none
/// of it. The lock is held only for map operations, never across awaits.
#[derive(Default)]
pub struct CallStore {
    indexes: Mutex<Indexes>,
}

impl CallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a new call under all three keys and hands back the shared
    /// handle.
    pub async fn insert(&self, call: Call) -> SharedCall {
        info!(
            target: LOG,
            "Storing call id={} in room={} for user={}",
            call.local_call_id, call.room_id, call.peer_identity
        );
        let local_id = call.local_call_id.clone();
        let remote_id = call.remote_call_id.clone();
        let room_id = call.room_id.clone();
        let shared = Arc::new(Mutex::new(call));

        let mut indexes = self.indexes.lock().await;
        indexes.by_local_id.insert(local_id, shared.clone());
        indexes.by_remote_id.insert(remote_id, shared.clone());
        indexes.by_room_id.insert(room_id, shared.clone());
        shared
    }

    /// Drops the call from all three indexes. Safe to call again for a call
    /// that was already removed.
    pub async fn remove(&self, call: &Call) {
        let mut indexes = self.indexes.lock().await;
        indexes.by_local_id.remove(&call.local_call_id);
        indexes.by_remote_id.remove(&call.remote_call_id);
        indexes.by_room_id.remove(&call.room_id);
    }

    pub async fn by_local_id(&self, call_id: &str) -> Option<SharedCall> {
        self.indexes.lock().await.by_local_id.get(call_id).cloned()
    }

    pub async fn by_remote_id(&self, call_id: &str) -> Option<SharedCall> {
        self.indexes.lock().await.by_remote_id.get(call_id).cloned()
    }

    pub async fn by_room_id(&self, room_id: &str) -> Option<SharedCall> {
        self.indexes.lock().await.by_room_id.get(room_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.indexes.lock().await.by_local_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_call(n: u32) -> Call {
        Call::new(
            format!("local-{n}"),
            format!("remote-{n}"),
            format!("!room-{n}:example.org"),
            "voip_5551234".into(),
            "5551234".into(),
            "@caller:example.org".into(),
            "v=0".into(),
            Vec::new(),
        )
    }

    /// All three keys resolve to the same shared call.
    #[tokio::test]
    async fn test_lookup_by_any_key_returns_same_call() {
        let store = CallStore::new();
        let inserted = store.insert(make_call(1)).await;

        let by_local = store.by_local_id("local-1").await.unwrap();
        let by_remote = store.by_remote_id("remote-1").await.unwrap();
        let by_room = store.by_room_id("!room-1:example.org").await.unwrap();

        assert!(Arc::ptr_eq(&inserted, &by_local));
        assert!(Arc::ptr_eq(&inserted, &by_remote));
        assert!(Arc::ptr_eq(&inserted, &by_room));
    }

    /// After removal, no key resolves.
    #[tokio::test]
    async fn test_remove_clears_every_index() {
        let store = CallStore::new();
        let shared = store.insert(make_call(1)).await;

        {
            let call = shared.lock().await;
            store.remove(&call).await;
        }

        assert!(store.by_local_id("local-1").await.is_none());
        assert!(store.by_remote_id("remote-1").await.is_none());
        assert!(store.by_room_id("!room-1:example.org").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = CallStore::new();
        let shared = store.insert(make_call(1)).await;
        let call = shared.lock().await;
        store.remove(&call).await;
        store.remove(&call).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_independent_calls_do_not_collide() {
        let store = CallStore::new();
        store.insert(make_call(1)).await;
        store.insert(make_call(2)).await;
        assert_eq!(store.len().await, 2);

        let call_one = store.by_local_id("local-1").await.unwrap();
        {
            let call = call_one.lock().await;
            store.remove(&call).await;
        }
        assert!(store.by_local_id("local-1").await.is_none());
        assert!(store.by_local_id("local-2").await.is_some());
    }
}
