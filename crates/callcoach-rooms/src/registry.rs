//! Room lifecycle: creation, capacity-gated join, teardown.

use crate::error::RoomError;
use crate::room::{JoinOutcome, Room};
use crate::user::UserRegistry;
use callcoach_media::{MediaConfig, MediaWorkerPool, RouterRegistry};
use callcoach_types::UserIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Owns every live [`Room`].
///
/// Explicitly constructed at process start and injected wherever needed; no
/// hidden global instance.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    pool: Arc<MediaWorkerPool>,
    routers: RouterRegistry,
    users: UserRegistry,
    media_config: Arc<MediaConfig>,
    prompt: Arc<str>,
}

impl RoomRegistry {
    pub fn new(
        pool: Arc<MediaWorkerPool>,
        routers: RouterRegistry,
        users: UserRegistry,
        media_config: Arc<MediaConfig>,
        prompt: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            pool,
            routers,
            users,
            media_config,
            prompt: prompt.into(),
        }
    }

    pub async fn has_room(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    /// Creates a room (idempotent).
    ///
    /// Acquires a router from the least-loaded worker; failures wrap the
    /// underlying cause.
    pub async fn create_room(&self, room_id: &str, author_id: &str) -> Result<(), RoomError> {
        if room_id.is_empty() || author_id.is_empty() {
            return Err(RoomError::FieldsRequired);
        }

        if self.has_room(room_id).await {
            return Ok(());
        }

        let router = self
            .pool
            .create_router(&self.media_config)
            .await
            .map_err(RoomError::CreateFailed)?;
        self.routers.add(router.clone()).await;

        let room = Room::new(room_id, author_id, self.prompt.as_ref(), router);
        self.rooms
            .write()
            .await
            .insert(room_id.to_string(), room);
        tracing::info!(room_id, author_id, "room created");
        Ok(())
    }

    /// Updates global user presence, then delegates to the room's join.
    pub async fn join_room(
        &self,
        room_id: &str,
        identity: UserIdentity,
    ) -> Result<JoinOutcome, RoomError> {
        let room = self.get(room_id).await.ok_or(RoomError::NotFound)?;

        // Presence update is best-effort by contract.
        self.users.add_or_update(identity.clone()).await;

        Ok(room.add_participant(identity))
    }

    /// Removes a participant, cleans up their resources, and destroys the
    /// room once the participant count reaches zero.
    pub async fn remove_participant(&self, room_id: &str, user_id: &str) {
        let Some(room) = self.get(room_id).await else {
            return;
        };

        room.remove_participant(user_id);

        // Resource cleanup is best-effort; the room teardown must proceed
        // regardless.
        self.users.remove_by_user_id(user_id).await;

        if room.is_empty() {
            let router_id = room.router().id().to_string();
            room.close();
            self.routers.remove(&router_id).await;
            self.rooms.write().await.remove(room_id);
            tracing::info!(room_id, "room destroyed");
        }
    }

    /// Locates the unique room containing `user_id`, if any.
    ///
    /// Linear scan across rooms; fine at one room per call. Callers needing
    /// frequent lookups should maintain a user→room index.
    pub async fn find_room_by_user(&self, user_id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().await;
        rooms
            .values()
            .find(|room| room.has_participant(user_id))
            .cloned()
    }

    /// Convenience for disconnect flows: locate and remove the user from
    /// their room.
    pub async fn remove_user_from_any_room(&self, user_id: &str) {
        let room_id = self
            .find_room_by_user(user_id)
            .await
            .map(|room| room.room_id().to_string());
        if let Some(room_id) = room_id {
            self.remove_participant(&room_id, user_id).await;
        }
    }
}
