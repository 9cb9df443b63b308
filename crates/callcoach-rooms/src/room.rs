//! A two-party call room.

use callcoach_media::{Router, RtpCapabilities};
use callcoach_types::UserIdentity;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Default room capacity: one customer and one copilot-running agent, or
/// two customers.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 2;

/// Result of a join attempt.
///
/// A full room is a soft business failure (`success: false`), not an error;
/// the caller renders the difference to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinOutcome {
    pub success: bool,
    pub message: String,
    #[serde(rename = "routerRtpCap", skip_serializing_if = "Option::is_none")]
    pub router_rtp_cap: Option<RtpCapabilities>,
}

/// The resource container for one call.
pub struct Room {
    room_id: String,
    author_id: String,
    prompt: String,
    router: Arc<Router>,
    participants: Mutex<HashMap<String, UserIdentity>>,
    max_participants: usize,
}

impl Room {
    pub fn new(
        room_id: impl Into<String>,
        author_id: impl Into<String>,
        prompt: impl Into<String>,
        router: Arc<Router>,
    ) -> Arc<Self> {
        Arc::new(Self {
            room_id: room_id.into(),
            author_id: author_id.into(),
            prompt: prompt.into(),
            router,
            participants: Mutex::new(HashMap::new()),
            max_participants: DEFAULT_MAX_PARTICIPANTS,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// The coaching persona prompt this call runs with.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Adds a participant, or rebinds an existing one.
    ///
    /// Rejoin (same `user_id`) always succeeds, updates the stored identity,
    /// and never duplicates the participant. A new join into a full room is
    /// the soft failure.
    pub fn add_participant(&self, identity: UserIdentity) -> JoinOutcome {
        let mut participants = self.participants.lock().expect("participant lock poisoned");

        if participants.contains_key(&identity.user_id) {
            participants.insert(identity.user_id.clone(), identity);
            return JoinOutcome {
                success: true,
                message: "Rejoined the room successfully".to_string(),
                router_rtp_cap: Some(self.router.rtp_capabilities().clone()),
            };
        }

        if participants.len() >= self.max_participants {
            return JoinOutcome {
                success: false,
                message: "Room is full".to_string(),
                router_rtp_cap: None,
            };
        }

        participants.insert(identity.user_id.clone(), identity);
        JoinOutcome {
            success: true,
            message: "You have successfully joined the room".to_string(),
            router_rtp_cap: Some(self.router.rtp_capabilities().clone()),
        }
    }

    pub fn remove_participant(&self, user_id: &str) {
        self.participants
            .lock()
            .expect("participant lock poisoned")
            .remove(user_id);
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants
            .lock()
            .expect("participant lock poisoned")
            .contains_key(user_id)
    }

    pub fn participant(&self, user_id: &str) -> Option<UserIdentity> {
        self.participants
            .lock()
            .expect("participant lock poisoned")
            .get(user_id)
            .cloned()
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants
            .lock()
            .expect("participant lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn participants(&self) -> Vec<UserIdentity> {
        self.participants
            .lock()
            .expect("participant lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants
            .lock()
            .expect("participant lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.participant_count() == 0
    }

    /// Closes the room's router and clears the participant set.
    pub fn close(&self) {
        self.router.close();
        self.participants
            .lock()
            .expect("participant lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcoach_media::{MediaConfig, MediaWorkerPool};
    use callcoach_types::Role;

    fn identity(user_id: &str, socket_id: &str) -> UserIdentity {
        UserIdentity {
            user_id: user_id.to_string(),
            name: format!("name-{user_id}"),
            role: Role::User,
            socket_id: socket_id.to_string(),
        }
    }

    async fn test_room() -> Arc<Room> {
        let pool = MediaWorkerPool::new(1);
        let router = pool
            .create_router(&MediaConfig::default())
            .await
            .expect("router creation");
        Room::new("r1", "author", "prompt", router)
    }

    #[tokio::test]
    async fn joins_up_to_capacity_then_soft_fails() {
        let room = test_room().await;

        let first = room.add_participant(identity("a", "s1"));
        assert!(first.success);
        assert!(first.router_rtp_cap.is_some());
        assert_eq!(room.participant_count(), 1);

        let second = room.add_participant(identity("b", "s2"));
        assert!(second.success);
        assert_eq!(room.participant_count(), 2);

        let third = room.add_participant(identity("c", "s3"));
        assert!(!third.success);
        assert_eq!(third.message, "Room is full");
        assert!(third.router_rtp_cap.is_none());
        assert_eq!(room.participant_count(), 2, "failed join must not change count");
    }

    #[tokio::test]
    async fn rejoin_never_duplicates_and_returns_same_capabilities() {
        let room = test_room().await;

        let join = room.add_participant(identity("a", "s1"));
        let rejoin = room.add_participant(identity("a", "s2"));

        assert!(rejoin.success);
        assert_eq!(rejoin.message, "Rejoined the room successfully");
        assert_eq!(rejoin.router_rtp_cap, join.router_rtp_cap);
        assert_eq!(room.participant_count(), 1);
        assert_eq!(
            room.participant("a").map(|p| p.socket_id),
            Some("s2".to_string()),
            "rejoin must rebind the stored identity"
        );
    }

    #[tokio::test]
    async fn join_outcome_omits_capabilities_on_failure() {
        let room = test_room().await;
        let joined = room.add_participant(identity("a", "s1"));
        let json = serde_json::to_value(&joined).expect("serialization should not fail");
        assert!(json.get("routerRtpCap").is_some());

        room.add_participant(identity("b", "s2"));
        let failed = room.add_participant(identity("c", "s3"));
        let json = serde_json::to_value(&failed).expect("serialization should not fail");
        assert!(json.get("routerRtpCap").is_none());
        assert_eq!(json["success"], serde_json::json!(false));
    }
}
