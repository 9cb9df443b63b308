//! Connected users and their media resources.

use callcoach_media::{Consumer, Producer, WebRtcTransport};
use callcoach_types::{Role, UserIdentity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};

/// Capacity of the user event broadcast channel.
const USER_EVENT_CAPACITY: usize = 64;

/// Registry notifications, for observability. Not required for correctness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Added { user_id: String },
    Updated { user_id: String },
    Removed { user_id: String },
}

#[derive(Debug, Clone)]
struct UserState {
    name: String,
    role: Role,
    socket_id: String,
}

#[derive(Default)]
struct UserResources {
    producer_transport: Option<Arc<WebRtcTransport>>,
    consumer_transport: Option<Arc<WebRtcTransport>>,
    producer_track: Option<Arc<Producer>>,
    consumer_tracks: HashMap<String, Arc<Consumer>>,
}

/// A logical identity that survives socket churn.
///
/// Owns the user's transports and tracks; [`User::destroy`] is the single
/// teardown point, closing everything best-effort.
pub struct User {
    user_id: String,
    state: Mutex<UserState>,
    resources: Mutex<UserResources>,
}

impl User {
    fn new(identity: UserIdentity) -> Arc<Self> {
        Arc::new(Self {
            user_id: identity.user_id,
            state: Mutex::new(UserState {
                name: identity.name,
                role: identity.role,
                socket_id: identity.socket_id,
            }),
            resources: Mutex::new(UserResources::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.user_id
    }

    pub fn name(&self) -> String {
        self.state.lock().expect("user state lock poisoned").name.clone()
    }

    pub fn role(&self) -> Role {
        self.state.lock().expect("user state lock poisoned").role
    }

    pub fn is_agent(&self) -> bool {
        self.role().is_agent()
    }

    pub fn socket_id(&self) -> String {
        self.state
            .lock()
            .expect("user state lock poisoned")
            .socket_id
            .clone()
    }

    pub fn identity(&self) -> UserIdentity {
        let state = self.state.lock().expect("user state lock poisoned");
        UserIdentity {
            user_id: self.user_id.clone(),
            name: state.name.clone(),
            role: state.role,
            socket_id: state.socket_id.clone(),
        }
    }

    fn rebind(&self, identity: &UserIdentity) {
        let mut state = self.state.lock().expect("user state lock poisoned");
        state.name = identity.name.clone();
        state.role = identity.role;
        state.socket_id = identity.socket_id.clone();
    }

    /// Stores the producer transport, closing any replaced one.
    pub fn set_producer_transport(&self, transport: Arc<WebRtcTransport>) {
        let replaced = self
            .resources
            .lock()
            .expect("user resource lock poisoned")
            .producer_transport
            .replace(transport);
        if let Some(old) = replaced {
            old.close();
        }
    }

    pub fn producer_transport(&self) -> Option<Arc<WebRtcTransport>> {
        self.resources
            .lock()
            .expect("user resource lock poisoned")
            .producer_transport
            .clone()
    }

    /// Stores the consumer transport, closing any replaced one.
    pub fn set_consumer_transport(&self, transport: Arc<WebRtcTransport>) {
        let replaced = self
            .resources
            .lock()
            .expect("user resource lock poisoned")
            .consumer_transport
            .replace(transport);
        if let Some(old) = replaced {
            old.close();
        }
    }

    pub fn consumer_transport(&self) -> Option<Arc<WebRtcTransport>> {
        self.resources
            .lock()
            .expect("user resource lock poisoned")
            .consumer_transport
            .clone()
    }

    /// Stores the producer track, closing any replaced one.
    pub fn set_producer_track(&self, producer: Arc<Producer>) {
        let replaced = self
            .resources
            .lock()
            .expect("user resource lock poisoned")
            .producer_track
            .replace(producer);
        if let Some(old) = replaced {
            old.close();
        }
    }

    pub fn producer_track(&self) -> Option<Arc<Producer>> {
        self.resources
            .lock()
            .expect("user resource lock poisoned")
            .producer_track
            .clone()
    }

    pub fn producer_track_id(&self) -> Option<String> {
        self.producer_track().map(|p| p.id().to_string())
    }

    pub fn add_consumer_track(&self, consumer: Arc<Consumer>) {
        self.resources
            .lock()
            .expect("user resource lock poisoned")
            .consumer_tracks
            .insert(consumer.id().to_string(), consumer);
    }

    pub fn consumer_track(&self, consumer_id: &str) -> Option<Arc<Consumer>> {
        self.resources
            .lock()
            .expect("user resource lock poisoned")
            .consumer_tracks
            .get(consumer_id)
            .cloned()
    }

    /// Closes every owned transport and track. Best-effort and total:
    /// individual close failures are impossible by construction (closes are
    /// idempotent and non-failing), so teardown always completes.
    pub fn destroy(&self) {
        let mut resources = self.resources.lock().expect("user resource lock poisoned");
        if let Some(track) = resources.producer_track.take() {
            track.close();
        }
        if let Some(transport) = resources.producer_transport.take() {
            transport.close();
        }
        if let Some(transport) = resources.consumer_transport.take() {
            transport.close();
        }
        for (_, consumer) in resources.consumer_tracks.drain() {
            consumer.close();
        }
    }
}

/// Tracks connected identities, keyed by both user id and socket id.
#[derive(Clone)]
pub struct UserRegistry {
    by_user_id: Arc<RwLock<HashMap<String, Arc<User>>>>,
    by_socket_id: Arc<RwLock<HashMap<String, Arc<User>>>>,
    events_tx: broadcast::Sender<UserEvent>,
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UserRegistry {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(USER_EVENT_CAPACITY);
        Self {
            by_user_id: Arc::new(RwLock::new(HashMap::new())),
            by_socket_id: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    /// Subscribes to add/update/remove notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: UserEvent) {
        // No receivers is the normal case; nothing depends on delivery.
        let _ = self.events_tx.send(event);
    }

    /// Creates the user, or rebinds an existing user's socket.
    ///
    /// The stale socket-id mapping is removed, which is what makes
    /// reconnection idempotent rather than duplicating identities.
    pub async fn add_or_update(&self, identity: UserIdentity) -> Arc<User> {
        let existing = {
            let by_user = self.by_user_id.read().await;
            by_user.get(&identity.user_id).cloned()
        };

        if let Some(user) = existing {
            let old_socket = user.socket_id();
            if old_socket != identity.socket_id {
                let mut by_socket = self.by_socket_id.write().await;
                by_socket.remove(&old_socket);
                by_socket.insert(identity.socket_id.clone(), user.clone());
            }
            user.rebind(&identity);
            self.emit(UserEvent::Updated {
                user_id: user.id().to_string(),
            });
            return user;
        }

        let user = User::new(identity);
        self.by_user_id
            .write()
            .await
            .insert(user.id().to_string(), user.clone());
        self.by_socket_id
            .write()
            .await
            .insert(user.socket_id(), user.clone());
        self.emit(UserEvent::Added {
            user_id: user.id().to_string(),
        });
        user
    }

    pub async fn get_by_user_id(&self, user_id: &str) -> Option<Arc<User>> {
        self.by_user_id.read().await.get(user_id).cloned()
    }

    pub async fn get_by_socket_id(&self, socket_id: &str) -> Option<Arc<User>> {
        self.by_socket_id.read().await.get(socket_id).cloned()
    }

    pub async fn has_user(&self, user_id: &str) -> bool {
        self.by_user_id.read().await.contains_key(user_id)
    }

    /// Destroys the user's resources and evicts both index entries.
    pub async fn remove_by_user_id(&self, user_id: &str) {
        let user = { self.by_user_id.write().await.remove(user_id) };
        if let Some(user) = user {
            self.by_socket_id.write().await.remove(&user.socket_id());
            user.destroy();
            self.emit(UserEvent::Removed {
                user_id: user.id().to_string(),
            });
        }
    }

    /// Destroys the user's resources and evicts both index entries.
    pub async fn remove_by_socket_id(&self, socket_id: &str) {
        let user = { self.by_socket_id.write().await.remove(socket_id) };
        if let Some(user) = user {
            self.by_user_id.write().await.remove(user.id());
            user.destroy();
            self.emit(UserEvent::Removed {
                user_id: user.id().to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user_id: &str, socket_id: &str) -> UserIdentity {
        UserIdentity {
            user_id: user_id.to_string(),
            name: format!("name-{user_id}"),
            role: Role::User,
            socket_id: socket_id.to_string(),
        }
    }

    #[tokio::test]
    async fn add_then_rebind_keeps_one_identity() {
        let registry = UserRegistry::new();

        let user = registry.add_or_update(identity("u1", "s1")).await;
        assert_eq!(user.socket_id(), "s1");

        let rebound = registry.add_or_update(identity("u1", "s2")).await;
        assert!(Arc::ptr_eq(&user, &rebound), "rebind must not duplicate the user");
        assert_eq!(rebound.socket_id(), "s2");

        assert!(registry.get_by_socket_id("s1").await.is_none());
        assert!(registry.get_by_socket_id("s2").await.is_some());
    }

    #[tokio::test]
    async fn removal_evicts_both_indexes() {
        let registry = UserRegistry::new();
        registry.add_or_update(identity("u1", "s1")).await;

        registry.remove_by_user_id("u1").await;
        assert!(!registry.has_user("u1").await);
        assert!(registry.get_by_socket_id("s1").await.is_none());

        // Removing again is a no-op.
        registry.remove_by_user_id("u1").await;
    }

    #[tokio::test]
    async fn registry_emits_lifecycle_events() {
        let registry = UserRegistry::new();
        let mut events = registry.subscribe();

        registry.add_or_update(identity("u1", "s1")).await;
        registry.add_or_update(identity("u1", "s2")).await;
        registry.remove_by_socket_id("s2").await;

        assert_eq!(
            events.recv().await.unwrap(),
            UserEvent::Added {
                user_id: "u1".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            UserEvent::Updated {
                user_id: "u1".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            UserEvent::Removed {
                user_id: "u1".to_string()
            }
        );
    }
}
