//! Per-room routing context and the router registry.

use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::worker::{ConsumerSink, WorkerCommand, WorkerHandle};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

/// The media routing context for one room, bound to one worker.
///
/// Created when a room is created and closed when the room closes. Producer
/// registrations are mirrored here (for capability checks and consumer
/// parameter derivation); the packet fan-out table itself lives on the
/// owning worker's thread.
pub struct Router {
    id: String,
    rtp_capabilities: RtpCapabilities,
    worker: WorkerHandle,
    /// Producer id → negotiated kind and parameters. Brief map operations
    /// only; the lock never spans an await.
    producers: Mutex<HashMap<String, ProducerRecord>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct ProducerRecord {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

impl Router {
    pub(crate) fn new(worker: WorkerHandle, config: &MediaConfig) -> Arc<Self> {
        let router = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            rtp_capabilities: config.router_rtp_capabilities(),
            worker,
            producers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        tracing::debug!(router_id = %router.id, worker = router.worker.index(), "router created");
        router
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a peer with `rtp_capabilities` can consume `producer_id`.
    ///
    /// True when the producer exists on this router and the peer shares at
    /// least one codec (mime type, clock rate, channel count) with the
    /// router's capability set.
    pub fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let producers = self.producers.lock().expect("producer map lock poisoned");
        if !producers.contains_key(producer_id) {
            return false;
        }
        rtp_capabilities.codecs.iter().any(|peer| {
            self.rtp_capabilities.codecs.iter().any(|ours| {
                peer.mime_type.eq_ignore_ascii_case(&ours.mime_type)
                    && peer.clock_rate == ours.clock_rate
                    && peer.channels == ours.channels
            })
        })
    }

    /// Negotiated kind and parameters of a registered producer.
    pub(crate) fn producer_record(&self, producer_id: &str) -> Option<ProducerRecord> {
        self.producers
            .lock()
            .expect("producer map lock poisoned")
            .get(producer_id)
            .cloned()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            Err(MediaError::RouterClosed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn register_producer(
        &self,
        producer_id: String,
        record: ProducerRecord,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.worker.send(WorkerCommand::AddProducer {
            producer_id: producer_id.clone(),
        })?;
        self.producers
            .lock()
            .expect("producer map lock poisoned")
            .insert(producer_id, record);
        Ok(())
    }

    pub(crate) fn unregister_producer(&self, producer_id: &str) {
        self.producers
            .lock()
            .expect("producer map lock poisoned")
            .remove(producer_id);
        if let Err(e) = self.worker.send(WorkerCommand::RemoveProducer {
            producer_id: producer_id.to_string(),
        }) {
            tracing::warn!(router_id = %self.id, "failed to unregister producer: {}", e);
        }
    }

    pub(crate) fn register_consumer(
        &self,
        producer_id: &str,
        sink: ConsumerSink,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.worker.send(WorkerCommand::AddConsumer {
            producer_id: producer_id.to_string(),
            sink,
        })
    }

    pub(crate) fn unregister_consumer(&self, producer_id: &str, consumer_id: &str) {
        if let Err(e) = self.worker.send(WorkerCommand::RemoveConsumer {
            producer_id: producer_id.to_string(),
            consumer_id: consumer_id.to_string(),
        }) {
            tracing::warn!(router_id = %self.id, "failed to unregister consumer: {}", e);
        }
    }

    pub(crate) fn forward(&self, producer_id: &str, packet: Bytes) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.worker.send(WorkerCommand::Forward {
            producer_id: producer_id.to_string(),
            packet,
        })
    }

    /// Closes the router, detaching every producer from the worker table.
    ///
    /// Idempotent; never fails.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let producer_ids: Vec<String> = self
            .producers
            .lock()
            .expect("producer map lock poisoned")
            .drain()
            .map(|(id, _)| id)
            .collect();
        for producer_id in producer_ids {
            if let Err(e) = self
                .worker
                .send(WorkerCommand::RemoveProducer { producer_id })
            {
                tracing::warn!(router_id = %self.id, "failed to detach producer on close: {}", e);
            }
        }
        tracing::debug!(router_id = %self.id, "router closed");
    }
}

impl crate::worker::MediaWorkerPool {
    /// Creates a router on the least-loaded worker.
    pub async fn create_router(&self, config: &MediaConfig) -> Result<Arc<Router>, MediaError> {
        let worker = self.least_loaded().await?;
        Ok(Router::new(worker, config))
    }
}

/// Tracks the per-room routing contexts created on workers.
#[derive(Clone, Default)]
pub struct RouterRegistry {
    routers: Arc<RwLock<HashMap<String, Arc<Router>>>>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, router: Arc<Router>) {
        self.routers
            .write()
            .await
            .insert(router.id().to_string(), router);
    }

    pub async fn get(&self, router_id: &str) -> Option<Arc<Router>> {
        self.routers.read().await.get(router_id).cloned()
    }

    /// Removes and closes a router.
    pub async fn remove(&self, router_id: &str) {
        if let Some(router) = self.routers.write().await.remove(router_id) {
            router.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.routers.read().await.len()
    }
}
