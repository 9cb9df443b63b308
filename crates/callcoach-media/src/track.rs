//! Producer and consumer tracks.

use crate::error::MediaError;
use crate::parameters::{MediaKind, RtpParameters};
use crate::router::Router;
use crate::worker::{ConsumerSink, WorkerHandle};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// One media flow entering the router.
///
/// `write_rtp` is where packets enter the routing table: the transport's
/// network leg in production, the loopback pair and tests in-process.
pub struct Producer {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Arc<Router>,
    closed: AtomicBool,
}

impl Producer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Injects one RTP packet into the router for fan-out.
    pub fn write_rtp(&self, packet: Bytes) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::TransportClosed(self.id.clone()));
        }
        self.router.forward(&self.id, packet)
    }

    /// Closes the track and detaches it from the router. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.router.unregister_producer(&self.id);
        tracing::debug!(producer_id = %self.id, "producer closed");
    }
}

/// One media flow leaving the router toward a transport.
pub struct Consumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    rtp_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    router: Arc<Router>,
}

impl Consumer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unpauses delivery. Packets arriving while paused are dropped, not
    /// queued.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Takes the packet stream. Returns `None` after the first call.
    pub fn take_rtp(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.rtp_rx.lock().expect("rtp receiver lock poisoned").take()
    }

    /// Closes the track and detaches it from the router. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.router.unregister_consumer(&self.producer_id, &self.id);
        tracing::debug!(consumer_id = %self.id, "consumer closed");
    }
}

/// Registers a producer with the router and its worker routing table.
pub(crate) fn create_producer(
    router: Arc<Router>,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
) -> Result<Arc<Producer>, MediaError> {
    let id = Uuid::new_v4().to_string();
    router.register_producer(
        id.clone(),
        crate::router::ProducerRecord {
            kind,
            rtp_parameters: rtp_parameters.clone(),
        },
    )?;
    Ok(Arc::new(Producer {
        id,
        kind,
        rtp_parameters,
        router,
        closed: AtomicBool::new(false),
    }))
}

/// Registers a consumer for an existing producer.
///
/// The consumer mirrors the producer's negotiated parameters (including the
/// SSRC), so a loopback producer created from it carries the same stream
/// identity.
pub(crate) fn create_consumer(
    router: Arc<Router>,
    producer_id: &str,
    paused: bool,
) -> Result<Arc<Consumer>, MediaError> {
    let record = router
        .producer_record(producer_id)
        .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;

    let id = Uuid::new_v4().to_string();
    let paused_flag = Arc::new(AtomicBool::new(paused));
    let closed_flag = Arc::new(AtomicBool::new(false));
    let (tx, rx) = WorkerHandle::consumer_channel();

    router.register_consumer(
        producer_id,
        ConsumerSink {
            consumer_id: id.clone(),
            paused: paused_flag.clone(),
            closed: closed_flag.clone(),
            tx,
        },
    )?;

    Ok(Arc::new(Consumer {
        id,
        producer_id: producer_id.to_string(),
        kind: record.kind,
        rtp_parameters: record.rtp_parameters,
        paused: paused_flag,
        closed: closed_flag,
        rtp_rx: Mutex::new(Some(rx)),
        router,
    }))
}
