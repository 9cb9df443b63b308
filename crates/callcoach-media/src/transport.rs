//! Transports: negotiated WebRTC endpoints and the internal loopback kind.

use crate::error::MediaError;
use crate::parameters::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpParameters,
};
use crate::router::Router;
use crate::track::{create_consumer, create_producer, Consumer, Producer};
use crate::MediaConfig;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// ICE candidate priority for the single host candidate we advertise.
const HOST_CANDIDATE_PRIORITY: u32 = 1_015_021_823;

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn generate_ice_parameters() -> IceParameters {
    IceParameters {
        username_fragment: random_alphanumeric(8),
        password: random_alphanumeric(22),
        ice_lite: true,
    }
}

fn generate_ice_candidates(config: &MediaConfig) -> Vec<IceCandidate> {
    let span = config.rtc_max_port.saturating_sub(config.rtc_min_port).max(1);
    let port = config.rtc_min_port + rand::thread_rng().gen_range(0..span);
    vec![IceCandidate {
        foundation: "udpcandidate".to_string(),
        priority: HOST_CANDIDATE_PRIORITY,
        address: config.announced_address.clone(),
        port,
        protocol: "udp".to_string(),
        candidate_type: "host".to_string(),
    }]
}

fn generate_dtls_parameters() -> DtlsParameters {
    let digest: Vec<String> = (0..32)
        .map(|_| format!("{:02X}", rand::thread_rng().gen::<u8>()))
        .collect();
    DtlsParameters {
        role: DtlsRole::Auto,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: digest.join(":"),
        }],
    }
}

/// One negotiated ICE/DTLS media transport for a client.
///
/// Holds the local negotiation parameters returned to the client and the
/// remote DTLS parameters supplied on connect. Owned by its user; closed on
/// user/room teardown.
pub struct WebRtcTransport {
    id: String,
    router: Arc<Router>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    remote_dtls: Mutex<Option<DtlsParameters>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl WebRtcTransport {
    pub(crate) fn new(router: Arc<Router>, config: &MediaConfig) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            router,
            ice_parameters: generate_ice_parameters(),
            ice_candidates: generate_ice_candidates(config),
            dtls_parameters: generate_dtls_parameters(),
            remote_dtls: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn ice_parameters(&self) -> &IceParameters {
        &self.ice_parameters
    }

    pub fn ice_candidates(&self) -> &[IceCandidate] {
        &self.ice_candidates
    }

    pub fn dtls_parameters(&self) -> &DtlsParameters {
        &self.dtls_parameters
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Completes the DTLS handshake with the remote parameters.
    ///
    /// Must be called exactly once per transport.
    pub fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::TransportClosed(self.id.clone()));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(MediaError::AlreadyConnected(self.id.clone()));
        }
        *self.remote_dtls.lock().expect("dtls lock poisoned") = Some(dtls_parameters);
        Ok(())
    }

    /// Creates a producer track on this transport.
    pub fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<Producer>, MediaError> {
        if self.is_closed() {
            return Err(MediaError::TransportClosed(self.id.clone()));
        }
        create_producer(self.router.clone(), kind, rtp_parameters)
    }

    /// Creates a consumer track on this transport.
    ///
    /// Client consumers start paused; the client resumes them once its
    /// receiving side is wired.
    pub fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<Consumer>, MediaError> {
        if self.is_closed() {
            return Err(MediaError::TransportClosed(self.id.clone()));
        }
        create_consumer(self.router.clone(), producer_id, paused)
    }

    /// Closes the transport. Idempotent; never fails.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(transport_id = %self.id, "webrtc transport closed");
    }
}

/// The internal loopback transport used to feed and drain the agent
/// pipeline from the same media stream a human peer uses.
///
/// Packets flow through in-process channels only; there is no network leg.
pub struct DirectTransport {
    id: String,
    router: Arc<Router>,
    closed: AtomicBool,
}

impl DirectTransport {
    pub(crate) fn new(router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            router,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Creates a producer on the loopback transport.
    pub fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<Producer>, MediaError> {
        if self.is_closed() {
            return Err(MediaError::TransportClosed(self.id.clone()));
        }
        create_producer(self.router.clone(), kind, rtp_parameters)
    }

    /// Creates an unpaused consumer on the loopback transport.
    pub fn consume(&self, producer_id: &str) -> Result<Arc<Consumer>, MediaError> {
        if self.is_closed() {
            return Err(MediaError::TransportClosed(self.id.clone()));
        }
        create_consumer(self.router.clone(), producer_id, false)
    }

    /// Closes the transport. Idempotent; never fails.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(transport_id = %self.id, "direct transport closed");
    }
}
