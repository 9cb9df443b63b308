//! Stateless negotiation and track operations.
//!
//! Each function performs exactly one media action over explicit inputs and
//! returns the created resource or a typed failure; nothing is looked up or
//! cached here. Resource lifetime decisions (who stores what, when to close
//! it) belong to the caller — the signaling gateway and the registries.

use crate::error::MediaError;
use crate::parameters::{
    ClientTransportParams, ConsumerParams, DtlsParameters, MediaKind, RtpCapabilities,
    RtpParameters,
};
use crate::router::Router;
use crate::track::{Consumer, Producer};
use crate::transport::{DirectTransport, WebRtcTransport};
use crate::MediaConfig;
use std::sync::Arc;

/// Extracts the transport parameters sent to the client.
pub fn transport_params(transport: &WebRtcTransport) -> ClientTransportParams {
    ClientTransportParams {
        id: transport.id().to_string(),
        ice_parameters: transport.ice_parameters().clone(),
        ice_candidates: transport.ice_candidates().to_vec(),
        dtls_parameters: transport.dtls_parameters().clone(),
    }
}

/// Creates a WebRTC transport on the router.
///
/// Used for both the producer and the consumer side; the caller decides
/// which role the transport plays and where it is stored.
pub fn create_client_transport(
    router: &Arc<Router>,
    config: &MediaConfig,
) -> Result<(Arc<WebRtcTransport>, ClientTransportParams), MediaError> {
    router.ensure_open()?;
    let transport = WebRtcTransport::new(router.clone(), config);
    let params = transport_params(&transport);
    Ok((transport, params))
}

/// Connects a transport with the client-supplied DTLS parameters.
pub fn connect_transport(
    transport: &WebRtcTransport,
    dtls_parameters: DtlsParameters,
) -> Result<(), MediaError> {
    transport.connect(dtls_parameters).map_err(|e| {
        tracing::error!(transport_id = %transport.id(), "transport connect failed: {}", e);
        e
    })
}

/// Creates a producer track for a client.
pub fn create_producer_track(
    transport: &WebRtcTransport,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
) -> Result<Arc<Producer>, MediaError> {
    transport.produce(kind, rtp_parameters).map_err(|e| {
        tracing::error!(transport_id = %transport.id(), "failed to create producer track: {}", e);
        e
    })
}

/// Result of a consumer-track negotiation.
pub enum ConsumeOutcome {
    Consumed {
        consumer: Arc<Consumer>,
        params: ConsumerParams,
    },
    /// The requesting peer's capabilities are incompatible with the router,
    /// or the producer is gone. A soft failure, not an error.
    CannotConsume,
}

/// Creates a consumer track for a client, gated by a capability check.
///
/// Client consumers start paused; the client sends `unpauseConsumer` once
/// its receiving side is ready.
pub fn create_consumer_track(
    transport: &WebRtcTransport,
    router: &Router,
    rtp_capabilities: &RtpCapabilities,
    producer_id: &str,
) -> Result<ConsumeOutcome, MediaError> {
    if !router.can_consume(producer_id, rtp_capabilities) {
        tracing::debug!(
            producer_id,
            router_id = %router.id(),
            "peer cannot consume producer"
        );
        return Ok(ConsumeOutcome::CannotConsume);
    }

    let consumer = transport
        .consume(producer_id, rtp_capabilities, true)
        .map_err(|e| {
            tracing::error!(producer_id, "failed to create consumer track: {}", e);
            e
        })?;

    let params = ConsumerParams {
        producer_id: producer_id.to_string(),
        id: consumer.id().to_string(),
        kind: consumer.kind(),
        rtp_parameters: consumer.rtp_parameters().clone(),
    };

    Ok(ConsumeOutcome::Consumed { consumer, params })
}

/// Creates the internal loopback transport for an agent pipeline.
pub fn create_direct_transport(router: &Arc<Router>) -> Result<Arc<DirectTransport>, MediaError> {
    router.ensure_open()?;
    Ok(DirectTransport::new(router.clone()))
}

/// Creates the unpaused listener consumer on a loopback transport.
pub fn create_direct_consumer(
    transport: &DirectTransport,
    producer_id: &str,
) -> Result<Arc<Consumer>, MediaError> {
    transport.consume(producer_id).map_err(|e| {
        tracing::error!(producer_id, "failed to create agent consumer track: {}", e);
        e
    })
}

/// Creates the agent's producer on a loopback transport, mirroring the
/// listener consumer's negotiated parameters so the outbound stream keeps
/// the same identity.
pub fn create_direct_producer(
    transport: &DirectTransport,
    listener: &Consumer,
) -> Result<Arc<Producer>, MediaError> {
    transport
        .produce(listener.kind(), listener.rtp_parameters().clone())
        .map_err(|e| {
            tracing::error!(
                listener_id = %listener.id(),
                "failed to create agent producer track: {}",
                e
            );
            e
        })
}

/// Resumes (unpauses) a consumer.
pub fn resume_consumer(consumer: &Consumer) {
    consumer.resume();
}

/// Closes a WebRTC transport. Safe no-op when already closed; logs rather
/// than fails.
pub fn close_webrtc_transport(transport: &WebRtcTransport) {
    transport.close();
}

/// Closes a direct transport. Safe no-op when already closed.
pub fn close_direct_transport(transport: &DirectTransport) {
    transport.close();
}

/// Closes a producer track. Safe no-op when already closed.
pub fn close_producer(producer: &Producer) {
    producer.close();
}

/// Closes a consumer track. Safe no-op when already closed.
pub fn close_consumer(consumer: &Consumer) {
    consumer.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{RtpCodecParameters, RtpEncodingParameters};
    use crate::worker::MediaWorkerPool;
    use bytes::Bytes;
    use std::time::Duration;

    fn opus_parameters(ssrc: u32) -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 100,
                clock_rate: 48000,
                channels: 2,
            }],
            encodings: vec![RtpEncodingParameters { ssrc }],
        }
    }

    async fn test_router() -> Arc<Router> {
        let pool = MediaWorkerPool::new(1);
        let config = MediaConfig::default();
        pool.create_router(&config).await.expect("router creation")
    }

    async fn recv_with_timeout(rx: &mut tokio::sync::mpsc::Receiver<Bytes>) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn client_transport_returns_negotiation_params() {
        let router = test_router().await;
        let config = MediaConfig::default();
        let (transport, params) =
            create_client_transport(&router, &config).expect("transport creation");

        assert_eq!(params.id, transport.id());
        assert_eq!(params.ice_parameters.username_fragment.len(), 8);
        assert_eq!(params.ice_parameters.password.len(), 22);
        assert_eq!(params.ice_candidates.len(), 1);
        assert!(params.ice_candidates[0].port >= config.rtc_min_port);
        assert!(params.ice_candidates[0].port < config.rtc_max_port);
        assert_eq!(params.dtls_parameters.fingerprints[0].algorithm, "sha-256");
    }

    #[tokio::test]
    async fn transport_connects_exactly_once() {
        let router = test_router().await;
        let config = MediaConfig::default();
        let (transport, params) = create_client_transport(&router, &config).unwrap();

        connect_transport(&transport, params.dtls_parameters.clone())
            .expect("first connect succeeds");
        let second = connect_transport(&transport, params.dtls_parameters);
        assert!(matches!(second, Err(MediaError::AlreadyConnected(_))));
    }

    #[tokio::test]
    async fn paused_consumer_receives_nothing_until_resumed() {
        let router = test_router().await;
        let config = MediaConfig::default();
        let (producer_transport, _) = create_client_transport(&router, &config).unwrap();
        let (consumer_transport, _) = create_client_transport(&router, &config).unwrap();

        let producer =
            create_producer_track(&producer_transport, MediaKind::Audio, opus_parameters(42))
                .unwrap();

        let outcome = create_consumer_track(
            &consumer_transport,
            &router,
            router.rtp_capabilities(),
            producer.id(),
        )
        .unwrap();
        let consumer = match outcome {
            ConsumeOutcome::Consumed { consumer, .. } => consumer,
            ConsumeOutcome::CannotConsume => panic!("router capabilities must be consumable"),
        };
        assert!(consumer.is_paused());

        let mut rx = consumer.take_rtp().expect("first take returns the stream");

        producer.write_rtp(Bytes::from_static(b"packet-1")).unwrap();
        assert!(
            recv_with_timeout(&mut rx).await.is_none(),
            "paused consumer must not receive packets"
        );

        resume_consumer(&consumer);
        producer.write_rtp(Bytes::from_static(b"packet-2")).unwrap();
        let packet = recv_with_timeout(&mut rx).await.expect("packet after resume");
        assert_eq!(&packet[..], b"packet-2");
    }

    #[tokio::test]
    async fn incompatible_capabilities_yield_soft_cannot_consume() {
        let router = test_router().await;
        let config = MediaConfig::default();
        let (producer_transport, _) = create_client_transport(&router, &config).unwrap();
        let (consumer_transport, _) = create_client_transport(&router, &config).unwrap();

        let producer =
            create_producer_track(&producer_transport, MediaKind::Audio, opus_parameters(7))
                .unwrap();

        let pcm_only = RtpCapabilities {
            codecs: vec![crate::parameters::RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/PCMU".to_string(),
                clock_rate: 8000,
                channels: 1,
            }],
        };

        let outcome =
            create_consumer_track(&consumer_transport, &router, &pcm_only, producer.id()).unwrap();
        assert!(matches!(outcome, ConsumeOutcome::CannotConsume));
    }

    #[tokio::test]
    async fn loopback_pair_taps_the_producer_stream() {
        let router = test_router().await;
        let config = MediaConfig::default();
        let (producer_transport, _) = create_client_transport(&router, &config).unwrap();

        let producer =
            create_producer_track(&producer_transport, MediaKind::Audio, opus_parameters(1234))
                .unwrap();

        let direct = create_direct_transport(&router).unwrap();
        let listener = create_direct_consumer(&direct, producer.id()).unwrap();
        assert!(!listener.is_paused(), "agent listener starts unpaused");
        assert_eq!(listener.rtp_parameters().primary_ssrc(), Some(1234));

        let agent_producer = create_direct_producer(&direct, &listener).unwrap();
        assert_eq!(agent_producer.rtp_parameters().primary_ssrc(), Some(1234));

        let mut rx = listener.take_rtp().expect("listener stream");
        producer.write_rtp(Bytes::from_static(b"speech")).unwrap();
        let packet = recv_with_timeout(&mut rx).await.expect("tapped packet");
        assert_eq!(&packet[..], b"speech");
    }

    #[tokio::test]
    async fn closed_consumer_stops_receiving() {
        let router = test_router().await;
        let config = MediaConfig::default();
        let (producer_transport, _) = create_client_transport(&router, &config).unwrap();

        let producer =
            create_producer_track(&producer_transport, MediaKind::Audio, opus_parameters(5))
                .unwrap();
        let direct = create_direct_transport(&router).unwrap();
        let listener = create_direct_consumer(&direct, producer.id()).unwrap();
        let mut rx = listener.take_rtp().unwrap();

        close_consumer(&listener);
        close_consumer(&listener); // double close is a no-op

        producer.write_rtp(Bytes::from_static(b"late")).unwrap();
        assert!(recv_with_timeout(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn closed_router_rejects_new_transports() {
        let router = test_router().await;
        let config = MediaConfig::default();
        router.close();
        router.close(); // idempotent
        assert!(matches!(
            create_client_transport(&router, &config),
            Err(MediaError::RouterClosed(_))
        ));
    }
}
