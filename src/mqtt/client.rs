//! MQTT client wrapper (C4): a managed broker connection with auto-reconnect
//! and re-subscribe, built on `rumqttc`'s `AsyncClient`/`EventLoop` split.
//!
//! This wrapper is subscribe-only (see SPEC_FULL.md §4.4 / §9 Open
//! Questions): the source material's unused `publish` surface is omitted.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::error::{IngestError, Result};

/// Capacity of rumqttc's internal request channel between `AsyncClient` and `EventLoop`.
const MQTT_REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Certificate verifier that accepts any certificate. Installed only when
/// `allow_invalid_certs` is set; never the default.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Broker connection settings (§6 `mqtt.*`).
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub allow_invalid_certs: bool,
    pub keep_alive_s: u64,
    pub reconnect_delay_s: u64,
    pub clean_session: bool,
    pub qos: u8,
}

/// One inbound message, handed off the `EventLoop` task for C5/C6 to route and decode.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Managed MQTT broker connection (C4).
pub struct MqttClient {
    client: AsyncClient,
    event_task: JoinHandle<()>,
    subscriptions: Arc<Mutex<Vec<(String, u8)>>>,
}

impl MqttClient {
    /// Opens the broker connection and spawns the background event-loop task.
    /// Returns the client handle plus the channel inbound messages arrive on.
    pub fn start(config: MqttConfig) -> (Self, mpsc::Receiver<InboundMessage>) {
        let mut options = MqttOptions::new(config.client_id.clone(), config.broker_host.clone(), config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_s));
        options.set_clean_session(config.clean_session);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        if config.use_tls {
            let tls_config = if config.allow_invalid_certs {
                warn!("mqtt TLS certificate validation disabled (allow_invalid_certs=true); do not use in production");
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            } else {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
            };
            options.set_transport(Transport::tls_with_config(tls_config.into()));
        }

        let (client, mut event_loop) = AsyncClient::new(options, MQTT_REQUEST_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::channel(1000);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));

        let resub_client = client.clone();
        let resub_subscriptions = subscriptions.clone();
        let reconnect_delay = Duration::from_secs(config.reconnect_delay_s.max(1));

        let event_task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        // clean_session drops broker-side subscription state, so every
                        // (re)connect must resubscribe to everything configured so far.
                        let subs = resub_subscriptions.lock().await.clone();
                        for (topic, qos) in subs {
                            if let Err(e) = resub_client.subscribe(&topic, qos_from_u8(qos)).await {
                                warn!(topic, error = %e, "mqtt resubscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                            qos: publish.qos as u8,
                            retained: publish.retain,
                        };
                        if tx.send(message).await.is_err() {
                            // Receiver dropped: nothing left to deliver to.
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop error, reconnecting");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        (
            Self {
                client,
                event_task,
                subscriptions,
            },
            rx,
        )
    }

    /// Subscribes to `topic_filters` and remembers them for resubscription on reconnect.
    pub async fn subscribe(&self, topic_filters: &[(String, u8)]) -> Result<()> {
        {
            let mut subs = self.subscriptions.lock().await;
            subs.extend(topic_filters.iter().cloned());
        }
        for (topic, qos) in topic_filters {
            self.client
                .subscribe(topic, qos_from_u8(*qos))
                .await
                .map_err(|e| IngestError::connection("mqtt-broker", format!("subscribe to '{topic}' failed: {e}")))?;
        }
        Ok(())
    }

    /// Disconnects from the broker and stops the event-loop task.
    pub async fn stop(self) {
        let _ = self.client.disconnect().await;
        self.event_task.abort();
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}
