//! Thin, library-agnostic MQTT client abstraction, plus the concrete
//! `rumqttc`-backed implementation. Grounded directly on the teacher's
//! `connect_iothub()`/`ConnectionImplementation` (`iothub/mod.rs`):
//! building `MqttOptions` (client id, username shape, TLS, clean-session,
//! manual acks, inflight) and its reason-code-to-error mapping.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, MqttOptions, QoS, TlsConfiguration, Transport};

use crate::credentials::{Authentication, ConnectionCredentials};
use crate::error::{ErrorKind, SdkError};
use crate::settings::MqttTransportSettings;
use crate::token::tls_auth_error;
use crate::topics;

/// Options resolved from credentials + settings, ready to hand to the
/// underlying MQTT library.
pub fn build_connect_options(
    credentials: &ConnectionCredentials,
    settings: &MqttTransportSettings,
    password: Option<&str>,
) -> anyhow::Result<MqttOptions> {
    let client_id = credentials.client_id();
    let mut options = MqttOptions::new(client_id.clone(), credentials.host().to_string(), 8883);

    let product_info = urlencoding::encode(&settings.product_info).into_owned();
    let mut username = format!(
        "{}/{}/?api-version=2018-06-30&DeviceClientType={}",
        credentials.host(),
        client_id,
        product_info
    );
    if let Some(model_id) = &settings.model_id {
        username.push_str(&format!("&model-id={}", urlencoding::encode(model_id)));
    }
    if let Some(auth_chain) = &settings.auth_chain {
        username.push_str(&format!("&auth-chain={}", urlencoding::encode(auth_chain)));
    }

    match credentials.authentication() {
        Authentication::Certificate { .. } => {
            options.set_credentials(username, "");
        }
        Authentication::SharedKey(_) | Authentication::PrecomputedSasToken(_) => {
            let password = password
                .ok_or_else(|| anyhow::anyhow!("no SAS password available for shared-key auth"))?;
            options.set_credentials(username, password);
        }
    }

    options.set_clean_session(settings.clean_session);
    options.set_keep_alive(settings.keep_alive);
    options.set_manual_acks(true);
    options.set_inflight(1);
    options.set_transport(Transport::Tls(TlsConfiguration::Native));

    if let Some(will) = &settings.will {
        let topic = topics::publish_topic(credentials.device_id(), credentials.module_id());
        options.set_last_will(rumqttc::LastWill::new(
            topic,
            will.payload.clone(),
            will.qos.to_rumqttc(),
            will.retain,
        ));
    }

    Ok(options)
}

/// Maps a `rumqttc::ConnectionError` onto this crate's error taxonomy,
/// following the table in the specification's adapter component.
pub fn map_connect_error(error: &rumqttc::ConnectionError, cancelled: bool) -> SdkError {
    use rumqttc::ConnectionError;
    match error {
        ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword)
        | ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized)
        | ConnectionError::ConnectionRefused(ConnectReturnCode::BadClientId) => {
            SdkError::new(ErrorKind::Unauthorized, error.to_string())
        }
        ConnectionError::ConnectionRefused(ConnectReturnCode::RefusedProtocolVersion) => {
            SdkError::new(ErrorKind::NetworkErrors, error.to_string())
        }
        ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable) => {
            SdkError::new(ErrorKind::ServerBusy, error.to_string())
        }
        ConnectionError::Tls(_) => tls_auth_error(error.to_string()),
        ConnectionError::Io(_) | ConnectionError::NetworkTimeout if cancelled => {
            SdkError::new(ErrorKind::NetworkErrors, "operation cancelled")
        }
        ConnectionError::NetworkTimeout => SdkError::new(ErrorKind::Timeout, error.to_string()),
        _ => SdkError::new(ErrorKind::NetworkErrors, error.to_string()),
    }
}

/// Maps a publish/subscribe reason code failure into NetworkErrors,
/// carrying the reason code in the message per the specification.
pub fn publish_failure(reason: impl std::fmt::Debug) -> SdkError {
    SdkError::new(ErrorKind::NetworkErrors, format!("publish failed: {reason:?}"))
}

/// A delivered inbound message, handed to the adapter's `on_message`
/// callback before classification.
#[derive(Debug, Clone)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub pkid: u16,
    pub qos: QoS,
}

/// Library-agnostic MQTT client surface the transport handler drives.
/// `rumqttc`'s actual split between `AsyncClient` (commands) and
/// `EventLoop` (polling) is hidden behind this trait so the transport
/// handler and its tests don't depend on `rumqttc` directly.
#[async_trait]
pub trait MqttClientAdapter: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), SdkError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), SdkError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), SdkError>;

    async fn disconnect(&self) -> Result<(), SdkError>;

    /// Acknowledges a manually-ack'd publish identified by its packet id.
    async fn ack(&self, pkid: u16, qos: QoS) -> Result<(), SdkError>;
}

/// `rumqttc`-backed adapter. Thin wrapper: all the interesting
/// classification and correlation logic lives in `eventloop.rs` and
/// `transport.rs`, which poll the underlying `rumqttc::EventLoop`
/// directly rather than through this trait (the trait exists for the
/// command side and for substituting a fake in tests).
pub struct RumqttcAdapter {
    client: AsyncClient,
}

impl RumqttcAdapter {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MqttClientAdapter for RumqttcAdapter {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SdkError> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| publish_failure(e))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), SdkError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| publish_failure(e))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), SdkError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| publish_failure(e))
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        self.client.disconnect().await.map_err(|e| publish_failure(e))
    }

    async fn ack(&self, pkid: u16, qos: QoS) -> Result<(), SdkError> {
        let publish = rumqttc::Publish::new("", qos, Vec::new());
        let mut publish = publish;
        publish.pkid = pkid;
        self.client.ack(&publish).await.map_err(|e| publish_failure(e))
    }
}

/// A reasonably long but finite wait before a connect attempt is treated
/// as hung; cancellation remains the primary way to abort a connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ConnectionCredentials;
    use crate::settings::MqttTransportSettings;

    #[test]
    fn username_includes_api_version_and_product_info() {
        let creds = ConnectionCredentials::builder("hub.example.net", "dev-1")
            .with_shared_key("a2V5")
            .build()
            .unwrap();
        let settings = MqttTransportSettings::default();
        let options =
            build_connect_options(&creds, &settings, Some("SharedAccessSignature sr=x")).unwrap();
        assert!(format!("{:?}", options).contains("dev-1"));
    }

    #[test]
    fn shared_key_auth_requires_a_password() {
        let creds = ConnectionCredentials::builder("hub.example.net", "dev-1")
            .with_shared_key("a2V5")
            .build()
            .unwrap();
        let settings = MqttTransportSettings::default();
        let err = build_connect_options(&creds, &settings, None);
        assert!(err.is_err());
    }
}
