use std::time::Duration;

/// QoS level for a single publish or subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    pub(crate) fn to_rumqttc(self) -> rumqttc::QoS {
        match self {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// HTTP proxy to tunnel the MQTT connection through.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub basic_auth: Option<(String, String)>,
}

/// A last-will message published by the broker if the client disconnects
/// ungracefully.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// Transport variant the caller selected. Only Mqtt is implemented in
/// depth; the others are represented so a caller's intent is well typed
/// and a mismatched choice surfaces a clear construction-time error rather
/// than silently falling back to MQTT.
#[derive(Debug, Clone)]
pub enum TransportSettings {
    Mqtt(MqttTransportSettings),
    MqttWebSocket(MqttTransportSettings),
    AmqpTcp,
    AmqpWebSocket,
    Http,
}

impl TransportSettings {
    pub fn as_mqtt(&self) -> anyhow::Result<&MqttTransportSettings> {
        match self {
            TransportSettings::Mqtt(s) | TransportSettings::MqttWebSocket(s) => Ok(s),
            other => anyhow::bail!(
                "transport variant {other:?} is not implemented by this crate's transport handler"
            ),
        }
    }

    pub fn uses_websocket(&self) -> bool {
        matches!(self, TransportSettings::MqttWebSocket(_))
    }
}

impl std::fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportSettings::Mqtt(_) => write!(f, "Mqtt"),
            TransportSettings::MqttWebSocket(_) => write!(f, "MqttWebSocket"),
            TransportSettings::AmqpTcp => write!(f, "AmqpTcp"),
            TransportSettings::AmqpWebSocket => write!(f, "AmqpWebSocket"),
            TransportSettings::Http => write!(f, "Http"),
        }
    }
}

/// MQTT-specific connection parameters.
#[derive(Debug, Clone)]
pub struct MqttTransportSettings {
    pub publish_qos: Qos,
    pub subscribe_qos: Qos,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    pub proxy: Option<ProxySettings>,
    pub will: Option<WillMessage>,
    pub auth_chain: Option<String>,
    pub model_id: Option<String>,
    pub twin_response_timeout: Duration,
    pub product_info: String,
}

impl Default for MqttTransportSettings {
    fn default() -> Self {
        Self {
            publish_qos: Qos::AtLeastOnce,
            subscribe_qos: Qos::AtLeastOnce,
            clean_session: false,
            keep_alive: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            proxy: None,
            will: None,
            auth_chain: None,
            model_id: None,
            twin_response_timeout: Duration::from_secs(60),
            product_info: "iothub-device-transport".to_string(),
        }
    }
}

impl MqttTransportSettings {
    pub fn builder() -> MqttTransportSettingsBuilder {
        MqttTransportSettingsBuilder::default()
    }
}

/// Fluent builder for [`MqttTransportSettings`], following the same
/// `with_*` chaining idiom as [`crate::credentials::CredentialsBuilder`].
#[derive(Default)]
pub struct MqttTransportSettingsBuilder {
    settings: MqttTransportSettings,
}

impl MqttTransportSettingsBuilder {
    pub fn with_publish_qos(mut self, qos: Qos) -> Self {
        self.settings.publish_qos = qos;
        self
    }

    pub fn with_subscribe_qos(mut self, qos: Qos) -> Self {
        self.settings.subscribe_qos = qos;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.settings.clean_session = clean_session;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.settings.keep_alive = keep_alive;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.settings.idle_timeout = idle_timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.settings.proxy = Some(proxy);
        self
    }

    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.settings.will = Some(will);
        self
    }

    pub fn with_auth_chain(mut self, auth_chain: impl Into<String>) -> Self {
        self.settings.auth_chain = Some(auth_chain.into());
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.settings.model_id = Some(model_id.into());
        self
    }

    pub fn with_twin_response_timeout(mut self, timeout: Duration) -> Self {
        self.settings.twin_response_timeout = timeout;
        self
    }

    pub fn with_product_info(mut self, product_info: impl Into<String>) -> Self {
        self.settings.product_info = product_info.into();
        self
    }

    pub fn build(self) -> MqttTransportSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_sane() {
        let settings = MqttTransportSettings::default();
        assert!(!settings.clean_session);
        assert_eq!(settings.publish_qos, Qos::AtLeastOnce);
    }

    #[test]
    fn non_mqtt_variant_rejected_with_clear_error() {
        let err = TransportSettings::AmqpTcp.as_mqtt();
        assert!(err.is_err());
    }

    #[test]
    fn builder_overrides_apply() {
        let settings = MqttTransportSettings::builder()
            .with_clean_session(true)
            .with_model_id("dtmi:example:1")
            .build();
        assert!(settings.clean_session);
        assert_eq!(settings.model_id.as_deref(), Some("dtmi:example:1"));
    }
}
