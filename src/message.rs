use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Well-known system properties recognised by the service. Anything else
/// a caller sets ends up in the free-form `user_properties` map.
#[derive(Debug, Clone, Default)]
pub struct SystemProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub user_id: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
    pub interface_id: Option<String>,
    pub to: Option<String>,
    pub output_name: Option<String>,
    pub input_name: Option<String>,
    pub diagnostic_id: Option<String>,
    pub diagnostic_correlation_context: Option<String>,
}

/// Well-known interface id set on a security telemetry message.
pub const SECURITY_MESSAGE_INTERFACE_ID: &str = "urn:azureiot:Security:SecurityAgent:1";

/// A telemetry or cloud-to-device message: payload bytes plus system and
/// user properties.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub payload: Vec<u8>,
    pub system_properties: SystemProperties,
    pub user_properties: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.system_properties.message_id = Some(message_id.into());
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.insert(key.into(), value.into());
        self
    }

    /// Marks this as a security message by setting the well-known
    /// interface-id system property.
    pub fn as_security_message(mut self) -> Self {
        self.system_properties.interface_id = Some(SECURITY_MESSAGE_INTERFACE_ID.to_string());
        self
    }
}

/// A message delivered to the device from the cloud or from another
/// module's output.
pub type IncomingMessage = Message;
