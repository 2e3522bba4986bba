//! Transport-independent request/response correlator and MQTT transport
//! handler for an IoT device client SDK.
//!
//! This crate covers the device<->service control plane: topic
//! encoding/decoding, a correlation-id registry that turns asynchronous
//! MQTT publishes into awaitable twin operations, a SAS token refresh
//! loop, and the MQTT transport handler tying it all together behind
//! [`MqttTransportHandler`].

mod correlation;
mod credentials;
mod error;
mod eventloop;
mod message;
mod method;
mod mqtt_adapter;
mod retry;
mod settings;
mod status;
mod token;
mod topics;
mod transport;
mod twin;

pub use credentials::{Authentication, ConnectionCredentials, CredentialsBuilder};
pub use error::{ErrorKind, Result, SdkError};
pub use message::{IncomingMessage, Message, SystemProperties, SECURITY_MESSAGE_INTERFACE_ID};
pub use method::{MethodRequest, MethodResponse};
pub use mqtt_adapter::{MqttClientAdapter, RumqttcAdapter};
pub use retry::{ExponentialBackoff, FixedDelay, Incremental, RetryPolicy};
pub use settings::{
    MqttTransportSettings, MqttTransportSettingsBuilder, ProxySettings, Qos, TransportSettings,
    WillMessage,
};
pub use status::{ChangeReason, ConnectionStatus, ConnectionStatusBus, RecommendedAction, StatusChange};
pub use token::{IssuedToken, SharedKeySigner, TokenRefresher, TokenRefresherCommand};
pub use transport::{DesiredPropertyListener, MessageListener, MethodListener, MqttTransportHandler};
pub use twin::{ReportedPropertiesPatch, TwinErrorBody, TwinProperties, TwinResponseOutcome, TwinSection};
