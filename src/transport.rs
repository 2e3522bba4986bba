//! The MQTT transport handler: open/close lifecycle, subscription
//! management, send/request-response operations, and inbound dispatch.
//! Grounded on the teacher's `IotHubConnection`/`ConnectionImplementation`
//! (`iothub/mod.rs`) for the open/close/Drop lifecycle shape, on
//! `handlers/twins.rs` for the get/patch request-response plumbing, and
//! on `handlers/c2d.rs`'s ack-after-listener-resolves pattern for the
//! device-bound-message path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::correlation::{CorrelationRegistry, PendingKind, PendingOperation};
use crate::credentials::{Authentication, ConnectionCredentials};
use crate::error::{ErrorKind, SdkError};
use crate::eventloop::{EventLoopDriver, LoopEvent};
use crate::message::{IncomingMessage, Message};
use crate::method::{MethodRequest, MethodResponse};
use crate::mqtt_adapter::{build_connect_options, map_connect_error, MqttClientAdapter, RumqttcAdapter};
use crate::settings::MqttTransportSettings;
use crate::status::{ChangeReason, ConnectionStatus, ConnectionStatusBus, StatusChange};
use crate::token::{TokenRefresher, TokenRefresherCommand};
use crate::topics;
use crate::twin::{ReportedPropertiesPatch, TwinErrorBody, TwinProperties, TwinResponseOutcome};

/// Receives telemetry and device-bound message deliveries.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Invoked once per inbound device-bound/module-input message; the
    /// message is only acknowledged to the broker after this resolves.
    async fn on_message(&self, message: IncomingMessage) -> Result<(), SdkError>;
}

/// Receives direct method invocations. Delivery does not wait for the
/// listener: the method-response topic is how the device replies.
#[async_trait]
pub trait MethodListener: Send + Sync {
    async fn on_method(&self, request: MethodRequest);
}

/// Receives desired-property patches, delivered synchronously (no
/// acknowledgement semantics apply to this topic family).
pub trait DesiredPropertyListener: Send + Sync {
    fn on_desired_properties(&self, properties: serde_json::Map<String, Value>);
}

struct OpenState {
    adapter: Arc<dyn MqttClientAdapter>,
    cancel: CancellationToken,
    subscribed_twin_responses: AtomicBool,
    refresher_commands: Option<tokio::sync::mpsc::Sender<TokenRefresherCommand>>,
}

/// Public entry point implementing the specification's MQTT transport.
/// Created once per logical connection; `open` may be called at most
/// once, after which the handler is either Open or terminally Closed.
pub struct MqttTransportHandler {
    credentials: Arc<ConnectionCredentials>,
    settings: MqttTransportSettings,
    correlation: Arc<CorrelationRegistry>,
    status_bus: Arc<ConnectionStatusBus>,
    message_listener: RwLock<Option<Arc<dyn MessageListener>>>,
    method_listener: RwLock<Option<Arc<dyn MethodListener>>>,
    desired_listener: RwLock<Option<Arc<dyn DesiredPropertyListener>>>,
    state: Mutex<Option<OpenState>>,
}

impl MqttTransportHandler {
    pub fn new(credentials: Arc<ConnectionCredentials>, settings: MqttTransportSettings) -> Arc<Self> {
        Arc::new(Self {
            credentials,
            settings,
            correlation: Arc::new(CorrelationRegistry::new()),
            status_bus: Arc::new(ConnectionStatusBus::new()),
            message_listener: RwLock::new(None),
            method_listener: RwLock::new(None),
            desired_listener: RwLock::new(None),
            state: Mutex::new(None),
        })
    }

    pub fn subscribe_connection_status(&self) -> watch::Receiver<StatusChange> {
        self.status_bus.subscribe()
    }

    pub async fn set_message_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.message_listener.write().await = Some(listener);
    }

    pub async fn set_method_listener(&self, listener: Arc<dyn MethodListener>) {
        *self.method_listener.write().await = Some(listener);
    }

    pub async fn set_desired_property_listener(&self, listener: Arc<dyn DesiredPropertyListener>) {
        *self.desired_listener.write().await = Some(listener);
    }

    /// Opens the underlying MQTT connection. Idempotent-once: a second
    /// call while already open returns an error rather than silently
    /// reconnecting.
    pub async fn open(self: &Arc<Self>) -> Result<(), SdkError> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Err(SdkError::new(ErrorKind::Unknown, "transport already open"));
        }

        let cancel = CancellationToken::new();

        let (password, refresher_commands) = match self.credentials.authentication() {
            Authentication::SharedKey(signer) => {
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                let refresher = TokenRefresher::new(
                    signer.clone(),
                    self.credentials.resource_uri(),
                    Duration::from_secs(3600),
                );
                let mut tokens = refresher.subscribe();
                let refresher_cancel = cancel.clone();
                tokio::spawn(async move { refresher.run(rx, refresher_cancel).await });
                tokens
                    .changed()
                    .await
                    .map_err(|_| SdkError::new(ErrorKind::Unknown, "token refresher stopped before issuing a token"))?;
                let token = tokens.borrow().clone();
                (token, Some(tx))
            }
            Authentication::PrecomputedSasToken(token) => (Some(token.clone()), None),
            Authentication::Certificate { .. } => (None, None),
        };

        let options = build_connect_options(&self.credentials, &self.settings, password.as_deref())
            .map_err(|e| SdkError::new(ErrorKind::Unknown, e.to_string()).with_source(e))?;
        let (client, event_loop) = AsyncClient::new(options, 16);
        let adapter: Arc<dyn MqttClientAdapter> = Arc::new(RumqttcAdapter::new(client));

        let driver = EventLoopDriver::new(event_loop, cancel.clone());
        self.spawn_poll_loop(driver);
        self.spawn_sweeper(cancel.clone());

        self.status_bus
            .publish(ConnectionStatus::Connected, ChangeReason::ClientOpen);

        *guard = Some(OpenState {
            adapter,
            cancel,
            subscribed_twin_responses: AtomicBool::new(false),
            refresher_commands,
        });
        Ok(())
    }

    fn spawn_poll_loop(self: &Arc<Self>, mut driver: EventLoopDriver) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = driver.next().await {
                handler.handle_loop_event(event).await;
            }
        });
    }

    fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let handler = Arc::clone(self);
        let period = handler.settings.twin_response_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let swept = handler.correlation.sweep(period, || {
                            SdkError::new(
                                ErrorKind::NetworkErrors,
                                "Did not receive twin response from service.",
                            )
                        });
                        if swept > 0 {
                            log::warn!("swept {swept} expired twin request(s)");
                        }
                    }
                }
            }
        });
    }

    async fn handle_loop_event(self: &Arc<Self>, event: LoopEvent) {
        match event {
            LoopEvent::Publish(publish) => self.dispatch_inbound(publish).await,
            LoopEvent::Disconnected(reason) => {
                log::warn!("mqtt connection dropped: {reason}");
                self.status_bus
                    .publish(ConnectionStatus::DisconnectedRetrying, ChangeReason::CommunicationError);
                self.correlation.sweep(Duration::ZERO, || {
                    SdkError::new(ErrorKind::NetworkErrors, "connection dropped while request was pending")
                });
                if let Some(state) = self.state.lock().await.as_ref() {
                    state.subscribed_twin_responses.store(false, Ordering::SeqCst);
                }
            }
            LoopEvent::Disconnecting | LoopEvent::PubAck(_) | LoopEvent::SubAck | LoopEvent::UnsubAck => {}
        }
    }

    async fn dispatch_inbound(self: &Arc<Self>, publish: crate::mqtt_adapter::InboundPublish) {
        let topic = publish.topic.clone();

        if topic.starts_with(&topics::cloud_to_device_topic(self.credentials.device_id())) {
            self.handle_device_bound(publish).await;
            return;
        }
        if topic.starts_with(topics::TWIN_PATCH_DESIRED_PREFIX) {
            self.handle_desired_properties(&publish).await;
            self.ack(publish.pkid).await;
            return;
        }
        if topic.starts_with(topics::TWIN_RESPONSE_PREFIX) {
            self.handle_twin_response(&topic, &publish.payload).await;
            self.ack(publish.pkid).await;
            return;
        }
        if topic.starts_with(topics::METHOD_REQUEST_PREFIX) {
            self.handle_method_request(&topic, &publish.payload).await;
            self.ack(publish.pkid).await;
            return;
        }
        if let Some(module_id) = self.credentials.module_id() {
            if topic.starts_with(&topics::module_input_topic(self.credentials.device_id(), module_id))
                || topic.starts_with(&topics::module_event_topic(self.credentials.device_id(), module_id))
            {
                self.handle_module_message(&topic, publish.clone()).await;
                self.ack(publish.pkid).await;
                return;
            }
        }
        log::warn!("discarding message on unrecognised topic: {topic}");
        self.ack(publish.pkid).await;
    }

    async fn ack(self: &Arc<Self>, pkid: u16) {
        if let Some(state) = self.state.lock().await.as_ref() {
            if let Err(err) = state.adapter.ack(pkid, self.settings.subscribe_qos.to_rumqttc()).await {
                log::warn!("failed to ack pkid {pkid}: {err}");
            }
        }
    }

    async fn handle_device_bound(self: &Arc<Self>, publish: crate::mqtt_adapter::InboundPublish) {
        let message = decode_incoming(&publish.topic, publish.payload.clone());
        let listener = self.message_listener.read().await.clone();
        match listener {
            Some(listener) => match listener.on_message(message).await {
                Ok(()) => self.ack(publish.pkid).await,
                Err(err) => {
                    log::warn!("message listener returned an error, acknowledging anyway (MQTT has no reject): {err}");
                    self.ack(publish.pkid).await;
                }
            },
            None => {
                log::warn!("no message listener registered, acknowledging and discarding");
                self.ack(publish.pkid).await;
            }
        }
    }

    async fn handle_desired_properties(self: &Arc<Self>, publish: &crate::mqtt_adapter::InboundPublish) {
        let listener = self.desired_listener.read().await.clone();
        let Some(listener) = listener else {
            return;
        };
        match serde_json::from_slice::<serde_json::Map<String, Value>>(&publish.payload) {
            Ok(properties) => listener.on_desired_properties(properties),
            Err(err) => log::warn!("failed to decode desired-properties patch: {err}"),
        }
    }

    async fn handle_twin_response(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let Some(parsed) = topics::parse_twin_response_topic(topic) else {
            log::warn!("unparseable twin response topic: {topic}");
            return;
        };
        self.correlation.complete_with(&parsed.request_id, |kind| {
            classify_twin_response(kind, parsed.status, parsed.version, payload)
        });
    }

    async fn handle_method_request(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let Some((method_name, request_id)) = topics::parse_method_request_topic(topic) else {
            log::warn!("unparseable method request topic: {topic}");
            return;
        };
        let listener = self.method_listener.read().await.clone();
        let Some(listener) = listener else {
            log::warn!("no method listener registered for {method_name}");
            return;
        };
        let request = MethodRequest {
            method_name,
            request_id,
            payload: payload.to_vec(),
        };
        listener.on_method(request).await;
    }

    async fn handle_module_message(self: &Arc<Self>, topic: &str, publish: crate::mqtt_adapter::InboundPublish) {
        let segments: Vec<&str> = topic.split('/').collect();
        let mut message = decode_incoming(topic, publish.payload);
        if segments.len() >= 6 {
            message.system_properties.input_name = Some(segments[5].to_string());
        }
        let listener = self.message_listener.read().await.clone();
        if let Some(listener) = listener {
            let _ = listener.on_message(message).await;
        }
    }

    async fn with_adapter<F, Fut, T>(&self, f: F) -> Result<T, SdkError>
    where
        F: FnOnce(Arc<dyn MqttClientAdapter>) -> Fut,
        Fut: std::future::Future<Output = Result<T, SdkError>>,
    {
        let adapter = {
            let guard = self.state.lock().await;
            guard
                .as_ref()
                .map(|s| Arc::clone(&s.adapter))
                .ok_or_else(|| SdkError::new(ErrorKind::Unknown, "transport is not open"))?
        };
        f(adapter).await
    }

    pub async fn send_telemetry(&self, message: Message) -> Result<(), SdkError> {
        let base = topics::publish_topic(self.credentials.device_id(), self.credentials.module_id());
        let topic = topics::topic_with_properties(&base, &message);
        let qos = self.settings.publish_qos.to_rumqttc();
        let payload = message.payload;
        self.with_adapter(|adapter| async move { adapter.publish(&topic, payload, qos).await })
            .await
    }

    pub async fn enable_receive_message(&self) -> Result<(), SdkError> {
        let base = topics::cloud_to_device_topic(self.credentials.device_id());
        self.subscribe(&topics::subscription_topic(&base)).await
    }

    pub async fn disable_receive_message(&self) -> Result<(), SdkError> {
        let base = topics::cloud_to_device_topic(self.credentials.device_id());
        self.unsubscribe(&topics::subscription_topic(&base)).await
    }

    pub async fn enable_methods(&self) -> Result<(), SdkError> {
        self.subscribe(&topics::subscription_topic(topics::METHOD_REQUEST_PREFIX)).await
    }

    pub async fn disable_methods(&self) -> Result<(), SdkError> {
        self.unsubscribe(&topics::subscription_topic(topics::METHOD_REQUEST_PREFIX)).await
    }

    pub async fn enable_twin_patch(&self) -> Result<(), SdkError> {
        self.subscribe(&topics::subscription_topic(topics::TWIN_PATCH_DESIRED_PREFIX)).await
    }

    pub async fn disable_twin_patch(&self) -> Result<(), SdkError> {
        self.unsubscribe(&topics::subscription_topic(topics::TWIN_PATCH_DESIRED_PREFIX)).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SdkError> {
        let qos = self.settings.subscribe_qos.to_rumqttc();
        let owned = topic.to_string();
        self.with_adapter(|adapter| async move { adapter.subscribe(&owned, qos).await }).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), SdkError> {
        let owned = topic.to_string();
        self.with_adapter(|adapter| async move { adapter.unsubscribe(&owned).await }).await
    }

    async fn ensure_subscribed_to_twin_responses(&self) -> Result<(), SdkError> {
        let already = {
            let guard = self.state.lock().await;
            guard
                .as_ref()
                .map(|s| s.subscribed_twin_responses.load(Ordering::SeqCst))
                .unwrap_or(false)
        };
        if already {
            return Ok(());
        }
        self.subscribe(&topics::subscription_topic(topics::TWIN_RESPONSE_PREFIX)).await?;
        if let Some(state) = self.state.lock().await.as_ref() {
            state.subscribed_twin_responses.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn get_twin(&self) -> Result<TwinProperties, SdkError> {
        self.ensure_subscribed_to_twin_responses().await?;
        let (tx, rx) = oneshot::channel();
        let rid = self.correlation.register(PendingOperation::GetTwin(tx));
        let topic = topics::twin_get_topic(&rid);
        let qos = self.settings.publish_qos.to_rumqttc();
        let send_result = self
            .with_adapter(|adapter| async move { adapter.publish(&topic, Vec::new(), qos).await })
            .await;
        if let Err(err) = send_result {
            self.correlation.cancel(&rid);
            return Err(err);
        }
        match rx.await {
            Ok(Ok(TwinResponseOutcome::GetTwinOk(twin))) => Ok(twin),
            Ok(Ok(TwinResponseOutcome::GetTwinErr { status, error })) => {
                Err(twin_error(status, error))
            }
            Ok(Ok(_)) => Err(SdkError::new(ErrorKind::Unknown, "unexpected twin response variant")),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SdkError::new(ErrorKind::NetworkErrors, "twin request was cancelled or the connection was lost")),
        }
    }

    pub async fn update_reported_properties(&self, patch: ReportedPropertiesPatch) -> Result<i64, SdkError> {
        self.ensure_subscribed_to_twin_responses().await?;
        let (tx, rx) = oneshot::channel();
        let rid = self.correlation.register(PendingOperation::PatchReportedProperties(tx));
        let topic = topics::twin_patch_reported_topic(&rid);
        let payload = serde_json::to_vec(&patch)
            .map_err(|e| SdkError::new(ErrorKind::Unknown, e.to_string()))?;
        let qos = self.settings.publish_qos.to_rumqttc();
        let send_result = self
            .with_adapter(|adapter| async move { adapter.publish(&topic, payload, qos).await })
            .await;
        if let Err(err) = send_result {
            self.correlation.cancel(&rid);
            return Err(err);
        }
        match rx.await {
            Ok(Ok(TwinResponseOutcome::PatchOk { version })) => Ok(version),
            Ok(Ok(TwinResponseOutcome::PatchErr { status, error })) => Err(twin_error(status, error)),
            Ok(Ok(_)) => Err(SdkError::new(ErrorKind::Unknown, "unexpected twin response variant")),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SdkError::new(ErrorKind::NetworkErrors, "patch request was cancelled or the connection was lost")),
        }
    }

    pub async fn send_method_response(&self, response: MethodResponse) -> Result<(), SdkError> {
        let topic = topics::method_response_topic(response.status, &response.request_id);
        let qos = self.settings.publish_qos.to_rumqttc();
        let payload = response.payload;
        self.with_adapter(|adapter| async move { adapter.publish(&topic, payload, qos).await }).await
    }

    /// Closes the transport. Best-effort: a failure while disconnecting
    /// is logged and swallowed, matching the specification's close
    /// contract.
    pub async fn close(&self) -> Result<(), SdkError> {
        let state = self.state.lock().await.take();
        let Some(state) = state else {
            return Ok(());
        };
        state.cancel.cancel();
        if let Some(commands) = &state.refresher_commands {
            drop(commands);
        }
        if let Err(err) = state.adapter.disconnect().await {
            log::warn!("error while disconnecting, releasing local resources anyway: {err}");
        }
        self.correlation.sweep(Duration::ZERO, || {
            SdkError::new(ErrorKind::NetworkErrors, "transport closed while request was pending")
        });
        self.status_bus.publish(ConnectionStatus::Closed, ChangeReason::ClientClose);
        Ok(())
    }
}

fn decode_incoming(topic: &str, payload: Vec<u8>) -> IncomingMessage {
    let mut message = Message::new(payload);
    if let Some(index) = topics::property_segment_index(topic) {
        if let Some(segment) = topic.split('/').nth(index) {
            if let Ok((system, user)) = topics::decode_properties(segment) {
                message.system_properties = system;
                message.user_properties = user;
            }
        }
    }
    message
}

fn classify_twin_response(
    kind: PendingKind,
    status: u32,
    version: Option<i64>,
    payload: &[u8],
) -> Result<TwinResponseOutcome, SdkError> {
    if status == 200 {
        return match serde_json::from_slice::<TwinProperties>(payload) {
            Ok(twin) => Ok(TwinResponseOutcome::GetTwinOk(twin)),
            Err(err) => Err(SdkError::new(ErrorKind::Unknown, format!("failed to decode twin document: {err}"))),
        };
    }
    if status == 204 {
        return Ok(TwinResponseOutcome::PatchOk {
            version: version.unwrap_or_default(),
        });
    }
    let error = serde_json::from_slice::<TwinErrorBody>(payload).unwrap_or_default();
    match kind {
        PendingKind::PatchReportedProperties => Ok(TwinResponseOutcome::PatchErr { status, error }),
        PendingKind::GetTwin => Ok(TwinResponseOutcome::GetTwinErr { status, error }),
    }
}

fn twin_error(status: u32, error: TwinErrorBody) -> SdkError {
    let kind = if error.error_code != 0 {
        SdkError::kind_from_status(error.error_code as u32)
    } else {
        SdkError::kind_from_status(status)
    };
    let mut sdk_error = SdkError::new(kind, error.message);
    if !error.tracking_id.is_empty() {
        sdk_error = sdk_error.with_tracking_id(error.tracking_id);
    }
    sdk_error
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_twin_response_200_decodes_document() {
        let body = br#"{"desired":{"$version":1},"reported":{"$version":2}}"#;
        let outcome = classify_twin_response(PendingKind::GetTwin, 200, None, body).unwrap();
        assert!(matches!(outcome, TwinResponseOutcome::GetTwinOk(_)));
    }

    #[test]
    fn classify_twin_response_204_returns_version() {
        let outcome =
            classify_twin_response(PendingKind::PatchReportedProperties, 204, Some(7), b"").unwrap();
        match outcome {
            TwinResponseOutcome::PatchOk { version } => assert_eq!(version, 7),
            _ => panic!("expected PatchOk"),
        }
    }

    #[test]
    fn classify_twin_response_get_error_is_keyed_on_pending_kind() {
        let body = br#"{"ErrorCode":404001,"Message":"not found"}"#;
        let outcome = classify_twin_response(PendingKind::GetTwin, 404, None, body).unwrap();
        match outcome {
            TwinResponseOutcome::GetTwinErr { status, error } => {
                assert_eq!(status, 404);
                assert_eq!(error.message, "not found");
            }
            _ => panic!("expected GetTwinErr"),
        }
    }

    #[test]
    fn classify_twin_response_patch_error_without_version_is_patch_error() {
        // A failed update_reported_properties carries a non-204 status and a
        // JSON error body with no $version, so this must not be inferred as
        // a get-twin error from the wire shape alone.
        let body = br#"{"ErrorCode":400000,"Message":"bad request"}"#;
        let outcome =
            classify_twin_response(PendingKind::PatchReportedProperties, 400, None, body).unwrap();
        match outcome {
            TwinResponseOutcome::PatchErr { status, error } => {
                assert_eq!(status, 400);
                assert_eq!(error.message, "bad request");
            }
            _ => panic!("expected PatchErr"),
        }
    }

    #[test]
    fn decode_incoming_extracts_device_bound_properties() {
        let topic = "devices/dev-1/messages/devicebound/%24.mid=m1&k=v";
        let message = decode_incoming(topic, b"payload".to_vec());
        assert_eq!(message.system_properties.message_id.as_deref(), Some("m1"));
        assert_eq!(message.user_properties.get("k").map(String::as_str), Some("v"));
        assert_eq!(message.payload, b"payload");
    }

    #[derive(Default, Clone)]
    struct FakeAdapter {
        published: Arc<std::sync::Mutex<Vec<(String, Vec<u8>)>>>,
        subscribed: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MqttClientAdapter for FakeAdapter {
        async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: rumqttc::QoS) -> Result<(), SdkError> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        async fn subscribe(&self, topic: &str, _qos: rumqttc::QoS) -> Result<(), SdkError> {
            self.subscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<(), SdkError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), SdkError> {
            Ok(())
        }

        async fn ack(&self, _pkid: u16, _qos: rumqttc::QoS) -> Result<(), SdkError> {
            Ok(())
        }
    }

    fn test_handler(device_id: &str) -> Arc<MqttTransportHandler> {
        let creds = ConnectionCredentials::builder("hub.example.net", device_id)
            .with_shared_key("a2V5")
            .build()
            .unwrap();
        MqttTransportHandler::new(creds, MqttTransportSettings::default())
    }

    async fn install_adapter(handler: &Arc<MqttTransportHandler>, adapter: FakeAdapter, subscribed_twin_responses: bool) {
        let mut guard = handler.state.lock().await;
        *guard = Some(OpenState {
            adapter: Arc::new(adapter),
            cancel: CancellationToken::new(),
            subscribed_twin_responses: AtomicBool::new(subscribed_twin_responses),
            refresher_commands: None,
        });
    }

    async fn wait_for_publish(fake: &FakeAdapter) -> String {
        for _ in 0..1000 {
            if let Some((topic, _)) = fake.published.lock().unwrap().last().cloned() {
                return topic;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected a publish within the poll budget");
    }

    // Scenario 1 (spec §8): open -> send one telemetry message -> expect a
    // single publish to the device-events topic with the message-id and
    // user property encoded in the topic string.
    #[tokio::test]
    async fn send_telemetry_publishes_expected_topic() {
        let _ = env_logger::builder().is_test(true).try_init();
        let handler = test_handler("dev-1");
        let fake = FakeAdapter::default();
        install_adapter(&handler, fake.clone(), false).await;

        let msg = Message::new(b"hello".to_vec())
            .with_message_id("m1")
            .with_user_property("k", "v");
        handler.send_telemetry(msg).await.unwrap();

        let published = fake.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "devices/dev-1/messages/events/$.mid=m1&k=v/");
        assert_eq!(published[0].1, b"hello");
    }

    // Scenario 2 (spec §8): get-twin completes once the service's response
    // is dispatched back through the handler's inbound classification.
    #[tokio::test]
    async fn get_twin_completes_from_dispatched_response() {
        let handler = test_handler("dev-1");
        let fake = FakeAdapter::default();
        install_adapter(&handler, fake.clone(), false).await;

        let awaiting = Arc::clone(&handler);
        let get = tokio::spawn(async move { awaiting.get_twin().await });

        let topic = wait_for_publish(&fake).await;
        let rid = topic.strip_prefix("$iothub/twin/GET/?$rid=").unwrap().to_string();
        assert!(fake.subscribed.lock().unwrap().iter().any(|t| t == "$iothub/twin/res/#"));

        let response_topic = format!("$iothub/twin/res/200/?$rid={rid}");
        let body = br#"{"desired":{"x":1,"$version":3},"reported":{"$version":5}}"#;
        handler.handle_twin_response(&response_topic, body).await;

        let twin = get.await.unwrap().unwrap();
        assert_eq!(twin.desired.version, 3);
        assert_eq!(twin.desired.properties.get("x").unwrap(), 1);
        assert_eq!(twin.reported.version, 5);
        assert!(handler.correlation.is_empty());
    }

    // Scenario 3 (spec §8): update-reported-properties returns the
    // server-assigned version carried in the 204 response's query string.
    #[tokio::test]
    async fn update_reported_properties_returns_server_version() {
        let handler = test_handler("dev-1");
        let fake = FakeAdapter::default();
        install_adapter(&handler, fake.clone(), false).await;

        let awaiting = Arc::clone(&handler);
        let update = tokio::spawn(async move {
            let mut patch = serde_json::Map::new();
            patch.insert("a".to_string(), serde_json::json!("b"));
            awaiting.update_reported_properties(patch).await
        });

        let topic = wait_for_publish(&fake).await;
        let rid = topic
            .strip_prefix("$iothub/twin/PATCH/properties/reported/?$rid=")
            .unwrap()
            .to_string();

        let response_topic = format!("$iothub/twin/res/204/?$rid={rid}&$version=7");
        handler.handle_twin_response(&response_topic, b"").await;

        let version = update.await.unwrap().unwrap();
        assert_eq!(version, 7);
    }

    #[tokio::test]
    async fn send_method_response_publishes_to_expected_topic() {
        let handler = test_handler("dev-1");
        let fake = FakeAdapter::default();
        install_adapter(&handler, fake.clone(), false).await;

        let response = MethodResponse::new("r-9", 200, b"{}".to_vec());
        handler.send_method_response(response).await.unwrap();

        let published = fake.published.lock().unwrap();
        assert_eq!(published[0].0, "$iothub/methods/res/200/?$rid=r-9");
    }

    // Scenario 5 (spec §8): a perceived disconnect fails every pending
    // twin operation immediately so the caller can retry after reconnect.
    #[tokio::test]
    async fn disconnect_fails_pending_twin_operations_immediately() {
        let handler = test_handler("dev-1");
        let fake = FakeAdapter::default();
        install_adapter(&handler, fake.clone(), false).await;

        let awaiting = Arc::clone(&handler);
        let get = tokio::spawn(async move { awaiting.get_twin().await });
        wait_for_publish(&fake).await;

        handler
            .handle_loop_event(LoopEvent::Disconnected("broker closed the connection".to_string()))
            .await;

        let result = get.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::NetworkErrors);
    }

    // Spec §8: "on next Open the subscription flag is reset and
    // re-subscription is required".
    #[tokio::test]
    async fn disconnect_resets_twin_subscription_flag() {
        let handler = test_handler("dev-1");
        let fake = FakeAdapter::default();
        install_adapter(&handler, fake, true).await;

        handler
            .handle_loop_event(LoopEvent::Disconnected("broker closed the connection".to_string()))
            .await;

        let guard = handler.state.lock().await;
        assert!(!guard
            .as_ref()
            .unwrap()
            .subscribed_twin_responses
            .load(Ordering::SeqCst));
    }
}
