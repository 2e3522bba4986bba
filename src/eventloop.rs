//! Polls the underlying `rumqttc::EventLoop` and turns its events into
//! classified callbacks the transport handler acts on. Grounded directly
//! on the teacher's `iothub/eventloop.rs` (`process_incoming_message`,
//! `process_outgoing_message`, `select!`-against-`CancellationToken`
//! polling loop).

use rumqttc::{Event, EventLoop, Incoming, Outgoing};
use tokio_util::sync::CancellationToken;

use crate::mqtt_adapter::InboundPublish;

/// What the polling loop observed on one iteration, handed back to the
/// transport handler for classification and dispatch.
pub enum LoopEvent {
    Publish(InboundPublish),
    PubAck(u16),
    SubAck,
    UnsubAck,
    /// The broker closed the connection, or a transient I/O error
    /// occurred while polling.
    Disconnected(String),
    /// We asked to disconnect; the loop is winding down cleanly.
    Disconnecting,
}

/// Drives `rumqttc::EventLoop::poll()` until cancelled, translating each
/// `rumqttc::Event` into a [`LoopEvent`] the caller can act on. One
/// `next()` call corresponds to one `select!` iteration in the teacher's
/// original loop.
pub struct EventLoopDriver {
    event_loop: EventLoop,
    cancel: CancellationToken,
}

impl EventLoopDriver {
    pub fn new(event_loop: EventLoop, cancel: CancellationToken) -> Self {
        Self { event_loop, cancel }
    }

    /// Returns `None` once cancelled; the caller should stop polling.
    pub async fn next(&mut self) -> Option<LoopEvent> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::debug!("event loop cancelled");
                    return None;
                }
                polled = self.event_loop.poll() => {
                    match polled {
                        Ok(event) => {
                            if let Some(mapped) = classify(event) {
                                return Some(mapped);
                            }
                            // Event carried no actionable information (e.g. PingReq); keep polling.
                        }
                        Err(err) => {
                            log::warn!("mqtt event loop error: {err}");
                            return Some(LoopEvent::Disconnected(err.to_string()));
                        }
                    }
                }
            }
        }
    }
}

fn classify(event: Event) -> Option<LoopEvent> {
    match event {
        Event::Incoming(Incoming::Publish(publish)) => Some(LoopEvent::Publish(InboundPublish {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            pkid: publish.pkid,
            qos: publish.qos,
        })),
        Event::Incoming(Incoming::PubAck(ack)) => Some(LoopEvent::PubAck(ack.pkid)),
        Event::Incoming(Incoming::SubAck(_)) => Some(LoopEvent::SubAck),
        Event::Incoming(Incoming::UnsubAck(_)) => Some(LoopEvent::UnsubAck),
        Event::Incoming(Incoming::Disconnect) => {
            Some(LoopEvent::Disconnected("broker sent DISCONNECT".to_string()))
        }
        Event::Outgoing(Outgoing::Disconnect) => Some(LoopEvent::Disconnecting),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn classify_publish_carries_topic_and_payload() {
        let publish = rumqttc::Publish {
            dup: false,
            qos: rumqttc::QoS::AtLeastOnce,
            retain: false,
            topic: "devices/d/messages/devicebound/".to_string(),
            pkid: 7,
            payload: Bytes::from_static(b"hello"),
        };
        let event = classify(Event::Incoming(Incoming::Publish(publish)));
        match event {
            Some(LoopEvent::Publish(inbound)) => {
                assert_eq!(inbound.topic, "devices/d/messages/devicebound/");
                assert_eq!(inbound.payload, b"hello");
                assert_eq!(inbound.pkid, 7);
            }
            _ => panic!("expected Publish event"),
        }
    }

    #[test]
    fn classify_ping_is_not_actionable() {
        assert!(classify(Event::Incoming(Incoming::PingResp)).is_none());
    }

    #[test]
    fn classify_outgoing_disconnect_signals_disconnecting() {
        let event = classify(Event::Outgoing(Outgoing::Disconnect));
        assert!(matches!(event, Some(LoopEvent::Disconnecting)));
    }
}
