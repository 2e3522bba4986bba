//! MQTT topic templates and the key=value property segment used by the
//! device twin, direct method, telemetry and cloud-to-device topic
//! families.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::message::{Message, SystemProperties};

pub const TWIN_GET_PREFIX: &str = "$iothub/twin/GET/";
pub const TWIN_PATCH_REPORTED_PREFIX: &str = "$iothub/twin/PATCH/properties/reported/";
pub const TWIN_PATCH_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
pub const METHOD_REQUEST_PREFIX: &str = "$iothub/methods/POST/";
pub const METHOD_RESPONSE_PREFIX: &str = "$iothub/methods/res/";

const WILDCARD_SUFFIX: &str = "#";

/// Appends the multi-level wildcard marker to a topic prefix, for
/// subscriptions. Idempotent: calling it twice does not double the
/// suffix.
pub fn subscription_topic(prefix: &str) -> String {
    if prefix.ends_with(WILDCARD_SUFFIX) {
        return prefix.to_string();
    }
    let mut topic = prefix.to_string();
    if !topic.ends_with('/') {
        topic.push('/');
    }
    topic.push_str(WILDCARD_SUFFIX);
    topic
}

/// `devices/{deviceId}/messages/events/` or, for a module identity,
/// `devices/{deviceId}/modules/{moduleId}/messages/events/`.
pub fn publish_topic(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!(
            "devices/{device_id}/modules/{module_id}/messages/events/"
        ),
        None => format!("devices/{device_id}/messages/events/"),
    }
}

/// `devices/{deviceId}/messages/devicebound/`
pub fn cloud_to_device_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/")
}

/// `devices/{deviceId}/modules/{moduleId}/inputs/`
pub fn module_input_topic(device_id: &str, module_id: &str) -> String {
    format!("devices/{device_id}/modules/{module_id}/inputs/")
}

/// `devices/{deviceId}/modules/{moduleId}/`
pub fn module_event_topic(device_id: &str, module_id: &str) -> String {
    format!("devices/{device_id}/modules/{module_id}/")
}

/// `$iothub/twin/GET/?$rid={rid}`
pub fn twin_get_topic(rid: &str) -> String {
    format!("{TWIN_GET_PREFIX}?$rid={rid}")
}

/// `$iothub/twin/PATCH/properties/reported/?$rid={rid}`
pub fn twin_patch_reported_topic(rid: &str) -> String {
    format!("{TWIN_PATCH_REPORTED_PREFIX}?$rid={rid}")
}

/// `$iothub/methods/res/{status}/?$rid={rid}`
pub fn method_response_topic(status: u32, rid: &str) -> String {
    format!("{METHOD_RESPONSE_PREFIX}{status}/?$rid={rid}")
}

/// Wire names the service recognises for each system property. Mirrors
/// the teacher's property-remapping table in `iothub/topics.rs`.
fn system_key(name: &str) -> &'static str {
    match name {
        "content_type" => "$.ct",
        "content_encoding" => "$.ce",
        "message_id" => "$.mid",
        "correlation_id" => "$.cid",
        "user_id" => "$.uid",
        "expiry" => "$.exp",
        "creation_time" => "iothub-creation-time-utc",
        "to" => "$.to",
        "output_name" => "$.on",
        "input_name" => "$.on",
        "interface_id" => "$.ifid",
        "diagnostic_id" => "$.diagid",
        "diagnostic_correlation_context" => "$.diagctx",
        other => other,
    }
}

/// Merges system and user properties into a single map keyed by their
/// wire names, system first so a colliding user key wins (matches the
/// teacher's last-write-wins merge order).
fn merged_properties(message: &Message) -> Vec<(String, String)> {
    let sp = &message.system_properties;
    let mut pairs = Vec::new();
    if let Some(v) = &sp.content_type {
        pairs.push((system_key("content_type").to_string(), v.clone()));
    }
    if let Some(v) = &sp.content_encoding {
        pairs.push((system_key("content_encoding").to_string(), v.clone()));
    }
    if let Some(v) = &sp.message_id {
        pairs.push((system_key("message_id").to_string(), v.clone()));
    }
    if let Some(v) = &sp.correlation_id {
        pairs.push((system_key("correlation_id").to_string(), v.clone()));
    }
    if let Some(v) = &sp.user_id {
        pairs.push((system_key("user_id").to_string(), v.clone()));
    }
    if let Some(v) = &sp.expiry {
        pairs.push((
            system_key("expiry").to_string(),
            v.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ));
    }
    if let Some(v) = &sp.creation_time {
        pairs.push((
            system_key("creation_time").to_string(),
            v.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ));
    }
    if let Some(v) = &sp.interface_id {
        pairs.push((system_key("interface_id").to_string(), v.clone()));
    }
    if let Some(v) = &sp.to {
        pairs.push((system_key("to").to_string(), v.clone()));
    }
    if let Some(v) = &sp.output_name {
        pairs.push((system_key("output_name").to_string(), v.clone()));
    }
    if let Some(v) = &sp.diagnostic_id {
        pairs.push((system_key("diagnostic_id").to_string(), v.clone()));
    }
    if let Some(v) = &sp.diagnostic_correlation_context {
        pairs.push((
            system_key("diagnostic_correlation_context").to_string(),
            v.clone(),
        ));
    }
    for (k, v) in &message.user_properties {
        pairs.push((k.clone(), v.clone()));
    }
    pairs
}

/// Appends the property segment to a base topic, which must already end
/// with `/`. Keys are emitted verbatim (matching the teacher's
/// `encode_property`); only values are URL-encoded. A trailing `/` is
/// appended to the result if not already present.
pub fn topic_with_properties(base_topic: &str, message: &Message) -> String {
    let pairs = merged_properties(message);
    if pairs.is_empty() {
        return base_topic.to_string();
    }
    let encoded = pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let mut topic = format!("{base_topic}{encoded}");
    if !topic.ends_with('/') {
        topic.push('/');
    }
    topic
}

/// Reverses [`system_key`]: wire name -> system-property slot name, or
/// `None` if the wire name has no dedicated slot (it becomes a user
/// property instead).
fn system_slot(wire_key: &str) -> Option<&'static str> {
    match wire_key {
        "$.ct" => Some("content_type"),
        "$.ce" => Some("content_encoding"),
        "$.mid" => Some("message_id"),
        "$.cid" => Some("correlation_id"),
        "$.uid" => Some("user_id"),
        "$.exp" => Some("expiry"),
        "iothub-creation-time-utc" => Some("creation_time"),
        "$.to" => Some("to"),
        "$.on" => Some("output_name"),
        "$.ifid" => Some("interface_id"),
        "$.diagid" => Some("diagnostic_id"),
        "$.diagctx" => Some("diagnostic_correlation_context"),
        _ => None,
    }
}

/// Parses a `k=v&k=v&...` query-like segment into an ordered map,
/// URL-decoding both keys and values. Grounded directly on the teacher's
/// `iothub/query.rs::parse`.
pub fn parse_query(query: &str) -> anyhow::Result<HashMap<String, Option<String>>> {
    let mut result = HashMap::new();
    if query.is_empty() {
        return Ok(result);
    }
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => {
                let key = urlencoding::decode(k)?.into_owned();
                let value = urlencoding::decode(v)?.into_owned();
                result.insert(key, Some(value));
            }
            None => {
                let key = urlencoding::decode(pair)?.into_owned();
                result.insert(key, None);
            }
        }
    }
    Ok(result)
}

/// Decodes a property segment (as produced on the device-bound /
/// module-input topics) into a populated [`Message`] (payload left
/// empty; caller fills it in).
pub fn decode_properties(query: &str) -> anyhow::Result<(SystemProperties, HashMap<String, String>)> {
    let parsed = parse_query(query)?;
    let mut system = SystemProperties::default();
    let mut user = HashMap::new();
    for (key, value) in parsed {
        let value = value.unwrap_or_default();
        match system_slot(&key) {
            Some("content_type") => system.content_type = Some(value),
            Some("content_encoding") => system.content_encoding = Some(value),
            Some("message_id") => system.message_id = Some(value),
            Some("correlation_id") => system.correlation_id = Some(value),
            Some("user_id") => system.user_id = Some(value),
            Some("expiry") => system.expiry = chrono::DateTime::parse_from_rfc3339(&value)
                .ok()
                .map(|d| d.with_timezone(&chrono::Utc)),
            Some("creation_time") => {
                system.creation_time = chrono::DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|d| d.with_timezone(&chrono::Utc))
            }
            Some("to") => system.to = Some(value),
            Some("output_name") => system.output_name = Some(value),
            Some("interface_id") => system.interface_id = Some(value),
            Some("diagnostic_id") => system.diagnostic_id = Some(value),
            Some("diagnostic_correlation_context") => {
                system.diagnostic_correlation_context = Some(value)
            }
            _ => {
                user.insert(key, value);
            }
        }
    }
    Ok((system, user))
}

/// The property segment on a device-bound topic lives at a fixed path
/// index depending on whether it targets a device (`devices/{d}/messages/devicebound/{props}`,
/// index 4) or a module endpoint (`devices/{d}/modules/{m}/inputs/{input}/{props}`,
/// index 6). Any other segment count is treated as malformed.
pub fn property_segment_index(topic: &str) -> Option<usize> {
    let segments = topic.split('/').count();
    match segments {
        5 => Some(4),
        7 => Some(6),
        _ => None,
    }
}

static TWIN_RESPONSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$iothub/twin/res/(\d+)/\?\$rid=([^&]+)(?:&\$version=(\d+))?$").unwrap()
});

/// Parsed twin response topic: status, request id, and (for a successful
/// reported-properties patch) the server-assigned version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinResponseTopic {
    pub status: u32,
    pub request_id: String,
    pub version: Option<i64>,
}

pub fn parse_twin_response_topic(topic: &str) -> Option<TwinResponseTopic> {
    let caps = TWIN_RESPONSE_RE.captures(topic)?;
    let status = caps.get(1)?.as_str().parse().ok()?;
    let request_id = urlencoding::decode(caps.get(2)?.as_str()).ok()?.into_owned();
    let version = caps.get(3).and_then(|m| m.as_str().parse().ok());
    Some(TwinResponseTopic {
        status,
        request_id,
        version,
    })
}

static METHOD_REQUEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$iothub/methods/POST/([^/]+)/\?\$rid=(.+)$").unwrap());

/// Parsed method-request topic: method name and request id.
pub fn parse_method_request_topic(topic: &str) -> Option<(String, String)> {
    let caps = METHOD_REQUEST_RE.captures(topic)?;
    let method_name = caps.get(1)?.as_str().to_string();
    let request_id = urlencoding::decode(caps.get(2)?.as_str())
        .ok()?
        .into_owned();
    Some((method_name, request_id))
}
