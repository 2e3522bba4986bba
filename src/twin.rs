use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One side (`desired` or `reported`) of a twin document: an arbitrary
/// JSON object tree with a reserved `$version` number at the root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinSection {
    #[serde(rename = "$version")]
    pub version: i64,
    #[serde(flatten)]
    pub properties: serde_json::Map<String, Value>,
}

/// The full twin document returned by a successful `GetTwin`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinProperties {
    pub desired: TwinSection,
    pub reported: TwinSection,
}

/// Partial update the caller wants merged into the `reported` section.
/// Represented as a raw JSON object since reported properties have no
/// fixed shape.
pub type ReportedPropertiesPatch = serde_json::Map<String, Value>;

/// Error body the service attaches to a non-success twin response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinErrorBody {
    #[serde(rename = "ErrorCode", default)]
    pub error_code: i64,
    #[serde(rename = "TrackingId", default)]
    pub tracking_id: String,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Info", default)]
    pub info: std::collections::HashMap<String, String>,
    #[serde(rename = "TimestampUtc", default)]
    pub timestamp_utc: String,
}

/// Outcome of a twin response, before it's matched against the pending
/// operation that is awaiting it.
#[derive(Debug, Clone)]
pub enum TwinResponseOutcome {
    GetTwinOk(TwinProperties),
    GetTwinErr { status: u32, error: TwinErrorBody },
    PatchOk { version: i64 },
    PatchErr { status: u32, error: TwinErrorBody },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twin_document_roundtrips_through_json() {
        let body = r#"{"desired":{"x":1,"$version":3},"reported":{"$version":5}}"#;
        let twin: TwinProperties = serde_json::from_str(body).unwrap();
        assert_eq!(twin.desired.version, 3);
        assert_eq!(twin.desired.properties.get("x").unwrap(), 1);
        assert_eq!(twin.reported.version, 5);
    }

    #[test]
    fn error_body_defaults_missing_fields() {
        let err: TwinErrorBody = serde_json::from_str("{}").unwrap();
        assert_eq!(err.error_code, 0);
        assert_eq!(err.message, "");
    }
}
