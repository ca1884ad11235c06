use serde::{Deserialize, Serialize};

/// A single ingest event (wire format v1).
///
/// Adapters POST these to kaitd, one JSON object per line. Only `source`
/// and `kind` are required; everything else is optional context the bridge
/// worker uses when folding the event into the Reasoning Bank.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestEvent {
    /// Origin adapter: "gui", "matrix", "cli", "api", ...
    pub source: String,
    /// Event kind: "user_message", "feedback", "correction", ...
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Primary payload text (user input, feedback value, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Source-specific metadata, passed through opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    /// Stamped by kaitd on acceptance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<f64>,
}

impl IngestEvent {
    /// Validate the minimal invariants the ingest endpoint enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("missing source".to_string());
        }
        if self.kind.trim().is_empty() {
            return Err("missing kind".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let ev = IngestEvent {
            source: "matrix".into(),
            kind: "user_message".into(),
            session_id: Some("room:abc".into()),
            trace_id: None,
            body: Some("hello".into()),
            meta: Some(serde_json::json!({"room": "!x:server"})),
            received_at: None,
        };
        let line = serde_json::to_string(&ev).unwrap();
        let back: IngestEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let ev = IngestEvent {
            source: "cli".into(),
            kind: "user_message".into(),
            session_id: None,
            trace_id: None,
            body: None,
            meta: None,
            received_at: None,
        };
        let line = serde_json::to_string(&ev).unwrap();
        assert!(!line.contains("session_id"));
        assert!(!line.contains("meta"));
    }

    #[test]
    fn test_validate() {
        let mut ev = IngestEvent {
            source: "cli".into(),
            kind: "user_message".into(),
            session_id: None,
            trace_id: None,
            body: None,
            meta: None,
            received_at: None,
        };
        assert!(ev.validate().is_ok());
        ev.source = "  ".into();
        assert!(ev.validate().is_err());
        ev.source = "cli".into();
        ev.kind = String::new();
        assert!(ev.validate().is_err());
    }
}
