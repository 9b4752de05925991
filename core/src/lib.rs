//! Shared types for the rpcprobe engine.

pub mod catalog;

use serde::Serialize;
use serde_json::Value;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Identity label before the identity probe has resolved.
pub const IDENTITY_PENDING: &str = "pending";
/// Identity label when the identity probe failed or returned nothing usable.
pub const IDENTITY_UNKNOWN: &str = "unknown";

/// Terminal classification of one probe, plus the not-yet-completed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    ProtocolError,
    TransportError,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        self != Outcome::Pending
    }

    pub fn is_error(self) -> bool {
        matches!(self, Outcome::ProtocolError | Outcome::TransportError)
    }
}

/// Outcome of one (endpoint, method) probe.
///
/// `elapsed_ms` is present exactly when the outcome is terminal and always
/// measures from the start of the first attempt, retries included.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub method: String,
    pub elapsed_ms: Option<f64>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_result: Option<Value>,
}

impl ProbeResult {
    pub fn pending(method: impl Into<String>) -> Self {
        ProbeResult {
            method: method.into(),
            elapsed_ms: None,
            outcome: Outcome::Pending,
            message: None,
            raw_result: None,
        }
    }

    pub fn success(method: impl Into<String>, elapsed_ms: f64, raw_result: Option<Value>) -> Self {
        ProbeResult {
            method: method.into(),
            elapsed_ms: Some(elapsed_ms),
            outcome: Outcome::Success,
            message: None,
            raw_result,
        }
    }

    pub fn protocol_error(method: impl Into<String>, elapsed_ms: f64, message: impl Into<String>) -> Self {
        ProbeResult {
            method: method.into(),
            elapsed_ms: Some(elapsed_ms),
            outcome: Outcome::ProtocolError,
            message: Some(message.into()),
            raw_result: None,
        }
    }

    pub fn transport_error(method: impl Into<String>, elapsed_ms: f64, message: impl Into<String>) -> Self {
        ProbeResult {
            method: method.into(),
            elapsed_ms: Some(elapsed_ms),
            outcome: Outcome::TransportError,
            message: Some(message.into()),
            raw_result: None,
        }
    }
}

/// One endpoint row of the session snapshot: identity label plus one result
/// slot per catalog method, in catalog order.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub url: String,
    pub identity: String,
    pub results: Vec<ProbeResult>,
}

impl EndpointSnapshot {
    pub fn result(&self, method: &str) -> Option<&ProbeResult> {
        self.results.iter().find(|r| r.method == method)
    }

    /// True once the identity label and every slot have left the pending state.
    pub fn is_settled(&self) -> bool {
        self.identity != IDENTITY_PENDING && self.results.iter().all(|r| r.outcome.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn elapsed_tracks_terminal_outcomes() {
        assert!(ProbeResult::pending("eth_blockNumber").elapsed_ms.is_none());
        assert!(ProbeResult::success("eth_blockNumber", 12.5, None).elapsed_ms.is_some());
        assert!(ProbeResult::transport_error("eth_blockNumber", 3.0, "timeout").elapsed_ms.is_some());
    }

    #[test]
    fn outcome_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Outcome::TransportError).unwrap(), "\"transport_error\"");
        assert_eq!(serde_json::to_string(&Outcome::Success).unwrap(), "\"success\"");
    }

    #[test]
    fn snapshot_settles_only_when_identity_resolved() {
        let mut row = EndpointSnapshot {
            url: "http://a".into(),
            identity: IDENTITY_PENDING.into(),
            results: vec![ProbeResult::success("eth_chainId", 5.0, Some(json!("0x1")))],
        };
        assert!(!row.is_settled());
        row.identity = "geth/v1.13".into();
        assert!(row.is_settled());
        row.results.push(ProbeResult::pending("eth_blockNumber"));
        assert!(!row.is_settled());
    }
}
