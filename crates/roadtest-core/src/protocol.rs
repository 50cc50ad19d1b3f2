//! Wire model of the device-side test harness event stream.
//!
//! The harness running on the device dials back to the local test event
//! server and reports test lifecycle events as newline-delimited JSON, one
//! event object per line, discriminated by an `event` field:
//!
//! ```json
//! {"event":"specDone","description":"spins up","status":"passed"}
//! {"event":"jasmineDone","specResults":{"specFailed":0,"specPassed":12}}
//! ```
//!
//! `jasmineDone` is the terminal event; it carries the failed-spec count the
//! orchestrator aggregates into a pass/fail outcome. Everything else is
//! informational.

use serde::{Deserialize, Serialize};

/// Aggregated counts carried by the terminal `jasmineDone` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecResults {
    /// Number of failed specs. Zero means the suite passed.
    #[serde(rename = "specFailed")]
    pub spec_failed: u32,

    /// Number of passed specs, when the harness reports it.
    #[serde(rename = "specPassed", default, skip_serializing_if = "Option::is_none")]
    pub spec_passed: Option<u32>,

    /// Total number of defined specs, when the harness reports it.
    #[serde(rename = "specDefined", default, skip_serializing_if = "Option::is_none")]
    pub spec_defined: Option<u32>,
}

impl SpecResults {
    /// A suite passes exactly when no spec failed.
    pub fn passed(&self) -> bool {
        self.spec_failed == 0
    }
}

/// One event reported by the device-side harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum HarnessEvent {
    #[serde(rename = "jasmineStarted")]
    JasmineStarted,

    #[serde(rename = "suiteStarted")]
    SuiteStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    #[serde(rename = "specStarted")]
    SpecStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    #[serde(rename = "specDone")]
    SpecDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    #[serde(rename = "suiteDone")]
    SuiteDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// Terminal event: the suite finished.
    #[serde(rename = "jasmineDone")]
    JasmineDone {
        #[serde(rename = "specResults")]
        spec_results: SpecResults,
    },

    /// A log line captured on the device. Passive; never affects control flow.
    #[serde(rename = "deviceLog")]
    DeviceLog { line: String },

    /// Arbitrary device metadata (model, OS version, ...). Passive.
    #[serde(rename = "deviceInfo")]
    DeviceInfo {
        #[serde(default)]
        info: serde_json::Value,
    },
}

impl HarnessEvent {
    /// Parse one line of the event stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error for malformed or unknown events.
    /// Callers are expected to skip such lines rather than drop the
    /// connection.
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Whether this is the terminal suite-finished event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HarnessEvent::JasmineDone { .. })
    }
}
