//! Line protocol spoken with classifier processes.
//!
//! One JSON object per line in each direction. A worker announces that its
//! model is loaded by printing the bare line `READY`; after that, every request
//! line gets exactly one response line.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Startup sentinel printed by a classifier once it can take requests.
pub const READY_SENTINEL: &str = "READY";

/// Check whether an output line is the startup sentinel.
pub fn is_ready_line(line: &str) -> bool {
    line.trim() == READY_SENTINEL
}

/// An email to classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRequest {
    pub subject: String,
    pub sender: String,
    pub body: String,
    /// Date the email was sent, used by the classifier to resolve year-less dates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_date: Option<String>,
}

impl ClassificationRequest {
    /// Create a request without an email date.
    pub fn new(
        subject: impl Into<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            sender: sender.into(),
            body: body.into(),
            email_date: None,
        }
    }

    /// Attach the email date.
    pub fn with_email_date(mut self, date: impl Into<String>) -> Self {
        self.email_date = Some(date.into());
        self
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

/// Structured booking data extracted from one email.
///
/// Every field is optional: which ones are present depends on the email type.
/// Fields this struct does not name are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub email_type: Option<String>,
    pub confidence: Option<f64>,
    pub booking_code: Option<String>,
    pub guest_name: Option<String>,
    pub status: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub check_in_date: Option<String>,
    pub check_out_date: Option<String>,
    pub nights: Option<u32>,
    pub guest_count: Option<u32>,
    pub host_earnings_eur: Option<f64>,
    pub cleaning_fee_eur: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A parsed response line.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    /// The classifier produced a result.
    Result(ClassificationResult),
    /// The classifier reported its own failure for this request.
    Error(String),
}

/// Parse one response line.
///
/// `{"error": "..."}` is the classifier's per-request failure report; any
/// other JSON object is a result. Anything else breaks framing.
pub fn parse_reply(line: &str) -> Result<WorkerReply, serde_json::Error> {
    let value: Value = serde_json::from_str(line.trim())?;
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Ok(WorkerReply::Error(message.to_string()));
    }
    serde_json::from_value(value).map(WorkerReply::Result)
}
