//! Wire types for the session container's `/analyze_job` endpoint.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// `completion_reason` reported when the analysis stopped on token exhaustion.
pub const TOKEN_LIMIT_REACHED: &str = "token_limit_reached";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLedgerSnapshot {
    pub used_token: u64,
    pub issued_token: u64,
    pub remaining_token: i64,
}

impl TokenLedgerSnapshot {
    pub fn new(used: u64, issued: u64) -> Self {
        Self {
            used_token: used,
            issued_token: issued,
            remaining_token: i64::try_from(issued)
                .unwrap_or(i64::MAX)
                .saturating_sub(i64::try_from(used).unwrap_or(i64::MAX)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeJobRequest {
    pub job_id: String,
    pub query: String,
    pub model: String,
    pub session_id: String,
    pub input_dir: String,
    pub output_dir: String,
    #[serde(rename = "user_email")]
    pub user_identity: String,
    #[serde(
        rename = "user_token_info",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub token_ledger: Option<TokenLedgerSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    #[serde(default, with = "rust_decimal::serde::float")]
    pub prompt_cost: Decimal,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub completion_cost: Decimal,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub total_cost: Decimal,
    #[serde(default)]
    pub model: Option<String>,
}

/// Body of a 200 response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeJobResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub metrics: UsageMetrics,
    #[serde(default)]
    pub costs: CostBreakdown,
    #[serde(default)]
    pub analysis_completed_early: bool,
    #[serde(default)]
    pub completion_reason: Option<String>,
}

impl AnalyzeJobResponse {
    pub fn token_limit_reached(&self) -> bool {
        self.completion_reason
            .as_deref()
            .is_some_and(|reason| reason.eq_ignore_ascii_case(TOKEN_LIMIT_REACHED))
    }

    /// False when the body reports an error or stopped on token exhaustion,
    /// even though the HTTP call itself succeeded.
    pub fn is_success(&self) -> bool {
        let error_status = self.status.as_deref() == Some("error");
        let has_error = self.error.as_ref().is_some_and(|e| !e.is_null());
        !(error_status || has_error || self.token_limit_reached())
    }
}

/// Body of a 402 or other error response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub metrics: UsageMetrics,
}
