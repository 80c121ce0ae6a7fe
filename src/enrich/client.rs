//! Content-analysis collaborator.
//!
//! The analysis service receives a JPEG crop plus the damage class and
//! replies with free text. The only structure we rely on is a line matching
//! `Severity: <low|medium|high>` and a line matching `Recommendation: <text>`
//! (both case-insensitive). Anything else falls back field by field.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use url::Url;

use crate::{DamageClass, Severity, Verdict};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A collaborator that grades a damage crop.
///
/// Implementations must be callable from multiple worker threads at once.
pub trait AnalysisClient: Send + Sync {
    /// Analyze one crop. Returns the raw response text; the caller parses it
    /// with [`parse_verdict`]. Transport failures, timeouts, and non-success
    /// status codes are all plain errors.
    fn analyze(&self, damage_type: DamageClass, jpeg: &[u8]) -> Result<String>;
}

/// HTTP analysis client.
///
/// Posts the raw JPEG body with the damage class as a query parameter and
/// expects a text response. Every call carries the configured timeout; a
/// timed-out call is indistinguishable from any other failed call.
pub struct HttpAnalysisClient {
    endpoint: Url,
    agent: ureq::Agent,
}

impl HttpAnalysisClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("parse analysis endpoint url")?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported analysis endpoint scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { endpoint, agent })
    }

    pub fn with_default_timeout(endpoint: &str) -> Result<Self> {
        Self::new(endpoint, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

impl AnalysisClient for HttpAnalysisClient {
    fn analyze(&self, damage_type: DamageClass, jpeg: &[u8]) -> Result<String> {
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .query("damage_type", damage_type.as_str())
            .set("Content-Type", "image/jpeg")
            .send_bytes(jpeg)
            .context("analysis request failed")?;
        response
            .into_string()
            .context("read analysis response body")
    }
}

/// Fixed-response client for demos and tests.
pub struct StubAnalysisClient {
    response: String,
}

impl StubAnalysisClient {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

impl Default for StubAnalysisClient {
    fn default() -> Self {
        Self::new("Severity: medium\nRecommendation: Schedule inspection")
    }
}

impl AnalysisClient for StubAnalysisClient {
    fn analyze(&self, _damage_type: DamageClass, _jpeg: &[u8]) -> Result<String> {
        Ok(self.response.clone())
    }
}

fn severity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)severity:\s*(low|medium|high)").unwrap())
}

fn recommendation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)recommendation:\s*(\S.*)").unwrap())
}

/// Extract a verdict from free-form analysis text.
///
/// Fields fall back individually: a response with a valid severity but no
/// recommendation keeps the parsed severity and takes the generic
/// recommendation, and vice versa. The whole response is never discarded.
pub fn parse_verdict(text: &str) -> Verdict {
    let fallback = Verdict::fallback();

    let severity = severity_re()
        .captures(text)
        .and_then(|caps| Severity::parse(caps.get(1).map_or("", |m| m.as_str())))
        .unwrap_or(fallback.severity);

    let recommendation = recommendation_re()
        .captures(text)
        .map(|caps| caps.get(1).map_or("", |m| m.as_str()).trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or(fallback.recommendation);

    Verdict {
        severity,
        recommendation,
    }
}
