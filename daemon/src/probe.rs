use async_trait::async_trait;
use reqwest::Client;

use crate::config::ProbeConfig;

/// Classification of one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// An HTTP server answered.
    Reachable,
    /// Connection refused, timed out, or the host could not be resolved.
    Unreachable(String),
    /// Something answered but not with usable HTTP.
    Ambiguous(String),
}

impl ProbeOutcome {
    /// Ambiguous outcomes count as unreachable for the state machine.
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Reachable => None,
            ProbeOutcome::Unreachable(d) | ProbeOutcome::Ambiguous(d) => Some(d),
        }
    }
}

/// One bounded liveness check. Implementations never retry.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

/// `GET`s the configured URL with a hard timeout.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
    strict: bool,
}

impl HttpProbe {
    pub fn new(config: &ProbeConfig) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            url: config.url(),
            strict: config.strict,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        let outcome = match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                if self.strict && !status.is_success() {
                    ProbeOutcome::Ambiguous(format!("health endpoint answered {status}"))
                } else {
                    ProbeOutcome::Reachable
                }
            }
            Err(e) => classify_error(&e),
        };

        match &outcome {
            ProbeOutcome::Reachable => tracing::trace!("Probe {} reachable", self.url),
            ProbeOutcome::Unreachable(detail) => {
                tracing::debug!("Probe {} unreachable: {detail}", self.url)
            }
            ProbeOutcome::Ambiguous(detail) => {
                tracing::warn!("Probe {} ambiguous: {detail}", self.url)
            }
        }
        outcome
    }
}

fn classify_error(err: &reqwest::Error) -> ProbeOutcome {
    if err.is_timeout() {
        ProbeOutcome::Unreachable("timed out".to_string())
    } else if err.is_connect() {
        ProbeOutcome::Unreachable(format!("connection failed: {}", root_cause(err)))
    } else {
        ProbeOutcome::Ambiguous(root_cause(err))
    }
}

fn root_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}
