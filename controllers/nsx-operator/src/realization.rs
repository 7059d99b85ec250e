//! Realization poller.
//!
//! NSX applies intent asynchronously. After a mutating call the services
//! poll the realized state of the intent path until every expected entity is
//! REALIZED, an entity reports ERROR, or the retry policy runs out.

use nsx_client::{NsxClientTrait, NsxError, RealizationState, RealizedEntity};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Realization failures
#[derive(Debug, Error)]
pub enum RealizationError {
    /// Still converging when the policy ran out
    #[error("{path} not realized after {elapsed_secs}s")]
    Timeout { path: String, elapsed_secs: u64 },

    /// The backend reported a permanent error
    #[error("{path} failed to realize: {message}")]
    Failed { path: String, message: String },

    /// A poll failed with a non-retryable backend error
    #[error("polling realization of {path}: {source}")]
    Backend {
        path: String,
        #[source]
        source: NsxError,
    },
}

/// Poll interval and overall deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    Pending,
    Realized,
    Failed(String),
}

/// Classify one poll result.
///
/// With markers, every marker entity type must be present and REALIZED.
/// Without markers, at least one entity must exist and all must be REALIZED.
fn classify(entities: &[RealizedEntity], expected_markers: &[&str]) -> PollOutcome {
    if let Some(failed) = entities.iter().find(|e| e.state == RealizationState::Error) {
        let message = failed
            .alarms
            .iter()
            .map(|a| a.message.as_str())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        let message = if message.is_empty() {
            format!("{} is in state ERROR", failed.entity_type)
        } else {
            message
        };
        return PollOutcome::Failed(message);
    }

    let realized = if expected_markers.is_empty() {
        !entities.is_empty() && entities.iter().all(|e| e.state == RealizationState::Realized)
    } else {
        expected_markers.iter().all(|marker| {
            entities
                .iter()
                .any(|e| e.entity_type == *marker && e.state == RealizationState::Realized)
        })
    };

    if realized {
        PollOutcome::Realized
    } else {
        PollOutcome::Pending
    }
}

/// Polls NSX realized state with a bounded retry policy
#[derive(Clone)]
pub struct RealizationPoller {
    client: Arc<dyn NsxClientTrait>,
}

impl std::fmt::Debug for RealizationPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealizationPoller")
            .field("base_url", &self.client.base_url())
            .finish()
    }
}

impl RealizationPoller {
    pub fn new(client: Arc<dyn NsxClientTrait>) -> Self {
        Self { client }
    }

    /// Wait until `path` is realized.
    ///
    /// Transient poll failures count as "not yet realized". Dropping the
    /// returned future stops polling, which is how callers cancel it.
    pub async fn check_realize_state(
        &self,
        policy: &RetryPolicy,
        path: &str,
        expected_markers: &[&str],
    ) -> Result<(), RealizationError> {
        let started = Instant::now();
        loop {
            match self.client.get_realized_entities(path).await {
                Ok(entities) => match classify(&entities, expected_markers) {
                    PollOutcome::Realized => {
                        debug!("{} realized after {:?}", path, started.elapsed());
                        return Ok(());
                    }
                    PollOutcome::Failed(message) => {
                        return Err(RealizationError::Failed {
                            path: path.to_string(),
                            message,
                        });
                    }
                    PollOutcome::Pending => debug!("{} not realized yet", path),
                },
                Err(e) if e.is_transient() => warn!("Transient error polling {}: {}", path, e),
                Err(source) => {
                    return Err(RealizationError::Backend {
                        path: path.to_string(),
                        source,
                    });
                }
            }

            if started.elapsed() + policy.interval > policy.timeout {
                return Err(RealizationError::Timeout {
                    path: path.to_string(),
                    elapsed_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(policy.interval).await;
        }
    }
}
