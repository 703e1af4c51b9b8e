//! JSON-over-HTTP with retry, shared by the embedding and chat clients.
//!
//! | Outcome | Action |
//! |---------|--------|
//! | 2xx | parse body as JSON |
//! | 429, 5xx | retry with backoff |
//! | other 4xx | fail immediately |
//! | network error | retry with backoff |
//!
//! Backoff is 1s, 2s, 4s, ... capped at 32s. Every failure surfaces as
//! [`CollaboratorError::Unavailable`] so the core can absorb it.

use std::time::Duration;

use finsight_core::error::CollaboratorError;
use tracing::warn;

pub fn build_client(timeout_secs: u64) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| CollaboratorError::Unavailable(format!("http client: {}", e)))
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// POST `body` to `url` and return the decoded JSON response.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value, CollaboratorError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff(attempt)).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(key) = bearer {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        CollaboratorError::Unavailable(format!("{} returned unreadable body: {}", service, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let message = format!("{} API error {}: {}", service, status, body_text);
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(service, attempt, %status, "retryable API error");
                    last_err = Some(message);
                    continue;
                }
                return Err(CollaboratorError::Unavailable(message));
            }
            Err(e) => {
                warn!(service, attempt, error = %e, "request failed");
                last_err = Some(format!("{} connection error at {}: {}", service, url, e));
            }
        }
    }

    Err(CollaboratorError::Unavailable(
        last_err.unwrap_or_else(|| format!("{} failed after retries", service)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(6), Duration::from_secs(32));
        assert_eq!(backoff(20), Duration::from_secs(32));
    }
}
