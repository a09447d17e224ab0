use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::models::{parse_retry_after, AccrualOutcome, AccrualResponse};
use super::AccrualSource;
use crate::error::{AccrualError, AppError, AppResult};
use crate::shutdown::Shutdown;

/// Upper bound for a single accrual request, connect included
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the external accrual service
#[derive(Clone)]
pub struct AccrualClient {
    client: Client,
    base_url: String,
}

impl AccrualClient {
    pub fn new(base_url: &str) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(AccrualError::from)?;

        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch and classify the accrual state of one order
    pub async fn get_order(&self, number: &str) -> Result<AccrualOutcome, AccrualError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);
        debug!("Querying accrual service: {}", url);

        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                let parsed: AccrualResponse = serde_json::from_str(&body)
                    .map_err(|e| AccrualError::MalformedPayload(e.to_string()))?;
                Ok(parsed.into())
            }
            StatusCode::NO_CONTENT => Ok(AccrualOutcome::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => {
                let header = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok());
                Ok(AccrualOutcome::RateLimited {
                    retry_after: parse_retry_after(header),
                })
            }
            other => Err(AccrualError::UnexpectedStatus(other.as_u16())),
        }
    }
}

#[async_trait]
impl AccrualSource for AccrualClient {
    async fn fetch(&self, number: &str, shutdown: &Shutdown) -> AppResult<AccrualOutcome> {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => Err(AppError::Cancelled),
            outcome = self.get_order(number) => Ok(outcome?),
        }
    }
}

/// Strip trailing slashes and default to plain http when no scheme is given
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::models::{AccrualStatus, DEFAULT_RETRY_AFTER};
    use crate::shutdown;
    use httpmock::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(normalize_base_url("http://accrual:8080/"), "http://accrual:8080");
        assert_eq!(normalize_base_url("localhost:8081"), "http://localhost:8081");
        assert_eq!(normalize_base_url("https://accrual.example"), "https://accrual.example");
    }

    #[tokio::test]
    async fn test_processed_order_is_resolved() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/orders/79927398713");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"order":"79927398713","status":"PROCESSED","accrual":500}"#);
            })
            .await;

        let client = AccrualClient::new(&server.base_url()).unwrap();
        let outcome = client.get_order("79927398713").await.unwrap();

        mock.assert_async().await;
        assert_eq!(
            outcome,
            AccrualOutcome::Resolved {
                status: AccrualStatus::Processed,
                accrual: Some(dec!(500)),
            }
        );
    }

    #[tokio::test]
    async fn test_no_content_means_not_registered() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/orders/12345678903");
                then.status(204);
            })
            .await;

        let client = AccrualClient::new(&server.base_url()).unwrap();
        let outcome = client.get_order("12345678903").await.unwrap();

        assert_eq!(outcome, AccrualOutcome::NotRegistered);
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/orders/1");
                then.status(429).header("Retry-After", "60");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/orders/2");
                then.status(429);
            })
            .await;

        let client = AccrualClient::new(&server.base_url()).unwrap();

        assert_eq!(
            client.get_order("1").await.unwrap(),
            AccrualOutcome::RateLimited {
                retry_after: Duration::from_secs(60)
            }
        );
        assert_eq!(
            client.get_order("2").await.unwrap(),
            AccrualOutcome::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER
            }
        );
    }

    #[tokio::test]
    async fn test_unexpected_status_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/orders/1");
                then.status(500);
            })
            .await;

        let client = AccrualClient::new(&server.base_url()).unwrap();
        let result = client.get_order("1").await;

        assert!(matches!(result, Err(AccrualError::UnexpectedStatus(500))));
    }

    #[tokio::test]
    async fn test_malformed_body_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/orders/1");
                then.status(200).body("not json");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/orders/2");
                then.status(200)
                    .body(r#"{"order":"2","status":"LOST"}"#);
            })
            .await;

        let client = AccrualClient::new(&server.base_url()).unwrap();

        assert!(matches!(
            client.get_order("1").await,
            Err(AccrualError::MalformedPayload(_))
        ));
        assert!(matches!(
            client.get_order("2").await,
            Err(AccrualError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_is_cancelled_by_shutdown() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/orders/1");
                then.status(204).delay(Duration::from_secs(3));
            })
            .await;

        let client = AccrualClient::new(&server.base_url()).unwrap();
        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();

        let result = client.fetch("1", &shutdown).await;

        assert!(matches!(result, Err(AppError::Cancelled)));
    }
}
