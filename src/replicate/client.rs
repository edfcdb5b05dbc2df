use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::error::ApiError;
use super::types::CreatePrediction;
use crate::state_machine::Job;

pub const API_URL: &str = "https://api.replicate.com/v1";

/// The remote job API as seen by the poller and the CLI.
pub trait PredictionApi: Send + Sync + 'static {
    fn get_prediction(&self, id: &str) -> impl Future<Output = Result<Job, ApiError>> + Send;

    fn create_prediction(
        &self,
        req: &CreatePrediction,
    ) -> impl Future<Output = Result<Job, ApiError>> + Send;

    fn cancel_prediction(&self, id: &str) -> impl Future<Output = Result<Job, ApiError>> + Send;
}

pub struct ReplicateClient {
    api_token: String,
    client: Client,
    base_url: String,
}

impl ReplicateClient {
    pub fn new(api_token: String) -> Result<Self, ApiError> {
        Self::with_base_url(api_token, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(api_token: String, base_url: String) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            api_token,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(1000);
            return Err(ApiError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ApiError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

impl PredictionApi for ReplicateClient {
    async fn get_prediction(&self, id: &str) -> Result<Job, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/predictions/{id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn create_prediction(&self, req: &CreatePrediction) -> Result<Job, ApiError> {
        let response = self
            .client
            .post(self.url("/predictions"))
            .bearer_auth(&self.api_token)
            .json(req)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn cancel_prediction(&self, id: &str) -> Result<Job, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/predictions/{id}/cancel")))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobStatus;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prediction(status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "pred_1",
            "status": status,
            "created_at": "2024-01-01T00:00:00Z",
            "logs": ""
        })
    }

    async fn client_for(server: &MockServer) -> ReplicateClient {
        ReplicateClient::with_base_url("r8_test".into(), server.uri()).unwrap()
    }

    #[tokio::test]
    async fn get_prediction_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/predictions/pred_1"))
            .and(header("authorization", "Bearer r8_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(prediction("processing")))
            .expect(1)
            .mount(&server)
            .await;

        let job = client_for(&server).await.get_prediction("pred_1").await.unwrap();
        assert_eq!(job.id, "pred_1");
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn throttling_maps_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "4"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.get_prediction("x").await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { retry_after_ms: 4000 }));
    }

    #[tokio::test]
    async fn huge_retry_after_saturates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", u64::MAX.to_string()),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).await.get_prediction("x").await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::RateLimited {
                retry_after_ms: u64::MAX
            }
        ));
    }

    #[tokio::test]
    async fn not_found_is_an_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such prediction"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.get_prediction("x").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "API error (status 404): no such prediction");
    }

    #[tokio::test]
    async fn garbage_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.get_prediction("x").await.unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn create_and_cancel_hit_their_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(prediction("starting")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/predictions/pred_1/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(prediction("canceled")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let req = CreatePrediction::new("v1", serde_json::json!({"prompt": "hi"}));
        assert_eq!(client.create_prediction(&req).await.unwrap().status, JobStatus::Starting);
        assert_eq!(client.cancel_prediction("pred_1").await.unwrap().status, JobStatus::Canceled);
    }
}
