//! Fulfillment provider port and adapters.
//!
//! The provider issues the purchased artifact (a certificate). It is slow,
//! fallible, and not transactional with the ledger, so the orchestrator only
//! ever calls it after the reservation has committed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{ArtifactId, OwnerId, PurchaseId, ReferenceId, ResourceId};
use ledger::{DeliveryDetails, PurchaseRecord};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FulfillmentError;

/// What the provider needs to issue an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentRequest {
    /// Doubles as the provider-side idempotency key.
    pub purchase_id: PurchaseId,
    pub owner_id: OwnerId,
    pub resource_id: ResourceId,
    pub variant: String,
    pub reference_id: ReferenceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryDetails>,
}

impl From<&PurchaseRecord> for FulfillmentRequest {
    fn from(record: &PurchaseRecord) -> Self {
        Self {
            purchase_id: record.id,
            owner_id: record.owner_id,
            resource_id: record.resource_id.clone(),
            variant: record.variant.clone(),
            reference_id: record.reference_id.clone(),
            delivery: record.delivery.clone(),
        }
    }
}

/// Successful issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentReceipt {
    pub artifact_id: ArtifactId,
}

/// Trait for artifact issuance.
#[async_trait]
pub trait FulfillmentProvider: Send + Sync {
    /// Issues the artifact for a reserved purchase.
    async fn issue(
        &self,
        request: &FulfillmentRequest,
    ) -> Result<FulfillmentReceipt, FulfillmentError>;
}

#[async_trait]
impl<T: FulfillmentProvider + ?Sized> FulfillmentProvider for Arc<T> {
    async fn issue(
        &self,
        request: &FulfillmentRequest,
    ) -> Result<FulfillmentReceipt, FulfillmentError> {
        (**self).issue(request).await
    }
}

#[derive(Debug, Default)]
struct InMemoryFulfillmentState {
    issued: Vec<(ArtifactId, FulfillmentRequest)>,
    next_id: u32,
    fail_on_issue: bool,
    fail_next: u32,
    latency: Option<Duration>,
    calls: u32,
}

/// In-memory fulfillment provider for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFulfillmentProvider {
    state: Arc<Mutex<InMemoryFulfillmentState>>,
}

impl InMemoryFulfillmentProvider {
    /// Creates a new in-memory fulfillment provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryFulfillmentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every issue call fail until reset.
    pub fn set_fail_on_issue(&self, fail: bool) {
        self.state().fail_on_issue = fail;
    }

    /// Makes the next `count` issue calls fail.
    pub fn fail_next(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Delays every issue call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Number of artifacts issued so far.
    pub fn issued_count(&self) -> usize {
        self.state().issued.len()
    }

    /// Number of issue calls, including failed ones.
    pub fn call_count(&self) -> u32 {
        self.state().calls
    }

    /// Returns the request an artifact was issued for.
    pub fn request_for(&self, artifact_id: &ArtifactId) -> Option<FulfillmentRequest> {
        self.state()
            .issued
            .iter()
            .find(|(id, _)| id == artifact_id)
            .map(|(_, request)| request.clone())
    }
}

#[async_trait]
impl FulfillmentProvider for InMemoryFulfillmentProvider {
    async fn issue(
        &self,
        request: &FulfillmentRequest,
    ) -> Result<FulfillmentReceipt, FulfillmentError> {
        let latency = {
            let mut state = self.state();
            state.calls += 1;
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();

        if state.fail_on_issue {
            return Err(FulfillmentError::Rejected(
                "Certificate service unavailable".to_string(),
            ));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(FulfillmentError::Transport(
                "Certificate service returned 503".to_string(),
            ));
        }

        state.next_id += 1;
        let artifact_id = ArtifactId::new(format!("CERT-{:04}", state.next_id));
        state.issued.push((artifact_id.clone(), request.clone()));

        Ok(FulfillmentReceipt { artifact_id })
    }
}

/// Fulfillment provider that POSTs JSON requests to one HTTP endpoint.
///
/// The endpoint answers `2xx` with `{"artifact_id": "..."}`.
pub struct HttpFulfillmentProvider {
    client: Client,
    endpoint: Url,
}

impl HttpFulfillmentProvider {
    /// Builds an adapter whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error when the reqwest client cannot be constructed.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl FulfillmentProvider for HttpFulfillmentProvider {
    #[tracing::instrument(skip(self, request), fields(purchase_id = %request.purchase_id, endpoint = %self.endpoint))]
    async fn issue(
        &self,
        request: &FulfillmentRequest,
    ) -> Result<FulfillmentReceipt, FulfillmentError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .header("Idempotency-Key", request.purchase_id.to_string())
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, body.as_ref()));
        }

        serde_json::from_slice::<FulfillmentReceipt>(body.as_ref()).map_err(|error| {
            FulfillmentError::Decode(format!("invalid fulfillment payload: {error}"))
        })
    }
}

fn map_transport_error(error: reqwest::Error) -> FulfillmentError {
    if error.is_timeout() {
        FulfillmentError::Timeout(error.to_string())
    } else {
        FulfillmentError::Transport(error.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &[u8]) -> FulfillmentError {
    let preview = body_preview(body);
    let message = if preview.is_empty() {
        format!("status {}", status.as_u16())
    } else {
        format!("status {}: {}", status.as_u16(), preview)
    };

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            FulfillmentError::Timeout(message)
        }
        _ if status.is_client_error() => FulfillmentError::Rejected(message),
        _ => FulfillmentError::Transport(message),
    }
}

fn body_preview(body: &[u8]) -> String {
    const PREVIEW_CHAR_LIMIT: usize = 160;

    let compact = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    compact.chars().take(PREVIEW_CHAR_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use common::Money;
    use ledger::ReservationRequest;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    fn request() -> FulfillmentRequest {
        let reservation = ReservationRequest::new(
            OwnerId::new(),
            "course-101",
            "digital",
            Money::from_cents(2599),
        );
        FulfillmentRequest::from(&PurchaseRecord::processing(&reservation))
    }

    #[tokio::test]
    async fn test_sequential_artifact_ids() {
        let provider = InMemoryFulfillmentProvider::new();

        let r1 = provider.issue(&request()).await.unwrap();
        let r2 = provider.issue(&request()).await.unwrap();

        assert_eq!(r1.artifact_id.as_str(), "CERT-0001");
        assert_eq!(r2.artifact_id.as_str(), "CERT-0002");
        assert_eq!(provider.issued_count(), 2);
        assert!(provider.request_for(&r1.artifact_id).is_some());
    }

    #[tokio::test]
    async fn test_fail_on_issue() {
        let provider = InMemoryFulfillmentProvider::new();
        provider.set_fail_on_issue(true);

        let result = provider.issue(&request()).await;
        assert!(matches!(result, Err(FulfillmentError::Rejected(_))));
        assert_eq!(provider.issued_count(), 0);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_recovers() {
        let provider = InMemoryFulfillmentProvider::new();
        provider.fail_next(1);

        assert!(provider.issue(&request()).await.is_err());
        assert!(provider.issue(&request()).await.is_ok());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status_error(StatusCode::BAD_REQUEST, b"bad variant"),
            FulfillmentError::Rejected(m) if m == "status 400: bad variant"
        ));
        assert!(matches!(
            map_status_error(StatusCode::GATEWAY_TIMEOUT, b""),
            FulfillmentError::Timeout(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::SERVICE_UNAVAILABLE, b""),
            FulfillmentError::Transport(m) if m == "status 503"
        ));
    }

    /// Serves `router` on a local port and returns its certificate endpoint.
    async fn serve(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/certificates")).unwrap()
    }

    #[tokio::test]
    async fn test_http_provider_success() {
        // Only answers when the idempotency key matches the purchase
        let router = Router::new().route(
            "/certificates",
            post(
                |headers: HeaderMap, Json(body): Json<FulfillmentRequest>| async move {
                    let key = headers
                        .get("Idempotency-Key")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    if key == Some(body.purchase_id.to_string()) {
                        (StatusCode::OK, Json(json!({ "artifact_id": "CERT-9001" })))
                    } else {
                        (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing key" })))
                    }
                },
            ),
        );
        let url = serve(router).await;
        let provider = HttpFulfillmentProvider::new(url, Duration::from_secs(5)).unwrap();

        let receipt = provider.issue(&request()).await.unwrap();
        assert_eq!(receipt.artifact_id.as_str(), "CERT-9001");
    }

    #[tokio::test]
    async fn test_http_provider_maps_server_error() {
        let router = Router::new().route(
            "/certificates",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "down" }))) }),
        );
        let url = serve(router).await;
        let provider = HttpFulfillmentProvider::new(url, Duration::from_secs(5)).unwrap();

        let result = provider.issue(&request()).await;
        assert!(matches!(result, Err(FulfillmentError::Transport(_))));
    }

    #[tokio::test]
    async fn test_http_provider_maps_client_error_to_rejected() {
        let router = Router::new().route(
            "/certificates",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "unknown variant") }),
        );
        let url = serve(router).await;
        let provider = HttpFulfillmentProvider::new(url, Duration::from_secs(5)).unwrap();

        let result = provider.issue(&request()).await;
        assert!(matches!(
            result,
            Err(FulfillmentError::Rejected(m)) if m == "status 422: unknown variant"
        ));
    }

    #[tokio::test]
    async fn test_http_provider_rejects_bad_payload() {
        let router = Router::new().route(
            "/certificates",
            post(|| async { Json(json!({ "unexpected": true })) }),
        );
        let url = serve(router).await;
        let provider = HttpFulfillmentProvider::new(url, Duration::from_secs(5)).unwrap();

        let result = provider.issue(&request()).await;
        assert!(matches!(result, Err(FulfillmentError::Decode(_))));
    }

    #[tokio::test]
    async fn test_http_provider_times_out() {
        let router = Router::new().route(
            "/certificates",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!({ "artifact_id": "CERT-LATE" }))
            }),
        );
        let url = serve(router).await;
        let provider = HttpFulfillmentProvider::new(url, Duration::from_millis(100)).unwrap();

        let result = provider.issue(&request()).await;
        assert!(matches!(result, Err(FulfillmentError::Timeout(_))));
    }
}
