//! Link issuer adapters for StagePay.

#![deny(unsafe_code)]

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use stagepay_core::{IssuedLink, IssuerError, LinkIssuer, LinkRequest};
use std::time::Duration;
use tracing::debug;

/// Mock issuer producing deterministic checkout links for local runs.
#[derive(Debug, Clone)]
pub struct MockLinkIssuer {
    base_url: String,
}

impl MockLinkIssuer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for MockLinkIssuer {
    fn default() -> Self {
        Self::new("https://pay.local")
    }
}

#[async_trait]
impl LinkIssuer for MockLinkIssuer {
    fn issuer_id(&self) -> &'static str {
        "mock"
    }

    async fn issue_link(&self, request: &LinkRequest) -> Result<IssuedLink, IssuerError> {
        let stage_id = request.stage_id.to_string();
        let short_id: String = stage_id.chars().take(8).collect();

        Ok(IssuedLink {
            link: format!("{}/checkout/{}", self.base_url, stage_id),
            external_reference: format!("mock-{short_id}"),
        })
    }
}

/// Deterministic failing issuer useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailIssuer {
    error: IssuerError,
}

impl AlwaysFailIssuer {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            error: IssuerError::Unavailable(reason.into()),
        }
    }

    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            error: IssuerError::Rejected(reason.into()),
        }
    }
}

#[async_trait]
impl LinkIssuer for AlwaysFailIssuer {
    fn issuer_id(&self) -> &'static str {
        "always-fail"
    }

    async fn issue_link(&self, _request: &LinkRequest) -> Result<IssuedLink, IssuerError> {
        Err(self.error.clone())
    }
}

/// Response body accepted from a checkout-preference style processor API.
#[derive(Debug, Deserialize)]
struct IssuerResponse {
    #[serde(alias = "init_point", alias = "url")]
    link: String,
    #[serde(alias = "id", alias = "preference_id")]
    external_reference: String,
}

/// Issuer backed by a payment processor's HTTP API.
///
/// The [`LinkRequest`] is POSTed as JSON. Transport failures and 5xx/429
/// answers are reported as `Unavailable`; any other non-success status or an
/// unreadable body is `Rejected`.
#[derive(Debug, Clone)]
pub struct HttpLinkIssuer {
    client: Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpLinkIssuer {
    pub fn new(
        endpoint: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, IssuerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| IssuerError::Unavailable(format!("http client: {err}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            bearer_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LinkIssuer for HttpLinkIssuer {
    fn issuer_id(&self) -> &'static str {
        "http"
    }

    async fn issue_link(&self, request: &LinkRequest) -> Result<IssuedLink, IssuerError> {
        let mut call = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.bearer_token {
            call = call.bearer_auth(token);
        }

        let response = call
            .send()
            .await
            .map_err(|err| IssuerError::Unavailable(err.to_string()))?;

        let status = response.status();
        debug!(stage_id = %request.stage_id, %status, "issuer responded");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: IssuerResponse = response
            .json()
            .await
            .map_err(|err| IssuerError::Rejected(format!("unreadable issuer response: {err}")))?;

        IssuedLink {
            link: body.link,
            external_reference: body.external_reference,
        }
        .validate()
    }
}

fn classify_status(status: StatusCode, body: &str) -> IssuerError {
    let message = if body.is_empty() {
        format!("status {status}")
    } else {
        format!("status {status}: {body}")
    };

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        IssuerError::Unavailable(message)
    } else {
        IssuerError::Rejected(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use stagepay_core::{PaymentStage, ProjectId, StageId, StageStatus};

    fn request() -> LinkRequest {
        let stage = PaymentStage {
            id: StageId::new(),
            project_id: ProjectId::new("project-7"),
            stage_name: "foundation".to_string(),
            stage_percentage: Decimal::new(40, 0),
            amount: Decimal::new(400_000, 2),
            required_progress: 0,
            status: StageStatus::Available,
            payment_link: None,
            external_payment_reference: None,
            due_date: None,
            paid_date: None,
            created_at: Utc::now(),
            revision: 0,
        };
        LinkRequest::for_stage(&stage, "USD")
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/preferences")
    }

    fn issuer(endpoint: String) -> HttpLinkIssuer {
        HttpLinkIssuer::new(endpoint, Some("secret".to_string()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn mock_links_are_deterministic() {
        let issuer = MockLinkIssuer::new("https://pay.test/");
        let request = request();

        let first = issuer.issue_link(&request).await.unwrap();
        let second = issuer.issue_link(&request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.link,
            format!("https://pay.test/checkout/{}", request.stage_id)
        );
        assert!(first.external_reference.starts_with("mock-"));
        assert_eq!(first.external_reference.len(), "mock-".len() + 8);
    }

    #[tokio::test]
    async fn always_fail_reports_configured_error() {
        let err = AlwaysFailIssuer::unavailable("down")
            .issue_link(&request())
            .await
            .unwrap_err();
        assert_eq!(err, IssuerError::Unavailable("down".to_string()));

        let err = AlwaysFailIssuer::rejecting("no")
            .issue_link(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::Rejected(_)));
    }

    #[tokio::test]
    async fn http_issuer_reads_processor_preference() {
        let app = Router::new().route(
            "/preferences",
            post(|Json(body): Json<serde_json::Value>| async move {
                let stage_id = body["stage_id"].as_str().unwrap_or_default().to_string();
                Json(serde_json::json!({
                    "id": format!("pref-{stage_id}"),
                    "init_point": format!("https://checkout.example/{stage_id}"),
                }))
            }),
        );
        let request = request();

        let issued = issuer(serve(app).await).issue_link(&request).await.unwrap();

        assert_eq!(
            issued.link,
            format!("https://checkout.example/{}", request.stage_id)
        );
        assert_eq!(issued.external_reference, format!("pref-{}", request.stage_id));
    }

    #[tokio::test]
    async fn http_issuer_maps_server_errors_to_unavailable() {
        let app = Router::new().route(
            "/preferences",
            post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let err = issuer(serve(app).await)
            .issue_link(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::Unavailable(ref m) if m.contains("maintenance")));
    }

    #[tokio::test]
    async fn http_issuer_maps_client_errors_and_bad_bodies_to_rejected() {
        let app = Router::new()
            .route(
                "/preferences",
                post(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, "amount too low") }),
            )
            .route(
                "/garbage",
                post(|| async { Json(serde_json::json!({ "unexpected": true })) }),
            );
        let endpoint = serve(app).await;

        let err = issuer(endpoint.clone())
            .issue_link(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::Rejected(_)));

        let garbage = endpoint.replace("/preferences", "/garbage");
        let err = issuer(garbage).issue_link(&request()).await.unwrap_err();
        assert!(matches!(err, IssuerError::Rejected(_)));
    }

    #[tokio::test]
    async fn unreachable_issuer_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = issuer(format!("http://{addr}/preferences"))
            .issue_link(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::Unavailable(_)));
    }

    #[test]
    fn rate_limiting_is_retryable() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            IssuerError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad"),
            IssuerError::Rejected(_)
        ));
    }
}
