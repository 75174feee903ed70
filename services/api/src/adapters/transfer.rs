//! services/api/src/adapters/transfer.rs
//!
//! The HTTP adapter for the external transfer provider. It implements the
//! `TransferProvider` port against a Stripe-compatible Connect API: transfers
//! are form-encoded `POST /v1/transfers` calls carrying the payout id as the
//! `Idempotency-Key`, and account eligibility is read from `GET /v1/accounts/{id}`.

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use revshare_core::ports::{
    AccountStatus, TransferError, TransferProvider, TransferReceipt, TransferRequest,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// An adapter that implements the `TransferProvider` port over HTTP.
#[derive(Clone)]
pub struct HttpTransferAdapter {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct TransferResponse {
    id: String,
}

#[derive(Deserialize)]
struct AccountResponse {
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    charges_enabled: bool,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpTransferAdapter {
    /// Creates a new adapter. `timeout` bounds every request end to end.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        if let Ok(value) = header::HeaderValue::from_str(&format!("Bearer {}", api_key)) {
            headers.insert(header::AUTHORIZATION, value);
        }
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read_error(response: reqwest::Response) -> String {
        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(parsed) => {
                let message = parsed.error.message.unwrap_or_else(|| status.to_string());
                match parsed.error.code {
                    Some(code) => format!("{} ({})", message, code),
                    None => message,
                }
            }
            Err(_) => format!("HTTP {}", status),
        }
    }
}

/// Amount in the currency's minor unit (cents).
fn minor_units(amount: Decimal) -> Result<i64, TransferError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| TransferError::Rejected(format!("Amount {} is out of range", amount)))
}

fn send_error(e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::TimedOut
    } else {
        TransferError::Unavailable(e.to_string())
    }
}

/// A refusal is only final when the provider answered with a client error.
fn status_error(status: StatusCode, message: String) -> TransferError {
    if status.is_client_error() {
        TransferError::Rejected(message)
    } else {
        TransferError::Unavailable(message)
    }
}

#[async_trait]
impl TransferProvider for HttpTransferAdapter {
    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let amount = minor_units(request.amount)?.to_string();
        let currency = request.currency.to_lowercase();
        let form = [
            ("amount", amount.as_str()),
            ("currency", currency.as_str()),
            ("destination", request.destination_account_id.as_str()),
            ("description", request.description.as_str()),
            ("metadata[payout_id]", request.idempotency_key.as_str()),
        ];

        let response = self
            .http
            .post(format!("{}/v1/transfers", self.base_url))
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .form(&form)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = Self::read_error(response).await;
            warn!(%status, idempotency_key = %request.idempotency_key, "Transfer refused by provider: {}", message);
            return Err(status_error(status, message));
        }

        let body: TransferResponse = response.json().await.map_err(send_error)?;
        debug!(transfer_id = %body.id, idempotency_key = %request.idempotency_key, "Transfer created");
        Ok(TransferReceipt { transfer_id: body.id })
    }

    async fn account_status(&self, account_id: &str) -> Result<AccountStatus, TransferError> {
        let response = self
            .http
            .get(format!("{}/v1/accounts/{}", self.base_url, account_id))
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = Self::read_error(response).await;
            return Err(status_error(status, message));
        }

        let body: AccountResponse = response.json().await.map_err(send_error)?;
        Ok(AccountStatus {
            payouts_enabled: body.payouts_enabled,
            charges_enabled: body.charges_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(amount: Decimal) -> TransferRequest {
        TransferRequest {
            destination_account_id: "acct_123".into(),
            amount,
            currency: "EUR".into(),
            idempotency_key: "6f1c1c1e-0000-4000-8000-000000000001".into(),
            description: "Payout 2024-06".into(),
        }
    }

    fn adapter(server: &MockServer) -> HttpTransferAdapter {
        HttpTransferAdapter::new(&server.uri(), "sk_test", Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn amounts_convert_to_cents() {
        assert_eq!(minor_units(dec!(2400.00)).unwrap(), 240_000);
        assert_eq!(minor_units(dec!(26.67)).unwrap(), 2_667);
        assert_eq!(minor_units(dec!(0)).unwrap(), 0);
    }

    #[tokio::test]
    async fn transfer_sends_idempotency_key_and_minor_units() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transfers"))
            .and(header("Idempotency-Key", "6f1c1c1e-0000-4000-8000-000000000001"))
            .and(header("Authorization", "Bearer sk_test"))
            .and(body_string_contains("amount=240000"))
            .and(body_string_contains("currency=eur"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "tr_1" })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = adapter(&server).create_transfer(&request(dec!(2400))).await.unwrap();
        assert_eq!(receipt.transfer_id, "tr_1");
    }

    #[tokio::test]
    async fn client_error_is_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transfers"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": "balance_insufficient", "message": "Insufficient funds" }
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).create_transfer(&request(dec!(10))).await.unwrap_err();
        match err {
            TransferError::Rejected(message) => assert!(message.contains("balance_insufficient")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = adapter(&server).create_transfer(&request(dec!(10))).await.unwrap_err();
        assert!(matches!(err, TransferError::Unavailable(_)));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "id": "tr_late" }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let err = adapter(&server).create_transfer(&request(dec!(10))).await.unwrap_err();
        assert!(matches!(err, TransferError::TimedOut));
    }

    #[tokio::test]
    async fn account_status_reads_capabilities() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/accounts/acct_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "acct_123",
                "payouts_enabled": false,
                "charges_enabled": true
            })))
            .mount(&server)
            .await;

        let status = adapter(&server).account_status("acct_123").await.unwrap();
        assert!(!status.payouts_enabled);
        assert!(status.charges_enabled);
    }
}
