//! Mobile wallet merchant API client
//!
//! Wallets A, B and C are served by one merchant gateway that takes an
//! `API_PURCHASE` request and answers synchronously.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{
    config::MobileWalletConfig,
    payment_providers::{PaymentError, Result, WalletCharge, WalletGateway, WalletResponse},
    types::PaymentPlatform,
};

pub struct MobileWalletClient {
    client: reqwest::Client,
    config: MobileWalletConfig,
}

impl MobileWalletClient {
    pub fn new(config: MobileWalletConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::ProviderApi(format!("create wallet HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn payload<'a>(&'a self, charge: &'a WalletCharge) -> PurchaseRequest<'a> {
        let now = Utc::now();
        PurchaseRequest {
            schema_version: "1.0",
            request_id: format!("{}{}", charge.order_id.simple(), now.timestamp_millis()),
            timestamp: now.timestamp_millis(),
            channel_name: "WEB",
            service_name: "API_PURCHASE",
            service_params: ServiceParams {
                merchant_uid: &self.config.merchant_uid,
                payment_method: "MWALLET_ACCOUNT",
                api_key: &self.config.api_key,
                api_user_id: &self.config.api_user_id,
                payer_info: PayerInfo { account_no: &charge.phone },
                transaction_info: TransactionInfo {
                    invoice_id: charge.order_id.to_string(),
                    reference_id: charge.order_id.to_string(),
                    amount: charge.amount,
                    currency: &self.config.currency,
                    description: format!("Credit purchase - {} credits", charge.credits),
                    platform: charge.platform,
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseRequest<'a> {
    schema_version: &'static str,
    request_id: String,
    timestamp: i64,
    channel_name: &'static str,
    service_name: &'static str,
    service_params: ServiceParams<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceParams<'a> {
    merchant_uid: &'a str,
    payment_method: &'static str,
    api_key: &'a str,
    api_user_id: &'a str,
    payer_info: PayerInfo<'a>,
    transaction_info: TransactionInfo<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayerInfo<'a> {
    account_no: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionInfo<'a> {
    invoice_id: String,
    reference_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    currency: &'a str,
    description: String,
    platform: PaymentPlatform,
}

#[async_trait]
impl WalletGateway for MobileWalletClient {
    async fn charge(&self, charge: &WalletCharge) -> Result<WalletResponse> {
        let payload = self.payload(charge);
        tracing::info!(order_id = %charge.order_id, platform = %charge.platform, request_id = %payload.request_id, "Sending wallet purchase request");

        let response = self
            .client
            .post(self.config.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(order_id = %charge.order_id, "Wallet gateway unreachable: {:?}", e);
                PaymentError::ProviderApi(e.to_string())
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PaymentError::ProviderApi(format!("wallet gateway returned {status}")));
        }

        // A 4xx with a body is still a classified decline, so parse regardless
        let body: WalletResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::ProviderApi(format!("invalid wallet response ({status}): {e}")))?;

        tracing::debug!(order_id = %charge.order_id, response_code = ?body.response_code, response_msg = ?body.response_msg, "Wallet gateway responded");
        Ok(body)
    }
}
