//! Gateway result classification.
//!
//! Pure functions that map a gateway payload onto [`Outcome`]. No I/O, no
//! clock, no ledger access: the same bytes always classify the same way.
//!
//! Hosted checkout events:
//!
//! | event type                                   | outcome                                |
//! |----------------------------------------------|----------------------------------------|
//! | `checkout.session.completed`, paid           | `Succeeded`                            |
//! | `checkout.session.completed`, anything else  | `Pending` (async payment method)       |
//! | `payment_intent.payment_failed`              | `Failed` (one declined attempt)        |
//! | any other well-formed event                  | ignored                                |
//! | body that is not an event                    | `Failed`, reason `malformed_payload`   |
//!
//! Mobile wallet responses succeed iff the response code is `2001` or the
//! message is `RCS_SUCCESS`; everything else is `Failed`.

use serde::Deserialize;
use serde_json::Value;

use crate::payment_providers::WalletResponse;
use crate::types::OrderId;

pub const WALLET_SUCCESS_CODE: &str = "2001";
pub const WALLET_SUCCESS_MESSAGE: &str = "RCS_SUCCESS";
pub const MALFORMED_PAYLOAD: &str = "malformed_payload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Pending,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Pending => "pending",
        }
    }
}

/// Normalized result of one gateway response or event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResult {
    pub outcome: Outcome,
    /// Gateway transaction identifier, when the payload carries one
    pub transaction_ref: Option<String>,
    /// Why the payment failed (or is still pending)
    pub reason: Option<String>,
}

impl GatewayResult {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed,
            transaction_ref: None,
            reason: Some(reason.into()),
        }
    }
}

/// A hosted checkout event that bears on an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutEventResult {
    pub event_id: Option<String>,
    pub event_type: String,
    /// Checkout session id, the primary correlation key
    pub session_ref: Option<String>,
    /// Order id carried in the event metadata, the fallback correlation key
    pub order_id: Option<OrderId>,
    pub result: GatewayResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutClassification {
    Relevant(CheckoutEventResult),
    /// Well-formed event the pipeline does not act on
    Ignored { event_id: Option<String>, event_type: String },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

fn malformed(event_id: Option<String>, event_type: String) -> CheckoutClassification {
    CheckoutClassification::Relevant(CheckoutEventResult {
        event_id,
        event_type,
        session_ref: None,
        order_id: None,
        result: GatewayResult::failed(MALFORMED_PAYLOAD),
    })
}

fn str_field<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// `metadata.order_id`, falling back to `client_reference_id`
fn order_id_of(object: &Value) -> Option<OrderId> {
    object
        .get("metadata")
        .and_then(|m| str_field(m, "order_id"))
        .or_else(|| str_field(object, "client_reference_id"))
        .and_then(|s| s.parse().ok())
}

/// `payment_intent` is either an id or an expanded object
fn payment_intent_of(object: &Value) -> Option<String> {
    match object.get("payment_intent") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(expanded @ Value::Object(_)) => str_field(expanded, "id").map(str::to_string),
        _ => None,
    }
}

/// Classify a verified hosted checkout webhook body.
pub fn classify_checkout_event(body: &[u8]) -> CheckoutClassification {
    let event: RawEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(_) => return malformed(None, String::new()),
    };
    let object = &event.data.object;

    let session_result = |result: GatewayResult| -> CheckoutClassification {
        match str_field(object, "id") {
            Some(session_id) => CheckoutClassification::Relevant(CheckoutEventResult {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                session_ref: Some(session_id.to_string()),
                order_id: order_id_of(object),
                result,
            }),
            None => malformed(event.id.clone(), event.event_type.clone()),
        }
    };

    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let payment_status = str_field(object, "payment_status");
            let outcome = if payment_status == Some("paid") {
                Outcome::Succeeded
            } else {
                Outcome::Pending
            };
            session_result(GatewayResult {
                outcome,
                transaction_ref: payment_intent_of(object),
                reason: (outcome == Outcome::Pending).then(|| format!("payment_status={}", payment_status.unwrap_or("missing"))),
            })
        }
        "payment_intent.payment_failed" => {
            let reason = object
                .get("last_payment_error")
                .and_then(|e| str_field(e, "message"))
                .unwrap_or("payment_failed")
                .to_string();
            CheckoutClassification::Relevant(CheckoutEventResult {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                session_ref: None,
                order_id: order_id_of(object),
                result: GatewayResult {
                    outcome: Outcome::Failed,
                    transaction_ref: str_field(object, "id").map(str::to_string),
                    reason: Some(reason),
                },
            })
        }
        _ => CheckoutClassification::Ignored {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
        },
    }
}

/// Classify a synchronous mobile wallet response.
pub fn classify_wallet_response(response: &WalletResponse) -> GatewayResult {
    let succeeded = response.response_code.as_deref() == Some(WALLET_SUCCESS_CODE)
        || response.response_msg.as_deref() == Some(WALLET_SUCCESS_MESSAGE);

    let transaction_ref = response
        .transaction_id
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| response.reference_id.clone().filter(|s| !s.is_empty()));

    if succeeded {
        GatewayResult {
            outcome: Outcome::Succeeded,
            transaction_ref,
            reason: None,
        }
    } else {
        GatewayResult {
            outcome: Outcome::Failed,
            transaction_ref,
            reason: Some(format!(
                "{}: {}",
                response.response_code.as_deref().unwrap_or("no_code"),
                response.response_msg.as_deref().unwrap_or("no_message")
            )),
        }
    }
}
