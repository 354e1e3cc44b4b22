//! Hosted checkout webhook ingress.
//!
//! Order of operations for one delivery:
//!
//! 1. verify the signature over the raw body (fail closed, nothing else runs)
//! 2. classify the event
//! 3. locate the order by session reference, then by `metadata.order_id`
//! 4. write the outcome to the ledger and, on success, trigger fulfillment
//!
//! Anything the pipeline cannot act on is acknowledged so the gateway stops
//! redelivering it. Redeliveries of a success are harmless: the trigger is
//! deduplicated per order and the credit compare-and-set runs at most once.

use std::sync::Arc;

use crate::{
    cache::CacheInvalidator,
    db::{ledger::Ledger, models::orders::Order},
    fulfillment::{FulfillmentRequest, FulfillmentTrigger},
    metrics,
    payment_providers::{CheckoutGateway, PaymentError, Result},
    payments::classifier::{CheckoutClassification, CheckoutEventResult, MALFORMED_PAYLOAD, Outcome, classify_checkout_event},
    types::{FulfillmentSource, OrderId, OrderStatus, PaymentPlatform},
};

/// How a verified delivery was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    /// Payment confirmed and fulfillment triggered
    FulfillmentTriggered(OrderId),
    /// A payment attempt was declined. The buyer can retry in the same
    /// session, so the order stays open.
    AttemptDeclined(OrderId),
    /// Payment still settling; the order stays processing
    StillPending(OrderId),
    /// No order matches the event
    Orphaned,
    /// The body verified but is not a usable event
    Malformed,
    /// Event type the pipeline does not act on
    Ignored,
}

impl WebhookAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookAck::FulfillmentTriggered(_) => "fulfillment_triggered",
            WebhookAck::AttemptDeclined(_) => "attempt_declined",
            WebhookAck::StillPending(_) => "pending",
            WebhookAck::Orphaned => "orphaned",
            WebhookAck::Malformed => "malformed",
            WebhookAck::Ignored => "ignored",
        }
    }
}

pub struct WebhookIngress {
    ledger: Arc<dyn Ledger>,
    gateway: Option<Arc<dyn CheckoutGateway>>,
    fulfillment: Arc<dyn FulfillmentTrigger>,
    cache: Arc<dyn CacheInvalidator>,
}

impl WebhookIngress {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateway: Option<Arc<dyn CheckoutGateway>>,
        fulfillment: Arc<dyn FulfillmentTrigger>,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            fulfillment,
            cache,
        }
    }

    /// Handle one webhook delivery.
    ///
    /// Errors are either signature rejections (nothing was read or written)
    /// or storage failures worth a gateway redelivery.
    pub async fn handle(&self, signature: Option<&str>, body: &[u8]) -> Result<WebhookAck> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            tracing::warn!("Checkout webhook received but no checkout gateway is configured");
            PaymentError::ProviderNotConfigured(PaymentPlatform::HostedCheckout)
        })?;

        if let Err(e) = gateway.verify_webhook(signature, body) {
            metrics::record_webhook_event("rejected");
            tracing::warn!(error = %e, "Rejected checkout webhook");
            return Err(e);
        }

        let ack = match classify_checkout_event(body) {
            CheckoutClassification::Ignored { event_id, event_type } => {
                tracing::debug!(?event_id, %event_type, "Ignoring checkout webhook event");
                WebhookAck::Ignored
            }
            CheckoutClassification::Relevant(event) => self.apply(event).await?,
        };

        metrics::record_webhook_event(ack.as_str());
        Ok(ack)
    }

    #[tracing::instrument(skip_all, fields(event_id = ?event.event_id, event_type = %event.event_type, outcome = event.result.outcome.as_str()))]
    async fn apply(&self, event: CheckoutEventResult) -> Result<WebhookAck> {
        if event.result.reason.as_deref() == Some(MALFORMED_PAYLOAD) && event.session_ref.is_none() && event.order_id.is_none() {
            tracing::error!("Verified checkout webhook carries no usable event, acknowledging without action");
            return Ok(WebhookAck::Malformed);
        }

        let Some(order) = self.locate(&event).await? else {
            metrics::record_webhook_orphaned();
            tracing::warn!(
                session_ref = ?event.session_ref,
                metadata_order_id = ?event.order_id,
                "No order matches checkout webhook, acknowledging"
            );
            return Ok(WebhookAck::Orphaned);
        };

        match event.result.outcome {
            Outcome::Succeeded => {
                let order = self.ledger.mark_paid(order.id, event.result.transaction_ref.as_deref()).await?;
                self.cache.order_changed(order.id).await;

                self.fulfillment
                    .trigger(FulfillmentRequest {
                        order_id: order.id,
                        user_id: order.user_id,
                        credits: order.credits,
                        source: FulfillmentSource::Checkout,
                    })
                    .await?;

                tracing::info!(order_id = %order.id, transaction_ref = ?order.external_transaction_ref, "Checkout payment confirmed");
                Ok(WebhookAck::FulfillmentTriggered(order.id))
            }
            Outcome::Failed => {
                let reason = event.result.reason.as_deref().unwrap_or("payment failed");
                if order.status.is_terminal() {
                    tracing::info!(order_id = %order.id, status = %order.status, %reason, "Declined attempt for a settled order, leaving it");
                } else {
                    self.ledger.note_declined_attempt(order.id, reason).await?;
                    self.cache.order_changed(order.id).await;
                    tracing::warn!(order_id = %order.id, %reason, "Checkout payment attempt declined, order stays open for a retry");
                }
                Ok(WebhookAck::AttemptDeclined(order.id))
            }
            Outcome::Pending => {
                if order.status == OrderStatus::Pending
                    && let Some(session_ref) = &event.session_ref
                {
                    self.ledger.mark_session_created(order.id, session_ref).await?;
                    self.cache.order_changed(order.id).await;
                }
                tracing::info!(order_id = %order.id, reason = ?event.result.reason, "Checkout payment still settling");
                Ok(WebhookAck::StillPending(order.id))
            }
        }
    }

    /// Session reference first, then the order id in the event metadata.
    ///
    /// A hit on the fallback means the session reference was never stored
    /// (the initiator lost a race or crashed), so it is back-filled.
    async fn locate(&self, event: &CheckoutEventResult) -> Result<Option<Order>> {
        if let Some(session_ref) = &event.session_ref
            && let Some(order) = self.ledger.find_order_by_session(session_ref).await?
        {
            return Ok(Some(order));
        }

        let Some(order_id) = event.order_id else {
            return Ok(None);
        };
        let Some(order) = self.ledger.get_order(order_id).await? else {
            return Ok(None);
        };

        match &event.session_ref {
            Some(session_ref) if order.external_session_ref.is_none() => {
                tracing::info!(order_id = %order.id, %session_ref, "Back-filling checkout session reference");
                let order = self.ledger.mark_session_created(order.id, session_ref).await?;
                self.cache.order_changed(order.id).await;
                Ok(Some(order))
            }
            _ => Ok(Some(order)),
        }
    }
}
