use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::status::{PaymentMethod, PaymentStatus};
use crate::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub payment_reference: String,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub gateway_transaction_id: String,
    /// Status the gateway reports synchronously; usually INITIATED, with
    /// the rest arriving later as webhook events.
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub payment_reference: String,
    pub refund_reference: String,
    pub gateway_transaction_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundDecision {
    Succeeded { gateway_refund_id: String },
    Declined { reason: String },
}

/// Transport-level failures. The call may or may not have reached the
/// gateway, so the caller retries with the same reference.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway timed out")]
    Timeout,
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

impl From<GatewayError> for CoreError {
    fn from(err: GatewayError) -> Self {
        CoreError::External(err.to_string())
    }
}

/// Port to whichever payment provider the deployment uses. Both calls must
/// be idempotent on the reference they carry.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Start collecting money for a payment
    async fn initiate(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;

    /// Return money for a captured payment
    async fn refund(&self, request: &RefundRequest) -> Result<RefundDecision, GatewayError>;
}

/// In-process gateway for tests and local runs. References listed in
/// `fail_references` time out; refund references in `decline_references`
/// are declined. While `offline`, every call is unavailable.
#[derive(Default)]
pub struct MockPaymentGateway {
    offline: AtomicBool,
    fail_references: Mutex<HashSet<String>>,
    decline_references: Mutex<HashSet<String>>,
    refund_calls: Mutex<Vec<String>>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with_timeout(&self, reference: &str) {
        if let Ok(mut refs) = self.fail_references.lock() {
            refs.insert(reference.to_string());
        }
    }

    pub fn recover(&self, reference: &str) {
        if let Ok(mut refs) = self.fail_references.lock() {
            refs.remove(reference);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn decline_refund(&self, refund_reference: &str) {
        if let Ok(mut refs) = self.decline_references.lock() {
            refs.insert(refund_reference.to_string());
        }
    }

    /// Refund references sent to the gateway, in call order.
    pub fn refund_calls(&self) -> Vec<String> {
        self.refund_calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn is_failing(&self, reference: &str) -> bool {
        self.fail_references
            .lock()
            .map(|refs| refs.contains(reference))
            .unwrap_or(false)
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn initiate(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("mock gateway offline".to_string()));
        }
        if self.is_failing(&request.payment_reference) {
            return Err(GatewayError::Timeout);
        }
        Ok(ChargeReceipt {
            gateway_transaction_id: format!("mock_txn_{}", request.payment_reference),
            status: PaymentStatus::Initiated,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundDecision, GatewayError> {
        if let Ok(mut calls) = self.refund_calls.lock() {
            calls.push(request.refund_reference.clone());
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("mock gateway offline".to_string()));
        }
        if self.is_failing(&request.refund_reference) {
            return Err(GatewayError::Timeout);
        }
        let declined = self
            .decline_references
            .lock()
            .map(|refs| refs.contains(&request.refund_reference))
            .unwrap_or(false);
        if declined {
            return Ok(RefundDecision::Declined {
                reason: "insufficient merchant balance".to_string(),
            });
        }
        Ok(RefundDecision::Succeeded {
            gateway_refund_id: format!("mock_rfnd_{}", request.refund_reference),
        })
    }
}
