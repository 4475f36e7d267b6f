use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mandi_core::{CoreError, CoreResult};
use mandi_finance::{Payment, PaymentFees, PaymentRefund, PaymentRepository};
use mandi_shared::Masked;
use rust_decimal::Decimal;
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::database::{parse_column, storage_error, DbClient};

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    payment_reference: String,
    payment_type: String,
    method: String,
    method_details: Option<String>,
    status: String,
    amount: Decimal,
    currency: String,
    gateway_fee: Decimal,
    processing_fee: Decimal,
    convenience_fee: Decimal,
    total_fees: Decimal,
    net_amount: Decimal,
    refundable_amount: Decimal,
    refunded_amount: Decimal,
    gateway_transaction_id: Option<String>,
    failure_reason: Option<String>,
    version: i64,
    initiated_at: Option<DateTime<Utc>>,
    authorized_at: Option<DateTime<Utc>>,
    captured_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct RefundRow {
    id: Uuid,
    payment_id: Uuid,
    order_id: Uuid,
    refund_reference: String,
    amount: Decimal,
    reason: String,
    status: String,
    gateway_refund_id: Option<String>,
    failure_reason: Option<String>,
    requested_by: Option<Uuid>,
    approved_by: Option<Uuid>,
    requested_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

const PAYMENT_COLUMNS: &str = "id, order_id, payment_reference, payment_type, method, method_details, status, \
     amount, currency, gateway_fee, processing_fee, convenience_fee, total_fees, net_amount, refundable_amount, \
     refunded_amount, gateway_transaction_id, failure_reason, version, initiated_at, authorized_at, captured_at, \
     settled_at, created_at, updated_at";

impl RefundRow {
    fn into_refund(self) -> CoreResult<PaymentRefund> {
        Ok(PaymentRefund {
            id: self.id,
            payment_id: self.payment_id,
            order_id: self.order_id,
            refund_reference: self.refund_reference,
            amount: self.amount,
            reason: self.reason,
            status: parse_column(&self.status)?,
            gateway_refund_id: self.gateway_refund_id,
            failure_reason: self.failure_reason,
            requested_by: self.requested_by,
            approved_by: self.approved_by,
            requested_at: self.requested_at,
            approved_at: self.approved_at,
            processed_at: self.processed_at,
            updated_at: self.updated_at,
        })
    }
}

impl PaymentRow {
    fn into_payment(self, refunds: Vec<PaymentRefund>) -> CoreResult<Payment> {
        Ok(Payment {
            id: self.id,
            order_id: self.order_id,
            payment_reference: self.payment_reference,
            payment_type: parse_column(&self.payment_type)?,
            method: parse_column(&self.method)?,
            method_details: self.method_details.map(Masked::new),
            status: parse_column(&self.status)?,
            amount: self.amount,
            currency: self.currency,
            fees: PaymentFees {
                gateway_fee: self.gateway_fee,
                processing_fee: self.processing_fee,
                convenience_fee: self.convenience_fee,
            },
            total_fees: self.total_fees,
            net_amount: self.net_amount,
            refundable_amount: self.refundable_amount,
            refunded_amount: self.refunded_amount,
            gateway_transaction_id: self.gateway_transaction_id,
            failure_reason: self.failure_reason,
            refunds,
            version: self.version,
            initiated_at: self.initiated_at,
            authorized_at: self.authorized_at,
            captured_at: self.captured_at,
            settled_at: self.settled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Payments with their refunds; the refund rows share the payment's
/// version check.
pub struct PgPaymentRepository {
    db: DbClient,
}

impl PgPaymentRepository {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    async fn load(&self, row: PaymentRow) -> CoreResult<Payment> {
        let refunds = sqlx::query_as::<_, RefundRow>(
            r#"
            SELECT id, payment_id, order_id, refund_reference, amount, reason, status, gateway_refund_id,
                   failure_reason, requested_by, approved_by, requested_at, approved_at, processed_at, updated_at
            FROM payment_refunds WHERE payment_id = $1 ORDER BY requested_at, refund_reference
            "#,
        )
        .bind(row.id)
        .fetch_all(&self.db.pool)
        .await
        .map_err(|e| storage_error("payment", row.id, e))?
        .into_iter()
        .map(RefundRow::into_refund)
        .collect::<CoreResult<Vec<_>>>()?;

        row.into_payment(refunds)
    }

    async fn hydrate(&self, row: Option<PaymentRow>) -> CoreResult<Option<Payment>> {
        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn write_refunds(tx: &mut Transaction<'_, Postgres>, payment: &Payment) -> Result<(), sqlx::Error> {
        for refund in &payment.refunds {
            sqlx::query(
                r#"
                INSERT INTO payment_refunds (id, payment_id, order_id, refund_reference, amount, reason, status,
                    gateway_refund_id, failure_reason, requested_by, approved_by, requested_at, approved_at,
                    processed_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    gateway_refund_id = EXCLUDED.gateway_refund_id,
                    failure_reason = EXCLUDED.failure_reason,
                    approved_by = EXCLUDED.approved_by,
                    approved_at = EXCLUDED.approved_at,
                    processed_at = EXCLUDED.processed_at,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(refund.id)
            .bind(refund.payment_id)
            .bind(refund.order_id)
            .bind(&refund.refund_reference)
            .bind(refund.amount)
            .bind(&refund.reason)
            .bind(refund.status.as_str())
            .bind(&refund.gateway_refund_id)
            .bind(&refund.failure_reason)
            .bind(refund.requested_by)
            .bind(refund.approved_by)
            .bind(refund.requested_at)
            .bind(refund.approved_at)
            .bind(refund.processed_at)
            .bind(refund.updated_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentRepository for PgPaymentRepository {
    async fn insert(&self, payment: &Payment) -> CoreResult<()> {
        let result: Result<(), sqlx::Error> = async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO payments (id, order_id, payment_reference, payment_type, method, method_details, status,
                    amount, currency, gateway_fee, processing_fee, convenience_fee, total_fees, net_amount,
                    refundable_amount, refunded_amount, gateway_transaction_id, failure_reason, version,
                    initiated_at, authorized_at, captured_at, settled_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19,
                    $20, $21, $22, $23, $24, $25)
                "#,
            )
            .bind(payment.id)
            .bind(payment.order_id)
            .bind(&payment.payment_reference)
            .bind(payment.payment_type.as_str())
            .bind(payment.method.as_str())
            .bind(payment.method_details.as_ref().map(|d| d.expose().clone()))
            .bind(payment.status.as_str())
            .bind(payment.amount)
            .bind(&payment.currency)
            .bind(payment.fees.gateway_fee)
            .bind(payment.fees.processing_fee)
            .bind(payment.fees.convenience_fee)
            .bind(payment.total_fees)
            .bind(payment.net_amount)
            .bind(payment.refundable_amount)
            .bind(payment.refunded_amount)
            .bind(&payment.gateway_transaction_id)
            .bind(&payment.failure_reason)
            .bind(payment.version)
            .bind(payment.initiated_at)
            .bind(payment.authorized_at)
            .bind(payment.captured_at)
            .bind(payment.settled_at)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .execute(&mut *tx)
            .await?;
            Self::write_refunds(&mut tx, payment).await?;
            tx.commit().await
        }
        .await;
        result.map_err(|e| storage_error("payment", &payment.payment_reference, e))
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(|e| storage_error("payment", id, e))?;
        self.hydrate(row).await
    }

    async fn get_by_reference(&self, reference: &str) -> CoreResult<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE payment_reference = $1",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(|e| storage_error("payment", reference, e))?;
        self.hydrate(row).await
    }

    async fn save(&self, payment: &Payment, expected_version: i64) -> CoreResult<()> {
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("payment", payment.id, e))?;

        let updated = sqlx::query(
            r#"
            UPDATE payments SET status = $1, gateway_fee = $2, processing_fee = $3, convenience_fee = $4,
                total_fees = $5, net_amount = $6, refundable_amount = $7, refunded_amount = $8,
                gateway_transaction_id = $9, failure_reason = $10, version = $11, initiated_at = $12,
                authorized_at = $13, captured_at = $14, settled_at = $15, updated_at = $16
            WHERE id = $17 AND version = $18
            "#,
        )
        .bind(payment.status.as_str())
        .bind(payment.fees.gateway_fee)
        .bind(payment.fees.processing_fee)
        .bind(payment.fees.convenience_fee)
        .bind(payment.total_fees)
        .bind(payment.net_amount)
        .bind(payment.refundable_amount)
        .bind(payment.refunded_amount)
        .bind(&payment.gateway_transaction_id)
        .bind(&payment.failure_reason)
        .bind(payment.version)
        .bind(payment.initiated_at)
        .bind(payment.authorized_at)
        .bind(payment.captured_at)
        .bind(payment.settled_at)
        .bind(payment.updated_at)
        .bind(payment.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("payment", payment.id, e))?;

        if updated.rows_affected() == 0 {
            return Err(CoreError::conflict("payment", payment.id));
        }

        Self::write_refunds(&mut tx, payment)
            .await
            .map_err(|e| storage_error("refund", &payment.payment_reference, e))?;
        tx.commit().await.map_err(|e| storage_error("payment", payment.id, e))
    }

    async fn list_by_order(&self, order_id: Uuid) -> CoreResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE order_id = $1 ORDER BY created_at",
            PAYMENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.db.pool)
        .await
        .map_err(|e| storage_error("payment", order_id, e))?;

        let mut payments = Vec::with_capacity(rows.len());
        for row in rows {
            payments.push(self.load(row).await?);
        }
        Ok(payments)
    }
}
