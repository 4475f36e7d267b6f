use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mandi_core::money::LineDiscount;
use mandi_core::{CoreError, CoreResult};
use mandi_order::models::ApplicationKind;
use mandi_order::{Order, OrderItem, OrderRepository, PaymentApplication};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::database::{from_quantity, parse_column, storage_error, to_quantity, DbClient};

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    buyer_id: Uuid,
    company_id: Option<Uuid>,
    vendor_id: Option<Uuid>,
    status: String,
    fulfillment_status: String,
    payment_status: String,
    subtotal: Decimal,
    tax_amount: Decimal,
    shipping_amount: Decimal,
    discount_amount: Decimal,
    total_amount: Decimal,
    currency: String,
    exchange_rate: Decimal,
    paid_amount: Decimal,
    outstanding_amount: Decimal,
    notes: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    vendor_id: Option<Uuid>,
    product_name: String,
    sku: Option<String>,
    unit_price: Decimal,
    quantity_ordered: i32,
    quantity_shipped: i32,
    quantity_delivered: i32,
    quantity_cancelled: i32,
    quantity_returned: i32,
    discounts: Json<Vec<LineDiscount>>,
    discount_amount: Decimal,
    tax_rate: Decimal,
    tax_inclusive: bool,
    tax_amount: Decimal,
    total_price: Decimal,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ApplicationRow {
    reference: String,
    payment_id: Uuid,
    kind: String,
    amount: Decimal,
    applied_at: DateTime<Utc>,
}

const ORDER_COLUMNS: &str = "id, order_number, buyer_id, company_id, vendor_id, status, fulfillment_status, \
     payment_status, subtotal, tax_amount, shipping_amount, discount_amount, total_amount, currency, \
     exchange_rate, paid_amount, outstanding_amount, notes, version, created_at, updated_at";

fn kind_str(kind: ApplicationKind) -> &'static str {
    match kind {
        ApplicationKind::Capture => "CAPTURE",
        ApplicationKind::Refund => "REFUND",
    }
}

fn parse_kind(value: &str) -> CoreResult<ApplicationKind> {
    match value {
        "CAPTURE" => Ok(ApplicationKind::Capture),
        "REFUND" => Ok(ApplicationKind::Refund),
        other => Err(CoreError::Storage(format!("unknown payment application kind {}", other))),
    }
}

impl OrderItemRow {
    fn into_item(self) -> CoreResult<OrderItem> {
        Ok(OrderItem {
            id: self.id,
            order_id: self.order_id,
            product_id: self.product_id,
            vendor_id: self.vendor_id,
            product_name: self.product_name,
            sku: self.sku,
            unit_price: self.unit_price,
            quantity_ordered: to_quantity(self.quantity_ordered, "quantity_ordered")?,
            quantity_shipped: to_quantity(self.quantity_shipped, "quantity_shipped")?,
            quantity_delivered: to_quantity(self.quantity_delivered, "quantity_delivered")?,
            quantity_cancelled: to_quantity(self.quantity_cancelled, "quantity_cancelled")?,
            quantity_returned: to_quantity(self.quantity_returned, "quantity_returned")?,
            discounts: self.discounts.0,
            discount_amount: self.discount_amount,
            tax_rate: self.tax_rate,
            tax_inclusive: self.tax_inclusive,
            tax_amount: self.tax_amount,
            total_price: self.total_price,
            status: parse_column(&self.status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>, payments: Vec<PaymentApplication>) -> CoreResult<Order> {
        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            buyer_id: self.buyer_id,
            company_id: self.company_id,
            vendor_id: self.vendor_id,
            status: parse_column(&self.status)?,
            fulfillment_status: parse_column(&self.fulfillment_status)?,
            payment_status: parse_column(&self.payment_status)?,
            items,
            subtotal: self.subtotal,
            tax_amount: self.tax_amount,
            shipping_amount: self.shipping_amount,
            discount_amount: self.discount_amount,
            total_amount: self.total_amount,
            currency: self.currency,
            exchange_rate: self.exchange_rate,
            paid_amount: self.paid_amount,
            outstanding_amount: self.outstanding_amount,
            payments,
            notes: self.notes,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Orders, their lines and their payment ledger, written together in one
/// transaction.
pub struct PgOrderRepository {
    db: DbClient,
}

impl PgOrderRepository {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    async fn load(&self, row: OrderRow) -> CoreResult<Order> {
        let items = sqlx::query_as::<_, OrderItemRow>(
            r#"
            SELECT id, order_id, product_id, vendor_id, product_name, sku, unit_price,
                   quantity_ordered, quantity_shipped, quantity_delivered, quantity_cancelled,
                   quantity_returned, discounts, discount_amount, tax_rate, tax_inclusive,
                   tax_amount, total_price, status, created_at, updated_at
            FROM order_items WHERE order_id = $1 ORDER BY position
            "#,
        )
        .bind(row.id)
        .fetch_all(&self.db.pool)
        .await
        .map_err(|e| storage_error("order", row.id, e))?
        .into_iter()
        .map(OrderItemRow::into_item)
        .collect::<CoreResult<Vec<_>>>()?;

        let payments = sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT reference, payment_id, kind, amount, applied_at
            FROM order_payment_applications WHERE order_id = $1 ORDER BY applied_at, reference
            "#,
        )
        .bind(row.id)
        .fetch_all(&self.db.pool)
        .await
        .map_err(|e| storage_error("order", row.id, e))?
        .into_iter()
        .map(|a| -> CoreResult<PaymentApplication> {
            Ok(PaymentApplication {
                kind: parse_kind(&a.kind)?,
                reference: a.reference,
                payment_id: a.payment_id,
                amount: a.amount,
                applied_at: a.applied_at,
            })
        })
        .collect::<CoreResult<Vec<_>>>()?;

        row.into_order(items, payments)
    }

    async fn write_children(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<(), sqlx::Error> {
        for (position, item) in order.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, position, product_id, vendor_id, product_name, sku,
                    unit_price, quantity_ordered, quantity_shipped, quantity_delivered, quantity_cancelled,
                    quantity_returned, discounts, discount_amount, tax_rate, tax_inclusive, tax_amount,
                    total_price, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
                ON CONFLICT (id) DO UPDATE SET
                    quantity_shipped = EXCLUDED.quantity_shipped,
                    quantity_delivered = EXCLUDED.quantity_delivered,
                    quantity_cancelled = EXCLUDED.quantity_cancelled,
                    quantity_returned = EXCLUDED.quantity_returned,
                    discounts = EXCLUDED.discounts,
                    discount_amount = EXCLUDED.discount_amount,
                    tax_amount = EXCLUDED.tax_amount,
                    total_price = EXCLUDED.total_price,
                    status = EXCLUDED.status,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(item.id)
            .bind(order.id)
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .bind(item.product_id)
            .bind(item.vendor_id)
            .bind(&item.product_name)
            .bind(&item.sku)
            .bind(item.unit_price)
            .bind(from_quantity(item.quantity_ordered, "quantity_ordered")?)
            .bind(from_quantity(item.quantity_shipped, "quantity_shipped")?)
            .bind(from_quantity(item.quantity_delivered, "quantity_delivered")?)
            .bind(from_quantity(item.quantity_cancelled, "quantity_cancelled")?)
            .bind(from_quantity(item.quantity_returned, "quantity_returned")?)
            .bind(Json(&item.discounts))
            .bind(item.discount_amount)
            .bind(item.tax_rate)
            .bind(item.tax_inclusive)
            .bind(item.tax_amount)
            .bind(item.total_price)
            .bind(item.status.as_str())
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(&mut **tx)
            .await?;
        }

        // Ledger rows are immutable once written.
        for application in &order.payments {
            sqlx::query(
                r#"
                INSERT INTO order_payment_applications (order_id, reference, payment_id, kind, amount, applied_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (order_id, reference) DO NOTHING
                "#,
            )
            .bind(order.id)
            .bind(&application.reference)
            .bind(application.payment_id)
            .bind(kind_str(application.kind))
            .bind(application.amount)
            .bind(application.applied_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn insert(&self, order: &Order) -> CoreResult<()> {
        let result: Result<(), sqlx::Error> = async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO orders (id, order_number, buyer_id, company_id, vendor_id, status, fulfillment_status,
                    payment_status, subtotal, tax_amount, shipping_amount, discount_amount, total_amount, currency,
                    exchange_rate, paid_amount, outstanding_amount, notes, version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
                "#,
            )
            .bind(order.id)
            .bind(&order.order_number)
            .bind(order.buyer_id)
            .bind(order.company_id)
            .bind(order.vendor_id)
            .bind(order.status.as_str())
            .bind(order.fulfillment_status.as_str())
            .bind(order.payment_status.as_str())
            .bind(order.subtotal)
            .bind(order.tax_amount)
            .bind(order.shipping_amount)
            .bind(order.discount_amount)
            .bind(order.total_amount)
            .bind(&order.currency)
            .bind(order.exchange_rate)
            .bind(order.paid_amount)
            .bind(order.outstanding_amount)
            .bind(&order.notes)
            .bind(order.version)
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&mut *tx)
            .await?;
            Self::write_children(&mut tx, order).await?;
            tx.commit().await
        }
        .await;
        result.map_err(|e| storage_error("order", order.id, e))
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(|e| storage_error("order", id, e))?;
        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn save(&self, order: &Order, expected_version: i64) -> CoreResult<()> {
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("order", order.id, e))?;

        let updated = sqlx::query(
            r#"
            UPDATE orders SET status = $1, fulfillment_status = $2, payment_status = $3, subtotal = $4,
                tax_amount = $5, shipping_amount = $6, discount_amount = $7, total_amount = $8,
                paid_amount = $9, outstanding_amount = $10, notes = $11, version = $12, updated_at = $13
            WHERE id = $14 AND version = $15
            "#,
        )
        .bind(order.status.as_str())
        .bind(order.fulfillment_status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.subtotal)
        .bind(order.tax_amount)
        .bind(order.shipping_amount)
        .bind(order.discount_amount)
        .bind(order.total_amount)
        .bind(order.paid_amount)
        .bind(order.outstanding_amount)
        .bind(&order.notes)
        .bind(order.version)
        .bind(order.updated_at)
        .bind(order.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("order", order.id, e))?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls it back.
            return Err(CoreError::conflict("order", order.id));
        }

        Self::write_children(&mut tx, order)
            .await
            .map_err(|e| storage_error("order", order.id, e))?;
        tx.commit().await.map_err(|e| storage_error("order", order.id, e))
    }

    async fn list_by_buyer(&self, buyer_id: Uuid) -> CoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE buyer_id = $1 ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .bind(buyer_id)
        .fetch_all(&self.db.pool)
        .await
        .map_err(|e| storage_error("order", buyer_id, e))?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            orders.push(self.load(row).await?);
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_kind_columns() {
        for kind in [ApplicationKind::Capture, ApplicationKind::Refund] {
            assert_eq!(parse_kind(kind_str(kind)).unwrap(), kind);
        }
        assert!(matches!(parse_kind("BOGUS"), Err(CoreError::Storage(_))));
    }
}
