use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mandi_core::money::Jurisdiction;
use mandi_core::{CoreError, CoreResult};
use mandi_finance::{Invoice, InvoiceRepository, InvoiceSource};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::database::{parse_column, storage_error, DbClient};

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: Uuid,
    invoice_number: String,
    invoice_type: String,
    status: String,
    source_kind: String,
    source_id: Uuid,
    order_id: Option<Uuid>,
    company_id: Option<Uuid>,
    description: String,
    vendor_state: String,
    buyer_state: String,
    jurisdiction: String,
    subtotal: Decimal,
    cgst_rate: Decimal,
    cgst_amount: Decimal,
    sgst_rate: Decimal,
    sgst_amount: Decimal,
    igst_rate: Decimal,
    igst_amount: Decimal,
    total_tax: Decimal,
    total_amount: Decimal,
    currency: String,
    issue_date: NaiveDate,
    due_date: Option<NaiveDate>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

const INVOICE_COLUMNS: &str = "id, invoice_number, invoice_type, status, source_kind, source_id, order_id, \
     company_id, description, vendor_state, buyer_state, jurisdiction, subtotal, cgst_rate, cgst_amount, sgst_rate, \
     sgst_amount, igst_rate, igst_amount, total_tax, total_amount, currency, issue_date, due_date, paid_at, \
     created_at, updated_at";

fn jurisdiction_str(jurisdiction: Jurisdiction) -> &'static str {
    match jurisdiction {
        Jurisdiction::IntraState => "INTRA_STATE",
        Jurisdiction::InterState => "INTER_STATE",
    }
}

fn parse_jurisdiction(value: &str) -> CoreResult<Jurisdiction> {
    match value {
        "INTRA_STATE" => Ok(Jurisdiction::IntraState),
        "INTER_STATE" => Ok(Jurisdiction::InterState),
        other => Err(CoreError::Storage(format!("unknown jurisdiction {}", other))),
    }
}

fn parse_source(kind: &str, id: Uuid) -> CoreResult<InvoiceSource> {
    match kind {
        "PAYMENT" => Ok(InvoiceSource::Payment(id)),
        "REFUND" => Ok(InvoiceSource::Refund(id)),
        "SUBSCRIPTION" => Ok(InvoiceSource::Subscription(id)),
        other => Err(CoreError::Storage(format!("unknown invoice source {}", other))),
    }
}

impl InvoiceRow {
    fn into_invoice(self) -> CoreResult<Invoice> {
        Ok(Invoice {
            id: self.id,
            invoice_number: self.invoice_number,
            invoice_type: parse_column(&self.invoice_type)?,
            status: parse_column(&self.status)?,
            source: parse_source(&self.source_kind, self.source_id)?,
            order_id: self.order_id,
            company_id: self.company_id,
            description: self.description,
            vendor_state: self.vendor_state,
            buyer_state: self.buyer_state,
            jurisdiction: parse_jurisdiction(&self.jurisdiction)?,
            subtotal: self.subtotal,
            cgst_rate: self.cgst_rate,
            cgst_amount: self.cgst_amount,
            sgst_rate: self.sgst_rate,
            sgst_amount: self.sgst_amount,
            igst_rate: self.igst_rate,
            igst_amount: self.igst_amount,
            total_tax: self.total_tax,
            total_amount: self.total_amount,
            currency: self.currency,
            issue_date: self.issue_date,
            due_date: self.due_date,
            paid_at: self.paid_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub struct PgInvoiceRepository {
    db: DbClient,
}

impl PgInvoiceRepository {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }
}

#[async_trait]
impl InvoiceRepository for PgInvoiceRepository {
    async fn insert_if_absent(&self, invoice: &Invoice) -> CoreResult<Invoice> {
        // The (source_kind, source_id) unique key turns a racing second
        // insert into a no-op; the winner is read back either way.
        sqlx::query(
            r#"
            INSERT INTO invoices (id, invoice_number, invoice_type, status, source_kind, source_id, order_id,
                company_id, description, vendor_state, buyer_state, jurisdiction, subtotal, cgst_rate, cgst_amount,
                sgst_rate, sgst_amount, igst_rate, igst_amount, total_tax, total_amount, currency, issue_date,
                due_date, paid_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
                $21, $22, $23, $24, $25, $26, $27)
            ON CONFLICT (source_kind, source_id) DO NOTHING
            "#,
        )
        .bind(invoice.id)
        .bind(&invoice.invoice_number)
        .bind(invoice.invoice_type.as_str())
        .bind(invoice.status.as_str())
        .bind(invoice.source.kind())
        .bind(invoice.source.id())
        .bind(invoice.order_id)
        .bind(invoice.company_id)
        .bind(&invoice.description)
        .bind(&invoice.vendor_state)
        .bind(&invoice.buyer_state)
        .bind(jurisdiction_str(invoice.jurisdiction))
        .bind(invoice.subtotal)
        .bind(invoice.cgst_rate)
        .bind(invoice.cgst_amount)
        .bind(invoice.sgst_rate)
        .bind(invoice.sgst_amount)
        .bind(invoice.igst_rate)
        .bind(invoice.igst_amount)
        .bind(invoice.total_tax)
        .bind(invoice.total_amount)
        .bind(&invoice.currency)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(invoice.paid_at)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&self.db.pool)
        .await
        .map_err(|e| storage_error("invoice", &invoice.invoice_number, e))?;

        self.find_by_source(invoice.source)
            .await?
            .ok_or_else(|| CoreError::not_found("invoice", &invoice.invoice_number))
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Invoice>> {
        sqlx::query_as::<_, InvoiceRow>(&format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(|e| storage_error("invoice", id, e))?
            .map(InvoiceRow::into_invoice)
            .transpose()
    }

    async fn find_by_source(&self, source: InvoiceSource) -> CoreResult<Option<Invoice>> {
        sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE source_kind = $1 AND source_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(source.kind())
        .bind(source.id())
        .fetch_optional(&self.db.pool)
        .await
        .map_err(|e| storage_error("invoice", source.id(), e))?
        .map(InvoiceRow::into_invoice)
        .transpose()
    }

    async fn update_status(&self, invoice: &Invoice) -> CoreResult<()> {
        let updated = sqlx::query("UPDATE invoices SET status = $1, paid_at = $2, updated_at = $3 WHERE id = $4")
            .bind(invoice.status.as_str())
            .bind(invoice.paid_at)
            .bind(invoice.updated_at)
            .bind(invoice.id)
            .execute(&self.db.pool)
            .await
            .map_err(|e| storage_error("invoice", invoice.id, e))?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::not_found("invoice", invoice.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_columns_read_back() {
        let id = Uuid::new_v4();
        for source in [
            InvoiceSource::Payment(id),
            InvoiceSource::Refund(id),
            InvoiceSource::Subscription(id),
        ] {
            assert_eq!(parse_source(source.kind(), source.id()).unwrap(), source);
        }
        assert!(parse_source("ORDER", id).is_err());
    }

    #[test]
    fn test_jurisdiction_columns_read_back() {
        for j in [Jurisdiction::IntraState, Jurisdiction::InterState] {
            assert_eq!(parse_jurisdiction(jurisdiction_str(j)).unwrap(), j);
        }
    }
}
