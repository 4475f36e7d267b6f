use chrono::{DateTime, Duration, NaiveDate, Utc};
use mandi_core::money::{jurisdiction_for, max_amount, split_inclusive_tax, split_tax, TaxSplit};
use mandi_core::status::{InvoiceStatus, InvoiceType, RefundStatus};
use mandi_core::{ensure_transition, CoreError, ValidationError};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{Invoice, InvoiceSource, Payment, SubscriptionCharge, TaxContext};

#[derive(Debug, thiserror::Error)]
pub enum InvoiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Cannot invoice {source_kind} {id}: {reason}")]
    NotInvoiceable {
        source_kind: &'static str,
        id: Uuid,
        reason: String,
    },
}

impl From<InvoiceError> for CoreError {
    fn from(err: InvoiceError) -> Self {
        match err {
            InvoiceError::Validation(v) => CoreError::Validation(v),
            InvoiceError::NotInvoiceable { source_kind, id, reason } => {
                CoreError::Validation(ValidationError::GuardFailed {
                    to: "invoice".to_string(),
                    reason: format!("{} {}: {}", source_kind, id, reason),
                })
            }
        }
    }
}

/// Builds GST invoices and credit notes. Pure: persistence and the
/// one-invoice-per-source rule live with the caller.
#[derive(Debug, Clone, Copy)]
pub struct InvoiceGenerator {
    payment_terms_days: i64,
}

struct Draft<'a> {
    source: InvoiceSource,
    invoice_type: InvoiceType,
    status: InvoiceStatus,
    amount: Decimal,
    currency: &'a str,
    order_id: Option<Uuid>,
    company_id: Option<Uuid>,
    description: String,
    due_date: Option<NaiveDate>,
    paid_at: Option<DateTime<Utc>>,
}

impl InvoiceGenerator {
    pub fn new(payment_terms_days: i64) -> Self {
        Self { payment_terms_days }
    }

    /// Tax invoice for money already collected. Issued as PAID.
    pub fn for_payment(
        &self,
        payment: &Payment,
        tax: &TaxContext,
        company_id: Option<Uuid>,
    ) -> Result<Invoice, InvoiceError> {
        if !payment.status.is_collected() {
            return Err(InvoiceError::NotInvoiceable {
                source_kind: "payment",
                id: payment.id,
                reason: format!("status is {}", payment.status),
            });
        }
        self.build(
            Draft {
                source: InvoiceSource::Payment(payment.id),
                invoice_type: InvoiceType::Standard,
                status: InvoiceStatus::Paid,
                amount: payment.amount,
                currency: &payment.currency,
                order_id: Some(payment.order_id),
                company_id,
                description: format!("Payment {}", payment.payment_reference),
                due_date: None,
                paid_at: payment.captured_at.or(Some(Utc::now())),
            },
            tax,
        )
    }

    /// Credit note for a completed refund.
    pub fn for_refund(
        &self,
        payment: &Payment,
        refund_id: Uuid,
        tax: &TaxContext,
        company_id: Option<Uuid>,
    ) -> Result<Invoice, InvoiceError> {
        let refund = payment
            .refunds
            .iter()
            .find(|r| r.id == refund_id)
            .ok_or_else(|| InvoiceError::NotInvoiceable {
                source_kind: "refund",
                id: refund_id,
                reason: format!("not part of payment {}", payment.payment_reference),
            })?;
        if refund.status != RefundStatus::Completed {
            return Err(InvoiceError::NotInvoiceable {
                source_kind: "refund",
                id: refund_id,
                reason: format!("status is {}", refund.status),
            });
        }
        self.build(
            Draft {
                source: InvoiceSource::Refund(refund.id),
                invoice_type: InvoiceType::Refund,
                status: InvoiceStatus::Paid,
                amount: refund.amount,
                currency: &payment.currency,
                order_id: Some(payment.order_id),
                company_id,
                description: format!("Credit note for refund {}", refund.refund_reference),
                due_date: None,
                paid_at: refund.processed_at,
            },
            tax,
        )
    }

    /// Invoice for one subscription billing cycle, due after the payment
    /// terms.
    pub fn for_subscription(&self, charge: &SubscriptionCharge, tax: &TaxContext) -> Result<Invoice, InvoiceError> {
        if charge.period_end < charge.period_start {
            return Err(ValidationError::Invalid(format!(
                "billing period ends {} before it starts {}",
                charge.period_end, charge.period_start
            ))
            .into());
        }
        let issue_date = Utc::now().date_naive();
        self.build(
            Draft {
                source: InvoiceSource::Subscription(charge.billing_event_id),
                invoice_type: InvoiceType::Standard,
                status: InvoiceStatus::Sent,
                amount: charge.amount,
                currency: &charge.currency,
                order_id: None,
                company_id: Some(charge.company_id),
                description: format!(
                    "{} subscription {} to {}",
                    charge.plan_name, charge.period_start, charge.period_end
                ),
                due_date: Some(issue_date + Duration::days(self.payment_terms_days)),
                paid_at: None,
            },
            tax,
        )
    }

    fn build(&self, draft: Draft<'_>, tax: &TaxContext) -> Result<Invoice, InvoiceError> {
        if draft.amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidAmount(format!("invoice amount {} must be positive", draft.amount)).into());
        }
        if draft.amount > max_amount() {
            return Err(ValidationError::InvalidAmount(format!("invoice amount {} exceeds the limit", draft.amount)).into());
        }
        if tax.gst_rate < Decimal::ZERO || tax.gst_rate > Decimal::ONE_HUNDRED {
            return Err(ValidationError::InvalidAmount(format!("GST rate {}% is out of range", tax.gst_rate)).into());
        }
        let jurisdiction = jurisdiction_for(&tax.vendor_state, &tax.buyer_state)?;
        let rates = tax.rates();
        let (subtotal, split): (Decimal, TaxSplit) = if tax.amount_includes_tax {
            split_inclusive_tax(draft.amount, &rates, jurisdiction)
        } else {
            (draft.amount, split_tax(draft.amount, &rates, jurisdiction))
        };
        let total_tax = split.total();

        let now = Utc::now();
        let id = Uuid::new_v4();
        Ok(Invoice {
            id,
            invoice_number: Self::invoice_number(draft.invoice_type, &id, now),
            invoice_type: draft.invoice_type,
            status: draft.status,
            source: draft.source,
            order_id: draft.order_id,
            company_id: draft.company_id,
            description: draft.description,
            vendor_state: tax.vendor_state.trim().to_uppercase(),
            buyer_state: tax.buyer_state.trim().to_uppercase(),
            jurisdiction,
            subtotal,
            cgst_rate: split.cgst_rate,
            cgst_amount: split.cgst,
            sgst_rate: split.sgst_rate,
            sgst_amount: split.sgst,
            igst_rate: split.igst_rate,
            igst_amount: split.igst,
            total_tax,
            total_amount: subtotal + total_tax,
            currency: draft.currency.to_string(),
            issue_date: now.date_naive(),
            due_date: draft.due_date,
            paid_at: draft.paid_at,
            created_at: now,
            updated_at: now,
        })
    }

    /// Format: INV-{yyyymmdd}-{short_uuid}, CRN- for credit notes
    fn invoice_number(invoice_type: InvoiceType, id: &Uuid, at: DateTime<Utc>) -> String {
        let prefix = match invoice_type {
            InvoiceType::Standard => "INV",
            InvoiceType::Refund => "CRN",
        };
        let short_id = &id.simple().to_string()[..8];
        format!("{}-{}-{}", prefix, at.format("%Y%m%d"), short_id.to_uppercase())
    }
}

impl Invoice {
    /// Only the status moves after issue; amounts never change.
    pub fn transition(&mut self, next: InvoiceStatus) -> Result<(), InvoiceError> {
        ensure_transition(self.status, next)?;
        let now = Utc::now();
        if next == InvoiceStatus::Paid {
            self.paid_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status == InvoiceStatus::Sent && self.due_date.is_some_and(|due| due < today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RefundRequestInput;
    use crate::payment::tests::captured_payment;
    use mandi_core::money::Jurisdiction;
    use rust_decimal_macros::dec;

    fn tax(vendor: &str, buyer: &str, includes_tax: bool) -> TaxContext {
        TaxContext {
            vendor_state: vendor.to_string(),
            buyer_state: buyer.to_string(),
            gst_rate: dec!(18),
            amount_includes_tax: includes_tax,
        }
    }

    #[test]
    fn test_intra_state_invoice_splits_cgst_sgst() {
        let payment = captured_payment(dec!(1000.00));
        let invoice = InvoiceGenerator::new(30)
            .for_payment(&payment, &tax("27", "27", false), None)
            .unwrap();

        assert!(invoice.invoice_number.starts_with("INV-"));
        assert_eq!(invoice.jurisdiction, Jurisdiction::IntraState);
        assert_eq!(invoice.cgst_amount, dec!(90.00));
        assert_eq!(invoice.sgst_amount, dec!(90.00));
        assert_eq!(invoice.igst_amount, Decimal::ZERO);
        assert_eq!(invoice.total_amount, dec!(1180.00));
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.source, InvoiceSource::Payment(payment.id));
    }

    #[test]
    fn test_inter_state_invoice_uses_igst() {
        let payment = captured_payment(dec!(1000.00));
        let invoice = InvoiceGenerator::new(30)
            .for_payment(&payment, &tax("27", "29", false), None)
            .unwrap();
        assert_eq!(invoice.igst_amount, dec!(180.00));
        assert_eq!(invoice.cgst_amount + invoice.sgst_amount, Decimal::ZERO);
        assert_eq!(invoice.total_tax, dec!(180.00));
    }

    #[test]
    fn test_tax_inclusive_amount_is_not_grossed_up() {
        let payment = captured_payment(dec!(1180.00));
        let invoice = InvoiceGenerator::new(30)
            .for_payment(&payment, &tax("27", "27", true), None)
            .unwrap();
        assert_eq!(invoice.subtotal, dec!(1000.00));
        assert_eq!(invoice.total_tax, dec!(180.00));
        assert_eq!(invoice.total_amount, dec!(1180.00));
    }

    #[test]
    fn test_uncollected_payment_cannot_be_invoiced() {
        let mut payment = captured_payment(dec!(1000.00));
        payment.status = mandi_core::status::PaymentStatus::Initiated;
        let result = InvoiceGenerator::new(30).for_payment(&payment, &tax("27", "27", false), None);
        assert!(matches!(result, Err(InvoiceError::NotInvoiceable { .. })));
    }

    #[test]
    fn test_credit_note_for_completed_refund() {
        let mut payment = captured_payment(dec!(1000.00));
        let (id, _) = payment
            .request_refund(&RefundRequestInput {
                refund_reference: Some("RFD-1".to_string()),
                amount: dec!(300.00),
                reason: "short shipment".to_string(),
                requested_by: None,
            })
            .unwrap();
        let generator = InvoiceGenerator::new(30);
        assert!(generator.for_refund(&payment, id, &tax("27", "27", false), None).is_err());

        payment.approve_refund(id, None).unwrap();
        payment.begin_refund_processing(id).unwrap();
        payment.complete_refund(id, None).unwrap();

        let note = generator.for_refund(&payment, id, &tax("27", "27", false), None).unwrap();
        assert!(note.invoice_number.starts_with("CRN-"));
        assert_eq!(note.invoice_type, InvoiceType::Refund);
        assert_eq!(note.subtotal, dec!(300.00));
        assert_eq!(note.total_tax, dec!(54.00));
    }

    #[test]
    fn test_subscription_invoice_due_after_terms() {
        let charge = SubscriptionCharge {
            subscription_id: Uuid::new_v4(),
            billing_event_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            plan_name: "Growth".to_string(),
            amount: dec!(4999.00),
            currency: "INR".to_string(),
            period_start: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 9, 30).unwrap(),
        };
        let invoice = InvoiceGenerator::new(15)
            .for_subscription(&charge, &tax("29", "27", false))
            .unwrap();

        assert_eq!(invoice.status, InvoiceStatus::Sent);
        assert_eq!(invoice.due_date, Some(invoice.issue_date + Duration::days(15)));
        assert_eq!(invoice.source, InvoiceSource::Subscription(charge.billing_event_id));
        assert!(invoice.is_overdue(invoice.issue_date + Duration::days(16)));
    }

    #[test]
    fn test_missing_state_code_rejected() {
        let payment = captured_payment(dec!(1000.00));
        let result = InvoiceGenerator::new(30).for_payment(&payment, &tax("", "27", false), None);
        assert!(matches!(result, Err(InvoiceError::Validation(_))));
    }

    #[test]
    fn test_gst_rate_outside_percent_range_rejected() {
        let payment = captured_payment(dec!(1000.00));
        let generator = InvoiceGenerator::new(30);
        for rate in [dec!(-18), dec!(100.01)] {
            let mut context = tax("27", "27", false);
            context.gst_rate = rate;
            let result = generator.for_payment(&payment, &context, None);
            assert!(matches!(
                result,
                Err(InvoiceError::Validation(ValidationError::InvalidAmount(_)))
            ));
        }

        let mut zero_rated = tax("27", "29", false);
        zero_rated.gst_rate = Decimal::ZERO;
        let invoice = generator.for_payment(&payment, &zero_rated, None).unwrap();
        assert_eq!(invoice.total_amount, dec!(1000.00));
    }

    #[test]
    fn test_only_status_moves_after_issue() {
        let payment = captured_payment(dec!(1000.00));
        let mut invoice = InvoiceGenerator::new(30)
            .for_payment(&payment, &tax("27", "27", false), None)
            .unwrap();
        assert!(invoice.transition(InvoiceStatus::Overdue).is_err());
        assert!(invoice.transition(InvoiceStatus::Sent).is_err());
    }
}
