//! Pure money arithmetic for lines, orders and GST invoices.
//!
//! Every function here is side-effect free. Intermediate values keep full
//! `Decimal` precision; rounding to two places happens once, when a final
//! aggregate field is produced.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::ValidationError;

pub const MONEY_SCALE: u32 = 2;

/// Largest unit count a line may carry; matches the INTEGER quantity columns.
pub const MAX_QUANTITY: u32 = i32::MAX as u32;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Ceiling for any single money input and for a line's gross value.
pub fn max_amount() -> Decimal {
    Decimal::from(1_000_000_000_000_000_i64)
}

fn ensure_within_limit(what: &str, value: Decimal) -> Result<(), ValidationError> {
    if value > max_amount() {
        return Err(ValidationError::InvalidAmount(format!(
            "{} {} exceeds the limit of {}",
            what,
            value,
            max_amount()
        )));
    }
    Ok(())
}

fn checked_sum<I>(what: &str, values: I) -> Result<Decimal, ValidationError>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .ok_or_else(|| ValidationError::InvalidAmount(format!("{} is too large", what)))
}

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Discount attached to a single order line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineDiscount {
    /// Fixed amount for the whole line, prorated when units drop out.
    Flat(Decimal),
    /// Percentage of the line's gross value.
    Percent(Decimal),
}

/// Primitive inputs for one line.
#[derive(Debug, Clone, Copy)]
pub struct LineInput<'a> {
    pub unit_price: Decimal,
    pub quantity_ordered: u32,
    /// Units still billed (ordered minus cancelled minus returned).
    pub billable_quantity: u32,
    pub discounts: &'a [LineDiscount],
    /// Percent, e.g. `18` for 18%.
    pub tax_rate: Decimal,
    pub tax_inclusive: bool,
}

/// Unrounded line figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineTotals {
    pub gross: Decimal,
    pub discount: Decimal,
    /// Value before tax; equals the discounted amount for tax-exclusive pricing.
    pub taxable: Decimal,
    pub tax: Decimal,
    /// `unit_price × billable − discounts`, which already embeds tax when
    /// the price is tax-inclusive.
    pub line_total: Decimal,
}

impl LineTotals {
    pub fn total_price(&self) -> Decimal {
        round_money(self.line_total)
    }

    pub fn tax_amount(&self) -> Decimal {
        round_money(self.tax)
    }

    pub fn discount_amount(&self) -> Decimal {
        round_money(self.discount)
    }
}

pub fn compute_item_total(input: &LineInput<'_>) -> Result<LineTotals, ValidationError> {
    if input.unit_price < Decimal::ZERO {
        return Err(ValidationError::InvalidAmount(format!(
            "unit price {} is negative",
            input.unit_price
        )));
    }
    ensure_within_limit("unit price", input.unit_price)?;
    if input.tax_rate < Decimal::ZERO || input.tax_rate > HUNDRED {
        return Err(ValidationError::InvalidAmount(format!(
            "tax rate {}% is out of range",
            input.tax_rate
        )));
    }
    if input.quantity_ordered == 0 {
        return Err(ValidationError::Invalid("ordered quantity must be positive".to_string()));
    }
    if input.quantity_ordered > MAX_QUANTITY {
        return Err(ValidationError::Invalid(format!(
            "ordered quantity {} exceeds {}",
            input.quantity_ordered, MAX_QUANTITY
        )));
    }
    if input.billable_quantity > input.quantity_ordered {
        return Err(ValidationError::QuantityExceeded {
            operation: "bill",
            requested: input.billable_quantity,
            available: input.quantity_ordered,
        });
    }

    let billable = Decimal::from(input.billable_quantity);
    let gross = input
        .unit_price
        .checked_mul(billable)
        .ok_or_else(|| ValidationError::InvalidAmount("line value is too large".to_string()))?;
    ensure_within_limit("line value", gross)?;
    let share = billable / Decimal::from(input.quantity_ordered);

    let mut discount = Decimal::ZERO;
    for d in input.discounts {
        match *d {
            LineDiscount::Flat(amount) => {
                if amount < Decimal::ZERO {
                    return Err(ValidationError::InvalidAmount(format!(
                        "discount {} is negative",
                        amount
                    )));
                }
                ensure_within_limit("discount", amount)?;
                discount += amount * share;
            }
            LineDiscount::Percent(pct) => {
                if pct < Decimal::ZERO || pct > HUNDRED {
                    return Err(ValidationError::InvalidAmount(format!(
                        "discount {}% is out of range",
                        pct
                    )));
                }
                discount += gross * pct / HUNDRED;
            }
        }
    }

    if discount > gross {
        return Err(ValidationError::InvalidAmount(format!(
            "discounts {} exceed line value {}",
            round_money(discount),
            round_money(gross)
        )));
    }

    let line_total = gross - discount;
    let (taxable, tax) = if input.tax_inclusive {
        let taxable = extract_taxable(line_total, input.tax_rate);
        (taxable, line_total - taxable)
    } else {
        (line_total, line_total * input.tax_rate / HUNDRED)
    };

    Ok(LineTotals {
        gross,
        discount,
        taxable,
        tax,
        line_total,
    })
}

/// Order-level charges that sit outside the lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderCharges {
    pub shipping: Decimal,
    pub discount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub paid: Decimal,
    pub outstanding: Decimal,
}

impl OrderTotals {
    /// Checks the arithmetic identities and sign constraints. A failure here
    /// is a defect in the engine, never a bad request.
    pub fn verify(&self) -> Result<(), String> {
        if self.total != self.subtotal + self.tax + self.shipping - self.discount {
            return Err(format!(
                "total {} != subtotal {} + tax {} + shipping {} - discount {}",
                self.total, self.subtotal, self.tax, self.shipping, self.discount
            ));
        }
        if self.outstanding != self.total - self.paid {
            return Err(format!(
                "outstanding {} != total {} - paid {}",
                self.outstanding, self.total, self.paid
            ));
        }
        for (name, value) in [
            ("subtotal", self.subtotal),
            ("tax", self.tax),
            ("shipping", self.shipping),
            ("discount", self.discount),
            ("total", self.total),
            ("paid", self.paid),
            ("outstanding", self.outstanding),
        ] {
            if value < Decimal::ZERO {
                return Err(format!("{} is negative: {}", name, value));
            }
        }
        Ok(())
    }
}

/// Rolls line totals up into order totals.
///
/// Subtotal and tax are summed unrounded and rounded once each; total is
/// then assembled from the rounded components so the identity
/// `total = subtotal + tax + shipping − discount` holds exactly.
pub fn compute_order_totals(
    lines: &[LineTotals],
    charges: &OrderCharges,
    paid: Decimal,
) -> Result<OrderTotals, ValidationError> {
    ensure_within_limit("shipping", charges.shipping)?;
    ensure_within_limit("order discount", charges.discount)?;

    let subtotal = round_money(checked_sum("subtotal", lines.iter().map(|l| l.taxable))?);
    let tax = round_money(checked_sum("tax", lines.iter().map(|l| l.tax))?);
    let shipping = round_money(charges.shipping);
    let discount = round_money(charges.discount);
    let paid = round_money(paid);
    let total = checked_sum("order total", [subtotal, tax, shipping])? - discount;

    Ok(OrderTotals {
        subtotal,
        tax,
        shipping,
        discount,
        total,
        paid,
        outstanding: total - paid,
    })
}

/// Converts an order-currency amount with the order's exchange-rate multiplier.
pub fn to_base_currency(amount: Decimal, exchange_rate: Decimal) -> Decimal {
    round_money(amount * exchange_rate)
}

/// Pre-tax value contained in a tax-inclusive amount (unrounded).
pub fn extract_taxable(gross: Decimal, rate_percent: Decimal) -> Decimal {
    gross / (Decimal::ONE + rate_percent / HUNDRED)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Jurisdiction {
    /// Vendor and buyer in the same state: CGST + SGST.
    IntraState,
    /// Different states: IGST.
    InterState,
}

/// Decides CGST/SGST vs IGST from the two GST state codes.
pub fn jurisdiction_for(vendor_state: &str, buyer_state: &str) -> Result<Jurisdiction, ValidationError> {
    let vendor = vendor_state.trim();
    let buyer = buyer_state.trim();
    if vendor.is_empty() || buyer.is_empty() {
        return Err(ValidationError::Invalid(
            "vendor and buyer state codes are required for GST".to_string(),
        ));
    }
    if vendor.eq_ignore_ascii_case(buyer) {
        Ok(Jurisdiction::IntraState)
    } else {
        Ok(Jurisdiction::InterState)
    }
}

/// GST rates in percent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GstRates {
    pub cgst: Decimal,
    pub sgst: Decimal,
    pub igst: Decimal,
}

impl GstRates {
    /// Even CGST/SGST halves of a combined rate.
    pub fn from_total(rate: Decimal) -> Self {
        let half = rate / Decimal::TWO;
        Self {
            cgst: half,
            sgst: half,
            igst: rate,
        }
    }

    pub fn combined(&self, jurisdiction: Jurisdiction) -> Decimal {
        match jurisdiction {
            Jurisdiction::IntraState => self.cgst + self.sgst,
            Jurisdiction::InterState => self.igst,
        }
    }
}

impl Default for GstRates {
    fn default() -> Self {
        Self::from_total(Decimal::from(18))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaxSplit {
    pub jurisdiction: Jurisdiction,
    pub cgst_rate: Decimal,
    pub cgst: Decimal,
    pub sgst_rate: Decimal,
    pub sgst: Decimal,
    pub igst_rate: Decimal,
    pub igst: Decimal,
}

impl TaxSplit {
    pub fn total(&self) -> Decimal {
        self.cgst + self.sgst + self.igst
    }
}

/// Splits tax on a tax-exclusive taxable amount.
pub fn split_tax(taxable: Decimal, rates: &GstRates, jurisdiction: Jurisdiction) -> TaxSplit {
    match jurisdiction {
        Jurisdiction::IntraState => TaxSplit {
            jurisdiction,
            cgst_rate: rates.cgst,
            cgst: round_money(taxable * rates.cgst / HUNDRED),
            sgst_rate: rates.sgst,
            sgst: round_money(taxable * rates.sgst / HUNDRED),
            igst_rate: Decimal::ZERO,
            igst: Decimal::ZERO,
        },
        Jurisdiction::InterState => TaxSplit {
            jurisdiction,
            cgst_rate: Decimal::ZERO,
            cgst: Decimal::ZERO,
            sgst_rate: Decimal::ZERO,
            sgst: Decimal::ZERO,
            igst_rate: rates.igst,
            igst: round_money(taxable * rates.igst / HUNDRED),
        },
    }
}

/// Splits a tax-inclusive gross amount into a rounded subtotal and tax
/// components that add back up to the rounded gross exactly. Any rounding
/// residue lands on SGST (intra-state) or IGST (inter-state).
pub fn split_inclusive_tax(gross: Decimal, rates: &GstRates, jurisdiction: Jurisdiction) -> (Decimal, TaxSplit) {
    let gross = round_money(gross);
    let combined = rates.combined(jurisdiction);
    let subtotal = round_money(extract_taxable(gross, combined));
    let tax_total = gross - subtotal;

    let split = match jurisdiction {
        Jurisdiction::IntraState => {
            let cgst = if combined.is_zero() {
                Decimal::ZERO
            } else {
                round_money(tax_total * rates.cgst / combined)
            };
            TaxSplit {
                jurisdiction,
                cgst_rate: rates.cgst,
                cgst,
                sgst_rate: rates.sgst,
                sgst: tax_total - cgst,
                igst_rate: Decimal::ZERO,
                igst: Decimal::ZERO,
            }
        }
        Jurisdiction::InterState => TaxSplit {
            jurisdiction,
            cgst_rate: Decimal::ZERO,
            cgst: Decimal::ZERO,
            sgst_rate: Decimal::ZERO,
            sgst: Decimal::ZERO,
            igst_rate: rates.igst,
            igst: tax_total,
        },
    };

    (subtotal, split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn line(unit_price: Decimal, qty: u32, discounts: &[LineDiscount], tax_rate: Decimal) -> LineTotals {
        compute_item_total(&LineInput {
            unit_price,
            quantity_ordered: qty,
            billable_quantity: qty,
            discounts,
            tax_rate,
            tax_inclusive: false,
        })
        .unwrap()
    }

    #[test]
    fn test_order_totals_scenario() {
        let a = line(dec!(100.00), 3, &[], dec!(6));
        let b = line(dec!(50.00), 2, &[LineDiscount::Flat(dec!(10.00))], Decimal::ZERO);
        assert_eq!(a.total_price(), dec!(300.00));
        assert_eq!(b.total_price(), dec!(90.00));

        let charges = OrderCharges {
            shipping: dec!(20.00),
            discount: dec!(10.00),
        };
        let totals = compute_order_totals(&[a, b], &charges, Decimal::ZERO).unwrap();
        assert_eq!(totals.subtotal, dec!(390.00));
        assert_eq!(totals.tax, dec!(18.00));
        assert_eq!(totals.total, dec!(418.00));
        assert_eq!(totals.outstanding, dec!(418.00));
        totals.verify().unwrap();
    }

    #[test]
    fn test_flat_discount_prorated_over_billable_units() {
        let discounts = [LineDiscount::Flat(dec!(10.00))];
        let totals = compute_item_total(&LineInput {
            unit_price: dec!(50.00),
            quantity_ordered: 2,
            billable_quantity: 1,
            discounts: &discounts,
            tax_rate: Decimal::ZERO,
            tax_inclusive: false,
        })
        .unwrap();
        assert_eq!(totals.total_price(), dec!(45.00));
    }

    #[test]
    fn test_percent_discount() {
        let totals = line(dec!(200.00), 1, &[LineDiscount::Percent(dec!(12.5))], Decimal::ZERO);
        assert_eq!(totals.total_price(), dec!(175.00));
        assert_eq!(totals.discount_amount(), dec!(25.00));
    }

    #[test]
    fn test_tax_inclusive_line_keeps_price() {
        let totals = compute_item_total(&LineInput {
            unit_price: dec!(118.00),
            quantity_ordered: 1,
            billable_quantity: 1,
            discounts: &[],
            tax_rate: dec!(18),
            tax_inclusive: true,
        })
        .unwrap();
        assert_eq!(totals.total_price(), dec!(118.00));
        assert_eq!(round_money(totals.taxable), dec!(100.00));
        assert_eq!(totals.tax_amount(), dec!(18.00));

        let order = compute_order_totals(&[totals], &OrderCharges::default(), Decimal::ZERO).unwrap();
        assert_eq!(order.subtotal, dec!(100.00));
        assert_eq!(order.total, dec!(118.00));
    }

    #[test]
    fn test_discount_larger_than_line_is_rejected() {
        let result = compute_item_total(&LineInput {
            unit_price: dec!(5.00),
            quantity_ordered: 1,
            billable_quantity: 1,
            discounts: &[LineDiscount::Flat(dec!(6.00))],
            tax_rate: Decimal::ZERO,
            tax_inclusive: false,
        });
        assert!(matches!(result, Err(ValidationError::InvalidAmount(_))));
    }

    #[test]
    fn test_rounding_happens_once() {
        // Three lines of 0.333... tax each; rounding per line would give 0.99.
        let lines: Vec<LineTotals> = (0..3)
            .map(|_| line(dec!(3.33333), 1, &[], dec!(10)))
            .collect();
        let totals = compute_order_totals(&lines, &OrderCharges::default(), Decimal::ZERO).unwrap();
        assert_eq!(totals.tax, dec!(1.00));
        totals.verify().unwrap();
    }

    #[test]
    fn test_verify_flags_negative_outstanding() {
        let totals = compute_order_totals(&[line(dec!(10.00), 1, &[], Decimal::ZERO)], &OrderCharges::default(), dec!(15.00)).unwrap();
        assert!(totals.verify().is_err());
    }

    #[test]
    fn test_tax_split_scenario() {
        let rates = GstRates::default();
        let intra = split_tax(dec!(1000.00), &rates, Jurisdiction::IntraState);
        assert_eq!(intra.cgst, dec!(90.00));
        assert_eq!(intra.sgst, dec!(90.00));
        assert_eq!(intra.igst, Decimal::ZERO);

        let inter = split_tax(dec!(1000.00), &rates, Jurisdiction::InterState);
        assert_eq!(inter.igst, dec!(180.00));
        assert_eq!(intra.total(), dec!(180.00));
        assert_eq!(inter.total(), dec!(180.00));
    }

    #[test]
    fn test_jurisdiction_from_state_codes() {
        assert_eq!(jurisdiction_for("27", "27").unwrap(), Jurisdiction::IntraState);
        assert_eq!(jurisdiction_for("mh", " MH ").unwrap(), Jurisdiction::IntraState);
        assert_eq!(jurisdiction_for("27", "29").unwrap(), Jurisdiction::InterState);
        assert!(jurisdiction_for("", "29").is_err());
    }

    #[test]
    fn test_inclusive_split_adds_back_to_gross() {
        let (subtotal, split) = split_inclusive_tax(dec!(100.00), &GstRates::default(), Jurisdiction::IntraState);
        assert_eq!(subtotal, dec!(84.75));
        assert_eq!(subtotal + split.total(), dec!(100.00));
        assert_eq!(split.cgst, dec!(7.63));
        assert_eq!(split.sgst, dec!(7.62));
    }

    #[test]
    fn test_base_currency_conversion() {
        assert_eq!(to_base_currency(dec!(10.00), dec!(83.125)), dec!(831.25));
    }

    #[test]
    fn test_huge_line_value_is_rejected_not_overflowed() {
        let result = compute_item_total(&LineInput {
            unit_price: Decimal::MAX,
            quantity_ordered: 2,
            billable_quantity: 2,
            discounts: &[],
            tax_rate: Decimal::ZERO,
            tax_inclusive: false,
        });
        assert!(matches!(result, Err(ValidationError::InvalidAmount(_))));

        let result = compute_item_total(&LineInput {
            unit_price: dec!(1000000000.00),
            quantity_ordered: 4_000_000,
            billable_quantity: 4_000_000,
            discounts: &[],
            tax_rate: Decimal::ZERO,
            tax_inclusive: false,
        });
        assert!(matches!(result, Err(ValidationError::InvalidAmount(_))));
    }

    #[test]
    fn test_oversized_quantity_rejected() {
        let result = compute_item_total(&LineInput {
            unit_price: dec!(1.00),
            quantity_ordered: u32::MAX,
            billable_quantity: u32::MAX,
            discounts: &[],
            tax_rate: Decimal::ZERO,
            tax_inclusive: false,
        });
        assert!(matches!(result, Err(ValidationError::Invalid(_))));
    }

    #[test]
    fn test_huge_charges_rejected() {
        let charges = OrderCharges {
            shipping: Decimal::MAX,
            discount: Decimal::ZERO,
        };
        let result = compute_order_totals(&[line(dec!(10.00), 1, &[], Decimal::ZERO)], &charges, Decimal::ZERO);
        assert!(matches!(result, Err(ValidationError::InvalidAmount(_))));
    }

    fn money() -> impl Strategy<Value = Decimal> {
        (0i64..10_000_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    proptest! {
        #[test]
        fn prop_order_identity_holds(
            prices in proptest::collection::vec((money(), 1u32..50, 0u32..30), 1..8),
            shipping in money(),
            inclusive in any::<bool>(),
        ) {
            let lines: Vec<LineTotals> = prices
                .iter()
                .map(|(price, qty, rate)| {
                    compute_item_total(&LineInput {
                        unit_price: *price,
                        quantity_ordered: *qty,
                        billable_quantity: *qty,
                        discounts: &[],
                        tax_rate: Decimal::from(*rate),
                        tax_inclusive: inclusive,
                    })
                    .unwrap()
                })
                .collect();
            let charges = OrderCharges { shipping, discount: Decimal::ZERO };
            let totals = compute_order_totals(&lines, &charges, Decimal::ZERO).unwrap();
            prop_assert_eq!(totals.total, totals.subtotal + totals.tax + totals.shipping - totals.discount);
            prop_assert_eq!(totals.outstanding, totals.total - totals.paid);
            prop_assert!(totals.verify().is_ok());
            // identical inputs, identical outputs
            prop_assert_eq!(totals, compute_order_totals(&lines, &charges, Decimal::ZERO).unwrap());
        }

        #[test]
        fn prop_split_branches_agree_on_total(cents in 0i64..100_000_000) {
            let taxable = Decimal::new(cents, 2);
            let rates = GstRates::default();
            let intra = split_tax(taxable, &rates, Jurisdiction::IntraState);
            let inter = split_tax(taxable, &rates, Jurisdiction::InterState);
            // two halves rounded separately may differ from the whole by one paisa
            prop_assert!((intra.total() - inter.total()).abs() <= Decimal::new(1, 2));
        }

        #[test]
        fn prop_inclusive_split_is_exact(cents in 0i64..100_000_000, intra in any::<bool>()) {
            let gross = Decimal::new(cents, 2);
            let jurisdiction = if intra { Jurisdiction::IntraState } else { Jurisdiction::InterState };
            let (subtotal, split) = split_inclusive_tax(gross, &GstRates::default(), jurisdiction);
            prop_assert_eq!(subtotal + split.total(), gross);
        }
    }
}
