//! Pure monetary arithmetic for invoice totals.
//!
//! All math is done in fixed-point [`Decimal`]; intermediates keep full
//! precision and only the final total is rounded (2 dp, midpoint away from
//! zero) so rounding error never compounds across steps.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::ServiceError;

pub const CURRENCY_SCALE: u32 = 2;

/// Pin an amount to exactly two decimal places. Backends without a native
/// decimal type strip trailing zeros on round-trip, so `100.00` can come
/// back as `100`; formatting and wire payloads go through this first.
pub fn to_currency(amount: Decimal) -> Decimal {
    let mut pinned =
        amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    pinned.rescale(CURRENCY_SCALE);
    pinned
}

/// A line item as supplied by the caller, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LineItemInput {
    #[validate(length(min = 1, max = 500, message = "Item description is required"))]
    pub description: String,
    #[validate(range(min = 1, message = "Quantity must be a positive integer"))]
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl LineItemInput {
    pub fn line_total(&self) -> Decimal {
        Decimal::from(self.quantity) * self.unit_price
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

/// Compute subtotal, tax, and total for a set of line items.
///
/// `discount` is an absolute amount subtracted from the subtotal before tax;
/// a discount larger than the subtotal clamps the taxable base to zero, so
/// the total can never go negative. `tax_rate` is a flat percentage.
pub fn compute_totals(
    items: &[LineItemInput],
    tax_rate: Decimal,
    discount: Decimal,
) -> Result<InvoiceTotals, ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::ValidationError(
            "Invoice requires at least one line item".to_string(),
        ));
    }
    if tax_rate < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Tax rate must not be negative".to_string(),
        ));
    }
    if discount < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Discount must not be negative".to_string(),
        ));
    }
    for item in items {
        item.validate()?;
        if item.unit_price <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Unit price must be positive for item '{}'",
                item.description
            )));
        }
    }

    let subtotal: Decimal = items.iter().map(LineItemInput::line_total).sum();

    let discounted = (subtotal - discount).max(Decimal::ZERO);
    let tax_amount = discounted * tax_rate / Decimal::from(100);
    let total_amount = (discounted + tax_amount)
        .round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero);

    Ok(InvoiceTotals {
        subtotal,
        tax_amount,
        total_amount,
    })
}
