use rust_decimal::Decimal;

use crate::error::SagaError;

/// Convert an asset amount (minor units) into settlement-currency minor units at `rate`,
/// rounding down. Integer-only: the rate's mantissa multiplies first, then the combined
/// decimal shift is applied once, so the result never depends on float rounding.
pub fn convert_amount(
    input: u128,
    rate: Decimal,
    asset_decimals: u32,
    settlement_decimals: u32,
) -> Result<u128, SagaError> {
    if rate <= Decimal::ZERO {
        return Err(SagaError::Conversion(format!("non-positive rate {rate}")));
    }

    let mantissa = u128::try_from(rate.mantissa())
        .map_err(|_| SagaError::Conversion(format!("rate {rate} out of range")))?;
    let numerator = input
        .checked_mul(mantissa)
        .ok_or_else(|| SagaError::Conversion(format!("{input} x {rate} overflows")))?;

    let shift = i64::from(settlement_decimals) - i64::from(asset_decimals) - i64::from(rate.scale());
    let magnitude = u32::try_from(shift.unsigned_abs())
        .map_err(|_| SagaError::Conversion(format!("decimal shift {shift} out of range")))?;

    if shift >= 0 {
        10u128
            .checked_pow(magnitude)
            .and_then(|factor| numerator.checked_mul(factor))
            .ok_or_else(|| SagaError::Conversion(format!("{input} x {rate} overflows")))
    } else {
        // 10^39 exceeds u128::MAX, so anything divided by it floors to zero
        Ok(10u128
            .checked_pow(magnitude)
            .map_or(0, |divisor| numerator / divisor))
    }
}
