//! Wei amounts: parsing request fields and formatting for humans.
//!
//! Request amounts are always base-unit integers, either decimal
//! (`"1000000000000000000"`) or `0x`-prefixed hex (`"0xde0b6b3a7640000"`).

use alloy_primitives::U256;

use crate::error::{Error, Result};

/// Number of wei in one ether.
pub const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;

/// Parses a base-unit integer amount.
///
/// # Errors
///
/// Returns [`Error::InvalidAmount`] for empty, signed, fractional, non-numeric
/// or overflowing input.
///
/// # Example
///
/// ```
/// use idcard_signer_core::{U256, units::parse_wei};
///
/// assert_eq!(parse_wei("1000").unwrap(), U256::from(1000));
/// assert_eq!(parse_wei("0x3e8").unwrap(), U256::from(1000));
/// assert!(parse_wei("1.5").is_err());
/// ```
pub fn parse_wei(input: &str) -> Result<U256> {
    let invalid = || Error::InvalidAmount(input.to_string());

    let (digits, radix) = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (input, 10),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid());
    }

    U256::from_str_radix(digits, u64::from(radix)).map_err(|_| invalid())
}

/// Formats wei as ether with trailing zeros trimmed (`"1"`, `"0.25"`).
#[must_use]
pub fn format_ether(wei: U256) -> String {
    let unit = U256::from(WEI_PER_ETHER);
    let whole = wei / unit;
    let frac = wei % unit;

    if frac.is_zero() {
        return whole.to_string();
    }

    let frac = format!("{:0>18}", frac.to_string());
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

/// Formats wei as ether rounded half-up to four decimals (`"1.2346"`).
#[must_use]
pub fn format_ether_fixed4(wei: U256) -> String {
    let step = U256::from(WEI_PER_ETHER / 10_000);
    let half = step / U256::from(2u8);
    let units = wei.saturating_add(half) / step;

    let ten_k = U256::from(10_000u16);
    let whole = units / ten_k;
    let frac = units % ten_k;

    format!("{whole}.{:0>4}", frac.to_string())
}
