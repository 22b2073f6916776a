//! Fixed-point monetary amounts and currency tags
//!
//! All order sizes are carried as integer counts of 10^-8 coin units.
//! Floating point appears only in price presentation, price comparison and
//! aggregation; equality on prices always goes through [`price_eq`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};

/// Number of base units per coin.
pub const COIN: u64 = 100_000_000;

/// Largest supported order size, in whole coins.
pub const MAX_COIN: u64 = 100_000_000;

/// Fixed-point coin amount, 10^-8 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Parse a decimal string into an amount.
    ///
    /// Rejects more than 8 fractional digits rather than rounding; precision
    /// loss at the boundary would silently change order sizes.
    pub fn from_decimal(s: &str) -> CoordinatorResult<Amount> {
        let s = s.trim();
        if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
            return Err(CoordinatorError::InvalidAmount(s.to_string()));
        }

        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(CoordinatorError::InvalidAmount(s.to_string()));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(CoordinatorError::InvalidAmount(s.to_string()));
        }
        if frac_part.len() > 8 {
            return Err(CoordinatorError::InvalidAmount(format!(
                "{} is too precise, maximum precision supported is 8 digits",
                s
            )));
        }

        let whole: u64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| CoordinatorError::InvalidAmount(s.to_string()))?
        };

        let mut frac: u64 = 0;
        if !frac_part.is_empty() {
            frac = frac_part
                .parse()
                .map_err(|_| CoordinatorError::InvalidAmount(s.to_string()))?;
            frac *= 10u64.pow(8 - frac_part.len() as u32);
        }

        let units = whole
            .checked_mul(COIN)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(|| CoordinatorError::InvalidAmount(s.to_string()))?;

        Ok(Amount(units))
    }

    /// Render as a decimal string, trailing zeros trimmed.
    ///
    /// Inverse of [`Amount::from_decimal`] for canonical inputs.
    pub fn to_decimal(self) -> String {
        let whole = self.0 / COIN;
        let frac = self.0 % COIN;
        if frac == 0 {
            return whole.to_string();
        }
        let frac = format!("{:08}", frac);
        format!("{}.{}", whole, frac.trim_end_matches('0'))
    }

    pub fn as_units(self) -> u64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / COIN as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// True when the amount fits within the supported order size range.
    pub fn within_bounds(self) -> bool {
        self.0 > 0 && self.0 <= MAX_COIN.saturating_mul(COIN)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal())
    }
}

/// Currency tag with the base-unit scale of its chain.
///
/// Two currencies compare equal by tag alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Currency {
    pub tag: String,
    pub coin: u64,
}

impl Currency {
    pub fn new(tag: impl Into<String>) -> Currency {
        Currency { tag: tag.into(), coin: COIN }
    }
}

impl PartialEq for Currency {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl Eq for Currency {}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// True iff the decimal string parses and carries at most 8 fractional digits.
pub fn valid_precision(s: &str) -> bool {
    Amount::from_decimal(s).is_ok()
}

/// Ask price of an order: units received per unit sent.
pub fn ask_price(from_amount: Amount, to_amount: Amount) -> f64 {
    to_amount.as_f64() / from_amount.as_f64()
}

/// Bid price: the inverse orientation, units sent per unit received.
pub fn bid_price(from_amount: Amount, to_amount: Amount) -> f64 {
    from_amount.as_f64() / to_amount.as_f64()
}

/// Relative-epsilon float comparison, Knuth 4.2.2 Eq 36.
pub fn price_eq(a: f64, b: f64) -> bool {
    let eps = f64::EPSILON;
    ((a - b).abs() / a.abs() <= eps) && ((a - b).abs() / b.abs() <= eps)
}

/// Format a price with the full 8 supported fractional digits.
pub fn format_price(price: f64) -> String {
    format!("{:.8}", price)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_round_trip() {
        for s in ["25", "0.1", "0.00000001", "1000", "0.0009", "12.3456789"] {
            let a = Amount::from_decimal(s).unwrap();
            assert_eq!(a.to_decimal(), *s, "round trip of {}", s);
        }
    }

    #[test]
    fn nine_fractional_digits_rejected() {
        assert!(Amount::from_decimal("0.000000001").is_err());
        assert!(!valid_precision("0.000000001"));
        assert!(valid_precision("0.00000001"));
    }

    #[test]
    fn rejects_garbage() {
        for s in ["", "-1", "+1", "1.2.3", "abc", "1e8", "."] {
            assert!(Amount::from_decimal(s).is_err(), "{} should not parse", s);
        }
    }

    #[test]
    fn bounds() {
        assert!(Amount::from_decimal("100000000").unwrap().within_bounds());
        assert!(!Amount::ZERO.within_bounds());
    }

    #[test]
    fn price_inverse_law() {
        let from = Amount::from_decimal("25").unwrap();
        let to = Amount::from_decimal("1000").unwrap();
        let p = ask_price(from, to);
        let q = bid_price(from, to);
        assert!(price_eq(p, 1.0 / q));
    }

    #[test]
    fn price_eq_is_not_raw_equality() {
        let a = 0.1 + 0.2;
        let b = 0.3;
        assert!(price_eq(a, b));
        assert!(!price_eq(0.001, 0.0012));
    }

    #[test]
    fn price_formatting() {
        assert_eq!(format_price(0.001), "0.00100000");
        assert_eq!(format_price(0.0009), "0.00090000");
    }
}
