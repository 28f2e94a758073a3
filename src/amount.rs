//! Safe financial arithmetic using fixed-point decimal
//!
//! Every ledger amount in this crate is an [`Amount`] backed by
//! `rust_decimal`. **Never use f64 for financial calculations!**
//!
//! Amounts are denominated in native asset units (XLM) with stroop
//! precision (7 decimal places). All arithmetic is exact and checked,
//! and amounts serialize as strings so precision survives JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of decimal places carried by the native asset (1 stroop = 1e-7 XLM).
pub const NATIVE_SCALE: u32 = 7;

/// Financial amount with fixed-point precision.
///
/// # Examples
///
/// ```rust
/// use patronpay::Amount;
///
/// let a = Amount::from_xlm(10);
/// let b = Amount::from_str_checked("2.5").unwrap();
/// let total = a.checked_add(&b).unwrap();
/// assert_eq!(total.to_string(), "12.5");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount {
    // Decimal serializes as a string with the serde feature enabled
    value: Decimal,
}

impl Amount {
    /// Create from a whole number of XLM.
    pub fn from_xlm(xlm: i64) -> Self {
        Self {
            value: Decimal::from(xlm),
        }
    }

    /// Create from a decimal string (e.g. `"9.8"`).
    ///
    /// Rejects negative values and values with more than stroop precision.
    pub fn from_str_checked(s: &str) -> Result<Self, String> {
        let value = Decimal::from_str(s).map_err(|e| format!("invalid amount: {}", e))?;
        if value.is_sign_negative() {
            return Err(format!("amount cannot be negative: {}", s));
        }
        if value.scale() > NATIVE_SCALE {
            return Err(format!(
                "amount has more than {} decimal places: {}",
                NATIVE_SCALE, s
            ));
        }
        Ok(Self { value })
    }

    /// Zero amount.
    pub fn zero() -> Self {
        Self {
            value: Decimal::ZERO,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// True for amounts strictly greater than zero.
    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }

    /// Checked addition (None on overflow).
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        self.value
            .checked_add(other.value)
            .map(|value| Self { value })
    }

    /// Checked subtraction (None if the result would be negative).
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        self.value
            .checked_sub(other.value)
            .filter(|v| !v.is_sign_negative())
            .map(|value| Self { value })
    }

    /// Saturating addition (clamps to max on overflow).
    pub fn saturating_add(&self, other: &Self) -> Self {
        self.checked_add(other).unwrap_or(Self {
            value: Decimal::MAX,
        })
    }

    /// Calculate a percentage of this amount, rounded to stroop precision.
    ///
    /// ```rust
    /// use patronpay::Amount;
    /// use rust_decimal_macros::dec;
    ///
    /// let gross = Amount::from_xlm(10);
    /// assert_eq!(gross.percentage(dec!(2)).to_string(), "0.2");
    /// ```
    pub fn percentage(&self, rate: Decimal) -> Self {
        let fraction = rate
            .checked_div(Decimal::from(100))
            .unwrap_or(Decimal::ZERO);
        self.value
            .checked_mul(fraction)
            .map(|value| Self {
                value: value.round_dp(NATIVE_SCALE).normalize(),
            })
            .unwrap_or_else(Self::zero)
    }

    /// Get the internal Decimal value.
    pub fn as_decimal(&self) -> Decimal {
        self.value
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value.normalize())
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}
