//! Fixed-point money arithmetic.
//!
//! Balances, wagers, and payouts are decimals with exactly two fractional
//! digits, carried as integer hundredths. Floating point never touches a
//! monetary value; serialization at system boundaries is the exact decimal
//! string (`"32.00"`).

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A monetary value with two fractional digits, stored as hundredths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

/// A payoff multiplier with two fractional digits, stored as hundredths
/// (`Multiplier::from_hundredths(350)` is `3.50×`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Multiplier(u64);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MoneyParseError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount: {0}")]
    Invalid(String),
    #[error("more than two fractional digits: {0}")]
    TooPrecise(String),
    #[error("amount out of range: {0}")]
    OutOfRange(String),
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Amount(hundredths)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// `self × multiplier`, rounded half-up to the nearest hundredth.
    pub fn mul_multiplier(self, multiplier: Multiplier) -> Amount {
        let product = self.0 as i128 * multiplier.hundredths() as i128;
        let rounded = if product >= 0 {
            (product + 50) / 100
        } else {
            (product - 50) / 100
        };
        Amount(rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }
}

impl Multiplier {
    pub const ONE: Multiplier = Multiplier(100);

    pub const fn from_hundredths(hundredths: u64) -> Self {
        Multiplier(hundredths)
    }

    pub const fn hundredths(self) -> u64 {
        self.0
    }
}

fn parse_fixed(input: &str) -> Result<i64, MoneyParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MoneyParseError::Empty);
    }
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(MoneyParseError::Invalid(input.to_string()));
    }
    if frac.len() > 2 {
        return Err(MoneyParseError::TooPrecise(input.to_string()));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(MoneyParseError::Invalid(input.to_string()));
    }
    let whole_part: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| MoneyParseError::OutOfRange(input.to_string()))?
    };
    let mut frac_part: i64 = if frac.is_empty() {
        0
    } else {
        frac.parse()
            .map_err(|_| MoneyParseError::Invalid(input.to_string()))?
    };
    if frac.len() == 1 {
        frac_part *= 10;
    }
    let hundredths = whole_part
        .checked_mul(100)
        .and_then(|v| v.checked_add(frac_part))
        .ok_or_else(|| MoneyParseError::OutOfRange(input.to_string()))?;
    Ok(if negative { -hundredths } else { hundredths })
}

impl FromStr for Amount {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s).map(Amount)
    }
}

impl FromStr for Multiplier {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hundredths = parse_fixed(s)?;
        u64::try_from(hundredths)
            .map(Multiplier)
            .map_err(|_| MoneyParseError::OutOfRange(s.to_string()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Serialize for Multiplier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Clients send amounts as either decimal strings or JSON numbers. Numbers
/// are re-rendered through `serde_json::Number`'s exact decimal form before
/// parsing so no float arithmetic is involved.
#[derive(Deserialize)]
#[serde(untagged)]
enum DecimalRepr {
    Text(String),
    Number(serde_json::Number),
}

impl DecimalRepr {
    fn into_string(self) -> String {
        match self {
            DecimalRepr::Text(text) => text,
            DecimalRepr::Number(number) => number.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = DecimalRepr::deserialize(deserializer)?.into_string();
        repr.parse().map_err(DeError::custom)
    }
}

impl<'de> Deserialize<'de> for Multiplier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = DecimalRepr::deserialize(deserializer)?.into_string();
        repr.parse().map_err(DeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for (input, hundredths, rendered) in [
            ("0", 0, "0.00"),
            ("10", 1000, "10.00"),
            ("10.5", 1050, "10.50"),
            ("10.05", 1005, "10.05"),
            ("0.01", 1, "0.01"),
            ("-3.20", -320, "-3.20"),
        ] {
            let amount: Amount = input.parse().unwrap();
            assert_eq!(amount.hundredths(), hundredths, "input {input}");
            assert_eq!(amount.to_string(), rendered);
        }
    }

    #[test]
    fn parse_rejects_junk() {
        assert!(matches!("".parse::<Amount>(), Err(MoneyParseError::Empty)));
        assert!("1.234".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
        assert!("1.2.3".parse::<Amount>().is_err());
        assert!(".".parse::<Amount>().is_err());
        assert!("-1".parse::<Multiplier>().is_err());
    }

    #[test]
    fn multiplier_payout_is_exact() {
        let bet: Amount = "10.00".parse().unwrap();
        let payout = bet.mul_multiplier(Multiplier::from_hundredths(320));
        assert_eq!(payout.to_string(), "32.00");
    }

    #[test]
    fn payout_rounds_half_up() {
        // 0.05 × 1.10 = 0.055 → 0.06
        let bet = Amount::from_hundredths(5);
        let payout = bet.mul_multiplier(Multiplier::from_hundredths(110));
        assert_eq!(payout.hundredths(), 6);

        // 0.05 × 1.09 = 0.0545 → 0.05
        let payout = bet.mul_multiplier(Multiplier::from_hundredths(109));
        assert_eq!(payout.hundredths(), 5);
    }

    #[test]
    fn deserializes_strings_and_numbers() {
        let from_string: Amount = serde_json::from_str("\"12.34\"").unwrap();
        assert_eq!(from_string.hundredths(), 1234);

        let from_int: Amount = serde_json::from_str("12").unwrap();
        assert_eq!(from_int.hundredths(), 1200);

        let from_number: Amount = serde_json::from_str("12.5").unwrap();
        assert_eq!(from_number.hundredths(), 1250);

        assert!(serde_json::from_str::<Amount>("12.345").is_err());
    }

    #[test]
    fn serializes_as_decimal_string() {
        let amount = Amount::from_hundredths(1005);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"10.05\"");
        let multiplier = Multiplier::from_hundredths(350);
        assert_eq!(serde_json::to_string(&multiplier).unwrap(), "\"3.50\"");
    }
}
