use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Currency the portal denotes with a bare `$`.
pub const LOCAL_CURRENCY: &str = "clp";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("invalid amount {text:?}: {reason}")]
    InvalidAmount { text: String, reason: String },
    #[error("empty currency")]
    EmptyCurrency,
    #[error("cannot combine {left} with {right}")]
    CurrencyMismatch {
        left: CurrencyCode,
        right: CurrencyCode,
    },
}

/// Lowercase currency code such as `clp`, `clf` or `usd`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Maps the token printed next to an amount to a code. `$` is the local currency.
    pub fn from_token(token: &str) -> Result<Self, MoneyError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(MoneyError::EmptyCurrency);
        }
        if token == "$" {
            return Ok(Self::local());
        }
        Ok(Self(token.to_lowercase()))
    }

    pub fn local() -> Self {
        Self(LOCAL_CURRENCY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_token(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(value: CurrencyCode) -> Self {
        value.0
    }
}

/// Exact decimal amount tagged with its currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: BigDecimal,
    currency: CurrencyCode,
}

impl Money {
    pub fn new(amount: BigDecimal, currency: CurrencyCode) -> Self {
        Self { amount, currency }
    }

    pub fn amount(&self) -> &BigDecimal {
        &self.amount
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(Money::new(&self.amount + &other.amount, self.currency.clone()))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Parses a portal amount such as `1.234.567` or `1.234,50`. Dots are thousands
/// separators and a comma, if any, is the decimal mark.
pub fn parse_money(currency: &str, amount_text: &str) -> Result<Money, MoneyError> {
    let currency = CurrencyCode::from_token(currency)?;
    let cleaned: String = amount_text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return Err(MoneyError::InvalidAmount {
            text: amount_text.to_string(),
            reason: "no digits".to_string(),
        });
    }
    let amount = BigDecimal::from_str(&cleaned).map_err(|e| MoneyError::InvalidAmount {
        text: amount_text.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Money::new(amount, currency))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_sign_means_local_currency() {
        let money = parse_money("$", "1.234.567").unwrap();
        assert_eq!(money.currency().as_str(), "clp");
        assert_eq!(money.amount(), &BigDecimal::from(1_234_567));

        let uf = parse_money("CLF", " 12,5 ").unwrap();
        assert_eq!(uf.currency().as_str(), "clf");
        assert_eq!(uf.amount(), &BigDecimal::from_str("12.5").unwrap());
    }

    #[test]
    fn repeated_sums_stay_exact() {
        let tenth = parse_money("$", "0,1").unwrap();
        let mut total = parse_money("$", "0").unwrap();
        for _ in 0..10 {
            total = total.checked_add(&tenth).unwrap();
        }
        assert_eq!(total.amount(), &BigDecimal::from(1));
    }

    #[test]
    fn mixing_currencies_is_an_error() {
        let clp = parse_money("$", "10").unwrap();
        let usd = parse_money("USD", "10").unwrap();
        assert!(matches!(
            clp.checked_add(&usd),
            Err(MoneyError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn bad_amounts_are_rejected() {
        assert!(matches!(
            parse_money("$", "  "),
            Err(MoneyError::InvalidAmount { .. })
        ));
        assert!(matches!(
            parse_money("$", "doce"),
            Err(MoneyError::InvalidAmount { .. })
        ));
        assert_eq!(parse_money("", "10"), Err(MoneyError::EmptyCurrency));
    }
}
