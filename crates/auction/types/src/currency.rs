//! Ad currencies
//!
//! Currencies are three-letter uppercase codes. A bid or config that leaves
//! its currency unset is compatible with every currency.

use serde::{Deserialize, Serialize};

use crate::errors::CurrencyError;

/// Code reported to scripts when no currency is known.
pub const UNKNOWN_CURRENCY_CODE: &str = "???";

/// A validated ISO-4217 style currency code (e.g. `USD`)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdCurrency(String);

impl AdCurrency {
    pub fn new(code: impl Into<String>) -> Result<Self, CurrencyError> {
        let code = code.into();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(CurrencyError::InvalidCode(code))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AdCurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for AdCurrency {
    type Error = CurrencyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AdCurrency> for String {
    fn from(c: AdCurrency) -> Self {
        c.0
    }
}

/// Two optional currencies are compatible unless both are set and differ.
pub fn currencies_match(a: Option<&AdCurrency>, b: Option<&AdCurrency>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Currency code as shown to scripts and report URLs.
pub fn currency_code(currency: Option<&AdCurrency>) -> &str {
    currency.map(AdCurrency::as_str).unwrap_or(UNKNOWN_CURRENCY_CODE)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn accepts_uppercase_three_letter_codes() {
        assert!(AdCurrency::new("USD").is_ok());
        assert!(AdCurrency::new("usd").is_err());
        assert!(AdCurrency::new("US").is_err());
        assert!(AdCurrency::new("???").is_err());
    }

    #[test]
    fn unset_currency_matches_anything() {
        let usd = AdCurrency::new("USD").unwrap();
        let eur = AdCurrency::new("EUR").unwrap();
        assert!(currencies_match(None, Some(&usd)));
        assert!(currencies_match(Some(&usd), None));
        assert!(currencies_match(Some(&usd), Some(&usd)));
        assert!(!currencies_match(Some(&usd), Some(&eur)));
    }

    #[test]
    fn unknown_code_when_unset() {
        assert_eq!(currency_code(None), "???");
        let cad = AdCurrency::new("CAD").unwrap();
        assert_eq!(currency_code(Some(&cad)), "CAD");
    }

    #[test]
    fn deserialize_rejects_invalid_code() {
        let ok: Result<AdCurrency, _> = serde_json::from_str("\"JPY\"");
        assert!(ok.is_ok());
        let bad: Result<AdCurrency, _> = serde_json::from_str("\"jpy\"");
        assert!(bad.is_err());
    }

    proptest! {
        #[test]
        fn uppercase_triples_are_kept_verbatim(code in "[A-Z]{3}") {
            let currency = AdCurrency::new(code.as_str()).unwrap();
            prop_assert_eq!(currency.as_str(), code.as_str());
        }

        #[test]
        fn codes_with_lowercase_are_rejected(code in "[A-Z]{0,2}[a-z][A-Za-z]{0,2}") {
            prop_assert!(AdCurrency::new(code).is_err());
        }
    }
}
