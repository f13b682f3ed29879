//! Currency pair and asset class types
//!
//! Pairs are used as map key components everywhere, so equality and hashing
//! only look at the upper-cased currency codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Result, StreamError};

/// Default display delimiter
pub const DEFAULT_DELIMITER: &str = "/";

/// An ordered (base, quote) pair of currency codes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    base: String,
    quote: String,
    delimiter: String,
}

impl CurrencyPair {
    /// Create a pair with the default delimiter
    pub fn new(base: &str, quote: &str) -> Self {
        Self::with_delimiter(base, quote, DEFAULT_DELIMITER)
    }

    /// Create a pair with a custom display delimiter
    pub fn with_delimiter(base: &str, quote: &str, delimiter: &str) -> Self {
        Self {
            base: base.trim().to_uppercase(),
            quote: quote.trim().to_uppercase(),
            delimiter: delimiter.to_string(),
        }
    }

    /// Parse a delimited pair such as `XBT/USD`
    pub fn parse(raw: &str, delimiter: &str) -> Result<Self> {
        if delimiter.is_empty() {
            return Err(StreamError::Decode(format!(
                "cannot split pair {raw:?} on an empty delimiter"
            )));
        }

        match raw.split_once(delimiter) {
            Some((base, quote)) if !base.trim().is_empty() && !quote.trim().is_empty() => {
                Ok(Self::with_delimiter(base, quote, delimiter))
            }
            _ => Err(StreamError::Decode(format!(
                "invalid currency pair {raw:?} for delimiter {delimiter:?}"
            ))),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Format the pair with a venue-specific delimiter
    pub fn format_with(&self, delimiter: &str) -> String {
        format!("{}{}{}", self.base, delimiter, self.quote)
    }
}

impl PartialEq for CurrencyPair {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.quote == other.quote
    }
}

impl Eq for CurrencyPair {}

impl Hash for CurrencyPair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base.hash(state);
        self.quote.hash(state);
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.base, self.delimiter, self.quote)
    }
}

impl From<CurrencyPair> for String {
    fn from(pair: CurrencyPair) -> Self {
        pair.to_string()
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = StreamError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw, DEFAULT_DELIMITER)
    }
}

/// Asset class of a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    #[default]
    Spot,
    Margin,
    Futures,
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Asset::Spot => "spot",
            Asset::Margin => "margin",
            Asset::Futures => "futures",
        };
        f.write_str(name)
    }
}
