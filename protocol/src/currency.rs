//! # Currency Parsing
//!
//! Balances travel through the API as decimal strings ("1.5") and through the
//! protocol as integers in the currency's minimal unit (wei for ETH). The
//! conversion is a pure function keyed by the currency symbol.
//!
//! Formatting always prints a fixed number of fractional digits so that
//! clients can compare balance strings byte for byte; extra precision is
//! truncated, never rounded up.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// A decimal amount could not be converted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("empty amount")]
    Empty,

    #[error("amount {0:?} is not a non-negative decimal number")]
    NotANumber(String),

    #[error("amount {amount:?} has more than {max} fractional digits")]
    TooPrecise { amount: String, max: u32 },

    #[error("amount {0:?} does not fit in the balance range")]
    Overflow(String),
}

/// Converts between decimal strings and minimal-unit integers for one currency.
pub trait CurrencyParser: Send + Sync {
    fn symbol(&self) -> &str;

    fn parse(&self, amount: &str) -> Result<u128, CurrencyError>;

    fn format(&self, value: u128) -> String;
}

/// A currency whose minimal unit is `10^-decimals` of the display unit.
#[derive(Clone, Debug)]
pub struct DecimalCurrency {
    symbol: String,
    decimals: u32,
    display_precision: u32,
}

impl DecimalCurrency {
    pub fn new(symbol: &str, decimals: u32, display_precision: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            decimals,
            display_precision: display_precision.min(decimals),
        }
    }

    /// Ether: 18 decimals, six shown.
    pub fn eth() -> Self {
        Self::new("ETH", 18, 6)
    }

    fn unit(&self) -> u128 {
        10u128.pow(self.decimals)
    }
}

impl CurrencyParser for DecimalCurrency {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn parse(&self, amount: &str) -> Result<u128, CurrencyError> {
        let trimmed = amount.trim();
        if trimmed.is_empty() {
            return Err(CurrencyError::Empty);
        }

        let (int_part, frac_part) = match trimmed.split_once('.') {
            Some((i, f)) => (i, f),
            None => (trimmed, ""),
        };
        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
        {
            return Err(CurrencyError::NotANumber(amount.to_string()));
        }
        if frac_part.len() > self.decimals as usize {
            return Err(CurrencyError::TooPrecise {
                amount: amount.to_string(),
                max: self.decimals,
            });
        }

        let overflow = || CurrencyError::Overflow(amount.to_string());
        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| overflow())?
        };
        let frac: u128 = if frac_part.is_empty() {
            0
        } else {
            let scale = 10u128.pow(self.decimals - frac_part.len() as u32);
            frac_part
                .parse::<u128>()
                .map_err(|_| overflow())?
                .checked_mul(scale)
                .ok_or_else(overflow)?
        };

        whole
            .checked_mul(self.unit())
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(overflow)
    }

    fn format(&self, value: u128) -> String {
        let unit = self.unit();
        let whole = value / unit;
        if self.display_precision == 0 {
            return whole.to_string();
        }
        let frac = (value % unit) / 10u128.pow(self.decimals - self.display_precision);
        format!(
            "{}.{:0width$}",
            whole,
            frac,
            width = self.display_precision as usize
        )
    }
}

/// The currencies a node supports, keyed by symbol.
#[derive(Clone, Default)]
pub struct Currencies {
    parsers: HashMap<String, Arc<dyn CurrencyParser>>,
}

impl Currencies {
    /// Registry with the built-in currencies.
    pub fn builtin() -> Self {
        let mut c = Self::default();
        c.register(Arc::new(DecimalCurrency::eth()));
        c
    }

    pub fn register(&mut self, parser: Arc<dyn CurrencyParser>) {
        self.parsers.insert(parser.symbol().to_string(), parser);
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<dyn CurrencyParser>> {
        self.parsers.get(symbol).cloned()
    }

    /// Keep only the listed symbols. Unknown symbols are returned.
    pub fn restrict_to(&mut self, symbols: &[String]) -> Vec<String> {
        let unknown = symbols
            .iter()
            .filter(|s| !self.parsers.contains_key(s.as_str()))
            .cloned()
            .collect();
        self.parsers.retain(|k, _| symbols.iter().any(|s| s == k));
        unknown
    }
}

impl std::fmt::Debug for Currencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut symbols: Vec<_> = self.parsers.keys().collect();
        symbols.sort();
        f.debug_struct("Currencies").field("symbols", &symbols).finish()
    }
}
