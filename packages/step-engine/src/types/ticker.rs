//! Exchange-qualified ticker symbols.

use serde::{Deserialize, Serialize};

/// Exchange applied to bare codes.
pub const DEFAULT_EXCHANGE: &str = "ASX";

/// Exchanges recognised in the `EX.CODE` form.
const KNOWN_EXCHANGES: &[&str] = &["ASX", "NYSE", "NASDAQ", "LSE", "TSX", "NZX", "US"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticker {
    pub exchange: String,
    pub code: String,
}

impl Ticker {
    /// Parse `ASX:GNP`, `ASX.GNP` or a bare `gnp` (default exchange).
    ///
    /// Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some((exchange, code)) = raw.split_once(':') {
            if !exchange.is_empty() {
                return Self::from_parts(exchange, code);
            }
        }

        if let Some((exchange, code)) = raw.split_once('.') {
            let exchange = exchange.to_uppercase();
            if KNOWN_EXCHANGES.contains(&exchange.as_str()) {
                return Self::from_parts(&exchange, code);
            }
        }

        Self::from_parts(DEFAULT_EXCHANGE, raw)
    }

    /// Parse many, dropping blanks.
    pub fn parse_all<I, S>(raw: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter().filter_map(|s| Self::parse(s.as_ref())).collect()
    }

    fn from_parts(exchange: &str, code: &str) -> Option<Self> {
        let code = code.trim().to_uppercase();
        if code.is_empty() {
            return None;
        }
        Some(Self {
            exchange: exchange.trim().to_uppercase(),
            code,
        })
    }

    /// Storage key: `asx:GNP` or `asx:GNP:<suffix>`.
    pub fn source_id(&self, suffix: &str) -> String {
        let exchange = self.exchange.to_lowercase();
        if suffix.is_empty() {
            format!("{}:{}", exchange, self.code)
        } else {
            format!("{}:{}:{}", exchange, self.code, suffix)
        }
    }
}

impl std::fmt::Display for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_form() {
        let t = Ticker::parse("nyse:ibm").unwrap();
        assert_eq!(t.exchange, "NYSE");
        assert_eq!(t.code, "IBM");
        assert_eq!(t.to_string(), "NYSE:IBM");
    }

    #[test]
    fn parses_dot_form_only_for_known_exchanges() {
        assert_eq!(Ticker::parse("ASX.GNP").unwrap().to_string(), "ASX:GNP");
        // BRK.B is a code, not an exchange prefix
        assert_eq!(Ticker::parse("BRK.B").unwrap().to_string(), "ASX:BRK.B");
    }

    #[test]
    fn bare_code_gets_default_exchange() {
        let t = Ticker::parse("  gnp ").unwrap();
        assert_eq!(t.to_string(), "ASX:GNP");
    }

    #[test]
    fn blank_input_is_none() {
        assert!(Ticker::parse("   ").is_none());
        assert!(Ticker::parse("ASX:").is_none());
    }

    #[test]
    fn source_id_lowercases_exchange() {
        let t = Ticker::parse("ASX:GNP").unwrap();
        assert_eq!(t.source_id("stock_collector"), "asx:GNP:stock_collector");
        assert_eq!(t.source_id(""), "asx:GNP");
    }
}
