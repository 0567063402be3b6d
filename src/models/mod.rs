use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One price observation from the market-data stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Wire value used by the Bybit v5 API
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    /// Single-letter prefix for client order ids
    pub fn code(&self) -> char {
        match self {
            Side::Buy => 'b',
            Side::Sell => 's',
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A market order request
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal, // Base-coin quantity
    pub client_order_id: String, // Lets the venue reject a resubmitted order
}

/// Execution result reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal, // Average executed price, not the requested one
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Balance of one coin
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub coin: String,
    pub total: Decimal,
    pub available: Decimal,
}

/// Split an exchange symbol like `BTCUSDT` into base and quote coins
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    const QUOTES: &[&str] = &["USDT", "USDC", "USDE", "BTC", "ETH", "EUR"];

    QUOTES.iter().find_map(|quote| {
        symbol
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base, *quote))
    })
}
