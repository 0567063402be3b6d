use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

use super::bybit::BybitClient;
use crate::error::{ExchangeError, ExchangeResult};
use crate::execution::ExchangeClient;
use crate::models::{split_symbol, Balance, Fill, MarketOrder, Side};

/// Simulated exchange filling market orders against live public quotes.
///
/// Buys fill at the best ask, sells at the best bid. Balances are virtual and
/// live only as long as the process.
pub struct PaperExchange {
    market: BybitClient,
    balances: Mutex<HashMap<String, Decimal>>,
}

impl PaperExchange {
    pub fn new(market: BybitClient, starting_balances: HashMap<String, Decimal>) -> Self {
        Self {
            market,
            balances: Mutex::new(starting_balances),
        }
    }

    fn settle(&self, order: &MarketOrder, price: Decimal) -> ExchangeResult<()> {
        let (base, quote) = split_symbol(&order.symbol).ok_or_else(|| {
            ExchangeError::NotSupported(format!("cannot split symbol {}", order.symbol))
        })?;
        let notional = order.quantity * price;

        let mut balances = self
            .balances
            .lock()
            .map_err(|_| ExchangeError::NotSupported("paper balances poisoned".to_string()))?;

        let (pay_coin, pay, get_coin, get) = match order.side {
            Side::Buy => (quote, notional, base, order.quantity),
            Side::Sell => (base, order.quantity, quote, notional),
        };

        let available = balances.get(pay_coin).copied().unwrap_or_default();
        if available < pay {
            return Err(ExchangeError::InsufficientBalance(format!(
                "{} {} needed, {} available",
                pay, pay_coin, available
            )));
        }

        balances.insert(pay_coin.to_string(), available - pay);
        *balances.entry(get_coin.to_string()).or_default() += get;
        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_market_order(&self, order: &MarketOrder) -> ExchangeResult<Fill> {
        if order.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected {
                code: -1,
                message: format!("invalid quantity {}", order.quantity),
            });
        }

        let quote = self.market.quote(&order.symbol).await?;
        let price = match order.side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        if price <= Decimal::ZERO {
            return Err(ExchangeError::NotFilled(format!(
                "{}: empty book side",
                order.client_order_id
            )));
        }

        self.settle(order, price)?;
        tracing::info!(
            side = %order.side,
            symbol = %order.symbol,
            quantity = %order.quantity,
            price = %price,
            "📝 Paper fill"
        );

        Ok(Fill {
            order_id: order.client_order_id.clone(),
            price,
            quantity: order.quantity,
            timestamp: Utc::now(),
        })
    }

    async fn balance(&self, coin: &str) -> ExchangeResult<Balance> {
        let balances = self
            .balances
            .lock()
            .map_err(|_| ExchangeError::NotSupported("paper balances poisoned".to_string()))?;
        let total = balances.get(coin).copied().unwrap_or_default();
        Ok(Balance {
            coin: coin.to_string(),
            total,
            available: total,
        })
    }
}
