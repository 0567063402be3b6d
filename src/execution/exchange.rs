use async_trait::async_trait;

use crate::error::ExchangeResult;
use crate::models::{Balance, Fill, MarketOrder};

/// Order placement and account queries consumed by the position engine
///
/// `place_market_order` is called at most once per logical order and resolves
/// to the executed fill. Implementations must not retry a rejected order.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn place_market_order(&self, order: &MarketOrder) -> ExchangeResult<Fill>;

    async fn balance(&self, coin: &str) -> ExchangeResult<Balance>;
}
