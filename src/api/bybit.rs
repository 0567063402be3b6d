use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use tokio::time::{sleep, Duration};

use crate::error::{ExchangeError, ExchangeResult};
use crate::execution::ExchangeClient;
use crate::models::{Balance, Fill, MarketOrder};

type HmacSha256 = Hmac<Sha256>;

const BYBIT_API: &str = "https://api.bybit.com";
const BYBIT_API_TESTNET: &str = "https://api-testnet.bybit.com";

const DEFAULT_RECV_WINDOW_MS: u64 = 5000;
const HTTP_TIMEOUT_SECS: u64 = 10;
const MAX_RETRIES: u32 = 3; // Reads only, orders are never resubmitted
const INITIAL_BACKOFF_MS: u64 = 250;
const FILL_POLL_ATTEMPTS: u32 = 10;
const FILL_POLL_INTERVAL_MS: u64 = 200;

#[derive(Clone)]
pub struct BybitConfig {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub recv_window_ms: u64,
}

impl BybitConfig {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>, testnet: bool) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: if testnet { BYBIT_API_TESTNET } else { BYBIT_API }.to_string(),
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
        }
    }

    /// Config for unauthenticated market data only
    pub fn public(testnet: bool) -> Self {
        Self::new("", "", testnet)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }
}

impl fmt::Debug for BybitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BybitConfig")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("recv_window_ms", &self.recv_window_ms)
            .finish()
    }
}

/// Best bid/ask from the public ticker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Bybit v5 REST client for spot market orders
#[derive(Clone)]
pub struct BybitClient {
    config: BybitConfig,
    client: Client,
    fill_poll_attempts: u32,
    fill_poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResult {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderInfo {
    order_id: String,
    order_status: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    updated_time: String,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    #[serde(default)]
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    #[serde(default)]
    wallet_balance: String,
    #[serde(default)]
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerInfo {
    bid1_price: String,
    ask1_price: String,
}

/// Bybit sends empty strings for unset numeric fields
fn parse_decimal(field: &str, value: &str) -> ExchangeResult<Decimal> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    value
        .parse()
        .map_err(|e| ExchangeError::Parse(format!("{} '{}': {}", field, value, e)))
}

impl BybitClient {
    pub fn new(config: BybitConfig) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            config,
            client,
            fill_poll_attempts: FILL_POLL_ATTEMPTS,
            fill_poll_interval: Duration::from_millis(FILL_POLL_INTERVAL_MS),
        })
    }

    pub fn with_fill_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.fill_poll_attempts = attempts.max(1);
        self.fill_poll_interval = interval;
        self
    }

    /// X-BAPI-SIGN: hex HMAC-SHA256 over timestamp + api key + recv window + payload
    fn signature(&self, timestamp: i64, payload: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Parse(format!("api secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(self.config.api_key.as_bytes());
        mac.update(self.config.recv_window_ms.to_string().as_bytes());
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed(
        &self,
        request: reqwest::RequestBuilder,
        payload: &str,
    ) -> ExchangeResult<reqwest::RequestBuilder> {
        let timestamp = Utc::now().timestamp_millis();
        let sign = self.signature(timestamp, payload)?;
        Ok(request
            .header("X-BAPI-API-KEY", &self.config.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.config.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", sign))
    }

    async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ExchangeError::Network(format!("HTTP {}: {}", status, body)));
        }

        let api: ApiResponse = serde_json::from_str(&body)?;
        if api.ret_code != 0 {
            return Err(ExchangeError::from_ret_code(api.ret_code, api.ret_msg));
        }
        Ok(serde_json::from_value(api.result)?)
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
        sign: bool,
    ) -> ExchangeResult<T> {
        let url = format!("{}{}?{}", self.config.base_url, endpoint, query);
        let mut request = self.client.get(&url);
        if sign {
            request = self.signed(request, query)?;
        }
        Self::read_response(request.send().await?).await
    }

    /// GET with retry and exponential backoff on transport errors
    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
        sign: bool,
    ) -> ExchangeResult<T> {
        let mut attempt = 1;
        loop {
            match self.get_once(endpoint, query, sign).await {
                Err(e @ (ExchangeError::Network(_) | ExchangeError::Timeout(_)))
                    if attempt < MAX_RETRIES =>
                {
                    let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                    tracing::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms...",
                        attempt,
                        MAX_RETRIES,
                        endpoint,
                        e,
                        backoff_ms
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> ExchangeResult<T> {
        let url = format!("{}{}", self.config.base_url, endpoint);
        let body = body.to_string();
        let request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        let request = self.signed(request, &body)?.body(body);
        Self::read_response(request.send().await?).await
    }

    async fn create_order(&self, order: &MarketOrder) -> ExchangeResult<String> {
        let body = serde_json::json!({
            "category": "spot",
            "symbol": order.symbol,
            "side": order.side.as_str(),
            "orderType": "Market",
            "qty": order.quantity.normalize().to_string(),
            "marketUnit": "baseCoin",
            "orderLinkId": order.client_order_id,
        });

        let created: CreateOrderResult = self.post("/v5/order/create", &body).await?;
        tracing::info!(
            order_id = %created.order_id,
            client_order_id = %order.client_order_id,
            side = %order.side,
            "Order accepted by Bybit"
        );
        Ok(created.order_id)
    }

    async fn order_status(&self, order_id: &str) -> ExchangeResult<Option<OrderInfo>> {
        let query = format!("category=spot&orderId={}", order_id);
        let result: ListResult<OrderInfo> = self.get("/v5/order/realtime", &query, true).await?;
        Ok(result.list.into_iter().find(|o| o.order_id == order_id))
    }

    /// Poll until the market order reports its average fill price
    async fn wait_for_fill(&self, order_id: &str) -> ExchangeResult<Fill> {
        for attempt in 1..=self.fill_poll_attempts {
            if let Some(info) = self.order_status(order_id).await? {
                let filled_qty = parse_decimal("cumExecQty", &info.cum_exec_qty)?;
                match info.order_status.as_str() {
                    "Filled" | "PartiallyFilledCanceled" if filled_qty > Decimal::ZERO => {
                        let price = parse_decimal("avgPrice", &info.avg_price)?;
                        if price > Decimal::ZERO {
                            return Ok(Fill {
                                order_id: info.order_id,
                                price,
                                quantity: filled_qty,
                                timestamp: info
                                    .updated_time
                                    .parse::<i64>()
                                    .ok()
                                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                                    .unwrap_or_else(Utc::now),
                            });
                        }
                    }
                    "Cancelled" | "Rejected" | "Deactivated" | "PartiallyFilledCanceled" => {
                        return Err(ExchangeError::NotFilled(format!(
                            "{} ({})",
                            order_id, info.order_status
                        )));
                    }
                    status => tracing::debug!(order_id, status, attempt, "Order not filled yet"),
                }
            }
            sleep(self.fill_poll_interval).await;
        }

        Err(ExchangeError::NotFilled(order_id.to_string()))
    }

    /// Public best bid/ask for a spot symbol
    pub async fn quote(&self, symbol: &str) -> ExchangeResult<Quote> {
        let query = format!("category=spot&symbol={}", symbol);
        let result: ListResult<TickerInfo> = self.get("/v5/market/tickers", &query, false).await?;
        let ticker = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Parse(format!("no ticker for {}", symbol)))?;

        Ok(Quote {
            bid: parse_decimal("bid1Price", &ticker.bid1_price)?,
            ask: parse_decimal("ask1Price", &ticker.ask1_price)?,
        })
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn place_market_order(&self, order: &MarketOrder) -> ExchangeResult<Fill> {
        let order_id = self.create_order(order).await?;
        self.wait_for_fill(&order_id).await
    }

    async fn balance(&self, coin: &str) -> ExchangeResult<Balance> {
        let query = format!("accountType=UNIFIED&coin={}", coin);
        let result: ListResult<WalletAccount> =
            self.get("/v5/account/wallet-balance", &query, true).await?;

        let entry = result
            .list
            .into_iter()
            .flat_map(|account| account.coin)
            .find(|c| c.coin.eq_ignore_ascii_case(coin));

        let Some(entry) = entry else {
            return Ok(Balance {
                coin: coin.to_string(),
                total: Decimal::ZERO,
                available: Decimal::ZERO,
            });
        };

        let total = parse_decimal("walletBalance", &entry.wallet_balance)?;
        let locked = parse_decimal("locked", &entry.locked)?;
        Ok(Balance {
            coin: entry.coin,
            total,
            available: (total - locked).max(Decimal::ZERO),
        })
    }
}
