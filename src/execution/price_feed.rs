use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;

use crate::models::Tick;

const BYBIT_SPOT_WS: &str = "wss://stream.bybit.com/v5/public/spot";
const BYBIT_SPOT_WS_TESTNET: &str = "wss://stream-testnet.bybit.com/v5/public/spot";

const TICK_BUFFER: usize = 1024;
const HEARTBEAT_SECS: u64 = 20; // Bybit drops idle connections after ~30s
const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Receiving end of a tick subscription
pub type TickStream = mpsc::Receiver<Tick>;

/// Streaming market data for one instrument
///
/// The returned stream is unbounded in time and survives transport failures;
/// ticks sent while reconnecting are lost. Dropping the receiver ends the
/// subscription.
pub trait PriceFeed: Send + Sync {
    fn subscribe(&self, symbol: &str) -> TickStream;
}

/// Best-bid price feed from the Bybit public spot WebSocket
pub struct BybitPriceFeed {
    url: String,
    shutdown: CancellationToken,
    initial_backoff: Duration,
}

impl BybitPriceFeed {
    pub fn new(testnet: bool, shutdown: CancellationToken) -> Self {
        let url = if testnet {
            BYBIT_SPOT_WS_TESTNET
        } else {
            BYBIT_SPOT_WS
        };
        Self::with_url(url, shutdown)
    }

    pub fn with_url(url: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            url: url.into(),
            shutdown,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }
}

impl PriceFeed for BybitPriceFeed {
    fn subscribe(&self, symbol: &str) -> TickStream {
        let (tx, rx) = mpsc::channel(TICK_BUFFER);

        let connection = FeedConnection {
            url: self.url.clone(),
            symbol: symbol.to_string(),
            initial_backoff: self.initial_backoff,
        };
        tokio::spawn(connection.run(tx, self.shutdown.child_token()));

        rx
    }
}

struct FeedConnection {
    url: String,
    symbol: String,
    initial_backoff: Duration,
}

impl FeedConnection {
    /// Reconnect loop. Exits on shutdown or when the subscriber goes away.
    async fn run(self, tx: mpsc::Sender<Tick>, shutdown: CancellationToken) {
        tracing::info!(symbol = %self.symbol, url = %self.url, "Price feed starting");
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                result = self.stream_once(&tx, &mut attempt) => result,
            };

            match result {
                Ok(()) => tracing::warn!(symbol = %self.symbol, "Price feed closed by server"),
                Err(e) => tracing::warn!(symbol = %self.symbol, "Price feed disconnected: {:#}", e),
            }

            if tx.is_closed() {
                break;
            }

            let delay = backoff_delay(self.initial_backoff, attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(
                "Reconnecting {} feed in {}ms (attempt {})",
                self.symbol,
                delay.as_millis(),
                attempt
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        tracing::info!(symbol = %self.symbol, "Price feed stopped");
    }

    /// One connection lifetime: connect, subscribe, forward ticks
    async fn stream_once(&self, tx: &mpsc::Sender<Tick>, attempt: &mut u32) -> anyhow::Result<()> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connect to {}", self.url))?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "op": "subscribe",
            "args": [orderbook_topic(&self.symbol)],
        });
        write.send(Message::Text(subscribe.to_string().into())).await?;
        tracing::info!(symbol = %self.symbol, "Subscribed to order book");

        let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_SECS));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let ping = serde_json::json!({ "op": "ping" });
                    write.send(Message::Text(ping.to_string().into())).await?;
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Ok(());
                    };

                    match msg? {
                        Message::Text(text) => match parse_message(&text, &self.symbol) {
                            Ok(FeedMessage::Tick(tick)) => {
                                *attempt = 0;
                                if tx.send(tick).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Ok(FeedMessage::Control) => {}
                            Ok(FeedMessage::Rejected(reason)) => {
                                anyhow::bail!("subscription rejected: {}", reason);
                            }
                            Err(e) => tracing::warn!("Skipping feed message: {:#}", e),
                        },
                        Message::Close(frame) => {
                            tracing::debug!("Close frame: {:?}", frame);
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

fn orderbook_topic(symbol: &str) -> String {
    format!("orderbook.1.{}", symbol)
}

/// Exponential backoff with up to 500ms of jitter
fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let base_ms = initial.as_millis() as u64;
    let exp_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt.min(16)))
        .min(MAX_BACKOFF_MS.max(base_ms));
    let jitter_ms = rand::thread_rng().gen_range(0..=500);
    Duration::from_millis(exp_ms + jitter_ms)
}

#[derive(Debug, Deserialize)]
struct WsMessage {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsOrderbook {
    s: String,
    #[serde(default)]
    b: Vec<[String; 2]>,
}

#[derive(Debug, PartialEq)]
enum FeedMessage {
    Tick(Tick),
    Control, // Acks, pongs and book updates without a bid
    Rejected(String),
}

fn parse_message(text: &str, symbol: &str) -> anyhow::Result<FeedMessage> {
    let msg: WsMessage = serde_json::from_str(text).context("decode feed message")?;

    if let Some(op) = msg.op.as_deref() {
        if msg.success == Some(false) {
            return Ok(FeedMessage::Rejected(format!(
                "{} failed: {}",
                op,
                msg.ret_msg.unwrap_or_default()
            )));
        }
        return Ok(FeedMessage::Control);
    }

    let (Some(topic), Some(data)) = (msg.topic, msg.data) else {
        return Ok(FeedMessage::Control);
    };
    if topic != orderbook_topic(symbol) {
        return Ok(FeedMessage::Control);
    }

    let book: WsOrderbook = serde_json::from_value(data).context("decode order book")?;
    let Some([price, size]) = book.b.first() else {
        tracing::debug!("Order book update without bid");
        return Ok(FeedMessage::Control);
    };

    let price: Decimal = price.parse().context("parse bid price")?;
    let size: Decimal = size.parse().context("parse bid size")?;
    if size.is_zero() || price <= Decimal::ZERO {
        return Ok(FeedMessage::Control);
    }

    let timestamp = msg
        .ts
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(FeedMessage::Tick(Tick::new(book.s, price, timestamp)))
}
