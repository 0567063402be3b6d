use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::commands::{BotCommand, CommandRouter};
use crate::notifier::NotificationSender;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const RATE_LIMIT_PER_SEC: u32 = 1; // Telegram allows about one message per second per chat
const MAX_RETRIES: u32 = 3;
const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_ERROR_BACKOFF_SECS: u64 = 5;

type TelegramRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Telegram Bot API client
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
    token: String,
    chat_id: i64,
    rate_limiter: Arc<TelegramRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl TelegramClient {
    /// `chat_id` is where notifications go
    pub fn new(token: impl Into<String>, chat_id: i64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let per_second = NonZeroU32::new(RATE_LIMIT_PER_SEC).context("rate limit must be > 0")?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: TELEGRAM_API_BASE.to_string(),
            token: token.into(),
            chat_id,
            rate_limiter,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Rate-limited sendMessage with retry on 429 and server errors
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let url = self.method_url("sendMessage");
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let response = self.client.post(&url).json(&body).send().await;
            let response = match response {
                Ok(response) => response,
                Err(e) if attempt < MAX_RETRIES => {
                    tracing::warn!("sendMessage failed (attempt {}/{}): {}", attempt, MAX_RETRIES, e);
                    sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    continue;
                }
                Err(e) => return Err(e).context("sendMessage request failed"),
            };

            let status = response.status();
            let api: ApiResponse<serde_json::Value> = response
                .json()
                .await
                .context("Failed to decode sendMessage response")?;

            if api.ok {
                tracing::debug!(chat_id, "Telegram message sent");
                return Ok(());
            }

            if status.as_u16() == 429 || status.is_server_error() {
                let backoff_secs = api
                    .parameters
                    .and_then(|p| p.retry_after)
                    .unwrap_or_else(|| 2u64.pow(attempt));
                tracing::warn!(
                    "Telegram returned {}, backing off for {}s (attempt {}/{})",
                    status,
                    backoff_secs,
                    attempt,
                    MAX_RETRIES
                );
                if attempt < MAX_RETRIES {
                    sleep(Duration::from_secs(backoff_secs)).await;
                    continue;
                }
            }

            anyhow::bail!(
                "sendMessage rejected ({}): {}",
                status,
                api.description.unwrap_or_default()
            );
        }

        anyhow::bail!("sendMessage failed after {} attempts", MAX_RETRIES)
    }

    /// Long-poll getUpdates starting at `offset`
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });

        let api: ApiResponse<Vec<Update>> = self
            .client
            .post(self.method_url("getUpdates"))
            .json(&body)
            .timeout(Duration::from_secs(timeout_secs + 5))
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("Failed to decode getUpdates response")?;

        if !api.ok {
            anyhow::bail!("getUpdates failed: {}", api.description.unwrap_or_default());
        }
        Ok(api.result.unwrap_or_default())
    }
}

#[async_trait]
impl NotificationSender for TelegramClient {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, text: &str) -> anyhow::Result<()> {
        self.send_message(self.chat_id, text).await
    }
}

/// Text of an update if it comes from the operator chat
fn operator_text(update: &Update, allowed_chat_id: i64) -> Option<(i64, String)> {
    let message = update.message.as_ref()?;
    if message.chat.id != allowed_chat_id {
        tracing::warn!(chat_id = message.chat.id, "Ignoring message from unknown chat");
        return None;
    }
    Some((message.chat.id, message.text.clone()?))
}

/// Operator command loop over getUpdates long polling
pub struct TelegramBot {
    client: TelegramClient,
    router: Arc<CommandRouter>,
    allowed_chat_id: i64,
    poll_timeout_secs: u64,
}

impl TelegramBot {
    pub fn new(client: TelegramClient, router: Arc<CommandRouter>, allowed_chat_id: i64) -> Self {
        Self {
            client,
            router,
            allowed_chat_id,
            poll_timeout_secs: POLL_TIMEOUT_SECS,
        }
    }

    /// Offset past every update queued before startup.
    ///
    /// getUpdates with offset -1 returns only the newest update and confirms
    /// all older ones, so commands sent while the bot was down never run.
    async fn skip_pending(&self) -> Result<i64> {
        let updates = self.client.get_updates(-1, 0).await?;
        let Some(last) = updates.last() else {
            return Ok(0);
        };

        tracing::info!(update_id = last.update_id, "Dropping commands sent before startup");
        Ok(last.update_id + 1)
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("🤖 Telegram command polling started");

        let mut offset = loop {
            let skipped = tokio::select! {
                _ = shutdown.cancelled() => return,
                skipped = self.skip_pending() => skipped,
            };
            match skipped {
                Ok(offset) => break offset,
                Err(e) => {
                    tracing::error!("Could not drop pending updates: {:#}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(Duration::from_secs(POLL_ERROR_BACKOFF_SECS)) => {}
                    }
                }
            }
        };

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.client.get_updates(offset, self.poll_timeout_secs) => polled,
            };

            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Some((chat_id, text)) = operator_text(&update, self.allowed_chat_id) {
                            self.dispatch(chat_id, text);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Update polling failed: {:#}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(Duration::from_secs(POLL_ERROR_BACKOFF_SECS)) => {}
                    }
                }
            }
        }

        tracing::info!("Telegram command polling stopped");
    }

    /// Handle one command in its own task so `/status` answers while a trade settles
    fn dispatch(&self, chat_id: i64, text: String) {
        let command = BotCommand::parse(&text);
        tracing::info!(chat_id, command = ?command, "Command received");

        let client = self.client.clone();
        let router = self.router.clone();
        tokio::spawn(async move {
            if let Some(ack) = command.ack() {
                if let Err(e) = client.send_message(chat_id, ack).await {
                    tracing::warn!("Failed to send ack: {:#}", e);
                }
            }

            let reply = router.handle(command).await;
            if let Err(e) = client.send_message(chat_id, &reply).await {
                tracing::error!("Failed to send reply: {:#}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::TradeParams;
    use crate::error::{ExchangeError, ExchangeResult};
    use crate::execution::{EngineConfig, ExchangeClient, PositionEngine, PriceFeed, TickStream};
    use crate::models::{Balance, Fill, MarketOrder};
    use crate::notifier::{LogSender, Notifier};
    use mockito::Matcher;

    fn update(update_id: i64, chat_id: i64, text: Option<&str>) -> Update {
        Update {
            update_id,
            message: Some(Message {
                chat: Chat { id: chat_id },
                text: text.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_operator_text_filters_chats() {
        assert_eq!(
            operator_text(&update(1, 42, Some("/status")), 42),
            Some((42, "/status".to_string()))
        );
        assert_eq!(operator_text(&update(2, 7, Some("/trade")), 42), None);
        assert_eq!(operator_text(&update(3, 42, None), 42), None);
        assert_eq!(
            operator_text(
                &Update {
                    update_id: 4,
                    message: None
                },
                42
            ),
            None
        );
    }

    #[tokio::test]
    async fn test_send_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::Json(serde_json::json!({
                "chat_id": 42,
                "text": "hello",
            })))
            .with_body(r#"{"ok":true,"result":{"message_id":1}}"#)
            .create_async()
            .await;

        let client = TelegramClient::new("TOKEN", 42)
            .unwrap()
            .with_base_url(server.url());
        tokio_test::assert_ok!(client.send("hello").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_message_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(400)
            .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#)
            .create_async()
            .await;

        let client = TelegramClient::new("TOKEN", 42)
            .unwrap()
            .with_base_url(server.url());
        let err = client.send("hello").await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }

    #[tokio::test]
    async fn test_get_updates() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/botTOKEN/getUpdates")
            .match_body(Matcher::PartialJson(serde_json::json!({ "offset": 10 })))
            .with_body(
                r#"{"ok":true,"result":[
                    {"update_id":10,"message":{"message_id":5,"chat":{"id":42,"type":"private"},"text":"/status"}},
                    {"update_id":11,"edited_message":{"message_id":6,"chat":{"id":42,"type":"private"}}}
                ]}"#,
            )
            .create_async()
            .await;

        let client = TelegramClient::new("TOKEN", 42)
            .unwrap()
            .with_base_url(server.url());
        let updates = client.get_updates(10, 0).await.unwrap();

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].update_id, 10);
        assert_eq!(
            updates[0].message.as_ref().and_then(|m| m.text.as_deref()),
            Some("/status")
        );
        assert!(updates[1].message.is_none());
    }

    struct CountingExchange {
        orders: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl ExchangeClient for CountingExchange {
        fn name(&self) -> &str {
            "counting"
        }

        async fn place_market_order(&self, _order: &MarketOrder) -> ExchangeResult<Fill> {
            *self.orders.lock().unwrap() += 1;
            Err(ExchangeError::NotSupported("orders disabled".to_string()))
        }

        async fn balance(&self, coin: &str) -> ExchangeResult<Balance> {
            Err(ExchangeError::NotSupported(coin.to_string()))
        }
    }

    struct SilentFeed;

    impl PriceFeed for SilentFeed {
        fn subscribe(&self, _symbol: &str) -> TickStream {
            tokio::sync::mpsc::channel(1).1
        }
    }

    #[tokio::test]
    async fn test_commands_queued_before_startup_are_not_run() {
        let mut server = mockito::Server::new_async().await;
        let stale = server
            .mock("POST", "/botTOKEN/getUpdates")
            .match_body(Matcher::PartialJson(serde_json::json!({ "offset": -1 })))
            .with_body(
                r#"{"ok":true,"result":[
                    {"update_id":10,"message":{"message_id":5,"chat":{"id":42,"type":"private"},"text":"/trade"}}
                ]}"#,
            )
            .expect(1)
            .create_async()
            .await;
        let resumed = server
            .mock("POST", "/botTOKEN/getUpdates")
            .match_body(Matcher::PartialJson(serde_json::json!({ "offset": 11 })))
            .with_body(r#"{"ok":true,"result":[]}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        let replies = server
            .mock("POST", "/botTOKEN/sendMessage")
            .expect(0)
            .create_async()
            .await;

        let shutdown = CancellationToken::new();
        let exchange = Arc::new(CountingExchange {
            orders: std::sync::Mutex::new(0),
        });
        let (notifier, _) = Notifier::spawn(Arc::new(LogSender));
        let (engine, _) = PositionEngine::spawn(
            exchange.clone(),
            Arc::new(SilentFeed),
            notifier,
            EngineConfig::default(),
            shutdown.clone(),
        );
        let router = Arc::new(CommandRouter::new(
            engine,
            exchange.clone(),
            TradeParams {
                symbol: "BTCUSDT".to_string(),
                amount: rust_decimal::Decimal::ONE,
                target_profit_percent: rust_decimal::Decimal::ONE,
            },
        ));

        let client = TelegramClient::new("TOKEN", 42)
            .unwrap()
            .with_base_url(server.url());
        let mut bot = TelegramBot::new(client, router, 42);
        bot.poll_timeout_secs = 0;

        let task = tokio::spawn(bot.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        task.await.unwrap();

        stale.assert_async().await;
        resumed.assert_async().await;
        replies.assert_async().await;
        assert_eq!(*exchange.orders.lock().unwrap(), 0);
    }
}
