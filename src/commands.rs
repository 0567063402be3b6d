//! Operator commands and their mapping onto the position engine.

use rust_decimal::Decimal;
use std::sync::Arc;

use crate::error::EngineError;
use crate::execution::{ExchangeClient, PositionEngine, PositionSnapshot, PositionState};
use crate::models::split_symbol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Help,
    Trade,
    Status,
    Close,
    Balance,
    Unknown(String),
}

impl BotCommand {
    /// Parse `/command` text. Bot mentions (`/status@my_bot`) are accepted.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();

        let Some(rest) = text.strip_prefix('/') else {
            return BotCommand::Unknown(text.to_string());
        };

        let command = rest
            .split_whitespace()
            .next()
            .and_then(|word| word.split('@').next())
            .map(|word| word.to_lowercase());

        match command.as_deref() {
            Some("start") | Some("help") => BotCommand::Help,
            Some("trade") => BotCommand::Trade,
            Some("status") | Some("s") => BotCommand::Status,
            Some("close") => BotCommand::Close,
            Some("balance") | Some("b") => BotCommand::Balance,
            _ => BotCommand::Unknown(text.to_string()),
        }
    }

    /// Interim reply for commands that wait on the exchange
    pub fn ack(&self) -> Option<&'static str> {
        match self {
            BotCommand::Trade => Some("⏳ Opening a position, please wait..."),
            BotCommand::Close => Some("⏳ Closing the position, please wait..."),
            _ => None,
        }
    }
}

/// Parameters used for every `/trade`
#[derive(Debug, Clone)]
pub struct TradeParams {
    pub symbol: String,
    pub amount: Decimal,
    pub target_profit_percent: Decimal,
}

/// Executes operator commands against the engine and renders replies
pub struct CommandRouter {
    engine: PositionEngine,
    exchange: Arc<dyn ExchangeClient>,
    params: TradeParams,
}

impl CommandRouter {
    pub fn new(engine: PositionEngine, exchange: Arc<dyn ExchangeClient>, params: TradeParams) -> Self {
        Self {
            engine,
            exchange,
            params,
        }
    }

    pub async fn handle(&self, command: BotCommand) -> String {
        tracing::debug!(?command, "Handling command");

        match command {
            BotCommand::Help => self.help(),
            BotCommand::Trade => self.trade().await,
            BotCommand::Status => format_status(&self.engine.status()),
            BotCommand::Close => self.close().await,
            BotCommand::Balance => self.balance().await,
            BotCommand::Unknown(text) => {
                format!("❓ Unknown command: {}\nSend /help for the command list", text)
            }
        }
    }

    fn help(&self) -> String {
        format!(
            "👋 Hello! I am a take-profit trading bot for Bybit.\n\
             Pair: {} | Amount: {} | Target: {}%\n\
             Available commands:\n\
             /trade - open a new position\n\
             /status - check the current position\n\
             /close - close the open position now\n\
             /balance - show account balances",
            self.params.symbol, self.params.amount, self.params.target_profit_percent
        )
    }

    async fn trade(&self) -> String {
        let result = self
            .engine
            .open(
                self.params.symbol.clone(),
                self.params.amount,
                self.params.target_profit_percent,
            )
            .await;

        match result {
            Ok(snapshot) => format!(
                "✅ Position opened!\n\
                 Trading Pair: {}\n\
                 Entry Price: {}\n\
                 Target Price: {}\n\
                 Amount: {}",
                snapshot.symbol,
                fmt_price(snapshot.entry_price),
                fmt_price(snapshot.target_price),
                snapshot.amount
            ),
            Err(EngineError::AlreadyActive(state)) => {
                format!("⚠️ A position is already active ({})", state)
            }
            Err(e) => format!("❌ Could not open the position: {}", e),
        }
    }

    async fn close(&self) -> String {
        match self.engine.close().await {
            Ok(snapshot) => format!(
                "✅ Position closed\n\
                 Trading Pair: {}\n\
                 Exit Price: {}\n\
                 Profit: {}",
                snapshot.symbol,
                fmt_price(snapshot.exit_price),
                fmt_percent(snapshot.realized_profit_percent)
            ),
            Err(EngineError::NotOpen(PositionState::Closing)) => {
                "⚠️ The position is already being closed".to_string()
            }
            Err(EngineError::NotOpen(_)) => "⚠️ No open position".to_string(),
            Err(e) => format!("❌ Could not close the position: {}", e),
        }
    }

    async fn balance(&self) -> String {
        let coins = match split_symbol(&self.params.symbol) {
            Some((base, quote)) => vec![base.to_string(), quote.to_string()],
            None => vec![self.params.symbol.clone()],
        };

        let mut lines = vec!["💰 Balances:".to_string()];
        for coin in coins {
            match self.exchange.balance(&coin).await {
                Ok(balance) => lines.push(format!(
                    "{}: {} (available {})",
                    balance.coin, balance.total, balance.available
                )),
                Err(e) => {
                    tracing::warn!(coin = %coin, "Balance query failed: {}", e);
                    lines.push(format!("{}: ❌ {}", coin, e));
                }
            }
        }
        lines.join("\n")
    }
}

/// Render a snapshot for `/status`
pub fn format_status(snapshot: &PositionSnapshot) -> String {
    match snapshot.state {
        PositionState::Idle => "⚠️ No open position".to_string(),
        PositionState::Opening => format!(
            "⏳ Opening position\nTrading Pair: {}\nAmount: {}",
            snapshot.symbol, snapshot.amount
        ),
        PositionState::Open | PositionState::Closing => format!(
            "📊 Current position:\n\
             Trading Pair: {}\n\
             State: {}\n\
             Entry Price: {}\n\
             Target Price: {}\n\
             Current Price: {}\n\
             Profit: {}",
            snapshot.symbol,
            snapshot.state,
            fmt_price(snapshot.entry_price),
            fmt_price(snapshot.target_price),
            fmt_price(snapshot.last_price),
            fmt_percent(snapshot.unrealized_profit_percent)
        ),
        PositionState::Closed => format!(
            "📊 Last position:\n\
             Trading Pair: {}\n\
             State: Closed ({})\n\
             Entry Price: {}\n\
             Exit Price: {}\n\
             Profit: {}",
            snapshot.symbol,
            snapshot
                .close_reason
                .map(|r| r.to_string())
                .unwrap_or_default(),
            fmt_price(snapshot.entry_price),
            fmt_price(snapshot.exit_price),
            fmt_percent(snapshot.realized_profit_percent)
        ),
        PositionState::Failed => {
            let (phase, reason) = snapshot
                .failure
                .as_ref()
                .map(|f| (f.phase.to_string(), f.reason.clone()))
                .unwrap_or_default();
            format!(
                "❌ Last position failed\n\
                 Trading Pair: {}\n\
                 State: Failed ({})\n\
                 Error: {}\n\
                 Send /trade to open a new position",
                snapshot.symbol, phase, reason
            )
        }
    }
}

fn fmt_price(price: Option<Decimal>) -> String {
    price
        .map(|p| p.round_dp(8).normalize().to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

fn fmt_percent(percent: Option<Decimal>) -> String {
    percent
        .map(|p| format!("{:.2}%", p))
        .unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{CloseReason, Failure, FailurePhase};
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_commands() {
        assert_eq!(BotCommand::parse("/start"), BotCommand::Help);
        assert_eq!(BotCommand::parse("/help"), BotCommand::Help);
        assert_eq!(BotCommand::parse("/trade"), BotCommand::Trade);
        assert_eq!(BotCommand::parse("  /STATUS  "), BotCommand::Status);
        assert_eq!(BotCommand::parse("/status@takeprofit_bot"), BotCommand::Status);
        assert_eq!(BotCommand::parse("/close"), BotCommand::Close);
        assert_eq!(BotCommand::parse("/balance"), BotCommand::Balance);
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(
            BotCommand::parse("/moon"),
            BotCommand::Unknown("/moon".to_string())
        );
        assert_eq!(
            BotCommand::parse("hello"),
            BotCommand::Unknown("hello".to_string())
        );
    }

    #[test]
    fn test_ack_only_for_exchange_commands() {
        assert!(BotCommand::Trade.ack().is_some());
        assert!(BotCommand::Close.ack().is_some());
        assert!(BotCommand::Status.ack().is_none());
    }

    #[test]
    fn test_status_idle() {
        assert_eq!(format_status(&PositionSnapshot::idle()), "⚠️ No open position");
    }

    #[test]
    fn test_status_open() {
        let snapshot = PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            state: PositionState::Open,
            amount: dec!(0.001),
            target_profit_percent: dec!(0.5),
            entry_price: Some(dec!(50000)),
            target_price: Some(dec!(50250.000)),
            last_price: Some(dec!(50100)),
            unrealized_profit_percent: Some(dec!(0.2)),
            ..Default::default()
        };

        let text = format_status(&snapshot);
        assert!(text.contains("Trading Pair: BTCUSDT"));
        assert!(text.contains("State: Open"));
        assert!(text.contains("Entry Price: 50000"));
        assert!(text.contains("Target Price: 50250"));
        assert!(text.contains("Current Price: 50100"));
        assert!(text.contains("Profit: 0.20%"));
    }

    #[test]
    fn test_status_closed_and_failed() {
        let closed = PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            state: PositionState::Closed,
            entry_price: Some(dec!(50000)),
            exit_price: Some(dec!(50260)),
            realized_profit_percent: Some(dec!(0.52)),
            close_reason: Some(CloseReason::TargetHit),
            ..Default::default()
        };
        let text = format_status(&closed);
        assert!(text.contains("State: Closed (target hit)"));
        assert!(text.contains("Profit: 0.52%"));

        let failed = PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            state: PositionState::Failed,
            failure: Some(Failure {
                phase: FailurePhase::Opening,
                reason: "insufficient balance".to_string(),
            }),
            ..Default::default()
        };
        let text = format_status(&failed);
        assert!(text.contains("State: Failed (Opening)"));
        assert!(text.contains("insufficient balance"));
    }
}
