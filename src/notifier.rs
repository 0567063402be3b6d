//! Operator notifications.
//!
//! The engine hands a [`Notification`] to [`Notifier::notify`], which only
//! queues it. A worker task delivers queued messages in order through a
//! [`NotificationSender`]; delivery errors are logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::execution::{CloseReason, FailurePhase};

const QUEUE_CAPACITY: usize = 64;

/// A position state transition worth telling the operator about
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Opened {
        symbol: String,
        entry_price: Decimal,
        amount: Decimal,
        target_price: Decimal,
        timestamp: DateTime<Utc>,
    },
    Closed {
        symbol: String,
        reason: CloseReason,
        entry_price: Decimal,
        exit_price: Decimal,
        realized_profit_percent: Decimal,
        timestamp: DateTime<Utc>,
    },
    Failed {
        symbol: String,
        phase: FailurePhase,
        error: String,
    },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Opened {
                symbol,
                entry_price,
                amount,
                target_price,
                timestamp,
            } => write!(
                f,
                "✅ Position opened!\n\
                 Trading Pair: {symbol}\n\
                 Entry Price: {entry_price}\n\
                 Amount: {amount}\n\
                 Target Price: {:.2}\n\
                 Time: {}",
                target_price,
                timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            Notification::Closed {
                symbol,
                reason,
                entry_price,
                exit_price,
                realized_profit_percent,
                timestamp,
            } => {
                let title = match reason {
                    CloseReason::TargetHit => "🎯 Target reached, position closed!",
                    CloseReason::Manual => "✅ Position closed manually",
                };
                write!(
                    f,
                    "{title}\n\
                     Trading Pair: {symbol}\n\
                     Profit Percentage: {:.2}%\n\
                     Entry Price: {entry_price}\n\
                     Exit Price: {exit_price}\n\
                     Time: {}",
                    realized_profit_percent,
                    timestamp.format("%Y-%m-%d %H:%M:%S UTC")
                )
            }
            Notification::Failed {
                symbol,
                phase,
                error,
            } => {
                let action = match phase {
                    FailurePhase::Opening => "open",
                    FailurePhase::Closing => "close",
                };
                write!(
                    f,
                    "❌ Could not {action} the position\n\
                     Trading Pair: {symbol}\n\
                     Phase: {phase}\n\
                     Error: {error}"
                )?;
                if *phase == FailurePhase::Closing {
                    write!(f, "\n⚠️ Check the exchange account, the sell is not retried")?;
                }
                Ok(())
            }
        }
    }
}

/// Delivery channel for operator messages
#[async_trait]
pub trait NotificationSender: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, text: &str) -> anyhow::Result<()>;
}

/// Sender that only writes messages to the log
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, text: &str) -> anyhow::Result<()> {
        tracing::info!(target: "takeprofit::notify", "{}", text);
        Ok(())
    }
}

/// Fire-and-forget handle used by the engine
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Spawn the delivery worker and return the handle
    pub fn spawn(sender: Arc<dyn NotificationSender>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Notification>(QUEUE_CAPACITY);

        let worker = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let text = notification.to_string();
                match sender.send(&text).await {
                    Ok(()) => tracing::debug!(sender = sender.name(), "Notification delivered"),
                    Err(e) => tracing::warn!(
                        sender = sender.name(),
                        error = %e,
                        "Failed to deliver notification"
                    ),
                }
            }
            tracing::debug!("Notification worker stopped");
        });

        (Self { tx }, worker)
    }

    /// Queue a notification. Never blocks; drops it if the queue is full.
    pub fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            tracing::warn!("Dropping notification: {}", e);
        }
    }
}
