//! Position lifecycle engine.
//!
//! One actor task owns the [`Position`] and processes operator commands,
//! price ticks and order settlements one at a time. Exchange calls run in
//! spawned tasks and report back as settlements, so the actor keeps draining
//! ticks while an order is in flight. After every mutation the actor publishes
//! a fresh [`PositionSnapshot`] on a `watch` channel, which is what
//! [`PositionEngine::status`] reads.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::exchange::ExchangeClient;
use super::position::{CloseReason, Position, PositionSnapshot, PositionState};
use super::price_feed::{PriceFeed, TickStream};
use crate::error::EngineError;
use crate::models::{Fill, MarketOrder, Side, Tick};
use crate::notifier::{Notification, Notifier};

const COMMAND_BUFFER: usize = 256;
const DEFAULT_ORDER_TIMEOUT_SECS: u64 = 10;

type Reply = oneshot::Sender<Result<PositionSnapshot, EngineError>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for a single exchange order call
    pub order_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order_timeout: Duration::from_secs(DEFAULT_ORDER_TIMEOUT_SECS),
        }
    }
}

enum Command {
    Open {
        symbol: String,
        amount: Decimal,
        target_profit_percent: Decimal,
        reply: Reply,
    },
    Close {
        reply: Reply,
    },
    Tick(Tick),
}

/// Outcome of an order placed by a spawned task
enum Settlement {
    Open {
        position_id: Uuid,
        outcome: Result<Fill, EngineError>,
        reply: Reply,
    },
    Close {
        position_id: Uuid,
        outcome: Result<Fill, EngineError>,
        reply: Option<Reply>, // None when the close was triggered by a tick
    },
}

/// Cloneable handle to the engine actor
#[derive(Clone)]
pub struct PositionEngine {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<PositionSnapshot>,
}

impl PositionEngine {
    /// Start the engine actor. It runs until `shutdown` is cancelled or every
    /// handle is dropped.
    pub fn spawn(
        exchange: Arc<dyn ExchangeClient>,
        price_feed: Arc<dyn PriceFeed>,
        notifier: Notifier,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (settled_tx, settled_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(PositionSnapshot::idle());

        let actor = EngineActor {
            exchange,
            price_feed,
            notifier,
            config,
            position: None,
            subscribed: None,
            ticks: None,
            commands: cmd_rx,
            settled_tx,
            settled_rx,
            snapshot: snapshot_tx,
        };
        let handle = tokio::spawn(actor.run(shutdown));

        (
            Self {
                commands: cmd_tx,
                snapshot: snapshot_rx,
            },
            handle,
        )
    }

    /// Open a long position with a market buy.
    ///
    /// Resolves once the buy settles: with the Open snapshot on a fill, or with
    /// the error that moved the position to Failed.
    pub async fn open(
        &self,
        symbol: impl Into<String>,
        amount: Decimal,
        target_profit_percent: Decimal,
    ) -> Result<PositionSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Open {
                symbol: symbol.into(),
                amount,
                target_profit_percent,
                reply,
            },
            rx,
        )
        .await
    }

    /// Manually close the open position. Resolves once the sell settles.
    pub async fn close(&self) -> Result<PositionSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Close { reply }, rx).await
    }

    /// Feed a price observation to the engine. Ticks for other symbols, or
    /// while no position is open, are discarded.
    pub async fn on_tick(&self, tick: Tick) {
        if self.commands.send(Command::Tick(tick)).await.is_err() {
            tracing::debug!("Tick dropped, engine stopped");
        }
    }

    /// Latest published snapshot. Never blocks on the actor.
    pub fn status(&self) -> PositionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch receiver for snapshot changes
    pub fn subscribe_status(&self) -> watch::Receiver<PositionSnapshot> {
        self.snapshot.clone()
    }

    async fn request(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<PositionSnapshot, EngineError>>,
    ) -> Result<PositionSnapshot, EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }
}

struct EngineActor {
    exchange: Arc<dyn ExchangeClient>,
    price_feed: Arc<dyn PriceFeed>,
    notifier: Notifier,
    config: EngineConfig,
    position: Option<Position>,
    subscribed: Option<String>,
    ticks: Option<TickStream>,
    commands: mpsc::Receiver<Command>,
    settled_tx: mpsc::Sender<Settlement>,
    settled_rx: mpsc::Receiver<Settlement>,
    snapshot: watch::Sender<PositionSnapshot>,
}

impl EngineActor {
    async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("🚀 Position engine started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                Some(settlement) = self.settled_rx.recv() => self.handle_settlement(settlement),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                tick = next_tick(&mut self.ticks) => match tick {
                    Some(tick) => self.handle_tick(tick),
                    None => {
                        tracing::warn!("Price feed ended, no more ticks");
                        self.ticks = None;
                        self.subscribed = None;
                    }
                },
            }
        }

        if let Some(position) = &self.position {
            if matches!(position.state, PositionState::Opening | PositionState::Closing) {
                tracing::warn!(
                    position_id = %position.id,
                    state = %position.state,
                    "Engine stopping with an order in flight, check the exchange account"
                );
            }
        }
        tracing::info!("Position engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                symbol,
                amount,
                target_profit_percent,
                reply,
            } => self.handle_open(symbol, amount, target_profit_percent, reply),
            Command::Close { reply } => self.handle_manual_close(reply),
            Command::Tick(tick) => self.handle_tick(tick),
        }
    }

    fn handle_open(
        &mut self,
        symbol: String,
        amount: Decimal,
        target_profit_percent: Decimal,
        reply: Reply,
    ) {
        if let Err(e) = validate_open(&symbol, amount, target_profit_percent) {
            let _ = reply.send(Err(e));
            return;
        }

        if let Some(current) = &self.position {
            if current.state.is_active() {
                tracing::info!(state = %current.state, "Trade rejected, position already active");
                let _ = reply.send(Err(EngineError::AlreadyActive(current.state)));
                return;
            }
        }

        let position = Position::new(symbol, amount, target_profit_percent);
        tracing::info!(
            position_id = %position.id,
            symbol = %position.symbol,
            amount = %amount,
            target = %target_profit_percent,
            "Opening position"
        );

        self.ensure_subscribed(&position.symbol);

        let order = MarketOrder {
            symbol: position.symbol.clone(),
            side: Side::Buy,
            quantity: position.amount,
            client_order_id: position.client_order_id(Side::Buy),
        };
        let position_id = position.id;
        self.position = Some(position);
        self.publish();

        let exchange = self.exchange.clone();
        let settled = self.settled_tx.clone();
        let timeout = self.config.order_timeout;
        tokio::spawn(async move {
            let outcome = place_order(exchange.as_ref(), &order, timeout).await;
            let _ = settled
                .send(Settlement::Open {
                    position_id,
                    outcome,
                    reply,
                })
                .await;
        });
    }

    fn handle_manual_close(&mut self, reply: Reply) {
        let Some(position) = self.position.as_mut() else {
            let _ = reply.send(Err(EngineError::NotOpen(PositionState::Idle)));
            return;
        };

        if let Err(e) = position.begin_close(CloseReason::Manual) {
            tracing::info!("Manual close rejected: {}", e);
            let _ = reply.send(Err(e));
            return;
        }

        tracing::info!(position_id = %position.id, "Closing position on operator request");
        self.publish();
        self.spawn_close(Some(reply));
    }

    fn handle_tick(&mut self, tick: Tick) {
        let Some(position) = self.position.as_mut() else {
            return;
        };
        if position.symbol != tick.symbol || position.state != PositionState::Open {
            return;
        }

        let target_hit = position.on_price(tick.price, tick.timestamp);
        if target_hit {
            // Open -> Closing is committed before the sell goes out; later ticks see Closing
            if let Err(e) = position.begin_close(CloseReason::TargetHit) {
                tracing::error!("Target hit but close guard refused: {}", e);
                self.publish();
                return;
            }
            tracing::info!(
                position_id = %position.id,
                price = %tick.price,
                profit = ?position.unrealized_profit_percent(),
                "🎯 Target reached, closing position"
            );
            self.publish();
            self.spawn_close(None);
        } else {
            tracing::trace!(price = %tick.price, "Tick");
            self.publish();
        }
    }

    fn spawn_close(&self, reply: Option<Reply>) {
        let Some(position) = &self.position else {
            return;
        };

        let order = MarketOrder {
            symbol: position.symbol.clone(),
            side: Side::Sell,
            quantity: position.amount,
            client_order_id: position.client_order_id(Side::Sell),
        };
        let position_id = position.id;

        let exchange = self.exchange.clone();
        let settled = self.settled_tx.clone();
        let timeout = self.config.order_timeout;
        tokio::spawn(async move {
            let outcome = place_order(exchange.as_ref(), &order, timeout).await;
            let _ = settled
                .send(Settlement::Close {
                    position_id,
                    outcome,
                    reply,
                })
                .await;
        });
    }

    fn handle_settlement(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Open {
                position_id,
                outcome,
                reply,
            } => {
                let result = self.settle_open(position_id, outcome);
                let _ = reply.send(result);
            }
            Settlement::Close {
                position_id,
                outcome,
                reply,
            } => {
                let result = self.settle_close(position_id, outcome);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
        self.publish();
    }

    fn settle_open(
        &mut self,
        position_id: Uuid,
        outcome: Result<Fill, EngineError>,
    ) -> Result<PositionSnapshot, EngineError> {
        let position = tracked(&mut self.position, position_id)?;

        let outcome = outcome.and_then(|fill| {
            position
                .confirm_open(&fill)
                .map(|_| fill)
                .map_err(|e| EngineError::ExchangeRejected(e.to_string()))
        });

        match outcome {
            Ok(fill) => {
                tracing::info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    entry = %fill.price,
                    "✅ Position opened"
                );
                self.notifier.notify(Notification::Opened {
                    symbol: position.symbol.clone(),
                    entry_price: fill.price,
                    amount: position.amount,
                    target_price: position.target_price().unwrap_or(fill.price),
                    timestamp: fill.timestamp,
                });
                Ok(position.snapshot())
            }
            Err(e) => {
                tracing::error!(position_id = %position.id, "❌ Open failed: {}", e);
                self.fail(position_id, &e);
                Err(e)
            }
        }
    }

    fn settle_close(
        &mut self,
        position_id: Uuid,
        outcome: Result<Fill, EngineError>,
    ) -> Result<PositionSnapshot, EngineError> {
        let position = tracked(&mut self.position, position_id)?;

        match outcome {
            Ok(fill) => {
                if let Err(e) = position.confirm_close(&fill) {
                    tracing::error!("Close fill for position in unexpected state: {:#}", e);
                    return Err(EngineError::InvalidRequest(e.to_string()));
                }

                let realized = position.realized_profit_percent().unwrap_or_default();
                let reason = position.close_reason.unwrap_or(CloseReason::Manual);
                tracing::info!(
                    position_id = %position.id,
                    exit = %fill.price,
                    realized = %realized.round_dp(4),
                    reason = %reason,
                    "Position closed"
                );
                self.notifier.notify(Notification::Closed {
                    symbol: position.symbol.clone(),
                    reason,
                    entry_price: position.entry_price.unwrap_or_default(),
                    exit_price: fill.price,
                    realized_profit_percent: realized,
                    timestamp: fill.timestamp,
                });
                Ok(position.snapshot())
            }
            Err(e) => {
                tracing::error!(
                    position_id = %position.id,
                    "❌ Close failed, not retrying: {}",
                    e
                );
                self.fail(position_id, &e);
                Err(e)
            }
        }
    }

    /// Move the in-flight position to Failed and tell the operator
    fn fail(&mut self, position_id: Uuid, error: &EngineError) {
        let Ok(position) = tracked(&mut self.position, position_id) else {
            return;
        };

        match position.fail(error.to_string(), Utc::now()) {
            Ok(phase) => self.notifier.notify(Notification::Failed {
                symbol: position.symbol.clone(),
                phase,
                error: error.to_string(),
            }),
            Err(e) => tracing::error!("Could not mark position failed: {:#}", e),
        }
    }

    fn ensure_subscribed(&mut self, symbol: &str) {
        if self.subscribed.as_deref() == Some(symbol) && self.ticks.is_some() {
            return;
        }
        tracing::info!(symbol, "Subscribing to price feed");
        self.ticks = Some(self.price_feed.subscribe(symbol));
        self.subscribed = Some(symbol.to_string());
    }

    fn publish(&self) {
        let snapshot = self
            .position
            .as_ref()
            .map(Position::snapshot)
            .unwrap_or_default();
        self.snapshot.send_replace(snapshot);
    }
}

/// The tracked position, if it is the one a settlement refers to
fn tracked(
    position: &mut Option<Position>,
    position_id: Uuid,
) -> Result<&mut Position, EngineError> {
    match position.as_mut() {
        Some(position) if position.id == position_id => Ok(position),
        _ => {
            tracing::error!(%position_id, "Settlement for unknown position");
            Err(EngineError::InvalidRequest(format!(
                "unknown position {}",
                position_id
            )))
        }
    }
}

fn validate_open(symbol: &str, amount: Decimal, target: Decimal) -> Result<(), EngineError> {
    if symbol.trim().is_empty() {
        return Err(EngineError::InvalidRequest("symbol is empty".to_string()));
    }
    if amount <= Decimal::ZERO {
        return Err(EngineError::InvalidRequest(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    if target <= Decimal::ZERO {
        return Err(EngineError::InvalidRequest(format!(
            "target profit percent must be positive, got {}",
            target
        )));
    }
    Ok(())
}

/// Place one order under the deadline. Never retries.
async fn place_order(
    exchange: &dyn ExchangeClient,
    order: &MarketOrder,
    timeout: Duration,
) -> Result<Fill, EngineError> {
    tracing::debug!(
        exchange = exchange.name(),
        side = %order.side,
        symbol = %order.symbol,
        quantity = %order.quantity,
        client_order_id = %order.client_order_id,
        "Placing market order"
    );

    match tokio::time::timeout(timeout, exchange.place_market_order(order)).await {
        Ok(Ok(fill)) => Ok(fill),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(EngineError::ExchangeTimeout(timeout.as_millis() as u64)),
    }
}

async fn next_tick(ticks: &mut Option<TickStream>) -> Option<Tick> {
    match ticks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
