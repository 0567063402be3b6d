use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::Fill;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PositionState {
    #[default]
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
    Failed,
}

impl PositionState {
    /// Opening, Open and Closing block a new trade
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PositionState::Opening | PositionState::Open | PositionState::Closing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed | PositionState::Failed)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PositionState::Idle => "Idle",
            PositionState::Opening => "Opening",
            PositionState::Open => "Open",
            PositionState::Closing => "Closing",
            PositionState::Closed => "Closed",
            PositionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    TargetHit,
    Manual,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TargetHit => f.write_str("target hit"),
            CloseReason::Manual => f.write_str("manual"),
        }
    }
}

/// Phase in which a position failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailurePhase {
    Opening,
    Closing,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Opening => f.write_str("Opening"),
            FailurePhase::Closing => f.write_str("Closing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub phase: FailurePhase,
    pub reason: String,
}

/// Profit of a long position, in percent of the entry price.
///
/// A short variant would invert the sign here.
pub fn profit_percent(entry_price: Decimal, price: Decimal) -> Decimal {
    if entry_price.is_zero() {
        return Decimal::ZERO;
    }
    (price - entry_price) / entry_price * Decimal::ONE_HUNDRED
}

/// Price at which a long position reaches the target profit
pub fn target_price(entry_price: Decimal, target_profit_percent: Decimal) -> Decimal {
    entry_price * (Decimal::ONE + target_profit_percent / Decimal::ONE_HUNDRED)
}

/// The single tracked trade
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub amount: Decimal,
    pub target_profit_percent: Decimal,
    pub state: PositionState,
    pub entry_price: Option<Decimal>, // Fill price of the buy, set once
    pub last_price: Option<Decimal>,
    pub last_price_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub failure: Option<Failure>,
}

impl Position {
    /// Allocate a fresh position in the Opening state
    pub fn new(symbol: String, amount: Decimal, target_profit_percent: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            amount,
            target_profit_percent,
            state: PositionState::Opening,
            entry_price: None,
            last_price: None,
            last_price_at: None,
            opened_at: None,
            closed_at: None,
            exit_price: None,
            close_reason: None,
            failure: None,
        }
    }

    /// Client order id for this position's order on `side`
    pub fn client_order_id(&self, side: crate::models::Side) -> String {
        format!("{}{}", side.code(), self.id.simple())
    }

    /// Opening -> Open, recording the fill price as entry and the filled
    /// quantity as the amount to sell later
    pub fn confirm_open(&mut self, fill: &Fill) -> anyhow::Result<()> {
        if self.state != PositionState::Opening {
            anyhow::bail!("Cannot confirm open in state {}", self.state);
        }
        if fill.price <= Decimal::ZERO {
            anyhow::bail!("Fill price must be positive, got {}", fill.price);
        }
        if fill.quantity <= Decimal::ZERO {
            anyhow::bail!("Fill quantity must be positive, got {}", fill.quantity);
        }

        if fill.quantity != self.amount {
            tracing::warn!(
                position_id = %self.id,
                requested = %self.amount,
                filled = %fill.quantity,
                "Buy filled partially, tracking the filled quantity"
            );
        }
        self.amount = fill.quantity;
        self.entry_price = Some(fill.price);
        self.opened_at = Some(fill.timestamp);
        self.state = PositionState::Open;
        Ok(())
    }

    /// Record a market price. Returns true when the profit target is reached.
    ///
    /// Prices are only recorded while Open.
    pub fn on_price(&mut self, price: Decimal, timestamp: DateTime<Utc>) -> bool {
        if self.state != PositionState::Open {
            return false;
        }

        self.last_price = Some(price);
        self.last_price_at = Some(timestamp);

        self.unrealized_profit_percent()
            .is_some_and(|profit| profit >= self.target_profit_percent)
    }

    /// Open -> Closing. This is the at-most-once close guard.
    pub fn begin_close(&mut self, reason: CloseReason) -> Result<(), EngineError> {
        if self.state != PositionState::Open {
            return Err(EngineError::NotOpen(self.state));
        }

        self.state = PositionState::Closing;
        self.close_reason = Some(reason);
        Ok(())
    }

    /// Closing -> Closed
    pub fn confirm_close(&mut self, fill: &Fill) -> anyhow::Result<()> {
        if self.state != PositionState::Closing {
            anyhow::bail!("Cannot confirm close in state {}", self.state);
        }

        self.exit_price = Some(fill.price);
        self.closed_at = Some(fill.timestamp);
        self.state = PositionState::Closed;
        Ok(())
    }

    /// Opening or Closing -> Failed
    pub fn fail(&mut self, reason: String, at: DateTime<Utc>) -> anyhow::Result<FailurePhase> {
        let phase = match self.state {
            PositionState::Opening => FailurePhase::Opening,
            PositionState::Closing => FailurePhase::Closing,
            other => anyhow::bail!("Cannot fail position in state {}", other),
        };

        self.failure = Some(Failure { phase, reason });
        self.closed_at = Some(at);
        self.state = PositionState::Failed;
        Ok(phase)
    }

    pub fn target_price(&self) -> Option<Decimal> {
        self.entry_price
            .map(|entry| target_price(entry, self.target_profit_percent))
    }

    /// Profit at the last observed price, while the position is held
    pub fn unrealized_profit_percent(&self) -> Option<Decimal> {
        if !matches!(self.state, PositionState::Open | PositionState::Closing) {
            return None;
        }
        Some(profit_percent(self.entry_price?, self.last_price?))
    }

    pub fn realized_profit_percent(&self) -> Option<Decimal> {
        Some(profit_percent(self.entry_price?, self.exit_price?))
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            id: Some(self.id),
            symbol: self.symbol.clone(),
            state: self.state,
            amount: self.amount,
            target_profit_percent: self.target_profit_percent,
            entry_price: self.entry_price,
            target_price: self.target_price(),
            last_price: self.last_price,
            unrealized_profit_percent: self.unrealized_profit_percent(),
            exit_price: self.exit_price,
            realized_profit_percent: self.realized_profit_percent(),
            close_reason: self.close_reason,
            failure: self.failure.clone(),
            opened_at: self.opened_at,
            closed_at: self.closed_at,
        }
    }
}

/// Immutable point-in-time copy of the position, served to status readers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub id: Option<Uuid>, // None while Idle
    pub symbol: String,
    pub state: PositionState,
    pub amount: Decimal,
    pub target_profit_percent: Decimal,
    pub entry_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub unrealized_profit_percent: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub realized_profit_percent: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub failure: Option<Failure>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionSnapshot {
    pub fn idle() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(price: Decimal) -> Fill {
        Fill {
            order_id: "1".to_string(),
            price,
            quantity: dec!(1),
            timestamp: Utc::now(),
        }
    }

    fn open_position(entry: Decimal, target: Decimal) -> Position {
        let mut position = Position::new("BTCUSDT".to_string(), dec!(1), target);
        position.confirm_open(&fill(entry)).unwrap();
        position
    }

    #[test]
    fn test_new_position_is_opening() {
        let position = Position::new("BTCUSDT".to_string(), dec!(0.001), dec!(0.5));

        assert_eq!(position.state, PositionState::Opening);
        assert!(position.state.is_active());
        assert_eq!(position.entry_price, None);
        assert_eq!(position.snapshot().unrealized_profit_percent, None);
    }

    #[test]
    fn test_confirm_open_uses_fill_price() {
        let position = open_position(dec!(50000), dec!(0.5));

        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.entry_price, Some(dec!(50000)));
        assert_eq!(position.target_price(), Some(dec!(50250)));
        assert!(position.opened_at.is_some());
    }

    #[test]
    fn test_confirm_open_twice_fails() {
        let mut position = open_position(dec!(100), dec!(0.5));

        let result = position.confirm_open(&fill(dec!(200)));
        assert!(result.is_err());
        assert_eq!(position.entry_price, Some(dec!(100)));
    }

    #[test]
    fn test_confirm_open_rejects_zero_price() {
        let mut position = Position::new("BTCUSDT".to_string(), dec!(1), dec!(0.5));
        assert!(position.confirm_open(&fill(Decimal::ZERO)).is_err());
        assert_eq!(position.state, PositionState::Opening);
    }

    #[test]
    fn test_confirm_open_tracks_filled_quantity() {
        let mut position = Position::new("BTCUSDT".to_string(), dec!(1), dec!(0.5));
        let partial = Fill {
            quantity: dec!(0.4),
            ..fill(dec!(100))
        };

        position.confirm_open(&partial).unwrap();
        assert_eq!(position.amount, dec!(0.4));
        assert_eq!(position.snapshot().amount, dec!(0.4));
    }

    #[test]
    fn test_confirm_open_rejects_empty_fill() {
        let mut position = Position::new("BTCUSDT".to_string(), dec!(1), dec!(0.5));
        let empty = Fill {
            quantity: Decimal::ZERO,
            ..fill(dec!(100))
        };

        assert!(position.confirm_open(&empty).is_err());
        assert_eq!(position.state, PositionState::Opening);
        assert_eq!(position.amount, dec!(1));
    }

    #[test]
    fn test_target_boundary_is_inclusive() {
        let mut position = open_position(dec!(100), dec!(0.5));

        assert!(!position.on_price(dec!(100.49), Utc::now()));
        assert!(position.on_price(dec!(100.5), Utc::now()));
    }

    #[test]
    fn test_loss_does_not_trigger() {
        let mut position = open_position(dec!(100), dec!(0.5));

        assert!(!position.on_price(dec!(95), Utc::now()));
        assert_eq!(position.unrealized_profit_percent(), Some(dec!(-5)));
    }

    #[test]
    fn test_prices_ignored_unless_open() {
        let mut position = Position::new("BTCUSDT".to_string(), dec!(1), dec!(0.5));
        assert!(!position.on_price(dec!(100), Utc::now()));
        assert_eq!(position.last_price, None);

        position.confirm_open(&fill(dec!(100))).unwrap();
        position.begin_close(CloseReason::Manual).unwrap();

        assert!(!position.on_price(dec!(200), Utc::now()));
        assert_eq!(position.last_price, None);
    }

    #[test]
    fn test_begin_close_only_once() {
        let mut position = open_position(dec!(100), dec!(0.5));

        position.begin_close(CloseReason::TargetHit).unwrap();
        let result = position.begin_close(CloseReason::Manual);

        assert_eq!(result, Err(EngineError::NotOpen(PositionState::Closing)));
        assert_eq!(position.close_reason, Some(CloseReason::TargetHit));
    }

    #[test]
    fn test_close_records_realized_profit() {
        let mut position = open_position(dec!(50000), dec!(0.5));
        position.on_price(dec!(50250), Utc::now());
        position.begin_close(CloseReason::TargetHit).unwrap();
        position.confirm_close(&fill(dec!(50260))).unwrap();

        let snapshot = position.snapshot();
        assert_eq!(snapshot.state, PositionState::Closed);
        assert_eq!(snapshot.exit_price, Some(dec!(50260)));
        assert_eq!(snapshot.realized_profit_percent, Some(dec!(0.52)));
        assert_eq!(snapshot.unrealized_profit_percent, None);
        assert!(snapshot.closed_at.is_some());
    }

    #[test]
    fn test_fail_records_phase() {
        let mut position = Position::new("BTCUSDT".to_string(), dec!(1), dec!(0.5));
        let phase = position
            .fail("insufficient balance".to_string(), Utc::now())
            .unwrap();

        assert_eq!(phase, FailurePhase::Opening);
        assert_eq!(position.state, PositionState::Failed);
        assert!(position.state.is_terminal());

        let mut position = open_position(dec!(100), dec!(0.5));
        position.begin_close(CloseReason::Manual).unwrap();
        let phase = position.fail("timeout".to_string(), Utc::now()).unwrap();
        assert_eq!(phase, FailurePhase::Closing);
    }

    #[test]
    fn test_cannot_fail_open_position() {
        let mut position = open_position(dec!(100), dec!(0.5));
        assert!(position.fail("nope".to_string(), Utc::now()).is_err());
        assert_eq!(position.state, PositionState::Open);
    }

    #[test]
    fn test_client_order_ids_differ_by_side() {
        let position = Position::new("BTCUSDT".to_string(), dec!(1), dec!(0.5));
        let buy = position.client_order_id(crate::models::Side::Buy);
        let sell = position.client_order_id(crate::models::Side::Sell);

        assert_ne!(buy, sell);
        assert!(buy.len() <= 36);
    }

    #[test]
    fn test_idle_snapshot() {
        let snapshot = PositionSnapshot::idle();
        assert_eq!(snapshot.state, PositionState::Idle);
        assert_eq!(snapshot.id, None);
    }
}
