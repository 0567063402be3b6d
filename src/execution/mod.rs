// Position lifecycle: state machine, engine actor and its collaborators
pub mod engine;
pub mod exchange;
pub mod position;
pub mod price_feed;

pub use engine::{EngineConfig, PositionEngine};
pub use exchange::ExchangeClient;
pub use position::{
    profit_percent, target_price, CloseReason, Failure, FailurePhase, Position, PositionSnapshot,
    PositionState,
};
pub use price_feed::{BybitPriceFeed, PriceFeed, TickStream};
