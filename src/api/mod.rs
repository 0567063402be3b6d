pub mod bybit;
pub mod paper;
pub mod telegram;

pub use bybit::{BybitClient, BybitConfig, Quote};
pub use paper::PaperExchange;
pub use telegram::{TelegramBot, TelegramClient};
