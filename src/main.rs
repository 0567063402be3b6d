use clap::Parser;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use takeprofit::api::{BybitClient, BybitConfig, PaperExchange, TelegramBot, TelegramClient};
use takeprofit::commands::{CommandRouter, TradeParams};
use takeprofit::config::Settings;
use takeprofit::execution::{BybitPriceFeed, ExchangeClient, PositionEngine};
use takeprofit::models::split_symbol;
use takeprofit::notifier::Notifier;
use takeprofit::Result;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Parser)]
#[command(name = "takeprofit")]
#[command(about = "Single-position take-profit bot for Bybit spot, operated over Telegram", long_about = None)]
#[command(version)]
struct Cli {
    /// Simulate fills against public quotes instead of placing real orders
    #[arg(long)]
    paper: bool,

    /// Starting quote-coin balance in paper mode
    #[arg(long, default_value = "10000")]
    paper_balance: Decimal,

    /// tracing filter, overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.log_filter.as_deref());

    tracing::info!("🚀 Take-profit bot starting");

    let settings = Settings::load()?;
    settings.validate(cli.paper)?;
    tracing::debug!(?settings, "Settings loaded");

    let exchange = build_exchange(&settings, &cli)?;

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Exchange: {} ({})", exchange.name(), if settings.testnet { "testnet" } else { "mainnet" });
    tracing::info!("  Pair: {}", settings.symbol);
    tracing::info!("  Amount: {}", settings.amount);
    tracing::info!("  Target Profit: {}%", settings.target_profit_percent);
    tracing::info!("  Order Timeout: {}s", settings.order_timeout_secs);

    let shutdown = CancellationToken::new();

    let telegram = TelegramClient::new(settings.telegram_token.clone(), settings.telegram_chat_id)?;
    let (notifier, notifier_task) = Notifier::spawn(Arc::new(telegram.clone()));

    let price_feed = Arc::new(BybitPriceFeed::new(settings.testnet, shutdown.clone()));
    let (engine, mut engine_task) = PositionEngine::spawn(
        exchange.clone(),
        price_feed,
        notifier,
        settings.engine_config(),
        shutdown.clone(),
    );

    let router = Arc::new(CommandRouter::new(
        engine.clone(),
        exchange,
        TradeParams {
            symbol: settings.symbol.clone(),
            amount: settings.amount,
            target_profit_percent: settings.target_profit_percent,
        },
    ));
    let bot = TelegramBot::new(telegram, router, settings.telegram_chat_id);
    let mut bot_task = tokio::spawn(bot.run(shutdown.clone()));

    tracing::info!("✅ Ready, send /trade in Telegram to open a position");
    tracing::info!("\nPress Ctrl+C to stop...\n");

    let (mut engine_done, mut bot_done) = (false, false);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = &mut engine_task => {
            engine_done = true;
            tracing::error!("Position engine exited: {:?}", result);
        }
        result = &mut bot_task => {
            bot_done = true;
            tracing::error!("Telegram bot exited: {:?}", result);
        }
    }

    let status = engine.status();
    if status.state.is_active() {
        tracing::warn!(
            "Exiting with position in state {} ({}), it is not persisted",
            status.state,
            status.symbol
        );
    }

    shutdown.cancel();
    drop(engine);

    // Let the notifier flush queued messages once the engine has dropped its handle
    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
    if tokio::time::timeout(grace, async {
        if !engine_done {
            let _ = engine_task.await;
        }
        if !bot_done {
            let _ = bot_task.await;
        }
        let _ = notifier_task.await;
    })
    .await
    .is_err()
    {
        tracing::warn!("Shutdown grace period elapsed");
    }

    tracing::info!("👋 Take-profit bot stopped");
    Ok(())
}

fn setup_logging(filter: Option<&str>) {
    let filter = filter
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "takeprofit=info".to_string());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_exchange(settings: &Settings, cli: &Cli) -> Result<Arc<dyn ExchangeClient>> {
    if cli.paper {
        let (_, quote) = split_symbol(&settings.symbol)
            .ok_or_else(|| format!("Cannot derive quote coin from {}", settings.symbol))?;
        tracing::info!(
            "📝 Paper mode: simulated fills, starting with {} {}",
            cli.paper_balance,
            quote
        );

        let market = BybitClient::new(BybitConfig::public(settings.testnet))?;
        let balances = HashMap::from([(quote.to_string(), cli.paper_balance)]);
        return Ok(Arc::new(PaperExchange::new(market, balances)));
    }

    let config = BybitConfig::new(
        settings.api_key.clone(),
        settings.api_secret.clone(),
        settings.testnet,
    )
    .with_recv_window(settings.recv_window_ms);
    Ok(Arc::new(BybitClient::new(config)?))
}
