mod candles;
mod config;
mod database;
mod engine;
mod exchange;
mod indicators;
mod notifications;
mod strategies;
mod trade;
mod types;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use candles::CandleStore;
use config::Config;
use database::{Database, WorkloadRepository};
use engine::WorkloadController;
use exchange::BinanceConnector;
use notifications::ChannelEventService;
use strategies::EmaCrossStrategy;
use types::{Account, Pair, Workload};

#[derive(Parser)]
#[command(name = "tradepilot")]
#[command(version = "0.1.0")]
#[command(about = "Automated cryptocurrency trading service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "tradepilot.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading service
    Run,
    /// Register an account and a workload for a trading pair
    AddWorkload {
        /// Trading pair, e.g. ETH/USDT
        #[arg(long)]
        pair: String,

        /// Account owner email (notification recipient)
        #[arg(long)]
        email: String,

        /// Exchange label, e.g. BINANCE
        #[arg(long, default_value = "BINANCE")]
        exchange: String,

        /// Exchange API key
        #[arg(long)]
        api_key: String,

        /// Exchange API secret
        #[arg(long)]
        api_secret: String,

        /// Fraction of the balance risked per trade, in (0, 1]
        #[arg(long, default_value = "0.02")]
        risk_factor: String,

        /// Maximum simultaneously open positions
        #[arg(long, default_value = "1")]
        open_positions_limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    init_logging(&config);

    info!("tradepilot v0.1.0");

    match cli.command {
        Commands::Run => run_service(config).await,
        Commands::AddWorkload {
            pair,
            email,
            exchange,
            api_key,
            api_secret,
            risk_factor,
            open_positions_limit,
        } => {
            add_workload(
                config,
                pair,
                email,
                exchange,
                api_key,
                api_secret,
                risk_factor,
                open_positions_limit,
            )
            .await
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_service(config: Config) -> Result<()> {
    let database = Arc::new(Database::new(&config.database.url).await?);

    let store = Arc::new(CandleStore::new(config.engine.candle_window_size));
    let signal_generator = Arc::new(EmaCrossStrategy::new());
    let connector = Arc::new(BinanceConnector::new(
        config.exchange.testnet,
        config.engine.request_timeout(),
    ));

    let (events, events_rx) = ChannelEventService::new(config.notifications.queue_capacity);
    ChannelEventService::spawn_logging_drain(events_rx);

    let controller = WorkloadController::new(
        database.clone(),
        connector,
        store,
        signal_generator,
        database.clone(),
        database.clone(),
        Arc::new(events),
        config.engine.clone(),
    );

    let token = CancellationToken::new();
    let controller_handle = tokio::spawn(controller.run(token.clone()));

    info!("trading service started; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    token.cancel();
    controller_handle.await?;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn add_workload(
    config: Config,
    pair: String,
    email: String,
    exchange: String,
    api_key: String,
    api_secret: String,
    risk_factor: String,
    open_positions_limit: i64,
) -> Result<()> {
    let pair = Pair::from_str(&pair)?;
    let risk_factor = Decimal::from_str(&risk_factor)?;

    if risk_factor <= Decimal::ZERO || risk_factor > Decimal::ONE {
        anyhow::bail!("risk factor must be in (0, 1]");
    }
    if open_positions_limit < 1 {
        anyhow::bail!("open positions limit must be >= 1");
    }

    let database = Database::new(&config.database.url).await?;

    let workload = Workload {
        id: Uuid::new_v4(),
        account: Account {
            id: Uuid::new_v4(),
            email,
            exchange,
            api_key,
            api_secret,
            risk_factor,
            open_positions_limit,
        },
        pair,
    };

    database.create_workload(&workload).await?;

    info!(
        "registered workload {} for {} on {}",
        workload.id, workload.pair, workload.account.exchange,
    );

    Ok(())
}
