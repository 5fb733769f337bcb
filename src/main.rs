mod cli;

use clap::Parser;
use cli::{Cli, Commands, DbCommands};
use smsledger::config::{Config, LogFormat};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_info = Config::from_env()?;
    init_tracing(config_info.config.log_format);
    tracing::info!(
        profile = config_info.profile.as_str(),
        overrides = config_info.overrides.len(),
        "Configuration loaded"
    );
    let config = &config_info.config;

    match cli.command.unwrap_or(Commands::Worker) {
        Commands::Worker => cli::handle_worker(config).await,
        Commands::Wallet(command) => cli::handle_wallet(config, command).await,
        Commands::Account(command) => cli::handle_account(config, command).await,
        Commands::Message(command) => cli::handle_message(config, command).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(config).await,
        Commands::Config => cli::handle_config_validate(&config_info),
    }
}
