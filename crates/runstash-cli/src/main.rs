use clap::Parser;
use runstash_cli::{AppConfig, Cli, commands};
use runstash_logging::SubscriberBuilder;
use runstash_store::RunStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?.with_overrides(&cli);

    let _log_guard = SubscriberBuilder::new()
        .with_config(config.log.clone())
        .try_init()?;

    let store = RunStore::open(config.store).await?;
    let result = commands::run(&store, cli.command).await;
    store.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
