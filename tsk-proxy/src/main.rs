mod bus;
mod config;
mod proxy;

use anyhow::Context;
use bus::KafkaBusConsumer;
use clap::Parser;
use config::ProxyConfig;
use log::{error, info};
use proxy::Proxy;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Bus-to-storage bridge: consumes TSKBATCH frames, filters, rebatches,
/// and forwards to a storage backend.
#[derive(Parser, Debug)]
#[command(name = "tsk-proxy", version, about)]
struct Cli {
    /// Path to the proxy's YAML configuration file.
    config: PathBuf,

    /// Overrides the config file's `log-level` (0-5, Off..Trace).
    #[arg(long)]
    log_level: Option<u8>,
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = ProxyConfig::load(&cli.config).context("loading configuration")?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    env_logger::Builder::new()
        .filter_level(config.level_filter())
        .init();
    info!(
        "tsk-proxy starting: channel={} consumer_group={}",
        config.kafka_channel, config.kafka_consumer_group
    );

    let topic = format!("{}.{}", config.kafka_topic_prefix, config.kafka_channel);
    let consumer = KafkaBusConsumer::connect(
        &config.kafka_brokers,
        &config.kafka_consumer_group,
        &topic,
        &config.kafka_offset,
    )
    .context("connecting to bus")?;

    let shutdown = Arc::new(AtomicU32::new(0));
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        let prev = handler_shutdown.fetch_add(1, Ordering::SeqCst);
        info!("received SIGINT (count={})", prev + 1);
    })
    .context("installing SIGINT handler")?;

    let mut proxy = Proxy::new(config, consumer, shutdown).context("initializing proxy")?;
    proxy.run()
}
