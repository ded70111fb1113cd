use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

use hue2mqtt::config::{AppConfig, ConfigError, LogLevel};
use hue2mqtt::hue::{ClipClient, HueConnector, HueError};
use hue2mqtt::mqtt::{MqttProxy, RumqttcClient};
use hue2mqtt::runner::Runner;
use hue2mqtt::thing::ThingRegistry;

/// Conventional exit status for configuration errors (EX_CONFIG).
const EX_CONFIG: u8 = 78;

#[derive(Parser)]
#[command(name = "hue2mqtt", version, about = "Philips Hue to MQTT bridge")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config_file: PathBuf,

    /// Override the configured log level
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::from_file(&args.config_file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EX_CONFIG);
        }
    };

    let level = args.log_level.unwrap_or(config.logging.level);
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(level))
        .init();
    info!("hue2mqtt starting");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            if is_config_failure(&err) {
                ExitCode::from(EX_CONFIG)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Misconfiguration, including a rejected app key, should not be retried
/// by a supervisor the way transient failures are.
fn is_config_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ConfigError>().is_some()
        || matches!(err.downcast_ref::<HueError>(), Some(HueError::Unauthorized))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let things = ThingRegistry::from_config(&config)?;
    let connector = HueConnector::new(ClipClient::new(&config.hue_bridge)?, &config.hue_bridge);
    let proxy = MqttProxy::new(RumqttcClient::new(&config.mqtt), &things);

    let mut runner = Runner::new(things, connector, proxy);
    runner.run().await
}
