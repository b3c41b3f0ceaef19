use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use sandbox_bridge_core::config::{Config, LoggingConfig};
use sandbox_bridge_core::types::{InteractionIds, PushEvent};
use sandbox_bridge_host::{
    HostBridge, HttpPersistenceApi, LoopbackRealtime, PersistenceApi, RealtimeChannel,
    UnconfiguredPersistence, WsRealtimeChannel,
};

#[derive(Parser)]
#[command(
    name = "sandbox-bridge",
    about = "Host bridge for sandboxed lesson interactions",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge server
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,

        /// Lesson id of an interaction to initialise on startup
        #[arg(long, requires_all = ["substage", "interaction"])]
        lesson: Option<String>,

        #[arg(long)]
        substage: Option<String>,

        #[arg(long)]
        interaction: Option<String>,

        #[arg(long)]
        processed_content: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let mut directives = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    for filter in &logging.filters {
        directives.push(',');
        directives.push_str(filter);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

async fn serve(
    config: Config,
    port: Option<u16>,
    initial: Option<InteractionIds>,
) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| config.host_port());
    let config = Arc::new(config);

    let api: Arc<dyn PersistenceApi> = match &config.persistence {
        Some(p) => Arc::new(HttpPersistenceApi::new(p, config.identity())?),
        None => {
            tracing::warn!("No persistence API configured; persistence calls will fail");
            Arc::new(UnconfiguredPersistence)
        }
    };

    let (realtime, pushes): (Arc<dyn RealtimeChannel>, Option<mpsc::UnboundedReceiver<PushEvent>>) =
        match &config.realtime {
            Some(rt) => {
                let (channel, pushes) = WsRealtimeChannel::connect(rt).await?;
                (Arc::new(channel), Some(pushes))
            }
            None => {
                tracing::info!("No real-time URL configured, using loopback channel");
                (Arc::new(LoopbackRealtime::new()), None)
            }
        };

    let bridge = HostBridge::new(config.clone(), realtime, api);
    if let Some(pushes) = pushes {
        bridge.spawn_push_pump(pushes);
    }
    if let Some(ids) = initial {
        bridge.initialize(ids).await;
    }

    let origins = bridge.state().origins.origins().join(", ");
    tracing::info!(
        origin = %config.host_origin(),
        allowed = %origins,
        "Starting sandbox bridge on port {port}"
    );
    sandbox_bridge_host::start_server(bridge, port).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve {
            port,
            lesson,
            substage,
            interaction,
            processed_content,
        } => {
            let initial = match (lesson, substage, interaction) {
                (Some(lesson), Some(substage), Some(interaction)) => Some(
                    InteractionIds::new(&lesson, &substage, &interaction)
                        .with_processed_content(processed_content),
                ),
                _ => None,
            };
            serve(config, port, initial).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}
