use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use hub_client::WsHubClient;
use interpreter_bot::{
    config::{ConfigManager, EnvConfigManager},
    interpreter::Interpreter,
    logger::init_tracing,
    settings::Settings,
    template::HandlebarsRenderer,
};
use schemars::schema_for;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

const SWEEP_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "interpreter",
    about = "Routes every human question through rewrite, routing, answer and completion bots",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the hub and serve the conversation
    Run(RunArgs),

    /// Print the JSON-Schema of the settings file
    Schema(SchemaArgs),

    /// Check a settings file and the templates it points to
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = "config/settings.yaml")]
    settings: PathBuf,

    /// Loaded into the environment before `INTERPRETER_*` overrides are read
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Log level (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            settings: PathBuf::from("config/settings.yaml"),
            env_file: PathBuf::from(".env"),
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Write to this file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(default_value = "config/settings.yaml")]
    settings: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => {
            let schema = serde_json::to_string_pretty(&schema_for!(Settings))?;
            match args.out {
                Some(path) => {
                    fs::write(&path, schema)?;
                    println!("Schema written to {}", path.display());
                }
                None => println!("{schema}"),
            }
            Ok(())
        }
        Commands::Validate(args) => {
            load_checked(&args.settings)?;
            println!("✅ {} is valid.", args.settings.display());
            Ok(())
        }
    }
}

/// Parse and validate the settings file, then compile its templates.
fn load_checked(path: &Path) -> anyhow::Result<()> {
    let settings = Settings::load(path)?;
    settings.validate()?;
    HandlebarsRenderer::from_files(&settings.interpreter.templates)?;
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(&args.log_dir, "interpreter.log", "pipeline_events.log", &args.log_level)
        .context("could not set up logging")?;

    let config = ConfigManager(EnvConfigManager::new(args.env_file.clone()));
    debug!("overrides from {:?}", config);
    let mut settings = Settings::load(&args.settings)?;
    settings.apply_overrides(&config).await?;
    settings.validate()?;
    let renderer = HandlebarsRenderer::from_files(&settings.interpreter.templates)?;

    info!("connecting to {}", settings.hub.ws_url);
    let mut client = WsHubClient::connect(&settings.hub.ws_url)
        .await
        .with_context(|| format!("could not connect to {}", settings.hub.ws_url))?;

    let mut interpreter = Interpreter::new(
        settings.interpreter.clone(),
        Box::new(renderer),
        Arc::new(client.sender()),
    );

    let mut sweep = tokio::time::interval(SWEEP_PERIOD);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("interpreter running; press Ctrl-C to exit");
    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break Ok(());
            }
            _ = sweep.tick() => {
                let aborted = interpreter.sweep_stale(Instant::now());
                if aborted > 0 {
                    warn!("aborted {} stale pipeline(s)", aborted);
                }
            }
            event = client.next_event() => {
                let Some(event) = event else {
                    break Err(anyhow!("hub connection closed"));
                };
                if let Err(e) = interpreter.handle_event(event) {
                    if !interpreter.is_ready() {
                        break Err(e.into());
                    }
                    error!("keeping previous interpreter mapping: {}", e);
                }
            }
        }
    };

    client.close();
    outcome
}
