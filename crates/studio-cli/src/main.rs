mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use studio_contracts::credentials::{CredentialStore, DEFAULT_ENV_FILE};
use studio_contracts::generation::DEFAULT_MODEL;
use studio_contracts::progress::ProgressSignal;
use studio_engine::{
    settings, EngineConfig, GeminiTransport, InteractionController, RequestAdapter,
    DEFAULT_API_BASE,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "studio", version, about = "Transform images with Gemini")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Credentials file holding GEMINI_API_KEY.
    #[arg(long, global = true, env = "STUDIO_ENV_FILE", default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,
    #[arg(long, global = true, env = "GEMINI_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,
    #[arg(long, global = true, env = "STUDIO_MODEL", default_value = DEFAULT_MODEL)]
    model: String,
    /// Directory for temporary input files (defaults to the system temp dir).
    #[arg(long, global = true, env = "STUDIO_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,
}

impl GlobalArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            api_base: self.api_base.trim_end_matches('/').to_string(),
            model: self.model.clone(),
            scratch_dir: self.scratch_dir.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send an image and prompt to Gemini and save or print the result.
    Transform(TransformArgs),
    /// Save an API key to the credentials file and reload it.
    SetKey(SetKeyArgs),
    /// Reload the credentials file.
    Refresh,
    /// Serve the single-page web UI.
    Serve(ServeArgs),
}

#[derive(Debug, Parser)]
struct TransformArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "transformed_image.jpg")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct SetKeyArgs {
    api_key: String,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "STUDIO_BIND", default_value = "127.0.0.1:7860")]
    bind: SocketAddr,
    /// Requests allowed to wait while another one is running.
    #[arg(long, env = "STUDIO_QUEUE_SIZE", default_value_t = 50)]
    queue_size: usize,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("studio error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = cli.global.engine_config();
    let store = CredentialStore::new(&cli.global.env_file);
    match cli.command {
        Command::Transform(args) => run_transform(args, &config, &store),
        Command::SetKey(args) => {
            let (status, _) = settings::save_and_refresh(&store, &args.api_key);
            println!("{status}");
            Ok(0)
        }
        Command::Refresh => {
            let (status, credentials) = settings::refresh_credentials(&store);
            println!("{status}");
            Ok(if credentials.is_some() { 0 } else { 1 })
        }
        Command::Serve(args) => server::serve(
            server::ServeOptions {
                bind: args.bind,
                queue_size: args.queue_size,
            },
            config,
            store,
        ),
    }
}

fn run_transform(args: TransformArgs, config: &EngineConfig, store: &CredentialStore) -> Result<i32> {
    let credentials = store
        .load()
        .with_context(|| format!("failed to load {}", store.path().display()))?;
    let image = image::open(&args.image)
        .with_context(|| format!("failed to open {}", args.image.display()))?;
    let transport = GeminiTransport::new(config.api_base.clone())?;
    let controller = InteractionController::new(RequestAdapter::new(credentials, transport), config);
    let progress = |signal: ProgressSignal| {
        eprintln!("[{:>3.0}%] {}", signal.fraction * 100.0, signal.label);
    };

    match controller.handle(&image, &args.prompt, &progress) {
        Ok(outcome) => {
            match outcome.download {
                Some(download) => {
                    download
                        .save(&args.out)
                        .with_context(|| format!("failed to write {}", args.out.display()))?;
                    println!("Image saved to {}", args.out.display());
                }
                None => print!("{}", outcome.text),
            }
            Ok(0)
        }
        Err(notification) => {
            eprintln!("{}", notification.message);
            Ok(1)
        }
    }
}
