use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use startgate::config::{Overrides, Settings};

mod cmd;

#[derive(Parser)]
#[command(name = "startgate")]
#[command(version, about = "Run database migrations, then start the server only if they succeed")]
pub struct Cli {
    /// Path to a startgate.toml file (defaults to $STARTGATE_CONFIG, then ./startgate.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Listen port. Overrides $PORT.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Listen host. Overrides $HOST.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Database URL. Overrides $DATABASE_URL.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Directory of *.sql migrations for the built-in migrator
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            host: self.host.clone(),
            database_url: self.database_url.clone(),
            migrations_dir: self.migrations_dir.clone(),
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Apply pending migrations, then start the server (default)
    Run,
    /// Apply pending migrations and exit
    Migrate,
    /// Show applied and pending migrations (built-in migrator only)
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        eprintln!("Warning: failed to load .env: {}", e);
    }

    match dispatch(cli).await {
        Ok(code) => exit_code(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let settings = Settings::load(cli.config.as_deref(), &cli.overrides())?;
    startgate::logging::init(&settings.log);

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => cmd::cmd_run(&settings).await,
        Commands::Migrate => cmd::cmd_migrate(&settings).await,
        Commands::Status { json } => cmd::cmd_status(&settings, json).await,
        Commands::Config => cmd::cmd_config(&settings),
    }
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code)
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}
