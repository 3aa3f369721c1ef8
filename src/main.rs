//! modelgate CLI

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use modelgate::config::Config;
use modelgate::server::run_server;

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(about = "LLM inference gateway with fallback, analytics and experiments")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server
    Run {
        /// Port to listen on
        #[arg(short, long, default_value = "8000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Relational store DSN (overrides DATABASE_DSN)
        #[arg(long)]
        database_dsn: Option<String>,

        /// Analytics store DSN (overrides ANALYTICS_DSN)
        #[arg(long)]
        analytics_dsn: Option<String>,
    },

    /// List known model ids
    Models,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Ok(dir) = std::env::var("LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "modelgate.log");
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(appender)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run {
            port,
            host,
            database_dsn,
            analytics_dsn,
        }) => {
            let mut config = match Config::from_env() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            };
            if let Some(dsn) = database_dsn {
                config.database_dsn = dsn;
            }
            if let Some(dsn) = analytics_dsn {
                config.analytics_dsn = dsn;
            }
            if let Err(e) = run_server(config, &host, port).await {
                eprintln!("server error: {e}");
                std::process::exit(1);
            }
        }
        Some(Commands::Models) => {
            for id in modelgate::domain::models::model_ids() {
                println!("{id}");
            }
        }
        None => {
            eprintln!("No command provided. Try `modelgate run`.");
            std::process::exit(2);
        }
    }
}
