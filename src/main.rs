use clap::{Parser, Subcommand};
use std::path::PathBuf;

use eggscan::config::ServerConfig;
use eggscan::db::{self, DynError};
use eggscan::serve;

#[derive(Parser, Debug)]
#[command(author, version, about = "Egg fertility detection service for camera and phone uploads")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Bring the database schema up to date and exit
    Migrate {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<(), DynError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Serve { config, port } => {
            let mut config = ServerConfig::from_file(&config)?;
            if let Some(port) = port {
                config.port = port;
            }
            serve::serve(config)
        }
        Command::Migrate { config } => migrate(ServerConfig::from_file(&config)?),
    }
}

fn migrate(config: ServerConfig) -> Result<(), DynError> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let pool = db::open_database(&config.database).await?;
        let outcome = db::migrate(&pool).await?;
        serve::log_migration(&outcome);
        println!("{}: {:?}", config.database.display(), outcome);
        pool.close().await;
        Ok::<(), DynError>(())
    })
}
