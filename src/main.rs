use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mailtunnel::automation::Automation;
use mailtunnel::config::{AppConfig, ConfigStorage};
use mailtunnel::forwarding::LocalPortForwarder;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (default: ~/.mailtunnel/config.json)
    #[arg(short, long, env = "MAILTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll continuously until Ctrl-C
    Run,
    /// Single pass; prints the saved files
    Once,
    /// Only keep the SSH tunnel up until Ctrl-C
    Forward,
    /// Write a sample configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn storage(path: Option<PathBuf>) -> Result<ConfigStorage, String> {
    match path {
        Some(path) => Ok(ConfigStorage::with_path(path)),
        None => ConfigStorage::new().map_err(|e| e.to_string()),
    }
}

/// Cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        trigger.cancel();
    });
    token
}

async fn run(args: Args) -> Result<(), String> {
    let storage = storage(args.config)?;

    if let Command::Init { force } = args.command {
        if storage.exists().await && !force {
            return Err(format!(
                "{:?} already exists, use --force to overwrite",
                storage.path()
            ));
        }
        storage
            .save(&AppConfig::sample())
            .await
            .map_err(|e| e.to_string())?;
        println!("Wrote {}", storage.path().display());
        return Ok(());
    }

    let config = storage.load().await.map_err(|e| e.to_string())?;
    info!("Loaded configuration from {:?}", storage.path());

    match args.command {
        Command::Forward => {
            let tunnel = config
                .tunnel()
                .ok_or("No SSH tunnel configured for the mail source")?;
            let mut forwarder = LocalPortForwarder::new(tunnel.to_session());
            let addr = forwarder.start().await.map_err(|e| e.to_string())?;
            println!("Forwarding {} -> {}:{}", addr, tunnel.remote_host, tunnel.remote_port);

            shutdown_on_ctrl_c().cancelled().await;
            forwarder.stop().await;
            Ok(())
        }
        Command::Once => {
            let mut automation = Automation::new(config).map_err(|e| e.to_string())?;
            automation.start().await.map_err(|e| e.to_string())?;
            let result = automation.run_once().await;
            automation.shutdown().await;

            for path in result.map_err(|e| e.to_string())? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Command::Run => {
            let mut automation = Automation::new(config).map_err(|e| e.to_string())?;
            automation.start().await.map_err(|e| e.to_string())?;
            automation
                .run_continuous(shutdown_on_ctrl_c())
                .await
                .map_err(|e| e.to_string())
        }
        Command::Init { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    mailtunnel::init_logging();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
