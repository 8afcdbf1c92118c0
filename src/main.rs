use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use tokio::sync::oneshot;

use rtsp_capture_rs::error::Error;
use rtsp_capture_rs::sink::FileFrameSink;
use rtsp_capture_rs::{Config, Session};

#[derive(Parser)]
#[command(name = "rtsp-capture-rs")]
#[command(author, version, about = "Captures H.264 access units from an RTSP stream to disk", long_about = None)]
struct Cli {
    /// Path to a YAML config file (default: ./config.yaml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Stream URL; overrides `rtsp_url` in the config file
    #[arg(long)]
    url: Option<String>,
}

const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config_file.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match Config::load(&config_path, cli.url.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    pretty_env_logger::formatted_builder()
        .filter_level(config.log_level.to_level_filter())
        .init();

    info!("starting capture of {} -> {}", config.rtsp_url, config.output_dir);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, requesting shutdown");
            let _ = shutdown_tx.send(());
        }
    });

    let output_dir = config.output_dir.clone();
    let session = Session::new(config);
    let sink = Box::new(FileFrameSink::new(output_dir));

    match session.run(sink, shutdown_rx).await {
        Ok(_stats) => ExitCode::SUCCESS,
        Err(Error::Cancelled) => {
            info!("capture cancelled");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("session failed: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::ConfigInvalid(_) => 1,
        Error::ConnectFailed(_) | Error::ProtocolError(_) | Error::AuthFailed(_) => 2,
        Error::TransportError(_) => 3,
        Error::Cancelled => 130,
        Error::MalformedFrame(_) | Error::MalformedRtp(_) | Error::DepacketizationError(_) | Error::FragmentLost => 3,
    }
}
