use std::fs::OpenOptions;
use std::process::ExitCode;

use chat_server::{Args, Config, begin_server};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = Args::parse();

    let log_path = args.log.clone();
    let config = match Config::resolve(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("chatd: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = init_tracing(log_path.as_deref()) {
        eprintln!("chatd: failed to initialise logging: {err}");
        return ExitCode::FAILURE;
    }

    match begin_server(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "chatd failed to start");
            ExitCode::FAILURE
        }
    }
}

/// Installs a `tracing-subscriber` `fmt` layer filtered by `RUST_LOG`
/// (default `info`), writing to `log_path` if given, otherwise stdout.
fn init_tracing(log_path: Option<&std::path::Path>) -> std::io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(move || file.try_clone().expect("cloning the log file handle"))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
    Ok(())
}
