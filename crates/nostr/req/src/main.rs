use clap::Parser;
use nostr_req::{Args, execute, exit_code_for};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_directive());

    let _ = rustls::crypto::ring::default_provider().install_default();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, closing subscriptions");
                cancel.cancel();
            }
        }
    });

    match execute(args, cancel).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            exit_code_for(&e)
        }
    }
}

/// Logs go to stderr so stdout stays parseable.
fn init_tracing(default_directive: &str) {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
