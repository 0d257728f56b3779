//! Engine-API multiplexer CLI.
//!
//! Forwards a consensus client's Engine-API traffic to a primary execution
//! client and a filtered copy to an optional secondary builder. Exits 0 on
//! graceful shutdown and 1 when the listen port cannot be bound.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use builder_playground::proxy::{EngineMux, MuxConfig, DEFAULT_PRIMARY};

#[derive(Debug, Parser)]
#[command(name = "engine-mux", about = "Engine-API multiplexing proxy", version)]
struct Args {
    /// Primary builder URL; its responses are returned to the caller
    #[arg(long = "primary-builder", default_value = DEFAULT_PRIMARY)]
    primary_builder: String,

    /// Secondary builder URL; receives a filtered copy of the traffic
    #[arg(long = "secondary-builder")]
    secondary_builder: Option<String>,

    /// Port to listen on
    #[arg(long, default_value_t = builder_playground::proxy::DEFAULT_MUX_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = MuxConfig {
        port: args.port,
        primary: args.primary_builder,
        secondary: args.secondary_builder,
    };

    let mux = match EngineMux::serve(config).await {
        Ok(mux) => mux,
        Err(err) => {
            error!(error = %err, "failed to start multiplexer");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for interrupt");
        return ExitCode::from(1);
    }
    info!("interrupt received, shutting down");

    if let Err(err) = mux.close().await {
        error!(error = %err, "shutdown did not complete cleanly");
    }
    ExitCode::SUCCESS
}
