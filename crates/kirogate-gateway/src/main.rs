use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing::info;

mod app;
mod auth;
mod bootstrap;
mod emit;
mod error;
mod http;
mod orchestrate;
mod refresh_task;

#[derive(Parser)]
#[command(name = "kirogate", about = "Anthropic-compatible proxy for Kiro/CodeWhisperer")]
struct Args {
    /// Path to kirogate.toml (default: ./kirogate.toml, then env overrides).
    #[arg(long)]
    config: Option<String>,
    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Obtain a credential bundle via the IAM Identity Center device flow.
    Login {
        #[arg(long, default_value = "us-east-1")]
        region: String,
        /// Where to write the bundle (picked up by the pool on next start).
        #[arg(long, default_value = "configs/kiro/idc.json")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = kirogate_core::config::GatewayConfig::load(args.config.as_deref())
        .unwrap_or_else(|e| {
            eprintln!("Config load failed ({e}), using defaults");
            kirogate_core::config::GatewayConfig::default()
        });
    if let Some(port) = args.port {
        config.server_port = port;
    }

    let default_filter = if config.enable_verbose_logging {
        "kirogate=debug,tower_http=debug"
    } else {
        "kirogate=info,tower_http=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if let Some(Command::Login { region, output }) = args.command {
        return login(&region, &output).await;
    }

    let bind = config.host.clone();
    let port = config.server_port;
    let state = bootstrap::build_state(config).await?;

    refresh_task::spawn(state.clone());

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("kirogate listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // push any debounced pool write out before exit
    state.pool.flush().await;

    Ok(())
}

/// Interactive device-authorization bootstrap.
async fn login(region: &str, output: &str) -> anyhow::Result<()> {
    use kirogate_auth::device::DeviceAuthClient;
    use kirogate_auth::Fingerprint;

    let flow = DeviceAuthClient::new(reqwest::Client::new(), region, Fingerprint::generate());

    let registered = flow.register_client().await?;
    let device = flow.start_device_authorization(&registered).await?;

    println!("Open this URL to approve the device:");
    println!(
        "  {}",
        device
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&device.verification_uri)
    );
    println!("Code: {}", device.user_code);

    let bundle = flow.poll_token(&registered, &device).await?;

    if let Some(parent) = std::path::Path::new(output).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, serde_json::to_string_pretty(&bundle)?)?;
    println!("Credential bundle written to {output}");
    Ok(())
}
