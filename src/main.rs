mod audio;
mod config;
mod rtp;
mod sip;

use std::net::UdpSocket as StdUdpSocket;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::info;

use audio::StaticAudioRouter;
use config::Config;
use sip::{Dispatcher, TimerConfig};

/// Parse command line arguments.
struct Args {
    validate: bool,
    help: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args { validate: false, help: false };
    for arg in &args[1..] {
        match arg.as_str() {
            "--validate" => result.validate = true,
            "--help" | "-h" => result.help = true,
            _ => {}
        }
    }
    result
}

fn print_help() {
    println!("frizzle-phone-core - SIP/RTP call handling engine\n");
    println!("USAGE:");
    println!("    frizzle-phone-core [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --validate    Validate configuration and exit");
    println!("    --help, -h    Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    SIP_BIND_ADDR, SIP_SERVER_IP, SIP_TIMER_T1_MS, SIP_TIMER_T2_MS, SIP_TIMER_T4_MS");
}

/// Detect the local IP address that would be used to reach the public
/// internet, by opening a UDP socket and never actually sending on it.
fn detect_server_ip() -> Result<String> {
    let socket = StdUdpSocket::bind("0.0.0.0:0").context("failed to open probe socket")?;
    socket.connect("8.8.8.8:80").context("failed to connect probe socket")?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    if args.help {
        print_help();
        return Ok(());
    }

    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frizzle_phone_core=info".parse().unwrap()),
        )
        .init();

    info!("frizzle-phone-core v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    config.validate()?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let server_ip = match &config.server_ip {
        Some(ip) => ip.clone(),
        None => detect_server_ip().context("failed to auto-detect server IP")?,
    };
    info!(%server_ip, bind_addr = %config.bind_addr, "starting SIP server");

    let timers = TimerConfig {
        t1: config.timer_t1,
        t2: config.timer_t2,
        t4: config.timer_t4,
    };

    // No pre-recorded audio ships with this binary; operators wire up
    // their own StaticAudioRouter::register calls (or a different
    // AudioRouter implementation) before deployment.
    let audio_router = Arc::new(StaticAudioRouter::new());

    let socket = Arc::new(
        UdpSocket::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?,
    );

    let mut dispatcher = Dispatcher::new(socket, server_ip, audio_router, timers);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(());
    });

    dispatcher.run(shutdown_rx).await;
    info!("shut down cleanly");

    Ok(())
}
