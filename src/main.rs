use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use scrcpy_gateway::Result;
use scrcpy_gateway::config::Config;
use scrcpy_gateway::http::{AppState, build_router};
use scrcpy_gateway::session::{Session, SessionMap};
use scrcpy_gateway::{decoder, plugin, session};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Multi-tenant HTTP gateway for scrcpy device streams
#[derive(Parser, Debug)]
#[command(name = "scrcpy-gateway")]
#[command(about = "HTTP gateway for scrcpy video, audio and control streams", long_about = None)]
struct Args {
    /// Configuration source: a file path, an http(s):// URL, or `-` for stdin
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Arc::new(Config::load(args.config.as_deref()).await?);
    info!(
        address = %config.address,
        ports = config.ports.len(),
        "Configuration loaded"
    );

    // One worker per port owns the sockets and runs the session FSM
    let mut sessions = HashMap::new();
    for (port, port_config) in &config.ports {
        let (session, connect_rx) = Session::new(*port, port_config);

        tokio::spawn(session::run_port_worker(
            Arc::clone(&session),
            Arc::clone(&config),
            port_config.clone(),
            connect_rx,
        ));

        if port_config.video
            && let Some(decoder_config) = &port_config.video_decoder
            && !decoder_config.stream
        {
            tokio::spawn(decoder::run_snapshot_worker(
                Arc::clone(&session),
                decoder_config.clone(),
            ));
        }

        sessions.insert(*port, session);
    }
    let sessions: SessionMap = Arc::new(sessions);

    // Plugin violations at startup are fatal
    let plugins = Arc::new(plugin::load(&config).await?);
    plugin::start_stream_pumps(&config, &sessions, &plugins);

    let router = build_router(AppState {
        config: Arc::clone(&config),
        sessions,
        plugins,
    });

    let addr = tokio::net::lookup_host(&config.address)
        .await
        .context("failed to resolve listen address")?
        .next()
        .context("listen address resolved to nothing")?;

    info!(%addr, "Listening");

    let serve = async {
        if !config.cert.is_empty() && !config.key.is_empty() {
            let tls = RustlsConfig::from_pem_file(&config.cert, &config.key)
                .await
                .context("failed to load TLS certificate")?;
            axum_server::bind_rustls(addr, tls)
                .serve(router.into_make_service())
                .await
                .context("server error")
        } else {
            axum_server::bind(addr)
                .serve(router.into_make_service())
                .await
                .context("server error")
        }
    };

    tokio::select! {
        result = serve => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
