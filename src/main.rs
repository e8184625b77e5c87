//! # Voice Conversion Server - Main Application Entry Point
//!
//! Loads a pretrained voice-conversion model once, then serves conversions
//! over a Socket.IO event channel next to the prebuilt front-end.
//!
//! ## Application Architecture:
//! - **cli / config**: flags layered over `voice-server.toml` and `APP_*` env
//! - **conversion**: model loading and the PCM16 → PCM16 pipeline
//! - **channel**: Engine.IO / Socket.IO over long-polling and websocket
//! - **tls**: self-signed or supplied certificates for HTTPS
//! - **state / health**: shared state, metrics and `/health`
//!
//! ## Building:
//! Checkpoints are exported ONNX graphs, evaluated by candle-onnx behind the
//! `onnx` feature. Without it every checkpoint is refused at startup:
//! ```text
//! cargo run --release --features onnx -- -p <port> -c config.json -m G.onnx
//! ```
//! candle-onnx needs `protoc` on the build host.

mod audio;
mod channel;
mod cli;
mod config;
mod conversion;
mod device;
mod error;
mod health;
mod state;
mod tls;

use actix_cors::Cors;
use actix_files::Files;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::dump::InputDump;
use clap::Parser;
use cli::Cli;
use config::AppConfig;
use conversion::hparams::HParams;
use conversion::ConversionService;
use device::DeviceManager;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers, polled by `wait_for_shutdown`.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Startup order:
/// 1. **Configuration**: `.env`, defaults, file, environment, then flags
/// 2. **Model**: hyper-parameters, checkpoint, compute devices
/// 3. **TLS**: provision or load the key/certificate pair when HTTPS is on
/// 4. **Server**: one listener for the channel, `/health` and static files
/// 5. **Shutdown**: SIGINT/SIGTERM stop the server gracefully
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    config.apply_cli(&cli);
    config.validate()?;

    info!("Starting voice-conversion-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}", config.bind_addr());

    let hparams = HParams::load(&config.model.config_path)?;
    let model = conversion::model::load_model(&config.model.checkpoint_path)?;
    let devices = DeviceManager::detect();
    let dump = InputDump::from_config(&config.diagnostics);
    if dump.is_enabled() {
        warn!(
            path = %config.diagnostics.dump_path.display(),
            "Input dump enabled, every request is written to disk"
        );
    }

    let service = Arc::new(ConversionService::new(model, hparams, devices, dump));
    info!(
        model = service.model_name(),
        n_speakers = service.n_speakers(),
        "Model ready"
    );

    let tls_config = match tls::resolve(&config.tls)? {
        Some(paths) => {
            info!(
                key = %paths.key.display(),
                cert = %paths.cert.display(),
                "Using TLS material"
            );
            Some(tls::load_server_config(&paths)?)
        }
        None => None,
    };

    let bind_addr = config.bind_addr();
    let scheme = if tls_config.is_some() { "https" } else { "http" };
    let static_dir = if config.static_files.dir.is_dir() {
        Some(config.static_files.dir.clone())
    } else {
        warn!(
            dir = %config.static_files.dir.display(),
            "Static directory not found, front-end will not be served"
        );
        None
    };
    let index_file = config.static_files.index_file.clone();
    let workers = config.server.workers;
    let max_payload = config.channel.max_payload;

    let app_state = AppState::new(config, service);

    setup_signal_handlers();

    info!("Listening on {}://{}", scheme, bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let static_dir = static_dir.clone();
        let index_file = index_file.clone();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/health", web::get().to(health::health_check))
            .configure(|cfg| channel::configure(cfg, max_payload))
            // Catch-all, must stay last
            .configure(move |cfg| {
                if let Some(dir) = static_dir {
                    cfg.service(Files::new("/", dir).index_file(index_file));
                }
            })
    })
    .workers(workers);

    let server = match tls_config {
        Some(tls) => server.bind_rustls_0_23(&bind_addr, tls)?,
        None => server.bind(&bind_addr)?,
    }
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_conversion_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(unix)]
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let handlers = (signal(SignalKind::terminate()), signal(SignalKind::interrupt()));
        let (mut sigterm, mut sigint) = match handlers {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

#[cfg(not(unix))]
fn setup_signal_handlers() {
    tokio::spawn(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => {
                error!("Failed to install Ctrl-C handler: {}", e);
                return;
            }
        }
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
