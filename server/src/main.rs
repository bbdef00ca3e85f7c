//! Server entry point: configuration, listener and connection acceptance.

use clap::Parser;
use log::{error, info, warn};
use skein_server::config::{self, Args};
use skein_server::connection::{handle_connection, ConnectionSettings};
use skein_server::crypto;
use skein_server::featureflag::FeatureFlags;
use skein_server::handler::HandlerEnv;
use skein_server::metrics;
use skein_server::receipt::{self, LoggingCreditService, RECEIPT_CHAN_SIZE};
use skein_server::session::{DefaultDiscoveryService, DiscoveryService, SessionStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    if let Err(err) = config::validate(&args) {
        error!("invalid configuration: {}", err);
        std::process::exit(1);
    }

    let signing_key = match config::load_signing_key(&args) {
        Ok(key) => Arc::new(key),
        Err(err) => {
            error!("error loading private key: {}", err);
            std::process::exit(1);
        }
    };

    // The production discovery client registers this server and validates
    // tokens; unpaired runs fall back to the placeholder.
    let discovery: Arc<dyn DiscoveryService> = Arc::new(DefaultDiscoveryService);
    let sessions = Arc::new(SessionStore::new(Arc::clone(&discovery)));
    let flags = Arc::new(FeatureFlags::parse(&args.feature_flags));

    let (receipt_tx, receipt_rx) = mpsc::channel(RECEIPT_CHAN_SIZE);
    let forwarder = receipt::spawn_forwarder(
        receipt_rx,
        Arc::new(LoggingCreditService {
            endpoint: args.ncs_endpoint.clone(),
        }),
    );

    let env = HandlerEnv {
        sessions,
        flags,
        receipts: receipt_tx,
        signing_key: Arc::clone(&signing_key),
        frame_duration: Duration::from_millis(args.frame_duration_ms),
    };
    let settings = ConnectionSettings {
        sync_clock_interval: Duration::from_secs(args.sync_clock_interval_secs),
        idle_timeout: Duration::from_secs(args.client_idle_timeout_secs),
        log_summary_interval: Duration::from_secs(args.log_summary_interval_secs),
    };

    let wallet_address = crypto::wallet_address(signing_key.verifying_key());
    info!(
        "starting skein server version={} addr={} endpoint={} wallet_address={}",
        env!("CARGO_PKG_VERSION"),
        args.addr,
        args.public_endpoint,
        wallet_address,
    );

    let listener = match TcpListener::bind(&args.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("binding {} failed: {}", args.addr, err);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(accept_connection(
                            stream,
                            peer,
                            env.clone(),
                            settings.clone(),
                            Arc::clone(&discovery),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(err) => error!("accepting connection failed: {}", err),
                }
            }
        }
    }

    metrics::log_snapshot();
    forwarder.abort();
    info!("server stopped");
}

/// Upgrades one TCP stream to WebSocket, authenticating the token and
/// extracting the client id during the handshake.
async fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    env: HandlerEnv,
    settings: ConnectionSettings,
    discovery: Arc<dyn DiscoveryService>,
    shutdown: watch::Receiver<bool>,
) {
    let mut client_id = String::new();
    let mut app_key = String::new();

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        client_id = header_value(request, "x-client-id").to_string();
        let token = header_value(request, "authorization")
            .strip_prefix("Bearer ")
            .unwrap_or_default()
            .to_string();

        match discovery.verify_user_auth(&token) {
            Ok(auth) => {
                app_key = auth.app_key;
                Ok(response)
            }
            Err(err) => {
                let mut rejection = ErrorResponse::new(Some(err.to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        }
    };

    match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(websocket) => {
            handle_connection(websocket, env, settings, client_id, app_key, shutdown).await
        }
        Err(err) => warn!("websocket handshake with {} failed: {}", peer, err),
    }
}

fn header_value<'r>(request: &'r Request, name: &str) -> &'r str {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn init_logging(level: &str) {
    let level = level.parse().unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}
