use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;

use antiblock_rs::api::dispatch::dispatch_request;
use antiblock_rs::config::Config;
use antiblock_rs::observability::init_tracing;
use antiblock_rs::state::AppState;

fn main() {
    let config = Config::load_from_env().unwrap_or_else(|err| {
        eprintln!("Failed to load configuration: {err}");
        std::process::exit(1);
    });

    init_tracing(config.debug_mode);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Failed to initialize Tokio runtime: {err}");
            std::process::exit(1);
        });

    runtime.block_on(async move {
        run(config).await;
    });
}

async fn run(config: Config) {
    let port = config.port;

    tracing::info!(
        upstream = %config.upstream_url_base,
        max_retries = config.max_consecutive_retries,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        swallow_thoughts_after_retry = config.swallow_thoughts_after_retry,
        punctuation_heuristic = config.enable_punctuation_heuristic,
        debug_mode = config.debug_mode,
        "antiblock-rs starting"
    );
    if config.enable_rate_limit {
        tracing::info!(
            limit = config.rate_limit_count,
            window_secs = config.rate_limit_window.as_secs(),
            "rate limiting enabled"
        );
    } else {
        tracing::info!("rate limiting disabled");
    }

    let state = Arc::new(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap_or_else(|err| {
            eprintln!("Failed to bind to 0.0.0.0:{port}: {err}");
            std::process::exit(1);
        });

    tracing::info!(port, "antiblock-rs is ready to accept connections");
    serve_accept_loop(listener, state).await;
}

async fn serve_accept_loop(listener: tokio::net::TcpListener, state: Arc<AppState>) {
    let conn_builder = AutoBuilder::new(TokioExecutor::new());

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!(error = %err, "accept error");
                continue;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("failed to enable TCP_NODELAY for {remote_addr}: {err}");
        }

        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let request_state = Arc::clone(&state);
        let hyper_service = service_fn(move |request: Request<Incoming>| {
            dispatch_request(Arc::clone(&request_state), request.map(Body::new))
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, hyper_service).await {
                tracing::debug!("failed to serve connection from {remote_addr}: {err:#}");
            }
        });
    }
}
