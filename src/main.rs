//! # Call Agent Backend - Main Application Entry Point
//!
//! This is the main entry point for the call-agent-backend web server: a voice
//! agent that answers telephone calls, listens to the caller through a streaming
//! recognizer, asks a dialogue engine what to say and speaks the reply back in
//! the telephony codec.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every call runs as a pair of tokio tasks
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **traits**: Recognition, synthesis and dialogue services sit behind traits
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **static**: Global variables that live for the entire program duration
//!
//! ## Application Architecture:
//! - **audio**: G.711 codec, resampling, inbound frame preparation, outbound framing
//! - **recognition**: Utterance boundary detection and the resilient ASR channel
//! - **synthesis**: Streaming text-to-speech with retries and real-time pacing
//! - **dialogue**: The dialogue engine contract and its HTTP implementation
//! - **call**: Per-call orchestration and the registry of live calls
//! - **providers**: Offline services used when no vendor is wired in
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Manages shared application state and metrics
//! - **health**: Provides system health monitoring endpoints
//! - **middleware**: Custom request processing logic (logging, metrics)
//! - **handlers**: HTTP request handlers for API endpoints
//! - **websocket**: One call per WebSocket connection
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod audio;       // Audio codecs and framing (audio/ directory)
mod call;        // Call sessions and registry (call/ directory)
mod config;      // Configuration management (config.rs)
mod dialogue;    // Dialogue engine contract (dialogue/ directory)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod providers;   // Offline service implementations (providers.rs)
mod recognition; // Speech recognition (recognition/ directory)
mod state;       // Application state management (state.rs)
mod synthesis;   // Speech synthesis (synthesis/ directory)
mod websocket;   // Call WebSocket (websocket.rs)

#[cfg(test)]
mod testing;

// External crate imports - These are dependencies from Cargo.toml
use actix_cors::Cors;  // Cross-Origin Resource Sharing support
use actix_web::{web, App, HttpServer, middleware::Logger};  // Web framework
use anyhow::Result;    // Better error handling with context
use config::AppConfig; // Our custom configuration struct
use state::AppState;   // Our custom application state
use std::sync::atomic::{AtomicBool, Ordering};  // Thread-safe boolean for shutdown
use tracing::{error, info};  // Structured logging
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup

/// Global shutdown signal that can be accessed from anywhere in the program.
/// AtomicBool is thread-safe, meaning multiple threads can safely read/write to it.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the services** calls talk to and the shared application state
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Sweeps idle calls** in the background
/// 6. **Handles graceful shutdown**: live calls are ended before the server stops
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-agent-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        encoding = config.tts.target_encoding.as_str(),
        sample_rate = config.tts.target_sample_rate,
        max_calls = config.performance.max_concurrent_calls,
        "Voice pipeline configured"
    );

    let services = providers::build_services(&config);
    let app_state = AppState::new(config.clone(), services);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Set up signal handlers for graceful shutdown (Ctrl+C, SIGTERM, etc.)
    setup_signal_handlers();
    spawn_idle_call_sweeper(app_state.clone(), config.performance.cleanup_interval());

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        // Configure CORS (Cross-Origin Resource Sharing) to allow web browsers to connect
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            // Share our application state with all request handlers
            .app_data(web::Data::new(server_state.clone()))
            // Add middleware in order (they execute in reverse order for responses)
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/calls", web::get().to(handlers::list_calls))
                    // Registered before "/calls/{call_id}" so "events" is never taken for an id
                    .route("/calls/events", web::post().to(handlers::call_event))
                    .route("/calls/{call_id}", web::get().to(handlers::get_call))
                    .route("/calls/{call_id}/asr/reset", web::post().to(handlers::reset_asr))
            )
            .route("/ws/calls/{call_id}", web::get().to(websocket::call_websocket))
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    // Get a handle to control the server and spawn it in a separate task
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, ending live calls...");
            let ended = app_state.calls.end_all("server_shutdown").await;
            info!(ended, "Live calls ended, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "call_agent_backend=trace")
/// - If not set, defaults to "call_agent_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_agent_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// End calls that have gone quiet, every `interval`.
///
/// A call whose transport vanished without hanging up would otherwise hold its
/// recognition channel and its slot forever.
fn spawn_idle_call_sweeper(state: AppState, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
            ticker.tick().await;
            let ended = state.sweep_idle_calls().await;
            if ended > 0 {
                info!(ended, "Idle calls ended");
            }
        }
    });
}

/// Set up signal handlers for graceful shutdown.
///
/// ## What this does:
/// - Listens for SIGTERM (termination signal from system)
/// - Listens for SIGINT (interrupt signal, usually Ctrl+C)
/// - When either signal is received, sets the global shutdown flag
///
/// If a handler cannot be installed, Ctrl+C through `tokio::signal::ctrl_c` is
/// the only way to stop the server gracefully.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                    }
                }
            }
            (sigterm, sigint) => {
                if let Err(e) = sigterm.and(sigint) {
                    error!("Failed to install signal handlers: {}", e);
                }
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received Ctrl+C");
            }
        }

        // SeqCst (Sequential Consistency) ensures this change is visible to all threads
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Polls every 100ms; `tokio::time::sleep` doesn't block other tasks.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
