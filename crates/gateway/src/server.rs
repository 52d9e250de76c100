use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::get,
    },
    llamadash_config::DashboardConfig,
    tokio::net::TcpListener,
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use crate::{
    broadcast::{EventBus, spawn_fanout},
    methods::MethodRegistry,
    services::GatewayServices,
    state::GatewayState,
    ws::handle_connection,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let ws_path = state.config.ws_path.clone();
    let app_state = AppState {
        gateway: state,
        methods,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route(&ws_path, get(ws_upgrade_handler))
        .layer(cors)
        .with_state(app_state)
}

/// Create the in-memory services, the shared state and the broadcast
/// fan-out task for `config`.
pub fn build_gateway(config: &DashboardConfig) -> Arc<GatewayState> {
    let bus = EventBus::new();
    let services = GatewayServices::local(&bus, config.logs.capacity);
    let state = GatewayState::new(config.server.clone(), services, bus);
    spawn_fanout(Arc::clone(&state));
    state
}

/// Serve the gateway on an already bound listener until it fails.
pub async fn serve_gateway(
    listener: TcpListener,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
) -> anyhow::Result<()> {
    let app = build_gateway_app(state, methods);

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Start the gateway HTTP + WebSocket server.
///
/// Loads the config file if present; `bind` and `port` override it.
pub async fn start_gateway(bind: Option<&str>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = llamadash_config::discover_and_load();
    if let Some(bind) = bind {
        config.server.bind = bind.to_string();
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let state = build_gateway(&config);
    let methods = Arc::new(MethodRegistry::new());

    let addr: SocketAddr = config.server.addr().parse()?;
    let listener = TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("llamadash gateway v{}", state.version),
        format!("listening on ws://{}{}", addr, config.server.ws_path),
        format!("{} methods registered", methods.method_names().len()),
        format!("log buffer: {} entries", config.logs.capacity),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    state.services.logs.info(format!("gateway listening on {addr}"));
    serve_gateway(listener, state, methods).await
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.gateway.client_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "connections": count,
        "uptimeMs": state.gateway.uptime_ms(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state.gateway, state.methods, addr))
}
