use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        get_balance, get_global, get_saga, get_stats, get_user, health_check, manual_abandon,
        manual_deposit, manual_retry, manual_withdraw, AppState,
    },
    middleware::{create_cors_layer, rate_limit_middleware, require_operator},
};

pub async fn create_app(state: AppState, cors_origins: &[String]) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // Operator routes: rate limited first, then token checked
    let manual = Router::new()
        .route("/deposit", post(manual_deposit))
        .route("/withdraw", post(manual_withdraw))
        .route("/retry/:id", post(manual_retry))
        .route("/abandon/:id", post(manual_abandon))
        .route_layer(from_fn_with_state(state.clone(), require_operator))
        .route_layer(from_fn_with_state(
            state.manual_limiter.clone(),
            rate_limit_middleware,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/balance/:address", get(get_balance))
        .route("/user/:address", get(get_user))
        .route("/global", get(get_global))
        .route("/stats", get(get_stats))
        .route("/saga/:id", get(get_saga))
        .nest("/manual", manual)
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(cors_origins))
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
