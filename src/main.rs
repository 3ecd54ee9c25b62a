use axum::extract::State;
use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use soko_api::database::connection::get_db_client;
use soko_api::services::email_service::EmailService;
use soko_api::services::mpesa_service::MpesaService;
use soko_api::state::AppState;
use soko_api::{config, routes, sweeper};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let db = get_db_client().await;
    let app_state = initialize_app_state(db).await;

    sweeper::spawn(app_state.clone());

    let app = build_router(app_state).await;
    start_server(app).await;
}

async fn initialize_app_state(db: mongodb::Database) -> AppState {
    let mut app_state = AppState::new(db);

    tracing::info!("🔧 Attempting to initialize M-Pesa service...");

    // Missing credentials disable payments but do not take the shop down.
    let config_result = std::panic::catch_unwind(config::AppConfig::from_env);

    match config_result {
        Ok(config) => {
            tracing::info!("✅ App config loaded successfully");
            tracing::info!("📱 Short code: {}", config.mpesa_short_code);
            tracing::info!("🌐 Environment: {}", config.mpesa_environment);

            let mpesa_service = Arc::new(MpesaService::new(config));

            // Verify credentials up front with a token fetch
            match mpesa_service.get_access_token().await {
                Ok(_) => {
                    app_state = app_state.with_mpesa(mpesa_service);
                    tracing::info!("✅ M-Pesa service initialized and ready");
                }
                Err(e) => {
                    tracing::error!("❌ Failed to get M-Pesa access token: {}", e);
                    tracing::warn!("M-Pesa service will be disabled");
                }
            }
        }
        Err(_) => {
            tracing::error!("❌ Failed to load M-Pesa config");
            tracing::warn!("M-Pesa service will be disabled");
        }
    }

    match EmailService::from_env() {
        Some(email_service) => {
            app_state = app_state.with_email(Arc::new(email_service));
            tracing::info!("✅ Email service initialized");
        }
        None => {
            tracing::warn!("EMAIL_API_URL/EMAIL_API_KEY not set, receipt emails disabled");
        }
    }

    app_state
}

async fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/health", get(api_health_check))
        .nest("/api/orders", routes::orders::order_routes())
        .nest("/api/mpesa", routes::mpesa::mpesa_routes())
        .nest("/api/events", routes::events::event_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

async fn start_server(app: Router) {
    let port = std::env::var("PORT").unwrap_or_else(|_| "10000".to_string());
    let addr = SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(10000)));

    tracing::info!("🚀 Server starting on {}", addr);

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            axum::serve(listener, app).await.unwrap();
        }
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}

async fn root_handler() -> &'static str {
    "🛒 Soko Storefront API"
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_health_check(State(state): State<AppState>) -> Json<Value> {
    use mongodb::bson::doc;

    let db_status = match state.db.run_command(doc! {"ping": 1}).await {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    Json(json!({
        "status": "healthy",
        "database": db_status,
        "mpesa": state.mpesa_service.is_some(),
        "email": state.email_service.is_some(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
