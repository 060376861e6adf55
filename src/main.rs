use std::sync::Arc;

use tracing::error;
use tracing_subscriber::EnvFilter;

mod modules;
mod providers;
mod server;

use providers::GeminiClient;
use server::{AppState, ServerConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_key = match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            error!("GEMINI_API_KEY is not set");
            std::process::exit(1);
        }
    };

    let mut builder = GeminiClient::builder().api_key(api_key);
    if let Ok(base_url) = std::env::var("GEMINI_BASE_URL") {
        builder = builder.base_url(&base_url);
    }
    let client = match builder.build() {
        Ok(client) => client,
        Err(err) => {
            error!("failed to build the generation client: {err}");
            std::process::exit(1);
        }
    };

    let config = ServerConfig {
        host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(3001),
        allowed_origins: std::env::var("FRONTEND_URLS")
            .map(|urls| {
                urls.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    };

    let state = AppState::new(Arc::new(client));
    if let Err(err) = server::serve(config, state).await {
        error!("server failed: {err}");
        std::process::exit(1);
    }
}
