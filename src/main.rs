//! Market sentiment crawler: binary entrypoint.
//! Boots the Axum HTTP server, wiring the pipeline, run history and metrics.

use market_sentiment_crawler::{build_state, config::Settings, create_router, metrics::Metrics};
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact logs by default, JSON lines with `LOG_FORMAT=json`.
/// A subscriber installed by the runtime wins; ours is then skipped.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("market_sentiment_crawler=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    // recorder first, so metric descriptions land in it
    let metrics = Metrics::init()?;

    let settings = Settings::load_default()?;
    let state = build_state(&settings).await?;

    let router = create_router(state).merge(metrics.router());

    Ok(router.into())
}
