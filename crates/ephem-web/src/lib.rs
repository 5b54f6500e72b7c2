//! Axum + Askama display side: today's ephemeris as a page and as JSON.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ephem_core::{format_date_long, today_utc, Clock, PublicationKey, SystemClock};
use ephem_storage::{read_for_display, DisplayRead, EphemerisStore, PgEphemerisStore, ReadStrategy};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "ephem-web";

pub const DEFAULT_WEB_PORT: u16 = 8000;

#[derive(Debug, Error)]
pub enum ReadConfigError {
    #[error("missing required environment variable READ_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ReadConfig {
    pub database_url: String,
    pub strategy: ReadStrategy,
    pub port: u16,
}

impl ReadConfig {
    pub fn from_env() -> Result<Self, ReadConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ReadConfigError> {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let database_url = get("READ_DATABASE_URL").ok_or(ReadConfigError::MissingDatabaseUrl)?;
        let strategy = match get("EPHEMERIS_READ_STRATEGY") {
            Some(raw) => raw.parse::<ReadStrategy>().map_err(|reason| ReadConfigError::Invalid {
                var: "EPHEMERIS_READ_STRATEGY",
                reason,
            })?,
            None => ReadStrategy::default(),
        };
        let port = match get("EPHEMERIS_WEB_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|err| {
                ReadConfigError::Invalid {
                    var: "EPHEMERIS_WEB_PORT",
                    reason: err.to_string(),
                }
            })?,
            None => DEFAULT_WEB_PORT,
        };
        Ok(Self {
            database_url,
            strategy,
            port,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EphemerisStore>,
    pub strategy: ReadStrategy,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(store: Arc<dyn EphemerisStore>, strategy: ReadStrategy) -> Self {
        Self {
            store,
            strategy,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn read_today(&self) -> DisplayRead {
        let requested = today_utc(self.clock.now());
        read_for_display(self.store.as_ref(), self.strategy, requested).await
    }
}

struct EntryView {
    long_date: String,
    category: String,
    title: String,
    description: String,
    source_url: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    today_long: String,
    entry: Option<EntryView>,
    is_fallback: bool,
}

fn long_date(key: PublicationKey) -> String {
    format_date_long(key.day(), key.month()).unwrap_or_else(|| key.display_date())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/today", get(today_json_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: ReadConfig) -> anyhow::Result<()> {
    let store = PgEphemerisStore::connect(&config.database_url).await?;
    let state = AppState::new(Arc::new(store), config.strategy);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, strategy = ?config.strategy, "serving ephemeris display");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(ReadConfig::from_env()?).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let read = state.read_today().await;
    let entry = read.ephemeris.map(|e| EntryView {
        long_date: long_date(e.record.key),
        category: e.record.category.to_string(),
        title: e.record.title,
        description: e.record.description,
        source_url: e.record.source_url,
    });
    render_html(IndexTemplate {
        today_long: long_date(read.requested),
        entry,
        is_fallback: read.is_fallback,
    })
}

async fn today_json_handler(State(state): State<Arc<AppState>>) -> Json<DisplayRead> {
    Json(state.read_today().await)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}
