use std::{net::SocketAddr, sync::Arc};

use axum::http::HeaderValue;
use clap::Parser;
use log::{info, warn};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::Config,
    engine::{Engine, EscrowKeys},
    github::GithubClient,
    stellar::HorizonClient,
    store::{MemStore, Store},
};

mod api;
mod config;
mod db;
mod engine;
mod error;
mod github;
mod models;
mod review;
mod session_auth;
mod stellar;
mod store;

#[derive(Debug, Parser)]
#[command(about = "Bounty marketplace backend paying out over Stellar")]
struct Cli {
    /// Serve plain HTTP instead of TLS
    #[arg(long)]
    no_https: bool,
    /// Run against an in-memory store instead of SurrealDB
    #[arg(long)]
    memory_db: bool,
    /// TLS certificate path (PEM)
    #[arg(long, default_value = "cert.pem")]
    cert: String,
    /// TLS private key path (PEM)
    #[arg(long, default_value = "key.pem")]
    key: String,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Secret used to sign session tokens
    pub session_secret: String,
}

impl AppState {
    pub async fn init(config: &Config, memory_db: bool) -> anyhow::Result<AppState> {
        let store: Arc<dyn Store> = if memory_db {
            warn!("using the in-memory store, nothing will be persisted");
            Arc::new(MemStore::new())
        } else {
            let db = db::connect(
                &config.db_url,
                &config.db_username,
                &config.db_password,
                &config.db_namespace,
                &config.db_database,
            )
            .await?;
            db::migrate(&db).await?;
            Arc::new(db::SurrealStore::new(db))
        };

        let engine = Engine::new(
            store,
            Arc::new(GithubClient::new()),
            Arc::new(HorizonClient::new(
                config.horizon_url.clone(),
                config.stellar_network,
            )),
            EscrowKeys {
                public: config.escrow_public_key.clone(),
                secret: config.escrow_secret_key.clone(),
            },
        );

        Ok(AppState {
            engine,
            session_secret: config.session_secret.clone(),
        })
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp(None).init();

    if dotenvy::dotenv().is_err() {
        warn!("no .env file found, relying on the process environment");
    }

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let app_state = AppState::init(&config, cli.memory_db).await?;

    let app = api::router()
        .layer(cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    if cli.no_https {
        info!("listening on http://{addr}");
        axum_server::bind(addr)
            .serve(app.into_make_service())
            .await?;
    } else {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cli.cert, &cli.key).await?;
        info!("listening on https://{addr}");
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await?;
    }

    Ok(())
}
