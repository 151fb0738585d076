use std::env;

use anyhow::Context;

/// Stellar network selection; picks the passphrase used when signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StellarNetwork {
    Test,
    Main,
}

impl StellarNetwork {
    pub fn passphrase(&self) -> &'static str {
        match self {
            StellarNetwork::Test => "Test SDF Network ; September 2015",
            StellarNetwork::Main => "Public Global Stellar Network ; September 2015",
        }
    }
}

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub db_username: String,
    pub db_password: String,
    pub db_namespace: String,
    pub db_database: String,

    pub horizon_url: String,
    pub stellar_network: StellarNetwork,
    /// Platform escrow account that releases payouts
    pub escrow_public_key: String,
    pub escrow_secret_key: String,

    /// Secret used to sign session tokens
    pub session_secret: String,

    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
}

fn var(key: &str) -> anyhow::Result<String> {
    env::var(key).with_context(|| format!("Couldn't get {key} env var"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        let stellar_network = match var("STELLAR_NETWORK")
            .unwrap_or_else(|_| "test".into())
            .as_str()
        {
            "main" | "public" => StellarNetwork::Main,
            _ => StellarNetwork::Test,
        };

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().to_string())
            .collect();

        Ok(Config {
            db_url: var("DB_URL")?,
            db_username: var("DB_USERNAME")?,
            db_password: var("DB_PASSWORD")?,
            db_namespace: var("DB_NAMESPACE")?,
            db_database: var("DB_DATABASE")?,
            horizon_url: env::var("HORIZON_URL")
                .unwrap_or_else(|_| "https://horizon-testnet.stellar.org".into()),
            stellar_network,
            escrow_public_key: var("ESCROW_PUBLIC_KEY")?,
            escrow_secret_key: var("ESCROW_SECRET_KEY")?,
            session_secret: var("SESSION_SECRET")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            allowed_origins,
        })
    }
}
