use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};

use kirogate_auth::{
    CredentialSet, FingerprintRegistry, GovernorConfig, RateGovernor, TokenManager,
    TokenRefresher, TokenStore, Tuning, UsageChecker, UserTokenCache,
};
use kirogate_core::auth::ClientAuth;
use kirogate_core::state::AppState;
use kirogate_core::{handler, upstream};

#[derive(Debug, Parser)]
#[command(name = "kirogate", version, about = "Anthropic/OpenAI gateway for the Kiro upstream")]
struct CliArgs {
    /// Bind host.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Bind port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Inbound bearer secret. Mandatory: without it the gateway refuses to
    /// start.
    #[arg(long, env = "KIRO_CLIENT_TOKEN")]
    client_token: Option<String>,

    /// Managed store file; omit to run without the store source.
    #[arg(long, env = "K2A_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let Some(client_token) = args.client_token.filter(|token| !token.is_empty()) else {
        bail!("KIRO_CLIENT_TOKEN is not set; configure a strong random secret before starting");
    };

    let tuning = Tuning::from_env();

    let store = match &args.data_dir {
        Some(dir) => match TokenStore::open(dir.join("store.json")) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(%err, "managed store unavailable, continuing without it");
                None
            }
        },
        None => None,
    };

    let credentials = CredentialSet::load(store.as_deref()).context("load credentials")?;
    if credentials.is_empty() {
        warn!("no usable credentials configured; set KIRO_AUTH_TOKEN or add store entries");
    }

    // All process-wide state is built before the listener binds.
    let proxy = upstream::proxy_from_env();
    let client = upstream::shared_client(proxy.as_deref())
        .map_err(|err| anyhow::anyhow!(err.message))
        .context("build upstream client")?;
    let governor = Arc::new(RateGovernor::new(GovernorConfig::from(&tuning)));
    let fingerprints = Arc::new(FingerprintRegistry::new());
    let refresher = TokenRefresher::new(client.clone());
    let usage = UsageChecker::new(client.clone());
    let manager = Arc::new(TokenManager::new(
        credentials,
        governor,
        fingerprints,
        refresher.clone(),
        usage,
        store,
        tuning.token_cache_ttl,
    ));

    let state = Arc::new(AppState {
        client_auth: ClientAuth::new(client_token),
        manager,
        user_tokens: Arc::new(UserTokenCache::default()),
        refresher,
        client,
        request_deadline: tuning.request_deadline,
    });

    let app = handler::router(state);
    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, "kirogate listening");
    axum::serve(listener, app).await?;
    Ok(())
}
