use std::{sync::Arc, time::{Duration, Instant}};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, error, warn};
use crate::{
    api::handler::AppState,
    chain::{confirm::ConfirmationPolicy, origin::EvmOriginVault, remote::EvmRemoteLedger, OriginVault, RemoteLedger},
    config::{Config, OracleKind},
    error::AppResult,
    ledger::{repository::LedgerRepository, LedgerStore},
    middleware::RateLimitLayer,
    oracle::{ftso::FtsoOracle, pyth::PythOracle, PriceOracle},
    saga::{CoordinatorSettings, SagaCoordinator},
    watcher::{EventWatcher, WatcherSettings},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Database pool
    let pool = initialize_database(config).await?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(LedgerRepository::new(pool));

    // Price oracle
    let oracle: Arc<dyn PriceOracle> = match config.oracle_kind {
        OracleKind::Ftso => {
            let oracle = FtsoOracle::new(
                config.oracle_rpc_url(),
                &config.ftso_registry_address,
                config.quote_max_age_secs,
            )?;
            info!("✅ FTSO price oracle initialized for {}", config.oracle_symbol);
            Arc::new(oracle)
        }
        OracleKind::Pyth => {
            info!("✅ Pyth price oracle initialized: {}", config.pyth_base_url);
            Arc::new(PythOracle::new(&config.pyth_base_url, config.quote_max_age_secs))
        }
    };
    if let Some(rate) = config.fallback_rate()? {
        warn!("⚠️  Fallback rate {} configured: oracle outages will not stop deposits", rate);
    }

    // Chain clients
    info!("⚙️  Initializing chain clients...");
    let policy = ConfirmationPolicy {
        confirmations: config.remote_confirmations.max(1),
        timeout: config.tx_timeout(),
        poll_interval: config.tx_poll_interval(),
    };
    let remote: Arc<dyn RemoteLedger> = Arc::new(EvmRemoteLedger::new(
        &config.remote_rpc_url,
        &config.remote_manager_address,
        &config.remote_operator_key,
        policy.clone(),
    )?);
    let origin: Arc<dyn OriginVault> = Arc::new(EvmOriginVault::new(
        &config.origin_rpc_url,
        &config.origin_vault_address,
        &config.origin_operator_key,
        policy,
    )?);

    // Saga coordinator, resuming whatever the last run left behind
    let coordinator = SagaCoordinator::new(
        ledger.clone(),
        oracle,
        remote.clone(),
        origin.clone(),
        CoordinatorSettings::from_config(config)?,
    );
    coordinator.recover().await?;
    info!("✅ Saga coordinator ready ({} worker slots)", config.max_workers);

    // Origin event watcher
    let watcher_settings = WatcherSettings::from_config(config, &origin.vault_address());
    let cursor_stream = watcher_settings.stream.clone();
    let watcher = Arc::new(EventWatcher::new(
        origin.clone(),
        ledger.clone(),
        coordinator.clone(),
        watcher_settings,
    ));
    watcher.start();
    info!("✅ Origin event watcher started");

    // Reconciliation sweep for retryable and unconfirmed sagas
    let sweeper = coordinator.clone();
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;

            if let Err(e) = sweeper.sweep().await {
                error!("Reconciliation sweep failed: {:?}", e);
            }
        }
    });
    info!("✅ Reconciliation sweep started (every {}s)", sweep_interval.as_secs());

    if config.operator_token.is_none() {
        warn!("⚠️  OPERATOR_TOKEN not set - manual endpoints disabled");
    }

    Ok(AppState {
        ledger,
        coordinator,
        remote,
        origin,
        cursor_stream,
        stale_after: config.stale_after()?,
        started_at: Instant::now(),
        operator_token: config.operator_token.clone(),
        manual_limiter: RateLimitLayer::per_minute(config.manual_rate_limit_per_minute)?,
    })
}

async fn initialize_database(config: &Config) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", config.database_max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
