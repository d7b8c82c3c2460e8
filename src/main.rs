use std::sync::Arc;

use anyhow::Context;
use bike_stations::{
    api::{self, AppState, RequestDefaults},
    config::Config,
    history::HistoryService,
    stations::StationResolver,
    store::{InfluxStore, RedisStore},
    telemetry,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    telemetry::init_logging(config.log_json)?;
    info!(?config, "starting");

    let redis = Arc::new(
        RedisStore::connect(&config.redis_url())
            .await
            .with_context(|| format!("connecting to redis at {}", config.redis_url()))?,
    );
    let influx = Arc::new(InfluxStore::new(
        &config.influx_url(),
        &config.db_user,
        &config.db_password,
        config.db_timeout(),
    )?);

    let state = AppState::new(
        StationResolver::new(redis.clone(), redis, config.decode_policy),
        HistoryService::new(influx, config.db_database.clone()),
        RequestDefaults {
            contract_name: config.default_contract.clone(),
            distance_m: config.default_distance,
            sampling_interval: config.sampling_interval,
        },
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(addr = %config.listen, "listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, store connections released");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown requested");
}
