use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reviewflow_backend::{
    config::Config,
    database,
    jobs::JobScheduler,
    repositories::Repositories,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;
    if !database::health_check(&db_pool).await {
        anyhow::bail!("database health check failed");
    }

    let channels = AppState::delivery_channels(&config)?;
    let (state, log_writer) = AppState::build(config, Repositories::postgres(db_pool.clone()), channels)?;

    let jobs = JobScheduler::new(state.scheduler.clone()).await?;
    jobs.start().await?;
    tracing::info!(
        "Review automation worker running, sweeping every {}s",
        state.config.engine.sweep_interval_secs
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    jobs.shutdown().await?;
    log_writer.shutdown().await;
    match state.metrics.render() {
        Ok(text) => tracing::info!("Final metrics:\n{}", text),
        Err(e) => tracing::warn!("Could not render metrics: {}", e),
    }
    db_pool.close().await;

    Ok(())
}
