use std::sync::Arc;

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sizeflow_observability::init();

    let config = sizeflow_infra::Config::from_env().context("loading configuration")?;
    let services = sizeflow_api::app::services::build_services(&config)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;

    let app = sizeflow_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
