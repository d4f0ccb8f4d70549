use std::sync::Arc;

use thiserror::Error;
use toolcrib_core::config::{AppConfig, ConfigError, LoadOptions};
use toolcrib_core::service::{WorkflowService, WorkflowSettings};
use toolcrib_db::{connect_with_config, migrations, DbPool, SqlRequestStorage};
use tracing::info;

use crate::notifications::TracingNotificationDispatcher;

pub type Workflow = WorkflowService<SqlRequestStorage, TracingNotificationDispatcher>;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub workflow: Arc<Workflow>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_config(&config.database)
        .await
        .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let workflow = WorkflowService::new(
        SqlRequestStorage::new(db_pool.clone()),
        TracingNotificationDispatcher,
    )
    .with_settings(WorkflowSettings::from(&config.workflow));

    Ok(Application { config, db_pool, workflow: Arc::new(workflow) })
}
