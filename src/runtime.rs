use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
#[cfg(feature = "database")]
use sqlx::{migrate::MigrateDatabase, SqlitePool};
use tracing::info;

use crate::config::AutocoderConfig;

/// Explicit context threaded through every component, replacing any
/// module-level singleton. Constructed once in `main`, cloned cheaply
/// (the pool is an `Arc` internally, the config is wrapped in one here).
#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<AutocoderConfig>,
    pub project_root: PathBuf,
    #[cfg(feature = "database")]
    pub pool: SqlitePool,
}

impl Runtime {
    #[cfg(feature = "database")]
    pub async fn bootstrap(project_root: impl AsRef<Path>, config: AutocoderConfig) -> Result<Self> {
        let project_root = project_root.as_ref().to_path_buf();
        let state_dir = project_root.join(".autocoder");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;

        let database_url = if config.database.url.starts_with("sqlite:") {
            config.database.url.clone()
        } else {
            let abs = project_root.join(&config.database.url);
            format!("sqlite://{}", abs.display())
        };

        if !sqlx::Sqlite::database_exists(&database_url)
            .await
            .unwrap_or(false)
        {
            info!(url = %database_url, "creating database");
            sqlx::Sqlite::create_database(&database_url).await?;
        }

        let pool = SqlitePool::connect(&database_url).await?;

        if config.database.auto_migrate {
            info!("running database migrations");
            sqlx::migrate!("./migrations").run(&pool).await?;
        }

        Ok(Self {
            config: Arc::new(config),
            project_root,
            pool,
        })
    }

    #[cfg(not(feature = "database"))]
    pub async fn bootstrap(project_root: impl AsRef<Path>, config: AutocoderConfig) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            project_root: project_root.as_ref().to_path_buf(),
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(".autocoder")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.project_root.join("worktrees")
    }

    pub fn cleanup_queue_path(&self) -> PathBuf {
        self.state_dir().join("cleanup_queue.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    #[cfg(feature = "database")]
    pub async fn shutdown(&self) {
        info!("closing database pool");
        self.pool.close().await;
    }

    #[cfg(not(feature = "database"))]
    pub async fn shutdown(&self) {}
}
