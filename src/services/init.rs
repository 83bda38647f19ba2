//! Initialization helpers for the application:
//! - database connection + migrations
//! - background worker spawn helpers (dispatch loop, audit logger)

use std::{path::Path, sync::Arc};

use anyhow::Result;

use crate::config::Config;
use crate::services::status_feed;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else {
        if let Some(at_pos) = db_url.find('@') {
            let without_creds = &db_url[at_pos + 1..];
            return format!("(redacted){}", without_creds);
        }
        "(redacted)".to_string()
    }
}

/// Initialize SQLite database connection and run migrations.
///
/// Creates the parent directory for the database file (if applicable),
/// opens a connection pool using `create_if_missing(true)` and runs migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    // Extract the file path from the database URL
    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
            tracing::info!(
                "Database directory created or already exists: {}",
                parent.display()
            );
        }
    }

    // Dispatch workers and request handlers write concurrently; WAL plus a
    // busy timeout keeps short claim/CAS statements from failing with SQLITE_BUSY.
    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;
    tracing::info!("Connected to database file: {}", db_file_path.display());

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Spawn background workers:
/// - the dispatch loop, which runs a dispatch cycle whenever it is woken by a
///   submission or the poll interval elapses
/// - the audit logger, which persists every status change
///
/// Returns the `JoinHandle`s so callers can await shutdown. Each worker listens
/// for a shutdown notification via a `tokio::sync::broadcast::Sender<()>`.
pub fn spawn_background_workers(
    state: Arc<crate::AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(status_feed::spawn_audit_logger(
        state.pipeline.feed(),
        state.db.clone(),
        shutdown.clone(),
    ));

    if !state.config.delivery.dispatch_enabled {
        tracing::warn!("Delivery dispatch disabled; records stay queued until it is enabled");
        return handles;
    }

    // Dispatch worker
    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        let wake = state.pipeline.wake_handle();
        let poll_interval =
            std::time::Duration::from_secs(state.config.delivery.poll_interval_seconds.max(1));
        handles.push(tokio::spawn(async move {
            loop {
                // Keep draining while cycles come back full.
                loop {
                    match state.pipeline.run_dispatch_cycle(chrono::Utc::now()).await {
                        Ok(summary)
                            if summary.claimed > 0
                                && summary.claimed >= state.config.delivery.batch_size as usize => {
                            if shutdown_rx.try_recv().is_ok() {
                                tracing::info!("Dispatch worker received shutdown signal");
                                return;
                            }
                        }
                        Ok(_) => break,
                        Err(e) => {
                            tracing::warn!("Dispatch cycle failed: {:?}", e);
                            break;
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Dispatch worker shutting down");
                        break;
                    }
                    _ = wake.notified() => {
                        tracing::debug!("Dispatch worker woken by new deliveries");
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }));
    }

    handles
}
