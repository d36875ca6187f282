use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

use migrations::run_migrations;

pub use models::{Exposure, ScanRecord};

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

/// Handle to the scan record store. Clones share one worker thread that
/// owns the connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Option<Arc<PathBuf>>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let path_for_thread = db_path.clone();
        let inner = Self::spawn_worker(move || {
            let conn = Connection::open(&path_for_thread)
                .context("failed to open SQLite database")?;
            if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                error!("Failed to enable WAL mode: {err}");
            }
            Ok(conn)
        })?;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner,
            db_path: Some(Arc::new(db_path)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let inner = Self::spawn_worker(|| {
            Connection::open_in_memory().context("failed to open in-memory SQLite database")
        })?;
        Ok(Self {
            inner,
            db_path: None,
        })
    }

    fn spawn_worker<F>(open: F) -> Result<Arc<DatabaseInner>>
    where
        F: FnOnce() -> Result<Connection> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("proxitrace-db".into())
            .spawn(move || {
                let mut conn = match open() {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        Ok(Arc::new(DatabaseInner {
            sender: command_tx,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref().map(PathBuf::as_path)
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_database_reopens_with_schema_in_place() {
        let dir = std::env::temp_dir().join(format!("proxitrace-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("scan.sqlite3");

        {
            let db = Database::new(path.clone()).unwrap();
            assert_eq!(db.path(), Some(path.as_path()));
            db.execute(|conn| {
                conn.execute(
                    "INSERT INTO scan_data (buid, timestamp_start, timestamp_end, avg_rssi, med_rssi, rssi_count)
                     VALUES ('0102030405060708090a', 0, 1, -60, -60, 1)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        }

        let db = Database::new(path).unwrap();
        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM scan_data", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn task_errors_reach_the_caller() {
        let db = Database::in_memory().unwrap();
        assert!(db.path().is_none());
        let result: Result<()> = db
            .execute(|conn| {
                conn.execute("INSERT INTO missing_table VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }
}
