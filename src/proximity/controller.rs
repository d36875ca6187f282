use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::info;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::models::Buid;
use crate::radio::{RadioAdapter, RadioEvent};
use crate::settings::ScannerSettings;

use super::engine::{ProximityCore, ScannerSnapshot};
use super::loop_worker::{scanner_loop, ScannerCommand};

/// Handle to the proximity loop. Clones talk to the same loop task.
#[derive(Clone)]
pub struct ScannerController {
    commands: mpsc::UnboundedSender<ScannerCommand>,
    cancel_token: CancellationToken,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ScannerController {
    /// Spawns the loop on the current runtime. The loop owns the radio from here on.
    pub fn spawn(radio: Box<dyn RadioAdapter>, db: Database, settings: ScannerSettings) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let core = ProximityCore::new(settings);

        let handle = tokio::spawn(scanner_loop(core, radio, db, rx, cancel_token.clone()));

        Self {
            commands,
            cancel_token,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    fn send(&self, command: ScannerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("scanner loop is not running"))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ScannerCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(command(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("scanner loop dropped the request"))
    }

    /// Entry point for radio callbacks; never blocks.
    pub fn deliver(&self, event: RadioEvent) -> Result<()> {
        self.send(ScannerCommand::Deliver(event))
    }

    pub async fn start_scanning(&self) -> Result<()> {
        self.request(ScannerCommand::StartScanning).await?
    }

    /// Halts both scans and kicks off a flush without waiting for it.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(ScannerCommand::StopScanning).await
    }

    pub async fn start_advertising(&self, buid: Buid) -> Result<()> {
        self.request(|reply| ScannerCommand::StartAdvertising { buid, reply })
            .await?
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.request(ScannerCommand::StopAdvertising).await
    }

    /// Persists every finished identity session and returns how many records
    /// were written. Waits behind a flush that is already running.
    pub async fn flush(&self) -> Result<usize> {
        self.request(ScannerCommand::Flush).await?
    }

    pub async fn snapshot(&self) -> Result<ScannerSnapshot> {
        self.request(ScannerCommand::Snapshot).await
    }

    /// Stops the loop after a final flush. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel_token.cancel();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .context("scanner loop task failed to join")?;
            info!("Scanner loop stopped");
        }
        Ok(())
    }
}
