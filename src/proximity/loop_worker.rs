use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::models::Buid;
use crate::radio::{RadioAdapter, RadioEvent};

use super::engine::{ProximityCore, ScannerSnapshot};
use super::store::FlushBatch;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

pub(crate) type FlushReply = oneshot::Sender<Result<usize>>;

pub(crate) enum ScannerCommand {
    Deliver(RadioEvent),
    StartScanning(oneshot::Sender<Result<()>>),
    StopScanning(oneshot::Sender<()>),
    StartAdvertising {
        buid: Buid,
        reply: oneshot::Sender<Result<()>>,
    },
    StopAdvertising(oneshot::Sender<()>),
    Flush(FlushReply),
    Snapshot(oneshot::Sender<ScannerSnapshot>),
}

struct FlushOutcome {
    batch: FlushBatch,
    result: Result<Vec<i64>>,
}

/// Owns the core, the radio and the flush bookkeeping. Only the loop task
/// ever touches it.
struct Worker {
    core: ProximityCore,
    radio: Box<dyn RadioAdapter>,
    db: Database,
    outcome_tx: mpsc::UnboundedSender<FlushOutcome>,
    in_flight_waiters: Vec<FlushReply>,
    /// Flush requests that arrived while a batch was being written.
    follow_up: Option<Vec<FlushReply>>,
}

impl Worker {
    fn handle(&mut self, command: ScannerCommand) {
        let now = Instant::now();
        match command {
            ScannerCommand::Deliver(event) => {
                self.core.handle_event(event, self.radio.as_mut(), now);
            }
            ScannerCommand::StartScanning(reply) => {
                let _ = reply.send(self.core.start_scanning(self.radio.as_mut()));
            }
            ScannerCommand::StopScanning(reply) => {
                match self.core.stop_scanning(self.radio.as_mut()) {
                    Some(batch) => self.spawn_flush(batch, Vec::new()),
                    None => {
                        self.follow_up.get_or_insert_with(Vec::new);
                    }
                }
                let _ = reply.send(());
            }
            ScannerCommand::StartAdvertising { buid, reply } => {
                let _ = reply.send(self.core.start_advertising(buid, self.radio.as_mut()));
            }
            ScannerCommand::StopAdvertising(reply) => {
                self.core.stop_advertising(self.radio.as_mut());
                let _ = reply.send(());
            }
            ScannerCommand::Flush(reply) => self.request_flush(vec![reply]),
            ScannerCommand::Snapshot(reply) => {
                let _ = reply.send(self.core.snapshot(self.radio.as_ref(), now));
            }
        }
    }

    fn request_flush(&mut self, waiters: Vec<FlushReply>) {
        match self.core.prepare_flush() {
            Some(batch) => self.spawn_flush(batch, waiters),
            None => self
                .follow_up
                .get_or_insert_with(Vec::new)
                .extend(waiters),
        }
    }

    fn spawn_flush(&mut self, batch: FlushBatch, waiters: Vec<FlushReply>) {
        if batch.records.is_empty() {
            self.core.commit_flush(&batch, Utc::now(), Instant::now());
            for waiter in waiters {
                let _ = waiter.send(Ok(0));
            }
            return;
        }

        log_info!(
            "Flushing {} scan records (generation {})",
            batch.records.len(),
            batch.generation
        );
        self.in_flight_waiters = waiters;
        let db = self.db.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = db.insert_scan_records(batch.records.clone()).await;
            if outcome_tx.send(FlushOutcome { batch, result }).is_err() {
                log_warn!("Scanner loop gone before flush completed");
            }
        });
    }

    fn on_flush_outcome(&mut self, outcome: FlushOutcome) {
        let FlushOutcome { batch, result } = outcome;
        let waiters = std::mem::take(&mut self.in_flight_waiters);

        match result {
            Ok(ids) => {
                self.core.commit_flush(&batch, Utc::now(), Instant::now());
                log_info!("Flushed {} scan records", ids.len());
                for waiter in waiters {
                    let _ = waiter.send(Ok(ids.len()));
                }
            }
            Err(err) => {
                log_error!("Flush failed, keeping live sessions: {err:#}");
                self.core.abort_flush(&batch);
                let message = format!("{err:#}");
                for waiter in waiters {
                    let _ = waiter.send(Err(anyhow!("failed to persist scan records: {message}")));
                }
            }
        }

        if let Some(next) = self.follow_up.take() {
            self.request_flush(next);
        }
    }

    /// Lets pending writes land, stops the radio and writes whatever is left.
    async fn shut_down(&mut self, outcome_rx: &mut mpsc::UnboundedReceiver<FlushOutcome>) {
        while self.core.store().flush_in_flight() {
            match outcome_rx.recv().await {
                Some(outcome) => self.on_flush_outcome(outcome),
                None => break,
            }
        }

        self.core.stop_advertising(self.radio.as_mut());
        let Some(batch) = self.core.stop_scanning(self.radio.as_mut()) else {
            log_warn!("Flush still in flight at shutdown; newer samples are dropped");
            return;
        };
        if batch.records.is_empty() {
            return;
        }
        match self.db.insert_scan_records(batch.records.clone()).await {
            Ok(ids) => {
                self.core.commit_flush(&batch, Utc::now(), Instant::now());
                log_info!("Flushed {} scan records at shutdown", ids.len());
            }
            Err(err) => log_error!("Final flush failed: {err:#}"),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn scanner_loop(
    core: ProximityCore,
    radio: Box<dyn RadioAdapter>,
    db: Database,
    mut commands: mpsc::UnboundedReceiver<ScannerCommand>,
    cancel_token: CancellationToken,
) {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let mut worker = Worker {
        core,
        radio,
        db,
        outcome_tx,
        in_flight_waiters: Vec::new(),
        follow_up: None,
    };

    loop {
        let deadline = worker.core.next_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => worker.handle(command),
                None => {
                    log_info!("All scanner handles dropped");
                    break;
                }
            },
            Some(outcome) = outcome_rx.recv() => worker.on_flush_outcome(outcome),
            _ = sleep_until(deadline) => {
                worker.core.on_tick(worker.radio.as_mut(), Instant::now());
            }
            _ = cancel_token.cancelled() => {
                log_info!("scanner loop shutting down");
                break;
            }
        }
    }

    worker.shut_down(&mut outcome_rx).await;
}
