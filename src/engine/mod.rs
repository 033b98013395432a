mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use conflict::{filter_conflicts, merge_overlapping, now_ms, BusyIndex};
pub use error::EngineError;
pub use mutations::{BookingReceipt, BookingRequest};
pub use queries::Availability;
pub use slots::{generate_slots, Horizon, SlotGrid};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::adapters::Collaborators;
use crate::limits::DEFAULT_HORIZON_DAYS;
use crate::model::*;
use crate::wal::Wal;

pub type SharedHostState = Arc<RwLock<HostState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch, then answer every sender.
/// A non-append command ends the batch; it runs after the batch is durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut trailing = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    trailing = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = trailing {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak into
    // the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Engine tunables that do not come from host settings.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub default_days: u32,
    pub provider_timeout: Duration,
    pub notify_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_days: DEFAULT_HORIZON_DAYS,
            provider_timeout: Duration::from_secs(5),
            notify_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns committed bookings per host and serializes commits against them.
///
/// Lock order is `log_gate` (shared) then the host's `RwLock`. Every mutation
/// takes both; compaction takes `log_gate` exclusively so its snapshot and
/// the log swap cannot interleave with an append.
pub struct Engine {
    state: DashMap<HostId, SharedHostState>,
    wal_tx: mpsc::Sender<WalCommand>,
    log_gate: RwLock<()>,
    pub(super) collaborators: Collaborators,
    pub(super) options: EngineOptions,
}

/// Apply an event to a HostState. Caller holds the lock.
fn apply_to_host(hs: &mut HostState, event: &Event) {
    match event {
        Event::BookingCommitted { booking } => hs.insert_booking(booking.clone()),
        Event::CalendarSynced {
            id,
            event_id,
            meeting_link,
            ..
        } => {
            if let Some(b) = hs.get_mut(*id) {
                b.status = BookingStatus::Confirmed;
                b.external_event_id = Some(event_id.clone());
                b.meeting_link = meeting_link.clone();
            }
        }
        Event::CalendarFailed { id, .. } => {
            if let Some(b) = hs.get_mut(*id) {
                b.status = BookingStatus::CalendarFailed;
            }
        }
    }
}

impl Engine {
    /// Replay the log at `wal_path` and start the writer. Must run inside a
    /// Tokio runtime.
    pub fn new(wal_path: PathBuf, collaborators: Collaborators, options: EngineOptions) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            tracing::warn!(
                "discarded torn tail of {} after {} events",
                wal_path.display(),
                replay.events.len()
            );
            Wal::truncate(&wal_path, replay.valid_len)?;
        }

        let mut hosts: HashMap<HostId, HostState> = HashMap::new();
        for event in &replay.events {
            let hs = hosts
                .entry(event.host_id().to_string())
                .or_insert_with(|| HostState::new(event.host_id().to_string()));
            apply_to_host(hs, event);
        }
        let state = DashMap::new();
        for (id, hs) in hosts {
            state.insert(id, Arc::new(RwLock::new(hs)));
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            state,
            wal_tx,
            log_gate: RwLock::new(()),
            collaborators,
            options,
        })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Host state, created empty on first use.
    pub(super) fn host_state(&self, host_id: &str) -> SharedHostState {
        if let Some(rs) = self.state.get(host_id) {
            return rs.value().clone();
        }
        self.state
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(HostState::new(host_id.to_string()))))
            .value()
            .clone()
    }

    pub(super) fn existing_host_state(&self, host_id: &str) -> Option<SharedHostState> {
        self.state.get(host_id).map(|e| e.value().clone())
    }

    /// WAL-append then apply. The caller holds `log_gate` and the host write lock.
    pub(super) async fn persist_and_apply(&self, hs: &mut HostState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_host(hs, event);
        Ok(())
    }
}
