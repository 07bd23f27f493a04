//! Per-category operation lanes.
//!
//! Each category has one lane: a FIFO of pending jobs plus a marker for the
//! job currently running. A lane runs at most one job at a time on its own
//! worker thread; lanes of different categories run in parallel.
//!
//! Admission rules:
//! - auto backup while the lane is busy: dropped, and the lane remembers to
//!   run one auto backup after it drains if the source changed
//! - auto backup within the post-restore mute window: dropped
//! - manual backup while another manual backup is queued: replaces it, and
//!   both callers receive the result of the one that runs
//! - everything else: appended in arrival order
//!
//! Failures never escape a lane: each result is published, turned into a
//! user event and handed to the callers' tickets.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::core::clock::SnapshotId;
use crate::core::error::{EngineError, EngineResult, ErrorKind};
use crate::core::generation::{GenerationStore, PruneReport, validate_category};
use crate::core::publisher::{StatePublisher, UserEvent};
use crate::core::restore::RestoreCoordinator;
use crate::core::settings::SettingsCoordinator;
use crate::infra::io::fingerprint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Backup { is_auto: bool },
    Restore { timestamp: String },
    DeleteOne { timestamp: String },
    DeleteAll,
    SetMemo { text: String },
    Prune { limit: usize },
}

impl Operation {
    fn is_backup(&self) -> bool {
        matches!(self, Self::Backup { .. })
    }

    fn is_manual_backup(&self) -> bool {
        matches!(self, Self::Backup { is_auto: false })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Backup { is_auto: true } => "auto backup",
            Self::Backup { is_auto: false } => "manual backup",
            Self::Restore { .. } => "restore",
            Self::DeleteOne { .. } => "delete",
            Self::DeleteAll => "delete all",
            Self::SetMemo { .. } => "memo",
            Self::Prune { .. } => "prune",
        }
    }

    fn failure_title(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "Backup failed",
            Self::Restore { .. } => "Restore failed",
            Self::DeleteOne { .. } | Self::DeleteAll | Self::Prune { .. } => "Delete failed",
            Self::SetMemo { .. } => "Memo not saved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created {
        id: SnapshotId,
        is_auto: bool,
        /// Retention failures that left snapshots partially deleted.
        degraded: Vec<String>,
    },
    /// A manual request satisfied by the snapshot taken just before it.
    Coalesced { id: SnapshotId },
    /// An auto intent that produced no snapshot.
    Dropped,
    Restored,
    Deleted,
    DeletedAll { count: usize },
    MemoSaved,
    Pruned { removed: usize, degraded: Vec<String> },
}

pub type OpResult = Result<Outcome, Arc<EngineError>>;

/// Handle to the eventual result of a submitted operation.
#[derive(Debug)]
pub struct Ticket {
    rx: Receiver<OpResult>,
}

impl Ticket {
    fn pair() -> (SyncSender<OpResult>, Self) {
        let (tx, rx) = mpsc::sync_channel(1);
        (tx, Self { rx })
    }

    fn ready(result: OpResult) -> Self {
        let (tx, ticket) = Self::pair();
        let _ = tx.send(result);
        ticket
    }

    /// Block until the operation finished.
    pub fn wait(self) -> OpResult {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Arc::new(EngineError::ShuttingDown)))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<OpResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => Some(r),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Arc::new(EngineError::ShuttingDown))),
        }
    }
}

/// Everything a lane needs to execute jobs.
pub struct SchedulerContext {
    pub store: GenerationStore,
    pub restorer: RestoreCoordinator,
    pub publisher: StatePublisher,
    pub settings: SettingsCoordinator,
    /// Auto intents are ignored this long after a restore.
    pub restore_mute: Duration,
}

impl SchedulerContext {
    pub fn root(&self) -> Option<PathBuf> {
        self.settings.current().watched_root()
    }

    pub fn publish_categories(&self) {
        self.publisher
            .publish_categories(&self.store, self.root().as_deref());
    }
}

struct Job {
    seq: u64,
    op: Operation,
    waiters: Vec<SyncSender<OpResult>>,
    /// Backup that runs right before this manual backup.
    covered_by: Option<u64>,
    /// Synthesized after a drain; skipped when the source is unchanged.
    rerun: bool,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    seq: u64,
    is_backup: bool,
}

#[derive(Debug, Clone)]
struct BackupMark {
    seq: u64,
    id: SnapshotId,
    fingerprint: Option<u64>,
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<Job>,
    running: Option<InFlight>,
    worker: bool,
    rerun_auto: bool,
    muted_until: Option<Instant>,
    last_backup: Option<BackupMark>,
    seq: u64,
}

/// Admission decision for a new request.
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Queued,
    Replaced,
    Dropped,
}

impl LaneState {
    fn busy(&self) -> bool {
        self.running.is_some() || !self.queue.is_empty()
    }

    fn muted(&self, now: Instant) -> bool {
        self.muted_until.is_some_and(|until| now < until)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Most recent backup ahead of a job appended now, queued or running.
    fn backup_ahead(&self) -> Option<u64> {
        self.queue
            .iter()
            .rev()
            .find(|j| j.op.is_backup())
            .map(|j| j.seq)
            .or_else(|| self.running.filter(|r| r.is_backup).map(|r| r.seq))
    }

    fn admit(&mut self, op: Operation, waiter: SyncSender<OpResult>, now: Instant) -> Admission {
        match op {
            Operation::Backup { is_auto: true } => {
                if self.muted(now) {
                    let _ = waiter.send(Ok(Outcome::Dropped));
                    return Admission::Dropped;
                }
                if self.busy() {
                    self.rerun_auto = true;
                    let _ = waiter.send(Ok(Outcome::Dropped));
                    return Admission::Dropped;
                }
            }
            Operation::Backup { is_auto: false } => {
                let replaced = self
                    .queue
                    .iter()
                    .position(|j| j.op.is_manual_backup())
                    .and_then(|pos| self.queue.remove(pos));
                let admission = if replaced.is_some() {
                    Admission::Replaced
                } else {
                    Admission::Queued
                };
                let mut waiters = replaced.map(|j| j.waiters).unwrap_or_default();
                waiters.push(waiter);

                let covered_by = self.backup_ahead();
                let seq = self.next_seq();
                self.queue.push_back(Job {
                    seq,
                    op,
                    waiters,
                    covered_by,
                    rerun: false,
                });
                return admission;
            }
            _ => {}
        }

        let seq = self.next_seq();
        self.queue.push_back(Job {
            seq,
            op,
            waiters: vec![waiter],
            covered_by: None,
            rerun: false,
        });
        Admission::Queued
    }

    /// Next job to run, or `None` when the lane should go idle.
    fn take_next(&mut self, now: Instant) -> Option<Job> {
        let job = match self.queue.pop_front() {
            Some(job) => job,
            None if self.rerun_auto && !self.muted(now) => {
                self.rerun_auto = false;
                Job {
                    seq: self.next_seq(),
                    op: Operation::Backup { is_auto: true },
                    waiters: Vec::new(),
                    covered_by: None,
                    rerun: true,
                }
            }
            None => {
                self.rerun_auto = false;
                return None;
            }
        };
        self.running = Some(InFlight {
            seq: job.seq,
            is_backup: job.op.is_backup(),
        });
        Some(job)
    }
}

struct Lane {
    state: Mutex<LaneState>,
    idle: Condvar,
}

impl Lane {
    fn new() -> Self {
        Self {
            state: Mutex::new(LaneState::default()),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
    accepting: AtomicBool,
}

impl Scheduler {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self {
            ctx,
            lanes: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    fn lane(&self, category: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            lanes
                .entry(category.to_string())
                .or_insert_with(|| Arc::new(Lane::new())),
        )
    }

    /// Queue `op` on `category`'s lane.
    pub fn submit(&self, category: &str, op: Operation) -> Ticket {
        if !self.accepting.load(Ordering::SeqCst) {
            return Ticket::ready(Err(Arc::new(EngineError::ShuttingDown)));
        }
        if let Err(e) = validate_category(category) {
            return Ticket::ready(Err(Arc::new(e)));
        }

        let lane = self.lane(category);
        let (tx, ticket) = Ticket::pair();
        let label = op.label();

        let mut st = lane.lock();
        match st.admit(op, tx, Instant::now()) {
            Admission::Dropped => {
                debug!(category, "auto intent coalesced");
                return ticket;
            }
            Admission::Replaced => debug!(category, "queued manual backup superseded"),
            Admission::Queued => debug!(category, op = label, "queued"),
        }

        if !st.worker {
            st.worker = true;
            let ctx = Arc::clone(&self.ctx);
            let worker_lane = Arc::clone(&lane);
            let name = category.to_string();
            let spawned = thread::Builder::new()
                .name(format!("svault-lane-{category}"))
                .spawn(move || run_lane(ctx, worker_lane, name));
            if let Err(e) = spawned {
                error!(category, error = %e, "cannot start lane worker");
                st.worker = false;
                let err = Arc::new(EngineError::io("start lane worker", e));
                for job in st.queue.drain(..) {
                    for w in job.waiters {
                        let _ = w.send(Err(Arc::clone(&err)));
                    }
                }
                lane.idle.notify_all();
            }
        }
        ticket
    }

    /// Block until every lane has drained.
    pub fn wait_idle(&self) {
        let lanes: Vec<Arc<Lane>> = self
            .lanes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        for lane in lanes {
            let mut st = lane.lock();
            while st.worker {
                st = lane.idle.wait(st).unwrap_or_else(|p| p.into_inner());
            }
        }
    }

    /// Refuse new work and let queued and running jobs finish.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.wait_idle();
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

fn run_lane(ctx: Arc<SchedulerContext>, lane: Arc<Lane>, category: String) {
    loop {
        let (job, last_backup) = {
            let mut st = lane.lock();
            match st.take_next(Instant::now()) {
                Some(job) => (job, st.last_backup.clone()),
                None => {
                    st.worker = false;
                    st.running = None;
                    lane.idle.notify_all();
                    return;
                }
            }
        };

        debug!(category = %category, op = job.op.label(), seq = job.seq, "running");
        let (result, mark) = execute(&ctx, &category, &job, last_backup.as_ref());

        {
            let mut st = lane.lock();
            st.running = None;
            if let Some(mark) = mark {
                st.last_backup = Some(mark);
            }
            if matches!(result, Ok(Outcome::Restored)) {
                st.muted_until = Some(Instant::now() + ctx.restore_mute);
                st.rerun_auto = false;
            }
        }

        let result = result.map_err(Arc::new);
        report(&ctx, &category, &job.op, &result);
        for w in job.waiters {
            let _ = w.send(result.clone());
        }
    }
}

fn execute(
    ctx: &SchedulerContext,
    category: &str,
    job: &Job,
    last_backup: Option<&BackupMark>,
) -> (EngineResult<Outcome>, Option<BackupMark>) {
    let root = ctx.root();
    let result = match &job.op {
        Operation::Backup { is_auto } => {
            return backup(ctx, root, category, job, *is_auto, last_backup);
        }
        Operation::Restore { timestamp } => root
            .ok_or(EngineError::NoWatchedRoot)
            .and_then(|root| {
                ctx.restorer
                    .restore(&ctx.store, &root, category, timestamp)
            })
            .map(|_| Outcome::Restored),
        Operation::DeleteOne { timestamp } => {
            ctx.store.delete_one(category, timestamp).map(|()| {
                let source_exists = root.as_ref().is_some_and(|r| r.join(category).is_dir());
                if !source_exists
                    && let Err(e) = ctx.store.remove_category_if_empty(category)
                {
                    warn!(category, error = %e, "cannot remove empty archive");
                }
                Outcome::Deleted
            })
        }
        Operation::DeleteAll => ctx
            .store
            .delete_all(category)
            .map(|count| Outcome::DeletedAll { count }),
        Operation::SetMemo { text } => ctx
            .store
            .set_memo(category, text)
            .map(|()| Outcome::MemoSaved),
        Operation::Prune { limit } => ctx.store.prune(category, *limit).map(|report| {
            Outcome::Pruned {
                removed: report.removed.len(),
                degraded: degraded(&report),
            }
        }),
    };
    (result, None)
}

fn backup(
    ctx: &SchedulerContext,
    root: Option<PathBuf>,
    category: &str,
    job: &Job,
    is_auto: bool,
    last_backup: Option<&BackupMark>,
) -> (EngineResult<Outcome>, Option<BackupMark>) {
    let Some(root) = root else {
        return (Err(EngineError::NoWatchedRoot), None);
    };
    let source = root.join(category);
    if !source.is_dir() {
        return (
            Err(EngineError::SourceMissing {
                category: category.to_string(),
            }),
            None,
        );
    }

    let current = fingerprint(&source).ok();

    // Manual request queued behind a backup that already captured this state
    if let (Some(covered), Some(mark)) = (job.covered_by, last_backup)
        && mark.seq == covered
        && current.is_some()
        && current == mark.fingerprint
    {
        let id = mark.id.clone();
        let mark = BackupMark {
            seq: job.seq,
            id: id.clone(),
            fingerprint: current,
        };
        return (Ok(Outcome::Coalesced { id }), Some(mark));
    }

    // Auto intents never duplicate an unchanged tree
    if is_auto && current.is_some() {
        match ctx.store.latest_snapshot_print(category) {
            Ok(Some((id, latest))) if latest == current => {
                debug!(category, rerun = job.rerun, "source unchanged, auto backup skipped");
                let mark = BackupMark {
                    seq: job.seq,
                    id,
                    fingerprint: current,
                };
                return (Ok(Outcome::Dropped), Some(mark));
            }
            Ok(_) => {}
            Err(e) => debug!(category, error = %e, "no previous fingerprint"),
        }
    }

    let limit = ctx.settings.max_generations();
    match ctx.store.create(&root, category, is_auto, limit) {
        Ok(created) => {
            let mark = BackupMark {
                seq: job.seq,
                id: created.snapshot.id.clone(),
                fingerprint: created.fingerprint,
            };
            let outcome = Outcome::Created {
                id: created.snapshot.id,
                is_auto,
                degraded: degraded(&created.pruned),
            };
            (Ok(outcome), Some(mark))
        }
        Err(e) => (Err(e), None),
    }
}

fn degraded(report: &PruneReport) -> Vec<String> {
    report
        .failed
        .iter()
        .filter(|(_, e)| e.kind() == ErrorKind::PartialFailure)
        .map(|(_, e)| e.to_string())
        .collect()
}

/// Publish state and emit the user event for one finished job.
fn report(ctx: &SchedulerContext, category: &str, op: &Operation, result: &OpResult) {
    let event = |e: UserEvent| ctx.publisher.emit(e.for_category(category));
    let degraded_events = |list: &[String]| {
        for detail in list {
            event(UserEvent::error("Degraded state", detail.clone()));
        }
    };

    match result {
        Ok(Outcome::Created {
            id,
            is_auto,
            degraded,
        }) => {
            ctx.publish_categories();
            let kind = if *is_auto { "auto" } else { "manual" };
            info!(category, snapshot = %id, kind, "backup created");
            event(UserEvent::success(
                "Backup created",
                format!("{category}: {id} ({kind})"),
            ));
            degraded_events(degraded);
        }
        Ok(Outcome::Coalesced { id }) => event(UserEvent::info(
            "Backup up to date",
            format!("{category}: no changes since {id}"),
        )),
        Ok(Outcome::Dropped) => {}
        Ok(Outcome::Restored) => {
            ctx.publish_categories();
            if let Operation::Restore { timestamp } = op {
                event(UserEvent::success(
                    "Restore complete",
                    format!("{category} restored to {timestamp}"),
                ));
            }
        }
        Ok(Outcome::Deleted) => {
            ctx.publish_categories();
            if let Operation::DeleteOne { timestamp } = op {
                event(UserEvent::success(
                    "Snapshot deleted",
                    format!("{category}: {timestamp}"),
                ));
            }
        }
        Ok(Outcome::DeletedAll { count }) => {
            ctx.publish_categories();
            event(UserEvent::success(
                "All snapshots deleted",
                format!("{category}: {count} snapshot(s) removed"),
            ));
        }
        Ok(Outcome::MemoSaved) => ctx.publish_categories(),
        Ok(Outcome::Pruned { degraded, .. }) => {
            ctx.publish_categories();
            degraded_events(degraded);
        }
        Err(e) => match e.kind() {
            ErrorKind::SourceMissing => {
                debug!(category, "source missing");
                ctx.publish_categories();
            }
            ErrorKind::NotFound | ErrorKind::Rejected => {
                warn!(category, error = %e, op = op.label(), "request rejected");
                event(UserEvent::error(op.failure_title(), e.to_string()));
            }
            ErrorKind::PartialFailure => {
                error!(category, error = %e, op = op.label(), "degraded state");
                ctx.publish_categories();
                event(UserEvent::error("Degraded state", e.to_string()));
            }
            ErrorKind::Io | ErrorKind::SourceLocked => {
                warn!(category, error = %e, op = op.label(), "operation failed");
                ctx.publish_categories();
                event(UserEvent::error(op.failure_title(), e.to_string()));
            }
        },
    }
}
