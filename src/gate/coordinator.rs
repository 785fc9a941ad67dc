//! Gate state machine bound to a platform and a store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::persistence::GateStore;
use crate::platform::RemotePlatform;
use crate::types::{
    ChangeSetId, CheckState, GateRecord, JobStatus, OrchestrationRun, PublishOutcome, RepoId,
    RevisionId, RevisionSnapshot, RunId, RunOutcome, StatusCheck, SuppressReason,
};

use super::{
    GateError, GateView, InvalidationReport, MidRunPolicy, Result, RunTicket, StatusSettings,
};

/// The run holding a change set's slot.
#[derive(Debug)]
struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct GateEntry {
    record: GateRecord,
    active: Option<ActiveRun>,
}

impl GateEntry {
    /// Frees the slot if `run_id` holds it.
    fn release(&mut self, change_set: &ChangeSetId, run_id: RunId) -> Result<()> {
        match &self.active {
            Some(active) if active.run_id == run_id => {
                self.active = None;
                Ok(())
            }
            _ => Err(GateError::NotActiveRun {
                change_set: change_set.clone(),
                run_id,
            }),
        }
    }

    /// Frees the slot of a run that will never resolve.
    ///
    /// A `Running` record becomes `Invalidated`, so the abandoned run can never
    /// publish and the change set can be run again.
    fn abandon(&mut self, store: &dyn GateStore, change_set: &ChangeSetId, run_id: RunId) {
        match &self.active {
            Some(active) if active.run_id == run_id => active.cancel.cancel(),
            _ => return,
        }
        self.active = None;
        warn!(%change_set, %run_id, "Run abandoned before resolving, releasing its slot");
        if self.record.recover() {
            if let Err(e) = store.save(&self.record) {
                warn!(%change_set, error = %e, "Could not persist abandoned run");
            }
        }
    }
}

/// Holds a change set's slot for one run.
///
/// Dropping it before the run is published or recorded (the run's future was
/// dropped, or its task aborted) releases the slot. Once the run has resolved,
/// dropping it does nothing.
pub(super) struct RunSlot {
    entry: Arc<Mutex<GateEntry>>,
    store: Arc<dyn GateStore>,
    change_set: ChangeSetId,
    run_id: RunId,
}

impl std::fmt::Debug for RunSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSlot")
            .field("change_set", &self.change_set)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        if let Ok(mut entry) = self.entry.try_lock() {
            entry.abandon(self.store.as_ref(), &self.change_set, self.run_id);
            return;
        }

        // Another gate operation holds the entry; release once it is done.
        let Ok(handle) = Handle::try_current() else {
            warn!(change_set = %self.change_set, run_id = %self.run_id, "No runtime to release abandoned run");
            return;
        };
        let entry = Arc::clone(&self.entry);
        let store = Arc::clone(&self.store);
        let change_set = self.change_set.clone();
        let run_id = self.run_id;
        handle.spawn(async move {
            entry
                .lock()
                .await
                .abandon(store.as_ref(), &change_set, run_id);
        });
    }
}

/// Owns the gate state of every change set.
pub struct InvalidationCoordinator<P, S> {
    platform: Arc<P>,
    store: Arc<S>,
    /// Repositories a change set can span (those of the configured build nodes).
    repos: Vec<RepoId>,
    status: StatusSettings,
    policy: MidRunPolicy,
    entries: RwLock<HashMap<ChangeSetId, Arc<Mutex<GateEntry>>>>,
    next_run: AtomicU64,
}

impl<P: RemotePlatform, S: GateStore> InvalidationCoordinator<P, S> {
    pub fn new(platform: Arc<P>, store: Arc<S>, repos: Vec<RepoId>) -> Self {
        Self {
            platform,
            store,
            repos,
            status: StatusSettings::default(),
            policy: MidRunPolicy::default(),
            entries: RwLock::new(HashMap::new()),
            next_run: AtomicU64::new(1),
        }
    }

    pub fn with_status(mut self, status: StatusSettings) -> Self {
        self.status = status;
        self
    }

    pub fn with_policy(mut self, policy: MidRunPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn repos(&self) -> &[RepoId] {
        &self.repos
    }

    /// Returns the entry for `id`, loading it from the store on first use.
    async fn entry(&self, id: &ChangeSetId) -> Result<Arc<Mutex<GateEntry>>> {
        if let Some(entry) = self.entries.read().await.get(id) {
            return Ok(Arc::clone(entry));
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(id) {
            return Ok(Arc::clone(entry));
        }

        let record = match self.store.load(id)? {
            Some(mut record) => {
                if record.recover() {
                    warn!(change_set = %id, "Found record of a run that died with a previous process, treating as invalidated");
                    self.store.save(&record)?;
                }
                record
            }
            None => GateRecord::new(id.clone()),
        };
        let entry = Arc::new(Mutex::new(GateEntry {
            record,
            active: None,
        }));
        entries.insert(id.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Current head revision per repository, lowest-numbered open change first.
    async fn snapshot(&self, id: &ChangeSetId) -> Result<RevisionSnapshot> {
        let mut snapshot = RevisionSnapshot::new();
        for repo in &self.repos {
            let revisions = self
                .platform
                .list_open_revisions(repo, id.branch_pattern())
                .await?;
            if let Some(revision) = revisions.into_iter().next() {
                snapshot.insert(repo.clone(), revision.head);
            }
        }
        Ok(snapshot)
    }

    fn check(&self, state: CheckState, description: impl Into<String>) -> StatusCheck {
        StatusCheck {
            context: self.status.context.clone(),
            state,
            description: description.into(),
        }
    }

    /// Writes `check` on every revision of `revisions` whose last check differs.
    ///
    /// Successful writes are remembered on `record` even if a later one fails.
    async fn write_checks<'a>(
        &self,
        record: &mut GateRecord,
        revisions: impl IntoIterator<Item = (&'a RepoId, &'a RevisionId)>,
        check: &StatusCheck,
    ) -> Result<Vec<RepoId>> {
        let mut written = Vec::new();
        for (repo, revision) in revisions {
            if !record.needs_write(repo, revision, check.state) {
                debug!(%repo, revision = revision.short(), state = ?check.state, "Status already set");
                continue;
            }
            self.platform
                .set_status_check(repo, revision, check)
                .await?;
            record.record_check(repo.clone(), revision.clone(), check.state);
            written.push(repo.clone());
        }
        Ok(written)
    }

    /// Records a modification of the change set.
    ///
    /// The generation bump is persisted before any status write, so a crash in
    /// between still voids the running approval.
    #[instrument(skip(self), fields(change_set = %id))]
    pub async fn invalidate(&self, id: &ChangeSetId) -> Result<InvalidationReport> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;

        let generation = entry.record.invalidate();
        self.store.save(&entry.record)?;

        let mut aborted_run = false;
        if let Some(active) = &entry.active {
            match self.policy {
                MidRunPolicy::Abort => {
                    info!(run_id = %active.run_id, "Cancelling active run after modification");
                    active.cancel.cancel();
                    aborted_run = true;
                }
                MidRunPolicy::SuppressPublish => {
                    debug!(run_id = %active.run_id, "Active run will not be able to publish");
                }
            }
        }

        let snapshot = self.snapshot(id).await?;
        let pending = self.check(
            CheckState::Pending,
            "Change set modified; awaiting a full build",
        );
        let written = self
            .write_checks(&mut entry.record, snapshot.iter(), &pending)
            .await;
        if written.as_ref().map_or(true, |repos| !repos.is_empty()) {
            self.store.save(&entry.record)?;
        }
        let marked_pending = written?;

        info!(generation, marked = marked_pending.len(), "Change set invalidated");
        Ok(InvalidationReport {
            generation,
            marked_pending,
            aborted_run,
        })
    }

    /// Admits a run, capturing the generation and the revision snapshot together.
    #[instrument(skip(self), fields(change_set = %id))]
    pub async fn begin_run(&self, id: &ChangeSetId) -> Result<RunTicket> {
        let shared = self.entry(id).await?;
        let mut entry = shared.lock().await;

        if let Some(active) = &entry.active {
            warn!(run_id = %active.run_id, "Rejecting concurrent run");
            return Err(GateError::ConcurrentRunRejected(id.clone()));
        }

        let snapshot = self.snapshot(id).await?;

        let mut record = entry.record.clone();
        let generation = record.start_run();
        self.store.save(&record)?;
        entry.record = record;

        let run_id = RunId(self.next_run.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        entry.active = Some(ActiveRun {
            run_id,
            cancel: cancel.clone(),
        });

        info!(%run_id, generation, repos = snapshot.len(), "Run admitted");
        let store: Arc<dyn GateStore> = self.store.clone();
        Ok(RunTicket {
            run_id,
            change_set: id.clone(),
            generation,
            snapshot,
            cancel,
            _slot: RunSlot {
                entry: Arc::clone(&shared),
                store,
                change_set: id.clone(),
                run_id,
            },
        })
    }

    /// Publishes a succeeded run, or suppresses it if the change set moved on.
    ///
    /// Success is written only if the run's generation is still current and
    /// every repository's open head equals the run's snapshot. A suppressed
    /// publish writes nothing and is not an error. The run's slot is released
    /// either way.
    #[instrument(skip_all, fields(change_set = %run.change_set, run_id = %run.run_id))]
    pub async fn publish(&self, run: &OrchestrationRun) -> Result<PublishOutcome> {
        if run.outcome != RunOutcome::Succeeded {
            return Err(GateError::NotSucceeded { run_id: run.run_id });
        }

        let entry = self.entry(&run.change_set).await?;
        let mut entry = entry.lock().await;
        entry.release(&run.change_set, run.run_id)?;

        if !entry.record.is_current(run.generation) {
            let reason = SuppressReason::GenerationChanged {
                captured: run.generation,
                current: entry.record.generation,
            };
            info!(?reason, "Publish suppressed");
            entry.record.suppress();
            self.store.save(&entry.record)?;
            return Ok(PublishOutcome::Suppressed { reason });
        }

        let current = match self.snapshot(&run.change_set).await {
            Ok(current) => current,
            Err(e) => {
                entry.record.suppress();
                self.store.save(&entry.record)?;
                return Err(e);
            }
        };
        if let Some(repo) = run.snapshot.first_difference(&current) {
            let reason = SuppressReason::RevisionsChanged { repo };
            info!(?reason, "Publish suppressed");
            entry.record.suppress();
            self.store.save(&entry.record)?;
            return Ok(PublishOutcome::Suppressed { reason });
        }

        let succeeded = run
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Succeeded)
            .count();
        let success = self.check(
            CheckState::Success,
            format!("{} builds passed, {} skipped", succeeded, run.jobs.len() - succeeded),
        );
        let written = self
            .write_checks(&mut entry.record, run.snapshot.iter(), &success)
            .await;
        match &written {
            Ok(_) => {
                entry.record.resolve_run(run.generation, RunOutcome::Succeeded);
            }
            Err(_) => entry.record.suppress(),
        }
        self.store.save(&entry.record)?;
        written?;

        info!(revisions = run.snapshot.len(), "Published success");
        Ok(PublishOutcome::Published {
            revisions: run.snapshot.clone(),
        })
    }

    /// Records a failed run.
    ///
    /// If no modification happened since the run started, the phase becomes
    /// `Failed` and a failure check is written on each snapshot revision.
    /// Otherwise nothing is written. Returns whether the failure was recorded.
    #[instrument(skip_all, fields(change_set = %run.change_set, run_id = %run.run_id))]
    pub async fn record_failure(&self, run: &OrchestrationRun) -> Result<bool> {
        let entry = self.entry(&run.change_set).await?;
        let mut entry = entry.lock().await;
        entry.release(&run.change_set, run.run_id)?;

        if !entry.record.resolve_run(run.generation, RunOutcome::Failed) {
            info!(
                captured = run.generation,
                current = entry.record.generation,
                "Stale failure not recorded"
            );
            self.store.save(&entry.record)?;
            return Ok(false);
        }

        let failed: Vec<String> = run
            .jobs
            .iter()
            .filter(|job| job.status.is_failure())
            .map(|job| job.node.to_string())
            .collect();
        let failure = self.check(
            CheckState::Failure,
            format!("{} of {} builds failed: {}", failed.len(), run.jobs.len(), failed.join(", ")),
        );
        let written = self
            .write_checks(&mut entry.record, run.snapshot.iter(), &failure)
            .await;
        self.store.save(&entry.record)?;
        written?;

        info!(failed = failed.len(), "Recorded failure");
        Ok(true)
    }

    /// Writes a manual success check on one repository's open revision.
    ///
    /// Bypasses graph execution and leaves the phase unchanged. Meant for
    /// diagnosing the status plumbing of a single repository.
    #[instrument(skip(self), fields(change_set = %id, %repo))]
    pub async fn publish_test_signal(&self, id: &ChangeSetId, repo: &RepoId) -> Result<RevisionId> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;

        let revision = self
            .platform
            .list_open_revisions(repo, id.branch_pattern())
            .await?
            .into_iter()
            .next()
            .map(|r| r.head)
            .ok_or_else(|| GateError::NoOpenRevision {
                change_set: id.clone(),
                repo: repo.clone(),
            })?;

        let check = self.check(CheckState::Success, "Manual test signal");
        self.platform
            .set_status_check(repo, &revision, &check)
            .await?;
        entry
            .record
            .record_check(repo.clone(), revision.clone(), CheckState::Success);
        self.store.save(&entry.record)?;

        info!(revision = revision.short(), "Test signal published");
        Ok(revision)
    }

    /// Returns the gate state of `id`.
    pub async fn state(&self, id: &ChangeSetId) -> Result<GateView> {
        let entry = self.entry(id).await?;
        let entry = entry.lock().await;
        Ok(GateView {
            record: entry.record.clone(),
            active_run: entry.active.as_ref().map(|a| a.run_id),
        })
    }

    /// Cancels every active run.
    pub async fn cancel_all(&self) {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        for entry in entries {
            if let Some(active) = &entry.lock().await.active {
                active.cancel.cancel();
            }
        }
    }
}
