//! Per-app generation scheduling, apply/remove runs and state monitors.
//!
//! Every desired-state push or undeploy request becomes a generation. Each
//! app has a single-slot watch cell holding its latest job and one worker
//! draining it, so a job that is replaced before it starts never runs and
//! a job in flight is cancelled between units. Apply runs are serialized
//! across all apps by one lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tether_deployment::{ApplyEngine, ApplyReport};
use tether_health::{ClusterReader, MonitorConfig, StateMonitor, StatusSink};
use tether_release::VersionSequencer;
use tether_task::{ActionableError, ActiveTask, TaskStatusTracker};
use tether_types::{
    AppId, AppInformersRequest, AppStatus, DeployOutcome, DeployResult, DeployableUnit,
    DesiredState, Generation, UndeployRequest, EVENT_APP_STATUS, EVENT_DEPLOY_RESULT,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::outbox::{ChannelStatusSink, Outbox};
use crate::upstream::{CurrentState, InstalledRelease, UpstreamClient};

/// Work forwarded from the event handlers.
#[derive(Debug, Clone)]
pub enum Command {
    Deploy(DesiredState),
    Undeploy(UndeployRequest),
    Informers(AppInformersRequest),
}

#[derive(Debug, Clone)]
enum JobAction {
    Deploy(Arc<DesiredState>),
    Undeploy(Arc<UndeployRequest>),
}

impl JobAction {
    fn app_id(&self) -> &AppId {
        match self {
            JobAction::Deploy(state) => &state.app_id,
            JobAction::Undeploy(request) => &request.app_id,
        }
    }

    fn sequence(&self) -> Option<u64> {
        match self {
            JobAction::Deploy(state) => state.sequence,
            JobAction::Undeploy(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Job {
    generation: Generation,
    action: JobAction,
    cancel: CancellationToken,
    claimed: Arc<AtomicBool>,
}

impl Job {
    /// First caller wins: either the worker runs the job or the submitter
    /// reports it superseded, never both.
    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    fn result(&self, outcome: DeployOutcome) -> DeployResult {
        DeployResult {
            app_id: self.action.app_id().clone(),
            generation: self.generation,
            sequence: self.action.sequence(),
            outcome,
            applied: Vec::new(),
            removed: Vec::new(),
            tolerated_failures: Vec::new(),
            finished_at: Utc::now(),
        }
    }
}

struct AppSlot {
    jobs: watch::Sender<Option<Job>>,
    worker: JoinHandle<()>,
}

struct AppMonitor {
    monitor: Arc<StateMonitor>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct InstalledApp {
    release: InstalledRelease,
    units: Vec<DeployableUnit>,
}

/// Task id under which an app's runs are tracked.
pub fn task_id(app_id: &AppId) -> String {
    format!("deploy/{}", app_id.as_str())
}

/// Owns generation numbering and everything that runs per app.
pub struct Reconciler {
    engine: ApplyEngine,
    reader: Arc<dyn ClusterReader>,
    tracker: TaskStatusTracker,
    outbox: Outbox,
    sink: Arc<dyn StatusSink>,
    upstream: Option<UpstreamClient>,
    sequencer: VersionSequencer,
    monitor_config: MonitorConfig,
    latest: AtomicU64,
    slots: DashMap<AppId, AppSlot>,
    monitors: DashMap<AppId, AppMonitor>,
    installed: DashMap<AppId, InstalledApp>,
    apply_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        engine: ApplyEngine,
        reader: Arc<dyn ClusterReader>,
        tracker: TaskStatusTracker,
        outbox: Outbox,
        upstream: Option<UpstreamClient>,
        sequencer: VersionSequencer,
        monitor_config: MonitorConfig,
    ) -> Self {
        let sink: Arc<dyn StatusSink> = Arc::new(ChannelStatusSink::new(outbox.clone()));
        Self {
            engine,
            reader,
            tracker,
            outbox,
            sink,
            upstream,
            sequencer,
            monitor_config,
            latest: AtomicU64::new(0),
            slots: DashMap::new(),
            monitors: DashMap::new(),
            installed: DashMap::new(),
            apply_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Most recently assigned generation.
    pub fn latest_generation(&self) -> Generation {
        Generation::new(self.latest.load(Ordering::SeqCst))
    }

    pub fn monitored_apps(&self) -> Vec<AppId> {
        let mut apps: Vec<AppId> = self.monitors.iter().map(|e| e.key().clone()).collect();
        apps.sort();
        apps
    }

    /// Apps with a generation worker.
    pub fn active_apps(&self) -> Vec<AppId> {
        let mut apps: Vec<AppId> = self.slots.iter().map(|e| e.key().clone()).collect();
        apps.sort();
        apps
    }

    pub fn installed_apps(&self) -> Vec<AppId> {
        let mut apps: Vec<AppId> = self.installed.iter().map(|e| e.key().clone()).collect();
        apps.sort();
        apps
    }

    pub async fn handle(self: &Arc<Self>, command: Command) {
        match command {
            Command::Deploy(state) => {
                self.submit(JobAction::Deploy(Arc::new(state))).await;
            }
            Command::Undeploy(request) => {
                self.submit(JobAction::Undeploy(Arc::new(request))).await;
            }
            Command::Informers(request) => self.replace_monitor(request).await,
        }
    }

    /// Queue a desired state as the app's newest generation.
    pub async fn submit_desired(self: &Arc<Self>, state: DesiredState) -> Generation {
        self.submit(JobAction::Deploy(Arc::new(state))).await
    }

    async fn submit(self: &Arc<Self>, action: JobAction) -> Generation {
        let generation = Generation::new(self.latest.fetch_add(1, Ordering::SeqCst) + 1);
        let app_id = action.app_id().clone();
        let job = Job {
            generation,
            action,
            cancel: self.shutdown.child_token(),
            claimed: Arc::new(AtomicBool::new(false)),
        };
        info!(%app_id, %generation, "Generation submitted");

        let previous = {
            let slot = self
                .slots
                .entry(app_id.clone())
                .or_insert_with(|| self.spawn_worker(app_id.clone()));
            slot.jobs.send_replace(Some(job))
        };

        if let Some(previous) = previous {
            previous.cancel.cancel();
            if previous.claim() {
                debug!(%app_id, generation = %previous.generation, "Replaced before start");
                self.report(&previous.result(DeployOutcome::Superseded)).await;
            }
        }

        generation
    }

    fn spawn_worker(self: &Arc<Self>, app_id: AppId) -> AppSlot {
        let (jobs, mut rx) = watch::channel(None::<Job>);
        let this = Arc::clone(self);

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = this.shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let job = rx.borrow_and_update().clone();
                if let Some(job) = job {
                    if job.claim() {
                        this.run_job(job).await;
                    }
                }
            }
            debug!(%app_id, "Generation worker stopped");
        });

        AppSlot { jobs, worker }
    }

    async fn run_job(&self, job: Job) {
        let app_id = job.action.app_id().clone();
        let is_undeploy = matches!(job.action, JobAction::Undeploy(_));

        let result = {
            let _serialized = self.apply_lock.lock().await;
            if job.cancel.is_cancelled() {
                job.result(DeployOutcome::Superseded)
            } else {
                match &job.action {
                    JobAction::Deploy(state) => self.deploy(&job, state).await,
                    JobAction::Undeploy(request) => self.undeploy(&job, request).await,
                }
            }
        };

        self.report(&result).await;

        if is_undeploy && result.is_success() {
            self.release_slot(&app_id, job.generation);
        }
    }

    /// Drop an app's slot unless a newer job is already queued on it. The
    /// worker exits once its sender is gone.
    fn release_slot(&self, app_id: &AppId, generation: Generation) {
        let released = self.slots.remove_if(app_id, |_, slot| {
            slot.jobs
                .borrow()
                .as_ref()
                .is_some_and(|queued| queued.generation == generation)
        });
        if released.is_some() {
            debug!(%app_id, %generation, "Generation worker released");
        }
    }

    /// Highest release sequence queued or installed for an app.
    fn newest_sequence(&self, app_id: &AppId) -> Option<u64> {
        let queued = self.slots.get(app_id).and_then(|slot| {
            slot.jobs
                .borrow()
                .as_ref()
                .and_then(|job| job.action.sequence())
        });
        let installed = self
            .installed
            .get(app_id)
            .and_then(|installed| installed.release.sequence);
        queued.max(installed)
    }

    async fn report(&self, result: &DeployResult) {
        match &result.outcome {
            DeployOutcome::Succeeded => info!(
                app_id = %result.app_id,
                generation = %result.generation,
                applied = result.applied.len(),
                removed = result.removed.len(),
                "Generation succeeded"
            ),
            DeployOutcome::Failed { unit, diagnostics } => warn!(
                app_id = %result.app_id,
                generation = %result.generation,
                %unit,
                %diagnostics,
                "Generation failed"
            ),
            DeployOutcome::Superseded => info!(
                app_id = %result.app_id,
                generation = %result.generation,
                "Generation superseded"
            ),
        }
        self.outbox.emit(EVENT_DEPLOY_RESULT, result).await;
    }

    #[instrument(skip_all, fields(app_id = %state.app_id, generation = %job.generation))]
    async fn deploy(&self, job: &Job, state: &DesiredState) -> DeployResult {
        let task = self
            .start_task(
                &state.app_id,
                &format!("Deploying generation {}", job.generation),
            )
            .await;

        let mut result = job.result(DeployOutcome::Succeeded);
        let mut outcome = None;

        let orphans = self.orphans_of(state);
        if !orphans.is_empty() {
            update_task(&task, &format!("Removing {} orphaned units", orphans.len())).await;
            let report = self.engine.remove(&orphans, &job.cancel).await;
            result.removed = report.completed.clone();
            collect_tolerated(&mut result, &report);
            outcome = outcome_of(&report);
        }

        if outcome.is_none() {
            update_task(&task, &format!("Applying {} units", state.units.len())).await;
            let report = self.engine.apply(&state.units, &job.cancel).await;
            result.applied = report.completed.clone();
            collect_tolerated(&mut result, &report);
            outcome = outcome_of(&report);
        }

        result.outcome = outcome.unwrap_or(DeployOutcome::Succeeded);
        self.finish_task(task, &result.outcome).await;

        if result.is_success() {
            self.installed.insert(
                state.app_id.clone(),
                InstalledApp {
                    release: InstalledRelease {
                        app_id: state.app_id.clone(),
                        namespace: state.namespace.clone(),
                        sequence: state.sequence,
                        generation: job.generation,
                        units: state.units.iter().map(|u| u.key().to_string()).collect(),
                        installed_at: Utc::now(),
                    },
                    units: state.units.clone(),
                },
            );
            self.post_current_state().await;
        }

        result.finished_at = Utc::now();
        result
    }

    #[instrument(skip_all, fields(app_id = %request.app_id, generation = %job.generation))]
    async fn undeploy(&self, job: &Job, request: &UndeployRequest) -> DeployResult {
        self.stop_monitor(&request.app_id).await;

        let units: Vec<DeployableUnit> = if request.units.is_empty() {
            self.installed
                .get(&request.app_id)
                .map(|installed| installed.units.clone())
                .unwrap_or_default()
        } else {
            request.units.clone()
        };
        let units: Vec<DeployableUnit> = units
            .into_iter()
            .filter(|unit| !unit.flags.keep_on_remove)
            .collect();

        let task = self
            .start_task(
                &request.app_id,
                &format!("Removing {} units of {}", units.len(), request.app_id),
            )
            .await;

        let report = self.engine.remove(&units, &job.cancel).await;
        let mut result = job.result(outcome_of(&report).unwrap_or(DeployOutcome::Succeeded));
        result.removed = report.completed.clone();
        collect_tolerated(&mut result, &report);

        self.finish_task(task, &result.outcome).await;

        if result.is_success() {
            self.installed.remove(&request.app_id);
            self.post_current_state().await;
        }

        result.finished_at = Utc::now();
        result
    }

    /// Units to remove before applying `state`.
    ///
    /// The previous unit set comes with the push; when it is absent the
    /// locally recorded installation stands in for it.
    fn orphans_of(&self, state: &DesiredState) -> Vec<DeployableUnit> {
        if !state.previous_units.is_empty() {
            return state.orphaned_units();
        }

        let Some(installed) = self.installed.get(&state.app_id) else {
            return Vec::new();
        };
        let current: HashSet<_> = state.units.iter().map(DeployableUnit::key).collect();
        installed
            .units
            .iter()
            .filter(|unit| !unit.flags.keep_on_remove)
            .filter(|unit| !current.contains(&unit.key()))
            .cloned()
            .collect()
    }

    async fn start_task(&self, app_id: &AppId, message: &str) -> Option<ActiveTask> {
        match self.tracker.start(&task_id(app_id), message).await {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(%app_id, error = %e, "Failed to record task start");
                None
            }
        }
    }

    async fn finish_task(&self, task: Option<ActiveTask>, outcome: &DeployOutcome) {
        let Some(task) = task else {
            return;
        };
        let id = task.id().to_string();

        let finished = match outcome {
            DeployOutcome::Failed { unit, diagnostics } => {
                let error = ActionableError::new(format!("{} failed: {}", unit, diagnostics));
                task.fail(&error).await
            }
            DeployOutcome::Succeeded | DeployOutcome::Superseded => task.succeed().await,
        };
        if let Err(e) = finished {
            warn!(task = %id, error = %e, "Failed to record task completion");
        }
    }

    /// Post the installed releases upstream, if a REST client is configured.
    pub async fn post_current_state(&self) {
        let Some(upstream) = &self.upstream else {
            return;
        };

        let mut releases: Vec<InstalledRelease> = self
            .installed
            .iter()
            .map(|entry| entry.release.clone())
            .collect();
        releases.sort_by(|a, b| a.app_id.cmp(&b.app_id));

        let current = CurrentState {
            releases,
            reported_at: Utc::now(),
        };
        if let Err(e) = upstream.post_current_state(&current).await {
            warn!(error = %e, "Failed to post current state");
        }
    }

    /// Fetch the full desired state and submit one generation per app.
    pub async fn resync(self: &Arc<Self>) {
        let Some(upstream) = &self.upstream else {
            return;
        };

        match upstream.get_desired_state().await {
            Ok(response) => {
                let states = response.resolve(&self.sequencer);
                info!(apps = states.len(), "Resyncing desired state");
                for state in states {
                    let newest = self.newest_sequence(&state.app_id);
                    if let (Some(offered), Some(newest)) = (state.sequence, newest) {
                        if offered < newest {
                            info!(
                                app_id = %state.app_id,
                                offered,
                                newest,
                                "Skipping release older than the one already held"
                            );
                            continue;
                        }
                    }
                    self.submit_desired(state).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to fetch desired state"),
        }
    }

    #[instrument(skip_all, fields(app_id = %request.app_id))]
    async fn replace_monitor(&self, request: AppInformersRequest) {
        let (informers, rejected) = request.parse_informers();
        for (raw, reason) in &rejected {
            warn!(informer = %raw, %reason, "Skipping invalid informer");
        }

        self.stop_monitor(&request.app_id).await;
        if informers.is_empty() {
            info!("No informers, monitor removed");
            return;
        }

        let monitor = Arc::new(StateMonitor::new(
            request.app_id.clone(),
            request.namespace.clone(),
            informers,
            Arc::clone(&self.reader),
            Arc::clone(&self.sink),
            self.monitor_config,
        ));
        let cancel = self.shutdown.child_token();
        let handle = Arc::clone(&monitor).spawn(cancel.clone());

        self.monitors.insert(
            request.app_id,
            AppMonitor {
                monitor,
                cancel,
                handle,
            },
        );
    }

    async fn stop_monitor(&self, app_id: &AppId) {
        if let Some((_, running)) = self.monitors.remove(app_id) {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!(%app_id, error = %e, "Monitor task ended abnormally");
            }
        }
    }

    /// Last known status of every monitored app.
    pub async fn last_statuses(&self) -> Vec<AppStatus> {
        let monitors: Vec<Arc<StateMonitor>> = self
            .monitors
            .iter()
            .map(|entry| Arc::clone(&entry.monitor))
            .collect();

        let mut statuses = Vec::with_capacity(monitors.len());
        for monitor in monitors {
            if let Some(status) = monitor.last_status().await {
                statuses.push(status);
            }
        }
        statuses.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        statuses
    }

    /// Re-emit every known status on a fresh session.
    pub async fn resend_statuses(&self) {
        for status in self.last_statuses().await {
            self.outbox.emit(EVENT_APP_STATUS, &status).await;
        }
    }

    /// Stop workers and monitors. A run in progress finishes its current
    /// unit and reports itself superseded.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let apps: Vec<AppId> = self.monitors.iter().map(|e| e.key().clone()).collect();
        for app_id in apps {
            self.stop_monitor(&app_id).await;
        }

        let apps: Vec<AppId> = self.slots.iter().map(|e| e.key().clone()).collect();
        for app_id in apps {
            if let Some((_, slot)) = self.slots.remove(&app_id) {
                drop(slot.jobs);
                if let Err(e) = slot.worker.await {
                    warn!(%app_id, error = %e, "Generation worker ended abnormally");
                }
            }
        }
    }
}

fn outcome_of(report: &ApplyReport) -> Option<DeployOutcome> {
    if report.cancelled {
        return Some(DeployOutcome::Superseded);
    }
    report.first_failure().map(|failure| DeployOutcome::Failed {
        unit: failure.unit.clone(),
        diagnostics: failure.diagnostics.clone(),
    })
}

fn collect_tolerated(result: &mut DeployResult, report: &ApplyReport) {
    result
        .tolerated_failures
        .extend(report.tolerated.iter().map(|f| f.to_string()));
}

async fn update_task(task: &Option<ActiveTask>, message: &str) {
    if let Some(task) = task {
        if let Err(e) = task.update(message).await {
            debug!(task = task.id(), error = %e, "Failed to update task message");
        }
    }
}
