//! Persisted cron schedules and their live triggers.
//!
//! Every enabled job has exactly one trigger installed in the
//! [`JobScheduler`]. The job map, the trigger map and the schedule file are
//! only touched while holding the engine's single async mutex.

use crate::backend;
use crate::config::ConfigLoader;
use crate::snapshot::{parse_timezone, Trigger};
use crate::utils::errors::{Result, TimeMachineError};
use crate::writer::{SnapshotWriter, WriteReport};
use chrono_tz::Tz;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleJob {
    /// Key in the persisted document
    #[serde(skip)]
    pub id: String,

    pub cron_expression: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(rename = "liveConfigPath", default)]
    pub source_path: Option<PathBuf>,

    #[serde(rename = "backupFolderPath", default)]
    pub destination_path: Option<PathBuf>,

    #[serde(rename = "maxBackupsEnabled", default)]
    pub retention_enabled: bool,

    #[serde(rename = "maxBackupsCount", default = "default_retention_count")]
    pub retention_count: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_retention_count() -> usize {
    100
}

impl ScheduleJob {
    pub fn new(id: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cron_expression: cron_expression.into(),
            enabled: true,
            timezone: None,
            source_path: None,
            destination_path: None,
            retention_enabled: false,
            retention_count: default_retention_count(),
        }
    }

    pub fn retention(&self) -> Option<usize> {
        self.retention_enabled.then_some(self.retention_count)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleDocument {
    #[serde(default)]
    jobs: BTreeMap<String, ScheduleJob>,
}

/// The `{ "jobs": { ... } }` document on disk.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable documents load as empty.
    pub fn load(&self) -> BTreeMap<String, ScheduleJob> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to read schedule file");
                }
                return BTreeMap::new();
            }
        };

        match serde_json::from_str::<ScheduleDocument>(&content) {
            Ok(doc) => doc
                .jobs
                .into_iter()
                .map(|(id, mut job)| {
                    job.id = id.clone();
                    (id, job)
                })
                .collect(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unparsable schedule file");
                BTreeMap::new()
            }
        }
    }

    /// Rewrite the whole document.
    pub fn save(&self, jobs: &BTreeMap<String, ScheduleJob>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let doc = ScheduleDocument { jobs: jobs.clone() };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Called on every firing with the job that fired.
pub type TriggerFn = Arc<dyn Fn(ScheduleJob) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Accept 5-field cron by prepending a seconds field.
pub fn normalize_expression(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(TimeMachineError::InvalidSchedule {
            expression: expression.to_string(),
            reason: format!("expected 5 or 6 fields, got {n}"),
        }),
    }
}

/// Validate expression and timezone without installing anything.
pub fn validate(job: &ScheduleJob) -> Result<(String, Option<Tz>)> {
    if job.id.trim().is_empty() {
        return Err(TimeMachineError::InvalidInput("schedule id is empty".into()));
    }
    let expression = normalize_expression(&job.cron_expression)?;
    let tz = match job.timezone.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(name) => Some(parse_timezone(name).map_err(|_| TimeMachineError::InvalidSchedule {
            expression: job.cron_expression.clone(),
            reason: format!("unknown timezone {name}"),
        })?),
        None => None,
    };
    build_job(&expression, tz, |_, _| Box::pin(async {})).map_err(|e| {
        TimeMachineError::InvalidSchedule {
            expression: job.cron_expression.clone(),
            reason: e.to_string(),
        }
    })?;
    Ok((expression, tz))
}

fn build_job<F>(
    expression: &str,
    tz: Option<Tz>,
    run: F,
) -> std::result::Result<Job, tokio_cron_scheduler::JobSchedulerError>
where
    F: FnMut(Uuid, JobScheduler) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        + Send
        + Sync
        + 'static,
{
    match tz {
        Some(tz) => Job::new_async_tz(expression, tz, run),
        None => Job::new_async_tz(expression, chrono::Local, run),
    }
}

struct EngineState {
    scheduler: JobScheduler,
    jobs: BTreeMap<String, ScheduleJob>,
    triggers: HashMap<String, Uuid>,
}

pub struct ScheduleEngine {
    state: Mutex<EngineState>,
    store: ScheduleStore,
    on_fire: TriggerFn,
}

impl ScheduleEngine {
    pub async fn new(store: ScheduleStore, on_fire: TriggerFn) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| TimeMachineError::Scheduler(e.to_string()))?;
        Ok(Self {
            state: Mutex::new(EngineState {
                scheduler,
                jobs: BTreeMap::new(),
                triggers: HashMap::new(),
            }),
            store,
            on_fire,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.state
            .lock()
            .await
            .scheduler
            .start()
            .await
            .map_err(|e| TimeMachineError::Scheduler(e.to_string()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.triggers.clear();
        state
            .scheduler
            .shutdown()
            .await
            .map_err(|e| TimeMachineError::Scheduler(e.to_string()))
    }

    /// Replace every live trigger with one per persisted enabled job.
    ///
    /// Invalid jobs are logged and skipped.
    pub async fn load_all(&self) -> Result<usize> {
        let jobs = self.store.load();
        let mut state = self.state.lock().await;

        let live: Vec<String> = state.triggers.keys().cloned().collect();
        for id in live {
            self.cancel(&mut state, &id).await;
        }

        let mut installed = 0;
        for job in jobs.values() {
            if !job.enabled {
                continue;
            }
            match validate(job) {
                Ok((expression, tz)) => {
                    self.install(&mut state, job, &expression, tz).await?;
                    installed += 1;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, cron = %job.cron_expression, error = %e, "Failed to schedule job");
                }
            }
        }
        state.jobs = jobs;

        tracing::info!(count = installed, "Cron schedules initialized");
        Ok(installed)
    }

    /// Persist `job` and replace any live trigger for its id.
    pub async fn upsert(&self, job: ScheduleJob) -> Result<()> {
        let (expression, tz) = validate(&job)?;
        let mut state = self.state.lock().await;

        let mut jobs = state.jobs.clone();
        jobs.insert(job.id.clone(), job.clone());
        self.store.save(&jobs)?;
        state.jobs = jobs;

        self.cancel(&mut state, &job.id).await;
        if job.enabled {
            self.install(&mut state, &job, &expression, tz).await?;
        }

        tracing::info!(job_id = %job.id, cron = %expression, enabled = job.enabled, "Schedule saved");
        Ok(())
    }

    /// Delete a job and cancel its trigger. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let mut jobs = state.jobs.clone();
        let existed = jobs.remove(id).is_some();
        if existed {
            self.store.save(&jobs)?;
            state.jobs = jobs;
        }
        self.cancel(&mut state, id).await;
        Ok(existed)
    }

    pub async fn jobs(&self) -> Vec<ScheduleJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    /// Number of triggers currently installed.
    pub async fn active_triggers(&self) -> usize {
        self.state.lock().await.triggers.len()
    }

    async fn cancel(&self, state: &mut EngineState, id: &str) {
        if let Some(uuid) = state.triggers.remove(id) {
            if let Err(e) = state.scheduler.remove(&uuid).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to cancel trigger");
            }
        }
    }

    async fn install(
        &self,
        state: &mut EngineState,
        job: &ScheduleJob,
        expression: &str,
        tz: Option<Tz>,
    ) -> Result<()> {
        let on_fire = self.on_fire.clone();
        let fired = job.clone();
        let cron_job = build_job(expression, tz, move |_uuid, _lock| {
            let on_fire = on_fire.clone();
            let job = fired.clone();
            Box::pin(async move {
                tracing::info!(job_id = %job.id, "Starting scheduled backup");
                if let Err(e) = on_fire(job.clone()).await {
                    tracing::error!(job_id = %job.id, error = %e, "Scheduled backup failed");
                }
            })
        })
        .map_err(|e| TimeMachineError::InvalidSchedule {
            expression: job.cron_expression.clone(),
            reason: e.to_string(),
        })?;

        let uuid = state
            .scheduler
            .add(cron_job)
            .await
            .map_err(|e| TimeMachineError::Scheduler(e.to_string()))?;
        state.triggers.insert(job.id.clone(), uuid);
        Ok(())
    }
}

/// Run one scheduled snapshot with a fresh settings snapshot.
pub async fn run_scheduled(loader: &ConfigLoader, job: &ScheduleJob) -> Result<WriteReport> {
    let settings = loader.load()?;
    let source = job
        .source_path
        .clone()
        .unwrap_or_else(|| settings.backup.live_config_path.clone());
    let destination = job
        .destination_path
        .clone()
        .unwrap_or_else(|| settings.backup.backup_folder_path.clone());
    let writer = SnapshotWriter::from_settings(&settings).with_retention(job.retention());
    let mode = settings.backup.mode;
    let timezone = job.timezone.clone();

    tokio::task::spawn_blocking(move || {
        let backend = backend::open(mode, destination);
        writer.write(backend.as_ref(), &source, Trigger::Scheduled, timezone)
    })
    .await
    .map_err(|e| TimeMachineError::Task(e.to_string()))?
}

/// Default firing behaviour: snapshot the job's source into its destination.
pub fn snapshot_trigger(loader: ConfigLoader) -> TriggerFn {
    Arc::new(move |job: ScheduleJob| -> BoxFuture<'static, Result<()>> {
        let loader = loader.clone();
        Box::pin(async move {
            let report = run_scheduled(&loader, &job).await?;
            tracing::info!(
                job_id = %job.id,
                copied = report.copied,
                failed = report.failed,
                pruned = report.pruned.len(),
                "Scheduled backup finished"
            );
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn recording_trigger() -> (TriggerFn, Arc<std::sync::Mutex<Vec<String>>>) {
        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = fired.clone();
        let trigger: TriggerFn = Arc::new(move |job: ScheduleJob| -> BoxFuture<'static, Result<()>> {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(job.cron_expression);
                Ok(())
            })
        });
        (trigger, fired)
    }

    #[test]
    fn test_normalize_expression() {
        assert_eq!(normalize_expression("0 3 * * *").unwrap(), "0 0 3 * * *");
        assert_eq!(normalize_expression("*/5 * * * * *").unwrap(), "*/5 * * * * *");
        assert!(normalize_expression("* *").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let job = ScheduleJob::new("nightly", "61 * * * *");
        assert!(matches!(validate(&job), Err(TimeMachineError::InvalidSchedule { .. })));

        let mut job = ScheduleJob::new("nightly", "0 3 * * *");
        job.timezone = Some("Atlantis/Capital".into());
        assert!(matches!(validate(&job), Err(TimeMachineError::InvalidSchedule { .. })));

        job.timezone = Some("Europe/Berlin".into());
        assert!(validate(&job).is_ok());
    }

    #[test]
    fn test_store_document_shape() {
        let tmp = TempDir::new().unwrap();
        let store = ScheduleStore::new(tmp.path().join("data/scheduled-jobs.json"));
        assert!(store.load().is_empty());

        let mut job = ScheduleJob::new("nightly", "0 3 * * *");
        job.retention_enabled = true;
        job.retention_count = 7;
        let jobs = BTreeMap::from([(job.id.clone(), job.clone())]);
        store.save(&jobs).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["jobs"]["nightly"]["cronExpression"], "0 3 * * *");
        assert_eq!(raw["jobs"]["nightly"]["maxBackupsCount"], 7);
        assert_eq!(raw["jobs"]["nightly"]["maxBackupsEnabled"], true);

        assert_eq!(store.load().get("nightly"), Some(&job));
    }

    #[test]
    fn test_unparsable_store_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scheduled-jobs.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(ScheduleStore::new(path).load().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_upsert_persists_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = ScheduleStore::new(tmp.path().join("scheduled-jobs.json"));
        let (trigger, _) = recording_trigger();
        let engine = ScheduleEngine::new(store.clone(), trigger).await.unwrap();

        let err = engine
            .upsert(ScheduleJob::new("bad", "not a cron"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::InvalidInput);
        assert!(!store.path().exists());
        assert_eq!(engine.active_triggers().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upsert_replaces_trigger() {
        let tmp = TempDir::new().unwrap();
        let store = ScheduleStore::new(tmp.path().join("scheduled-jobs.json"));
        let (trigger, fired) = recording_trigger();
        let engine = ScheduleEngine::new(store.clone(), trigger).await.unwrap();
        engine.start().await.unwrap();

        engine
            .upsert(ScheduleJob::new("job", "0 0 0 1 1 *"))
            .await
            .unwrap();
        engine
            .upsert(ScheduleJob::new("job", "* * * * * *"))
            .await
            .unwrap();
        assert_eq!(engine.active_triggers().await, 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;

        let fired = fired.lock().unwrap().clone();
        assert!(!fired.is_empty());
        assert!(fired.iter().all(|expr| expr == "* * * * * *"));
        assert_eq!(store.load()["job"].cron_expression, "* * * * * *");

        assert!(engine.remove("job").await.unwrap());
        assert_eq!(engine.active_triggers().await, 0);
        assert!(store.load().is_empty());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_leaves_no_orphaned_trigger() {
        let tmp = TempDir::new().unwrap();
        let store = ScheduleStore::new(tmp.path().join("scheduled-jobs.json"));
        let job = ScheduleJob::new("job", "* * * * * *");
        store.save(&BTreeMap::from([(job.id.clone(), job)])).unwrap();

        let (trigger, fired) = recording_trigger();
        let engine = ScheduleEngine::new(store.clone(), trigger).await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.load_all().await.unwrap(), 1);
        assert_eq!(engine.load_all().await.unwrap(), 1);
        assert_eq!(engine.active_triggers().await, 1);

        assert!(engine.remove("job").await.unwrap());
        // let a firing that was already running finish
        tokio::time::sleep(Duration::from_millis(300)).await;
        fired.lock().unwrap().clear();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(fired.lock().unwrap().is_empty());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_cancels_jobs_missing_from_file() {
        let tmp = TempDir::new().unwrap();
        let store = ScheduleStore::new(tmp.path().join("scheduled-jobs.json"));
        let (trigger, _) = recording_trigger();
        let engine = ScheduleEngine::new(store.clone(), trigger).await.unwrap();

        engine.upsert(ScheduleJob::new("job", "0 3 * * *")).await.unwrap();
        assert_eq!(engine.active_triggers().await, 1);

        store.save(&BTreeMap::new()).unwrap();
        assert_eq!(engine.load_all().await.unwrap(), 0);
        assert_eq!(engine.active_triggers().await, 0);
        assert!(engine.jobs().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disabled_job_is_persisted_without_trigger() {
        let tmp = TempDir::new().unwrap();
        let store = ScheduleStore::new(tmp.path().join("scheduled-jobs.json"));
        let (trigger, _) = recording_trigger();
        let engine = ScheduleEngine::new(store.clone(), trigger).await.unwrap();

        let mut job = ScheduleJob::new("paused", "0 3 * * *");
        job.enabled = false;
        engine.upsert(job).await.unwrap();

        assert_eq!(engine.active_triggers().await, 0);
        assert_eq!(engine.jobs().await.len(), 1);

        let (trigger, _) = recording_trigger();
        let reloaded = ScheduleEngine::new(store, trigger).await.unwrap();
        assert_eq!(reloaded.load_all().await.unwrap(), 0);
        assert_eq!(reloaded.jobs().await[0].id, "paused");
    }
}
