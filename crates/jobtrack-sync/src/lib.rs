//! Run pipeline: reconcile raw listings against prior state, export snapshots,
//! notify, persist state. Every entry point that starts a run goes through the
//! shared on-disk run lock.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use jobtrack_adapters::{contact_text, extract_contacts, load_raw_jobs, parse_closing_date};
use jobtrack_core::{
    ApplyMethod, ClosingWindow, JobRecord, LockRecord, RawJob, RunState, SOURCE_TAG,
};
use jobtrack_storage::{
    load_state, save_state, write_atomic, DataDir, LockAttempt, RunLock, RunLockGuard,
};
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod export;
pub mod notify;

pub use export::{build_summary, render_csv, render_json, summary_headline, CSV_COLUMNS};
pub use notify::{
    DeliveryOutcome, DeliveryReport, EmailConfig, EmailNotifier, LocalNotifier, Notification,
    NotificationChannel, NotificationDispatcher, NotifyError,
};

pub const CRATE_NAME: &str = "jobtrack-sync";

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    pub input_path: PathBuf,
    pub scraper_command: Option<String>,
    pub parquet_export: bool,
    pub local_notify: bool,
    pub email: Option<EmailConfig>,
}

impl TrackerConfig {
    /// Defaults for a data directory with every notification channel off.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            input_path: DataDir::new(&data_dir).raw_input(),
            data_dir,
            scraper_command: None,
            parquet_export: false,
            local_notify: false,
            email: None,
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("JOBTRACK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let mut config = Self::for_data_dir(data_dir);
        if let Ok(input) = std::env::var("JOBTRACK_INPUT") {
            config.input_path = PathBuf::from(input);
        }
        config.scraper_command = std::env::var("JOBTRACK_SCRAPER_CMD")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());
        config.parquet_export = env_flag("JOBTRACK_PARQUET_EXPORT", false);
        config.local_notify = std::env::var("JOBTRACK_LOCAL_NOTIFY")
            .map(|v| v.trim() != "0")
            .unwrap_or(true);
        config.email = EmailConfig::from_env();
        config
    }

    pub fn data(&self) -> DataDir {
        DataDir::new(&self.data_dir)
    }

    /// Channels this config enables. Unconfigured channels are simply absent.
    pub fn dispatcher(&self) -> NotificationDispatcher {
        let mut dispatcher = NotificationDispatcher::new();
        if self.local_notify {
            if let Some(local) = LocalNotifier::detect() {
                dispatcher = dispatcher.with_channel(local);
            }
        }
        if let Some(email) = &self.email {
            dispatcher = dispatcher.with_channel(EmailNotifier::new(email.clone()));
        }
        dispatcher
    }
}

/// Normalize one raw listing. `is_new` is left for the reconciler to decide.
pub fn normalize_job(raw: &RawJob, url: String, today: NaiveDate) -> JobRecord {
    let contacts = extract_contacts(&contact_text(raw));
    let apply_url = raw.trimmed("apply_url");
    let apply_method = ApplyMethod::derive(apply_url.as_deref(), &contacts.emails);

    let closing_text = raw
        .trimmed("closing_date")
        .or_else(|| raw.trimmed("closing_date_raw"));
    let closing_date = closing_text
        .as_deref()
        .and_then(|text| parse_closing_date(text, today));
    // Keep unparseable text visible so the value is not silently lost.
    let closing_date_raw = match (raw.trimmed("closing_date_raw"), closing_date) {
        (Some(raw_text), _) => Some(raw_text),
        (None, None) => closing_text,
        (None, Some(_)) => None,
    };

    JobRecord {
        url,
        title: raw.text("title").trim().to_string(),
        company: raw.text("company").trim().to_string(),
        location: raw.text("location").trim().to_string(),
        closing_date,
        closing_date_raw,
        apply_url,
        apply_method,
        emails: contacts.emails,
        phones: contacts.phones,
        source: SOURCE_TAG.to_string(),
        description: raw.text("description"),
        details: raw.text("details"),
        is_new: false,
        extra: raw.extra_fields(),
    }
}

/// Single ordered pass: drop blank and repeated URLs, drop expired listings,
/// flag listings whose URL is absent from `seen`.
pub fn reconcile(raw_jobs: &[RawJob], seen: &HashSet<String>, today: NaiveDate) -> Vec<JobRecord> {
    let mut emitted = HashSet::new();
    let mut jobs = Vec::new();
    for raw in raw_jobs {
        let Some(url) = raw.url() else {
            continue;
        };
        if !emitted.insert(url.clone()) {
            continue;
        }
        let mut job = normalize_job(raw, url, today);
        if job.closing_window(today) == ClosingWindow::Expired {
            continue;
        }
        job.is_new = !seen.contains(&job.url);
        jobs.push(job);
    }
    jobs
}

#[derive(Debug, Default)]
pub struct ExpiryBuckets<'a> {
    pub closing_today: Vec<&'a JobRecord>,
    pub closing_soon: Vec<&'a JobRecord>,
}

pub fn expiry_buckets(jobs: &[JobRecord], today: NaiveDate) -> ExpiryBuckets<'_> {
    let mut buckets = ExpiryBuckets::default();
    for job in jobs {
        match job.closing_window(today) {
            ClosingWindow::Today => buckets.closing_today.push(job),
            ClosingWindow::Soon => buckets.closing_soon.push(job),
            _ => {}
        }
    }
    buckets
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_ts: String,
    pub raw_jobs: usize,
    pub jobs: usize,
    pub new_jobs: usize,
    pub closing_today: usize,
    pub closing_soon: usize,
    pub parquet_manifest: Option<String>,
    pub deliveries: Vec<DeliveryReport>,
}

pub struct TrackerPipeline {
    config: TrackerConfig,
    data: DataDir,
    dispatcher: NotificationDispatcher,
}

impl TrackerPipeline {
    pub fn new(config: TrackerConfig) -> Self {
        let dispatcher = config.dispatcher();
        Self::with_dispatcher(config, dispatcher)
    }

    pub fn with_dispatcher(config: TrackerConfig, dispatcher: NotificationDispatcher) -> Self {
        Self {
            data: config.data(),
            config,
            dispatcher,
        }
    }

    /// One full pass. Nothing is written unless the raw input exists, and state
    /// is persisted only after both snapshots and the summary are on disk.
    pub async fn run_once(&self, now: NaiveDateTime) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let today = now.date();
        let run_ts = now.format("%Y-%m-%dT%H:%M:%S").to_string();

        self.data.ensure().await?;
        let raw_jobs = load_raw_jobs(&self.config.input_path)
            .context("raw scraper output unavailable; leaving previous state untouched")?;
        let state = load_state(&self.data.state()).await;

        let jobs = reconcile(&raw_jobs, &state.seen_set(), today);
        let new_jobs: Vec<&JobRecord> = jobs.iter().filter(|j| j.is_new).collect();
        let buckets = expiry_buckets(&jobs, today);
        info!(
            %run_id,
            raw = raw_jobs.len(),
            kept = jobs.len(),
            new = new_jobs.len(),
            closing_today = buckets.closing_today.len(),
            closing_soon = buckets.closing_soon.len(),
            "reconciled listings"
        );

        write_atomic(&self.data.json_snapshot(), &render_json(&jobs)?).await?;
        write_atomic(&self.data.csv_snapshot(), &render_csv(&jobs)?).await?;
        let parquet_manifest = if self.config.parquet_export {
            let manifest = export::export_parquet_snapshot(&self.data.snapshots_dir(), &jobs)?;
            Some(manifest.display().to_string())
        } else {
            None
        };

        let summary = build_summary(
            &run_ts,
            &new_jobs,
            &buckets.closing_today,
            &buckets.closing_soon,
        );
        write_atomic(&self.data.summary(), summary.as_bytes()).await?;

        let notification = Notification {
            subject: "Jobs tracker summary".to_string(),
            headline: summary_headline(
                new_jobs.len(),
                buckets.closing_today.len(),
                buckets.closing_soon.len(),
            ),
            body: summary,
        };
        let deliveries = self.dispatcher.dispatch(&notification).await;

        save_state(&self.data.state(), &RunState::after_run(&jobs, run_ts.clone())).await?;

        Ok(RunReport {
            run_id,
            run_ts,
            raw_jobs: raw_jobs.len(),
            jobs: jobs.len(),
            new_jobs: new_jobs.len(),
            closing_today: buckets.closing_today.len(),
            closing_soon: buckets.closing_soon.len(),
            parquet_manifest,
            deliveries,
        })
    }
}

/// Run the external scraper in the data directory; any failure aborts the run.
pub async fn run_scraper(command: &str, data: &DataDir) -> Result<()> {
    info!(command, "running scraper");
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(data.root())
        .status()
        .await
        .with_context(|| format!("spawning scraper `{command}`"))?;
    if !status.success() {
        bail!("scraper `{command}` exited with {status}");
    }
    Ok(())
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Another live process holds the lock. `None` when its record was unreadable.
    AlreadyRunning(Option<LockRecord>),
}

/// Scraper + pipeline while holding `guard`. The lock is released when this returns or unwinds.
pub async fn run_with_lock(config: TrackerConfig, guard: RunLockGuard) -> Result<RunReport> {
    let span = info_span!("run", pid = guard.record().pid);
    async move {
        let _guard = guard;
        if let Some(command) = &config.scraper_command {
            run_scraper(command, &config.data()).await?;
        }
        let report = TrackerPipeline::new(config)
            .run_once(Local::now().naive_local())
            .await?;
        info!(run_id = %report.run_id, jobs = report.jobs, new = report.new_jobs, "run complete");
        Ok::<_, anyhow::Error>(report)
    }
    .instrument(span)
    .await
}

/// Lock acquisition blocks on file I/O and the guard file's advisory lock, so it
/// runs off the async workers.
pub async fn acquire_run_lock(lock: RunLock) -> Result<LockAttempt> {
    let attempt = tokio::task::spawn_blocking(move || lock.try_acquire())
        .await
        .context("run lock task failed")??;
    Ok(attempt)
}

/// Acquire the run lock and execute; a live holder yields `AlreadyRunning`.
pub async fn run_guarded(config: TrackerConfig) -> Result<RunOutcome> {
    config.data().ensure().await?;
    match acquire_run_lock(config.data().run_lock()).await? {
        LockAttempt::Acquired(guard) => {
            Ok(RunOutcome::Completed(run_with_lock(config, guard).await?))
        }
        LockAttempt::Busy(holder) => {
            warn!(holder = ?holder, "run already in progress");
            Ok(RunOutcome::AlreadyRunning(holder))
        }
    }
}

pub async fn run_guarded_from_env() -> Result<RunOutcome> {
    run_guarded(TrackerConfig::from_env()).await
}
