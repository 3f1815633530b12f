//! Snapshot writers (JSON, CSV, optional Parquet) and the human summary.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use jobtrack_core::JobRecord;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const CSV_COLUMNS: [&str; 14] = [
    "url",
    "title",
    "company",
    "location",
    "closing_date",
    "closing_date_raw",
    "apply_url",
    "apply_method",
    "emails",
    "phones",
    "source",
    "description",
    "details",
    "is_new",
];

pub const LIST_DELIMITER: &str = "; ";

pub fn render_json(jobs: &[JobRecord]) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(jobs).context("serializing job snapshot")
}

/// One CSV row in [`CSV_COLUMNS`] order; absent values are empty cells.
pub fn csv_row(job: &JobRecord) -> [String; 14] {
    [
        job.url.clone(),
        job.title.clone(),
        job.company.clone(),
        job.location.clone(),
        job.closing_date.map(|d| d.to_string()).unwrap_or_default(),
        job.closing_date_raw.clone().unwrap_or_default(),
        job.apply_url.clone().unwrap_or_default(),
        job.apply_method.as_str().to_string(),
        job.emails.join(LIST_DELIMITER),
        job.phones.join(LIST_DELIMITER),
        job.source.clone(),
        job.description.clone(),
        job.details.clone(),
        job.is_new.to_string(),
    ]
}

pub fn render_csv(jobs: &[JobRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CSV_COLUMNS)
        .context("writing csv header")?;
    for job in jobs {
        writer
            .write_record(csv_row(job))
            .with_context(|| format!("writing csv row for {}", job.url))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv snapshot: {}", err.error()))
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn nullable(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn utf8_column(jobs: &[JobRecord], value: impl Fn(&JobRecord) -> Option<String>) -> ArrayRef {
    Arc::new(StringArray::from(jobs.iter().map(value).collect::<Vec<_>>()))
}

/// Same columns as the CSV, with optional fields kept as nulls.
pub fn jobs_record_batch(jobs: &[JobRecord]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, false),
        ArrowField::new("closing_date", DataType::Utf8, true),
        ArrowField::new("closing_date_raw", DataType::Utf8, true),
        ArrowField::new("apply_url", DataType::Utf8, true),
        ArrowField::new("apply_method", DataType::Utf8, false),
        ArrowField::new("emails", DataType::Utf8, false),
        ArrowField::new("phones", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, false),
        ArrowField::new("details", DataType::Utf8, false),
        ArrowField::new("is_new", DataType::Boolean, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        utf8_column(jobs, |j| Some(j.url.clone())),
        utf8_column(jobs, |j| Some(j.title.clone())),
        utf8_column(jobs, |j| Some(j.company.clone())),
        utf8_column(jobs, |j| Some(j.location.clone())),
        utf8_column(jobs, |j| j.closing_date.map(|d| d.to_string())),
        utf8_column(jobs, |j| nullable(j.closing_date_raw.as_deref())),
        utf8_column(jobs, |j| nullable(j.apply_url.as_deref())),
        utf8_column(jobs, |j| Some(j.apply_method.as_str().to_string())),
        utf8_column(jobs, |j| Some(j.emails.join(LIST_DELIMITER))),
        utf8_column(jobs, |j| Some(j.phones.join(LIST_DELIMITER))),
        utf8_column(jobs, |j| Some(j.source.clone())),
        utf8_column(jobs, |j| Some(j.description.clone())),
        utf8_column(jobs, |j| Some(j.details.clone())),
        Arc::new(BooleanArray::from(jobs.iter().map(|j| j.is_new).collect::<Vec<_>>())),
    ];

    RecordBatch::try_new(schema, columns).context("building jobs record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Write `jobs.parquet` plus a sha256 manifest into `snapshot_dir`; returns the manifest path.
pub fn export_parquet_snapshot(snapshot_dir: &Path, jobs: &[JobRecord]) -> Result<PathBuf> {
    std::fs::create_dir_all(snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let jobs_path = snapshot_dir.join("jobs.parquet");
    write_parquet(&jobs_path, jobs_record_batch(jobs)?)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("jobs", snapshot_dir, &jobs_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn push_listing(lines: &mut Vec<String>, heading: String, jobs: &[&JobRecord]) {
    lines.push(heading);
    for job in jobs {
        lines.push(format!("- {} | {}", job.display_title(), job.url));
    }
    lines.push(String::new());
}

pub fn build_summary(
    run_ts: &str,
    new_jobs: &[&JobRecord],
    closing_today: &[&JobRecord],
    closing_soon: &[&JobRecord],
) -> String {
    let mut lines = vec![
        "Jobs tracker summary".to_string(),
        format!("Run: {run_ts}"),
        String::new(),
    ];
    push_listing(&mut lines, format!("New jobs: {}", new_jobs.len()), new_jobs);
    push_listing(
        &mut lines,
        format!("Expiring today: {}", closing_today.len()),
        closing_today,
    );
    push_listing(
        &mut lines,
        format!("Expiring soon (1-2 days): {}", closing_soon.len()),
        closing_soon,
    );
    lines.join("\n")
}

/// One-line form for channels with little room.
pub fn summary_headline(new: usize, closing_today: usize, closing_soon: usize) -> String {
    format!("New: {new} | Expiring today: {closing_today} | Expiring soon: {closing_soon}")
}
