//! Readers for the loosely structured scraper output: raw input, contacts, closing dates.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use jobtrack_core::RawJob;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub mod contacts;
pub mod dates;

pub use contacts::{extract_contacts, extract_emails, extract_phones, normalize_phone, ContactInfo};
pub use dates::parse_closing_date;

pub const CRATE_NAME: &str = "jobtrack-adapters";

#[derive(Debug, Error)]
pub enum InputError {
    #[error("raw input {0} does not exist")]
    Missing(PathBuf),
    #[error("reading raw input {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load the scraper's job list. Only a missing or unreadable file is an error;
/// malformed content degrades to an empty list.
pub fn load_raw_jobs(path: impl AsRef<Path>) -> Result<Vec<RawJob>, InputError> {
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(InputError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(InputError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(parse_raw_jobs(&text))
}

/// Parse a JSON job list, dropping anything that is not an object.
pub fn parse_raw_jobs(text: &str) -> Vec<RawJob> {
    match serde_json::from_str::<JsonValue>(text) {
        Ok(JsonValue::Array(items)) => {
            let total = items.len();
            let jobs: Vec<RawJob> = items
                .into_iter()
                .filter_map(|item| match item {
                    JsonValue::Object(map) => Some(RawJob::new(map)),
                    _ => None,
                })
                .collect();
            if jobs.len() < total {
                warn!(skipped = total - jobs.len(), "ignoring non-object entries in raw input");
            }
            jobs
        }
        Ok(_) => {
            warn!("raw input is not a list; treating as empty");
            Vec::new()
        }
        Err(err) => {
            warn!(error = %err, "raw input is not valid JSON; treating as empty");
            Vec::new()
        }
    }
}

/// Free text searched for contact details: description then details.
pub fn contact_text(raw: &RawJob) -> String {
    format!("{}\n{}", raw.text("description"), raw.text("details"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_list_and_invalid_json_degrade_to_empty() {
        assert!(parse_raw_jobs(r#"{"url": "a"}"#).is_empty());
        assert!(parse_raw_jobs("not json").is_empty());
        assert!(parse_raw_jobs("").is_empty());
    }

    #[test]
    fn non_object_items_are_skipped() {
        let jobs = parse_raw_jobs(r#"[{"url": "a"}, 3, "x", null, {"url": "b"}]"#);
        let urls: Vec<_> = jobs.iter().filter_map(|j| j.url()).collect();
        assert_eq!(urls, vec!["a", "b"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("jobtrack-adapters-definitely-missing.json");
        assert!(matches!(load_raw_jobs(&path), Err(InputError::Missing(_))));
    }

    #[test]
    fn contact_text_joins_description_and_details() {
        let jobs = parse_raw_jobs(r#"[{"description": "a@b.io", "details": 700}]"#);
        assert_eq!(contact_text(&jobs[0]), "a@b.io\n700");
    }
}
