//! Report generation for listings and fetched statistics.

mod generator;

pub use generator::*;

use crate::api::download_url;
use crate::models::{Investigation, Snapshot, TaskKind, TaskState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A rendered listing, optionally with one fetched value per row.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub rows: Vec<ReportRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub api_url: String,
    pub generated_at: DateTime<Utc>,
    /// Kind of value in each row, absent for plain listings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,
    pub investigations: usize,
    pub failed: usize,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub id: i64,
    pub name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<String>,
}

impl ReportRow {
    fn from_investigation(investigation: &Investigation) -> Self {
        Self {
            id: investigation.id,
            name: investigation.name.clone(),
            title: investigation.title.clone(),
            value: None,
            error: None,
            download: None,
        }
    }
}

impl Report {
    /// A plain investigation listing.
    pub fn listing(api_url: &str, investigations: &[Investigation], duration_seconds: f64) -> Self {
        Self {
            metadata: ReportMetadata {
                api_url: api_url.to_string(),
                generated_at: Utc::now(),
                kind: None,
                investigations: investigations.len(),
                failed: 0,
                duration_seconds,
            },
            rows: investigations
                .iter()
                .map(ReportRow::from_investigation)
                .collect(),
        }
    }

    /// A listing joined with the tasks of a final snapshot, in item order.
    pub fn with_values(
        api_url: &str,
        investigations: &[Investigation],
        kind: TaskKind,
        snapshot: &Snapshot<u64>,
        duration_seconds: f64,
    ) -> Self {
        let mut report = Self::listing(api_url, investigations, duration_seconds);
        report.metadata.kind = Some(kind);
        report.metadata.failed = snapshot.failed();

        for (row, task) in report.rows.iter_mut().zip(&snapshot.tasks) {
            match &task.state {
                TaskState::Succeeded(value) => row.value = Some(*value),
                TaskState::Failed(e) => row.error = Some(e.to_string()),
                TaskState::Pending | TaskState::InFlight => {}
            }
        }

        report
    }

    /// Attach an IDS zip download link to every row.
    pub fn with_download_links(mut self, ids_url: &str, session_id: &str) -> Result<Self> {
        for row in &mut self.rows {
            row.download = Some(download_url(ids_url, session_id, row.id, &row.name)?);
        }
        Ok(self)
    }
}
