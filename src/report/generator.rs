//! Markdown and JSON rendering.

use super::{Report, ReportMetadata, ReportRow};
use crate::models::{format_bytes, Investigation, TaskKind};
use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# Investigations\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_table(report));

    output
}

fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str(&format!("- **Catalogue:** {}\n", metadata.api_url));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!(
        "- **Investigations:** {}\n",
        metadata.investigations
    ));
    if metadata.failed > 0 {
        section.push_str(&format!("- **Failed:** {}\n", metadata.failed));
    }
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_table(report: &Report) -> String {
    let mut table = String::new();

    if report.rows.is_empty() {
        table.push_str("*No investigations found.*\n");
        return table;
    }

    let links = report.rows.iter().any(|row| row.download.is_some());

    table.push_str("| ID | Name | Title |");
    let mut align = String::from("|---:|---|---|");
    if let Some(kind) = report.metadata.kind {
        table.push_str(&format!(" {} |", kind.label()));
        align.push_str("---:|");
    }
    if links {
        table.push_str(" Download |");
        align.push_str("---|");
    }
    table.push('\n');
    table.push_str(&align);
    table.push('\n');

    for row in &report.rows {
        table.push_str(&format!(
            "| {} | {} | {} |",
            row.id,
            escape_cell(&row.name),
            escape_cell(&row.title)
        ));
        if let Some(kind) = report.metadata.kind {
            table.push_str(&format!(" {} |", value_cell(row, kind)));
        }
        if links {
            match &row.download {
                Some(url) => table.push_str(&format!(" [zip]({}) |", url)),
                None => table.push_str(" |"),
            }
        }
        table.push('\n');
    }

    table
}

fn value_cell(row: &ReportRow, kind: TaskKind) -> String {
    match (row.value, &row.error) {
        (Some(bytes), _) if kind == TaskKind::InvestigationSize => format_bytes(bytes),
        (Some(count), _) => count.to_string(),
        (None, Some(_)) => "error".to_string(),
        (None, None) => "-".to_string(),
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// Render one investigation with its included relations.
pub fn generate_investigation_details(investigation: &Investigation) -> String {
    let mut output = String::new();

    output.push_str(&format!("# {}\n\n", investigation.title));
    output.push_str(&format!("- **ID:** {}\n", investigation.id));
    output.push_str(&format!("- **Name:** {}\n", investigation.name));

    let optional = [
        ("Visit", &investigation.visit_id),
        ("DOI", &investigation.doi),
        ("Start Date", &investigation.start_date),
        ("End Date", &investigation.end_date),
        ("Release Date", &investigation.release_date),
    ];
    for (label, value) in optional {
        if let Some(value) = value {
            output.push_str(&format!("- **{}:** {}\n", label, value));
        }
    }

    output.push_str(&format!(
        "- **Users:** {}\n- **Samples:** {}\n- **Publications:** {}\n",
        investigation.investigation_users.len(),
        investigation.samples.len(),
        investigation.publications.len()
    ));

    if let Some(summary) = &investigation.summary {
        output.push_str(&format!("\n{}\n", summary));
    }

    output
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Render an investigation count.
pub fn generate_count(count: u64, json: bool) -> Result<String> {
    if json {
        Ok(serde_json::to_string_pretty(&json!({ "count": count }))?)
    } else {
        Ok(format!("{} investigations\n", count))
    }
}

/// Write rendered output to a file, or stdout when no path is given.
pub fn save_report(content: &str, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, content)
            .with_context(|| format!("Failed to write report to {}", path.display())),
        None => {
            print!("{}", content);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::models::{Investigation, QueryKey, Snapshot, Task, TaskState};
    use chrono::Utc;

    fn investigations() -> Vec<Investigation> {
        serde_json::from_str(
            r#"[
                {"id": 1, "name": "INV 1", "title": "Neutron | scattering"},
                {"id": 2, "name": "INV 2", "title": "Muons"}
            ]"#,
        )
        .unwrap()
    }

    fn size_snapshot() -> Snapshot<u64> {
        Snapshot {
            generation: 1,
            tasks: vec![
                Task {
                    query: QueryKey::new(TaskKind::InvestigationSize, 1),
                    state: TaskState::Succeeded(2_500_000),
                },
                Task {
                    query: QueryKey::new(TaskKind::InvestigationSize, 2),
                    state: TaskState::Failed(FetchError::Transport("reset".to_string())),
                },
            ],
            total: 2,
            completed: 2,
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_generate_listing_markdown() {
        let report = Report::listing("http://localhost:5000", &investigations(), 0.5);
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# Investigations"));
        assert!(markdown.contains("http://localhost:5000"));
        assert!(markdown.contains("| ID | Name | Title |\n"));
        assert!(markdown.contains("Neutron \\| scattering"));
        assert!(!markdown.contains("Failed:"));
    }

    #[test]
    fn test_generate_sizes_markdown() {
        let report = Report::with_values(
            "http://localhost:5000",
            &investigations(),
            TaskKind::InvestigationSize,
            &size_snapshot(),
            1.0,
        );
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("| ID | Name | Title | Size |"));
        assert!(markdown.contains("| 2.50 MB |"));
        assert!(markdown.contains("| error |"));
        assert!(markdown.contains("- **Failed:** 1"));
    }

    #[test]
    fn test_generate_json_report() {
        let report = Report::with_values(
            "http://localhost:5000",
            &investigations(),
            TaskKind::InvestigationDatasetCount,
            &size_snapshot(),
            1.0,
        );
        let json = generate_json_report(&report).unwrap();

        assert!(json.contains("\"kind\": \"investigationDatasetCount\""));
        assert!(json.contains("\"value\": 2500000"));
        assert!(json.contains("\"error\": \"transport error: reset\""));
    }

    #[test]
    fn test_download_links_column() {
        let report = Report::listing("http://localhost:5000", &investigations(), 0.0)
            .with_download_links("https://ids.example.com/ids", "abc")
            .unwrap();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("| ID | Name | Title | Download |\n|---:|---|---|---|\n"));
        assert!(markdown.contains(
            "[zip](https://ids.example.com/ids/getData?sessionId=abc&investigationIds=2&compress=false&zip=true&outname=INV+2)"
        ));
    }

    #[test]
    fn test_investigation_details() {
        let investigation: Investigation = serde_json::from_str(
            r#"{"id": 3, "name": "INV 3", "title": "Crystals", "doi": "10.1/x",
                "investigationUsers": [{"user": {"name": "a"}}],
                "samples": [{}, {}]}"#,
        )
        .unwrap();
        let details = generate_investigation_details(&investigation);

        assert!(details.starts_with("# Crystals\n"));
        assert!(details.contains("- **DOI:** 10.1/x"));
        assert!(!details.contains("Visit"));
        assert!(details.contains("- **Users:** 1"));
        assert!(details.contains("- **Samples:** 2"));
    }

    #[test]
    fn test_empty_listing() {
        let report = Report::listing("http://localhost:5000", &[], 0.0);
        assert!(generate_markdown_report(&report).contains("No investigations found"));
    }

    #[test]
    fn test_generate_count() {
        assert_eq!(generate_count(4, false).unwrap(), "4 investigations\n");
        assert!(generate_count(4, true).unwrap().contains("\"count\": 4"));
    }

    #[test]
    fn test_save_report_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        save_report("hello", Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello");
    }
}
