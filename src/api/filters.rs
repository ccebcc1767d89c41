//! Query parameter building for the catalogue API.
//!
//! Sorting, column filters and paging are expressed as repeated `order`,
//! `where`, `skip` and `limit` query parameters whose values are JSON.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Block size used when loading pages for infinite scrolling.
pub const INFINITE_BLOCK_SIZE: u64 = 50;

/// Default number of rows on a paginated table page.
pub const DEFAULT_RESULTS_PER_PAGE: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// A filter on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Case-insensitive text match, or exclusion when `include` is false.
    Text { value: String, include: bool },
    /// Inclusive date range, either end optional (`YYYY-MM-DD`).
    Date {
        start_date: Option<String>,
        end_date: Option<String>,
    },
}

/// Sort columns in priority order plus column filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortAndFilters {
    pub sort: Vec<(String, SortDirection)>,
    pub filters: BTreeMap<String, FilterValue>,
}

/// An extra raw parameter appended after the generated ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalFilter {
    pub filter_type: String,
    pub filter_value: String,
}

impl AdditionalFilter {
    /// `where {field: {eq: value}}`.
    pub fn where_eq(field: &str, value: impl Into<Value>) -> Self {
        let value: Value = value.into();
        Self {
            filter_type: "where".to_string(),
            filter_value: json!({ field: { "eq": value } }).to_string(),
        }
    }

    /// `include` of related entities.
    pub fn include(relations: Value) -> Self {
        Self {
            filter_type: "include".to_string(),
            filter_value: relations.to_string(),
        }
    }

    pub fn distinct(field: &str) -> Self {
        Self {
            filter_type: "distinct".to_string(),
            filter_value: Value::from(field).to_string(),
        }
    }
}

/// Inclusive row range, translated to `skip`/`limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRange {
    pub start_index: u64,
    pub stop_index: u64,
}

impl IndexRange {
    /// Rows of a 1-based table page.
    pub fn for_page(page: u64, results: u64) -> Self {
        let page = page.max(1);
        let results = results.max(1);
        let start_index = (page - 1) * results;
        Self {
            start_index,
            stop_index: start_index + results - 1,
        }
    }

    /// The `block`-th (0-based) block loaded by infinite scrolling.
    pub fn infinite(block: u64) -> Self {
        let start_index = block * INFINITE_BLOCK_SIZE;
        Self {
            start_index,
            stop_index: start_index + INFINITE_BLOCK_SIZE - 1,
        }
    }

    pub fn limit(&self) -> u64 {
        self.stop_index - self.start_index + 1
    }

    fn append_to(&self, params: &mut Vec<(String, String)>) {
        params.push(("skip".to_string(), self.start_index.to_string()));
        params.push(("limit".to_string(), self.limit().to_string()));
    }
}

/// Build `order` and `where` parameters.
///
/// Results are always ordered by `id` last so paging is stable, unless
/// `ignore_id_sort` is set.
pub fn api_params(sort_and_filters: &SortAndFilters, ignore_id_sort: bool) -> Vec<(String, String)> {
    let mut params = Vec::new();

    for (column, direction) in &sort_and_filters.sort {
        params.push((
            "order".to_string(),
            Value::from(format!("{} {}", column, direction.as_str())).to_string(),
        ));
    }
    if !ignore_id_sort {
        params.push(("order".to_string(), Value::from("id asc").to_string()));
    }

    params.extend(where_params(&sort_and_filters.filters));
    params
}

/// Build only the `where` parameters; used by count endpoints.
pub fn where_params(filters: &BTreeMap<String, FilterValue>) -> Vec<(String, String)> {
    let mut params = Vec::new();

    for (column, filter) in filters {
        match filter {
            FilterValue::Text { value, include } => {
                let op = if *include { "ilike" } else { "nilike" };
                params.push((
                    "where".to_string(),
                    json!({ column: { op: value } }).to_string(),
                ));
            }
            FilterValue::Date {
                start_date,
                end_date,
            } => {
                if let Some(start) = start_date.as_deref().filter(|s| !s.is_empty()) {
                    params.push((
                        "where".to_string(),
                        json!({ column: { "gte": format!("{} 00:00:00", start) } }).to_string(),
                    ));
                }
                if let Some(end) = end_date.as_deref().filter(|s| !s.is_empty()) {
                    params.push((
                        "where".to_string(),
                        json!({ column: { "lte": format!("{} 23:59:59", end) } }).to_string(),
                    ));
                }
            }
        }
    }

    params
}

/// Append additional filters and an optional row range.
pub fn append_extra(
    params: &mut Vec<(String, String)>,
    additional: &[AdditionalFilter],
    range: Option<IndexRange>,
) {
    if let Some(range) = range {
        range.append_to(params);
    }
    for filter in additional {
        params.push((filter.filter_type.clone(), filter.filter_value.clone()));
    }
}
