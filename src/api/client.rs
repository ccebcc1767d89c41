//! HTTP client for the catalogue and download APIs.

use crate::api::filters::{
    api_params, append_extra, where_params, AdditionalFilter, FilterValue, IndexRange,
    SortAndFilters,
};
use crate::config::ApiConfig;
use crate::error::FetchError;
use crate::models::Investigation;
use crate::session::TokenSource;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Parameters for an investigation listing.
#[derive(Debug, Clone, Default)]
pub struct InvestigationQuery {
    pub sort_and_filters: SortAndFilters,
    pub additional: Vec<AdditionalFilter>,
    pub range: Option<IndexRange>,
    pub ignore_id_sort: bool,
}

/// Position in the ISIS browse hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsisHierarchy {
    pub instrument_id: i64,
    /// Facility cycle id, or study id when `study` is set.
    pub child_id: i64,
    pub study: bool,
}

impl IsisHierarchy {
    fn study_filters(&self) -> Vec<AdditionalFilter> {
        vec![
            AdditionalFilter::where_eq(
                "investigationInstruments.instrument.id",
                self.instrument_id,
            ),
            AdditionalFilter::where_eq("studyInvestigations.study.id", self.child_id),
        ]
    }

    fn cycle_path(&self) -> String {
        format!(
            "instruments/{}/facilitycycles/{}/investigations",
            self.instrument_id, self.child_id
        )
    }
}

fn isis_include() -> AdditionalFilter {
    AdditionalFilter::include(json!([
        { "investigationInstruments": "instrument" },
        { "studyInvestigations": "study" },
        { "investigationUsers": "user" },
    ]))
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: i64,
}

/// Client for the facility's catalogue API and download API.
pub struct CatalogueClient {
    http: reqwest::Client,
    api_url: String,
    download_api_url: String,
    facility_name: String,
    token: Arc<dyn TokenSource>,
}

impl CatalogueClient {
    pub fn new(config: &ApiConfig, token: Arc<dyn TokenSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            download_api_url: config.download_api_url.trim_end_matches('/').to_string(),
            facility_name: config.facility_name.clone(),
            token,
        })
    }

    async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<R, FetchError> {
        debug!("GET {} ({} params)", url, params.len());

        let response = self
            .http
            .get(url)
            .query(params)
            .bearer_auth(self.token.session_id())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), url, &body));
        }

        response.json::<R>().await.map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path)
    }

    /// List investigations.
    pub async fn investigations(
        &self,
        query: &InvestigationQuery,
    ) -> Result<Vec<Investigation>, FetchError> {
        let mut params = api_params(&query.sort_and_filters, query.ignore_id_sort);
        append_extra(&mut params, &query.additional, query.range);
        self.get_json(&self.api("investigations"), &params).await
    }

    /// A single investigation by id, as a (possibly empty) list.
    pub async fn investigation(
        &self,
        investigation_id: i64,
        additional: &[AdditionalFilter],
    ) -> Result<Vec<Investigation>, FetchError> {
        let mut filters = vec![AdditionalFilter::where_eq("id", investigation_id)];
        filters.extend_from_slice(additional);
        self.investigations(&InvestigationQuery {
            additional: filters,
            ..InvestigationQuery::default()
        })
        .await
    }

    /// An investigation with its users, samples and publications.
    pub async fn investigation_details(
        &self,
        investigation_id: i64,
    ) -> Result<Investigation, FetchError> {
        let url = self.api("investigations");
        let params = vec![
            (
                "where".to_string(),
                json!({ "id": { "eq": investigation_id } }).to_string(),
            ),
            (
                "include".to_string(),
                json!([{ "investigationUsers": "user" }, "samples", "publications"]).to_string(),
            ),
        ];

        let investigations: Vec<Investigation> = self.get_json(&url, &params).await?;
        investigations
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Decode {
                url,
                message: format!("no investigation with id {}", investigation_id),
            })
    }

    /// Number of investigations matching the filters.
    pub async fn investigation_count(
        &self,
        filters: &BTreeMap<String, FilterValue>,
        additional: &[AdditionalFilter],
    ) -> Result<u64, FetchError> {
        let mut params = where_params(filters);
        append_extra(&mut params, additional, None);
        self.get_json(&self.api("investigations/count"), &params)
            .await
    }

    /// Investigations under an instrument's facility cycle or study.
    pub async fn isis_investigations(
        &self,
        hierarchy: IsisHierarchy,
        sort_and_filters: &SortAndFilters,
        range: Option<IndexRange>,
    ) -> Result<Vec<Investigation>, FetchError> {
        if hierarchy.study {
            let mut additional = hierarchy.study_filters();
            additional.push(isis_include());
            return self
                .investigations(&InvestigationQuery {
                    sort_and_filters: sort_and_filters.clone(),
                    additional,
                    range,
                    ignore_id_sort: false,
                })
                .await;
        }

        let mut params = api_params(sort_and_filters, false);
        append_extra(&mut params, &[isis_include()], range);
        self.get_json(&self.api(&hierarchy.cycle_path()), &params)
            .await
    }

    pub async fn isis_investigation_count(
        &self,
        hierarchy: IsisHierarchy,
        filters: &BTreeMap<String, FilterValue>,
    ) -> Result<u64, FetchError> {
        if hierarchy.study {
            return self
                .investigation_count(filters, &hierarchy.study_filters())
                .await;
        }

        let params = where_params(filters);
        let path = format!("{}/count", hierarchy.cycle_path());
        self.get_json(&self.api(&path), &params).await
    }

    /// Ids of every investigation under the hierarchy position.
    pub async fn isis_investigation_ids(
        &self,
        hierarchy: IsisHierarchy,
        filters: &BTreeMap<String, FilterValue>,
    ) -> Result<Vec<i64>, FetchError> {
        let mut params = where_params(filters);
        let url = if hierarchy.study {
            let mut additional = hierarchy.study_filters();
            additional.push(AdditionalFilter::distinct("id"));
            append_extra(&mut params, &additional, None);
            self.api("investigations")
        } else {
            // the facility cycle route has no distinct support, so fetch whole rows
            self.api(&hierarchy.cycle_path())
        };

        let rows: Vec<IdOnly> = self.get_json(&url, &params).await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// Number of datasets in an investigation.
    pub async fn dataset_count(&self, investigation_id: i64) -> Result<u64, FetchError> {
        let mut params = Vec::new();
        append_extra(
            &mut params,
            &[AdditionalFilter::where_eq("investigation.id", investigation_id)],
            None,
        );
        self.get_json(&self.api("datasets/count"), &params).await
    }

    /// Total size in bytes of an investigation's files.
    pub async fn investigation_size(&self, investigation_id: i64) -> Result<u64, FetchError> {
        let url = format!("{}/user/getSize", self.download_api_url);
        let params = vec![
            ("sessionId".to_string(), self.token.session_id()),
            ("facilityName".to_string(), self.facility_name.clone()),
            ("entityType".to_string(), "investigation".to_string()),
            ("entityId".to_string(), investigation_id.to_string()),
        ];
        self.get_json(&url, &params).await
    }
}

/// URL that downloads an investigation as a zip from the IDS.
pub fn download_url(
    ids_url: &str,
    session_id: &str,
    investigation_id: i64,
    investigation_name: &str,
) -> Result<String> {
    let base = format!("{}/getData", ids_url.trim_end_matches('/'));
    let url = reqwest::Url::parse_with_params(
        &base,
        &[
            ("sessionId", session_id.to_string()),
            ("investigationIds", investigation_id.to_string()),
            ("compress", "false".to_string()),
            ("zip", "true".to_string()),
            ("outname", investigation_name.to_string()),
        ],
    )
    .with_context(|| format!("Invalid IDS url: {}", ids_url))?;
    Ok(url.to_string())
}
