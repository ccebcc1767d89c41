//! Per-investigation fetchers driven by the batched aggregator.

use crate::api::client::CatalogueClient;
use crate::batch::ItemFetcher;
use crate::error::FetchError;
use crate::models::{Investigation, ItemKey, TaskKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Fetches the total file size of each investigation.
pub struct InvestigationSizeFetcher {
    client: Arc<CatalogueClient>,
}

impl InvestigationSizeFetcher {
    pub fn new(client: Arc<CatalogueClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ItemFetcher<Investigation> for InvestigationSizeFetcher {
    type Value = u64;

    fn kind(&self) -> TaskKind {
        TaskKind::InvestigationSize
    }

    fn key(&self, item: &Investigation) -> ItemKey {
        ItemKey::Number(item.id)
    }

    async fn fetch(&self, item: &Investigation) -> Result<u64, FetchError> {
        self.client.investigation_size(item.id).await
    }
}

/// Fetches the number of datasets in each investigation.
pub struct DatasetCountFetcher {
    client: Arc<CatalogueClient>,
}

impl DatasetCountFetcher {
    pub fn new(client: Arc<CatalogueClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ItemFetcher<Investigation> for DatasetCountFetcher {
    type Value = u64;

    fn kind(&self) -> TaskKind {
        TaskKind::InvestigationDatasetCount
    }

    fn key(&self, item: &Investigation) -> ItemKey {
        ItemKey::Number(item.id)
    }

    async fn fetch(&self, item: &Investigation) -> Result<u64, FetchError> {
        self.client.dataset_count(item.id).await
    }
}
