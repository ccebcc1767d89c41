//! Catalogue and download API access.

pub mod client;
pub mod fetchers;
pub mod filters;

pub use client::{download_url, CatalogueClient, InvestigationQuery, IsisHierarchy};
pub use fetchers::{DatasetCountFetcher, InvestigationSizeFetcher};
