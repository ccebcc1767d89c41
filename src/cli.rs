//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::api::filters::{
    FilterValue, IndexRange, SortAndFilters, SortDirection, DEFAULT_RESULTS_PER_PAGE,
};
use crate::api::IsisHierarchy;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// dgfetch - batched investigation statistics from a data catalogue
///
/// Lists investigations from the catalogue API and fetches per-investigation
/// sizes and dataset counts concurrently, publishing results in batches.
///
/// Examples:
///   dgfetch investigations --page 2
///   dgfetch sizes --blocks 3 --format json
///   dgfetch dataset-counts --instrument 1 --cycle 14
///   dgfetch count --filter title=neutron
///   dgfetch --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .dgfetch.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Catalogue API base URL
    #[arg(long, value_name = "URL", env = "DGFETCH_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Download API base URL, used for investigation sizes
    #[arg(long, value_name = "URL", global = true)]
    pub download_api_url: Option<String>,

    /// Facility name sent to the download API
    #[arg(long, value_name = "NAME", global = true)]
    pub facility: Option<String>,

    /// Session id used to authenticate requests
    #[arg(long, value_name = "TOKEN", env = "DGFETCH_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Completions between published result batches
    #[arg(long, value_name = "NUM", global = true)]
    pub batch_size: Option<usize>,

    /// Retries for a failed fetch (authorization failures are never retried)
    #[arg(long, value_name = "NUM", global = true)]
    pub retries: Option<u32>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT", global = true)]
    pub format: OutputFormat,

    /// Write the report to a file instead of stdout
    #[arg(short, long, value_name = "FILE", global = true)]
    pub output: Option<PathBuf>,

    /// Exit with code 2 if any per-investigation fetch failed
    #[arg(long, global = true)]
    pub fail_on_error: bool,

    /// Generate a default .dgfetch.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List investigations
    Investigations(ListingArgs),
    /// Count investigations matching the filters
    Count(ListingArgs),
    /// Fetch the total file size of each listed investigation
    Sizes(ListingArgs),
    /// Fetch the dataset count of each listed investigation
    DatasetCounts(ListingArgs),
    /// List only the ids of matching investigations
    Ids(ListingArgs),
    /// Show one investigation with its users, samples and publications
    Show {
        /// Investigation id
        id: i64,
    },
    /// Print the route registration messages for the shell
    Routes,
}

/// Which investigations to list.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ListingArgs {
    /// Table page to load (1-based)
    #[arg(long, default_value = "1", value_name = "PAGE")]
    pub page: u64,

    /// Rows per page
    #[arg(long, default_value_t = DEFAULT_RESULTS_PER_PAGE, value_name = "NUM")]
    pub results: u64,

    /// Load this many infinite-scroll blocks instead of a single page
    #[arg(long, value_name = "NUM", conflicts_with_all = ["page", "results"])]
    pub blocks: Option<u64>,

    /// A single investigation by id instead of a listing
    #[arg(long, value_name = "ID", conflicts_with_all = ["page", "results", "blocks"])]
    pub id: Option<i64>,

    /// Add IDS download links to listed investigations
    #[arg(long)]
    pub links: bool,

    /// Sort column, highest priority first (e.g. title:desc)
    #[arg(long, value_name = "COLUMN[:asc|desc]", value_parser = parse_sort)]
    pub sort: Vec<(String, SortDirection)>,

    /// Text filter on a column; prefix the value with ! to exclude
    #[arg(long, value_name = "COLUMN=VALUE", value_parser = parse_filter)]
    pub filter: Vec<(String, FilterValue)>,

    /// Only investigations on this instrument
    #[arg(long, value_name = "ID")]
    pub instrument: Option<i64>,

    /// Facility cycle under the instrument
    #[arg(long, value_name = "ID", requires = "instrument", conflicts_with = "study")]
    pub cycle: Option<i64>,

    /// Study under the instrument
    #[arg(long, value_name = "ID", requires = "instrument")]
    pub study: Option<i64>,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

fn parse_sort(s: &str) -> Result<(String, SortDirection), String> {
    let (column, direction) = match s.split_once(':') {
        Some((column, "asc")) => (column, SortDirection::Asc),
        Some((column, "desc")) => (column, SortDirection::Desc),
        Some((_, other)) => return Err(format!("unknown sort direction '{}'", other)),
        None => (s, SortDirection::Asc),
    };
    if column.is_empty() {
        return Err("sort column must not be empty".to_string());
    }
    Ok((column.to_string(), direction))
}

fn parse_filter(s: &str) -> Result<(String, FilterValue), String> {
    let (column, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected COLUMN=VALUE, got '{}'", s))?;
    if column.is_empty() {
        return Err("filter column must not be empty".to_string());
    }
    let filter = match value.strip_prefix('!') {
        Some(excluded) => FilterValue::Text {
            value: excluded.to_string(),
            include: false,
        },
        None => FilterValue::Text {
            value: value.to_string(),
            include: true,
        },
    };
    Ok((column.to_string(), filter))
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.command.is_none() {
            return Err("A command is required (try --help)".to_string());
        }

        for url in [&self.api_url, &self.download_api_url].into_iter().flatten() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("API URL must start with 'http://' or 'https://': {}", url));
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.batch_size == Some(0) {
            return Err("Batch size must be at least 1".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        if let Some(listing) = self.listing() {
            if listing.page == 0 {
                return Err("Page must be at least 1".to_string());
            }
            if listing.results == 0 {
                return Err("Results per page must be at least 1".to_string());
            }
            if listing.blocks == Some(0) {
                return Err("Blocks must be at least 1".to_string());
            }
            if listing.instrument.is_some() && listing.hierarchy().is_none() {
                return Err("--instrument needs --cycle or --study".to_string());
            }
        }

        Ok(())
    }

    /// The listing arguments of the selected command, if it has any.
    pub fn listing(&self) -> Option<&ListingArgs> {
        match self.command.as_ref()? {
            Command::Investigations(listing)
            | Command::Count(listing)
            | Command::Sizes(listing)
            | Command::DatasetCounts(listing)
            | Command::Ids(listing) => Some(listing),
            Command::Show { .. } | Command::Routes => None,
        }
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

impl ListingArgs {
    pub fn sort_and_filters(&self) -> SortAndFilters {
        SortAndFilters {
            sort: self.sort.clone(),
            filters: self.filters(),
        }
    }

    pub fn filters(&self) -> BTreeMap<String, FilterValue> {
        self.filter.iter().cloned().collect()
    }

    /// Row range of the requested page.
    pub fn range(&self) -> IndexRange {
        IndexRange::for_page(self.page, self.results)
    }

    /// Position in the instrument hierarchy, when one was selected.
    pub fn hierarchy(&self) -> Option<IsisHierarchy> {
        let instrument_id = self.instrument?;
        match (self.cycle, self.study) {
            (Some(cycle), _) => Some(IsisHierarchy {
                instrument_id,
                child_id: cycle,
                study: false,
            }),
            (None, Some(study)) => Some(IsisHierarchy {
                instrument_id,
                child_id: study,
                study: true,
            }),
            (None, None) => None,
        }
    }
}
