//! dgfetch - batched investigation statistics from a data catalogue
//!
//! A CLI tool that lists investigations from the catalogue API and fetches
//! per-investigation sizes and dataset counts concurrently, publishing
//! results in batches as they arrive.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (connection, config, rejected session, etc.)
//!   2 - Some per-investigation fetches failed and --fail-on-error is set

mod api;
mod batch;
mod cli;
mod config;
mod error;
mod models;
mod plugin;
mod report;
mod session;

use anyhow::{bail, Context, Result};
use api::filters::IndexRange;
use api::{CatalogueClient, DatasetCountFetcher, InvestigationQuery, InvestigationSizeFetcher};
use batch::{BatchedAggregator, ItemFetcher, ItemSource, QueryCache};
use cli::{Args, Command, ListingArgs, OutputFormat};
use config::{Config, DEFAULT_CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use models::{Investigation, Snapshot, TaskKind};
use plugin::{route_registrations, PluginMessage};
use report::Report;
use session::{SessionNotifier, TokenSource};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("dgfetch v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("dgfetch failed: {:#}", e);
            eprintln!("\nError: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .dgfetch.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to set API endpoints, the session token and batch settings.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Shared state for one command run.
struct RunContext {
    args: Args,
    config: Config,
    client: Arc<CatalogueClient>,
    token: Arc<dyn TokenSource>,
    started: Instant,
}

impl RunContext {
    /// Build the API client for already merged settings.
    fn new(args: Args, config: Config) -> Result<Self> {
        let token = config.session.token_source();
        if token.session_id().is_empty() {
            warn!(
                "No session token configured; set --token or {}",
                config.session.token_env
            );
        }

        let client = Arc::new(CatalogueClient::new(&config.api, token.clone())?);
        Ok(Self {
            args,
            config,
            client,
            token,
            started: Instant::now(),
        })
    }
}

/// Run the selected command. Returns the exit code (0 or 2).
async fn run(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let command = args.command.clone().context("No command given")?;
    let ctx = RunContext::new(args, config)?;

    match command {
        Command::Investigations(listing) => run_listing(&ctx, &listing).await,
        Command::Count(listing) => run_count(&ctx, &listing).await,
        Command::Ids(listing) => run_ids(&ctx, &listing).await,
        Command::Sizes(listing) => {
            let fetcher = InvestigationSizeFetcher::new(ctx.client.clone());
            run_values(&ctx, &listing, fetcher).await
        }
        Command::DatasetCounts(listing) => {
            let fetcher = DatasetCountFetcher::new(ctx.client.clone());
            run_values(&ctx, &listing, fetcher).await
        }
        Command::Show { id } => run_show(&ctx, id).await,
        Command::Routes => run_routes(&ctx),
    }
}

fn emit(ctx: &RunContext, content: &str) -> Result<()> {
    report::save_report(content, ctx.args.output.as_deref())?;
    if let Some(ref path) = ctx.args.output {
        info!("Report saved to: {}", path.display());
    }
    Ok(())
}

fn render(ctx: &RunContext, report: &Report) -> Result<String> {
    match ctx.args.format {
        OutputFormat::Json => report::generate_json_report(report),
        OutputFormat::Markdown => Ok(report::generate_markdown_report(report)),
    }
}

fn finish_report(ctx: &RunContext, listing: &ListingArgs, report: Report) -> Result<Report> {
    if listing.links {
        report.with_download_links(&ctx.config.api.ids_url, &ctx.token.session_id())
    } else {
        Ok(report)
    }
}

async fn run_listing(ctx: &RunContext, listing: &ListingArgs) -> Result<i32> {
    let investigations = load_investigations(ctx, listing).await?.normalize();
    info!("Loaded {} investigations", investigations.len());

    let report = Report::listing(
        &ctx.config.api.api_url,
        &investigations,
        ctx.started.elapsed().as_secs_f64(),
    );
    let report = finish_report(ctx, listing, report)?;
    emit(ctx, &render(ctx, &report)?)?;
    Ok(0)
}

async fn run_count(ctx: &RunContext, listing: &ListingArgs) -> Result<i32> {
    let filters = listing.filters();
    let count = match listing.hierarchy() {
        Some(hierarchy) => ctx.client.isis_investigation_count(hierarchy, &filters).await,
        None => ctx.client.investigation_count(&filters, &[]).await,
    }
    .context("Failed to count investigations")?;

    let json = ctx.args.format == OutputFormat::Json;
    emit(ctx, &report::generate_count(count, json)?)?;
    Ok(0)
}

async fn run_ids(ctx: &RunContext, listing: &ListingArgs) -> Result<i32> {
    let ids = match listing.hierarchy() {
        Some(hierarchy) => ctx
            .client
            .isis_investigation_ids(hierarchy, &listing.filters())
            .await
            .context("Failed to load investigation ids")?,
        None => load_investigations(ctx, listing)
            .await?
            .normalize()
            .into_iter()
            .map(|investigation| investigation.id)
            .collect(),
    };

    let content = match ctx.args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&ids)?,
        OutputFormat::Markdown => ids
            .iter()
            .map(|id| format!("{}\n", id))
            .collect::<String>(),
    };
    emit(ctx, &content)?;
    Ok(0)
}

async fn run_show(ctx: &RunContext, id: i64) -> Result<i32> {
    let investigation = ctx
        .client
        .investigation_details(id)
        .await
        .with_context(|| format!("Failed to load investigation {}", id))?;

    let content = match ctx.args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&investigation)?,
        OutputFormat::Markdown => report::generate_investigation_details(&investigation),
    };
    emit(ctx, &content)?;
    Ok(0)
}

fn run_routes(ctx: &RunContext) -> Result<i32> {
    let mut messages = route_registrations(&ctx.config.routes);
    messages.push(PluginMessage::RequestPluginRerender);

    let content = match ctx.args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&messages)?,
        OutputFormat::Markdown => messages
            .iter()
            .map(|message| match message {
                PluginMessage::RegisterRoute(route) => format!(
                    "- `{}` {} / {} -> {}\n",
                    message.action_type(),
                    route.section,
                    route.display_name,
                    route.link
                ),
                other => format!("- `{}`\n", other.action_type()),
            })
            .collect::<String>(),
    };
    emit(ctx, &content)?;
    Ok(0)
}

/// Load the investigations a listing selects, in the shape they arrive in.
async fn load_investigations(
    ctx: &RunContext,
    listing: &ListingArgs,
) -> Result<ItemSource<Investigation>> {
    if let Some(id) = listing.id {
        let found = ctx
            .client
            .investigation(id, &[])
            .await
            .with_context(|| format!("Failed to load investigation {}", id))?;
        return Ok(found.into_iter().next().into());
    }

    if let Some(blocks) = listing.blocks {
        let mut loader = BlockLoader::new(ctx, listing, blocks);
        let mut pages = Vec::new();
        while let Some(page) = loader.next_block().await? {
            pages.push(page);
        }
        return Ok(ItemSource::Pages(pages));
    }

    let page = load_range(ctx, listing, listing.range()).await?;
    Ok(ItemSource::List(page))
}

/// Walks an infinite-scroll listing one block at a time. Stops after
/// `limit` blocks or at the first block shorter than a full one.
struct BlockLoader<'a> {
    ctx: &'a RunContext,
    listing: &'a ListingArgs,
    next: u64,
    limit: u64,
    exhausted: bool,
}

impl<'a> BlockLoader<'a> {
    fn new(ctx: &'a RunContext, listing: &'a ListingArgs, limit: u64) -> Self {
        Self {
            ctx,
            listing,
            next: 0,
            limit,
            exhausted: false,
        }
    }

    async fn next_block(&mut self) -> Result<Option<Vec<Investigation>>> {
        if self.exhausted || self.next >= self.limit {
            return Ok(None);
        }

        let range = IndexRange::infinite(self.next);
        let page = load_range(self.ctx, self.listing, range).await?;
        debug!("Block {} returned {} investigations", self.next, page.len());
        self.next += 1;
        self.exhausted = (page.len() as u64) < range.limit();
        Ok(Some(page))
    }
}

async fn load_range(
    ctx: &RunContext,
    listing: &ListingArgs,
    range: IndexRange,
) -> Result<Vec<Investigation>> {
    let sort_and_filters = listing.sort_and_filters();
    let result = match listing.hierarchy() {
        Some(hierarchy) => {
            ctx.client
                .isis_investigations(hierarchy, &sort_and_filters, Some(range))
                .await
        }
        None => {
            ctx.client
                .investigations(&InvestigationQuery {
                    sort_and_filters,
                    range: Some(range),
                    ..InvestigationQuery::default()
                })
                .await
        }
    };
    result.context("Failed to load investigations")
}

/// List investigations and fetch one value per investigation through a
/// batched aggregator.
async fn run_values<F>(ctx: &RunContext, listing: &ListingArgs, fetcher: F) -> Result<i32>
where
    F: ItemFetcher<Investigation, Value = u64>,
{
    let kind = fetcher.kind();
    let batch = &ctx.config.batch;
    let session = SessionNotifier::new();

    let cache = Arc::new(QueryCache::new(batch.stale_time()));
    let aggregator: BatchedAggregator<Investigation, F> = BatchedAggregator::new(fetcher, cache)
        .with_retry(batch.retry_policy())
        .with_batch_size(batch.batch_size)
        .with_session(session.clone());

    // Infinite listings grow one block at a time. Every new block replaces
    // the collection; earlier items keep their running fetch or cached value.
    let (handle, investigations) = match listing.blocks {
        Some(blocks) => {
            let handle = aggregator.spawn(ItemSource::Absent);
            let mut loader = BlockLoader::new(ctx, listing, blocks);
            let mut pages: Vec<Vec<Investigation>> = Vec::new();
            while let Some(page) = loader.next_block().await? {
                pages.push(page);
                handle.set_items(ItemSource::Pages(pages.clone())).await?;
            }
            (handle, pages.into_iter().flatten().collect::<Vec<_>>())
        }
        _ => {
            let source = load_investigations(ctx, listing).await?;
            let investigations = source.clone().normalize();
            (aggregator.spawn(source), investigations)
        }
    };

    info!(
        "Fetching {} for {} investigations",
        kind.label().to_lowercase(),
        investigations.len()
    );

    let snapshot = track_progress(ctx, &handle, kind).await?;
    handle.shutdown().await;

    if session.is_invalid() {
        bail!("The session was rejected by the server; refresh the session token");
    }

    let report = Report::with_values(
        &ctx.config.api.api_url,
        &investigations,
        kind,
        &snapshot,
        ctx.started.elapsed().as_secs_f64(),
    );
    let report = finish_report(ctx, listing, report)?;
    emit(ctx, &render(ctx, &report)?)?;

    let failed = snapshot.failed();
    if failed > 0 {
        warn!("{} of {} fetches failed", failed, snapshot.total);
    }
    let code = exit_code(failed, ctx.args.fail_on_error);
    if code == 2 {
        eprintln!("\n{} fetches failed. Failing (exit code 2).", failed);
    }
    Ok(code)
}

/// Exit code for a finished value run.
fn exit_code(failed: usize, fail_on_error: bool) -> i32 {
    if failed > 0 && fail_on_error {
        2
    } else {
        0
    }
}

/// Follow published snapshots with a progress bar until every task is
/// terminal.
async fn track_progress(
    ctx: &RunContext,
    handle: &batch::AggregatorHandle<Investigation, u64>,
    kind: TaskKind,
) -> Result<Arc<Snapshot<u64>>> {
    let progress = if ctx.args.quiet {
        None
    } else {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {pos}/{len}")?
                .progress_chars("#>-"),
        );
        pb.set_message(kind.label());
        Some(pb)
    };

    let mut updates = handle.subscribe();
    let snapshot = loop {
        let snapshot = updates.borrow_and_update().clone();
        if let Some(ref pb) = progress {
            pb.set_length(snapshot.total as u64);
            pb.set_position(snapshot.completed as u64);
        }
        debug!(
            "Snapshot generation {}: {}/{}",
            snapshot.generation, snapshot.completed, snapshot.total
        );
        if snapshot.is_complete() {
            break snapshot;
        }
        if updates.changed().await.is_err() {
            break handle.latest();
        }
    };

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    if !snapshot.is_complete() {
        bail!("Aggregator stopped before all fetches finished");
    }
    Ok(snapshot)
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
