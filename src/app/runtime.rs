use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use super::config::AppConfig;
use super::data_io::{LineLog, OutputSink};
use super::dedupe::Deduplicator;
use super::error::{AppError, StorageResult};
use super::fetch::{PoliteFetcher, ReqwestTransport, Transport};
use super::harvest::{TenantJob, harvest_tenants};
use super::parser::AvatureHtmlParser;
use super::registry::{Strategy, TenantTable, build_registry};
use super::resolver::{EndpointResolver, Plan, plan_for};
use super::scan::{IndexScanner, ScanReport};
use super::types::{Cli, Command, HarvestEvent, TenantOutcome};

const TABLE_SAVE_EVERY: usize = 25;

pub fn init_logging(verbose: bool, json: bool) -> Result<(), AppError> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| AppError::Logging(e.to_string()))
}

pub async fn run(cli: Cli, stop: Arc<AtomicBool>) -> Result<(), AppError> {
    init_logging(cli.verbose, cli.log_json)?;
    let config = cli.apply(AppConfig::load(cli.config.as_deref())?).sanitize()?;
    debug!(domain = %config.platform_domain, "configuration loaded");

    match &cli.command {
        Command::Scan(_) => {
            let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config.fetch)?);
            let report = run_scan(&config, transport, stop).await?;
            if report.interrupted {
                warn!("scan interrupted; rerun to resume from the checkpoint");
            }
        }
        Command::Registry(_) => {
            build_registry(&config.registry, &config.scan.discovery_log, &config.platform_domain)?;
        }
        Command::Harvest(_) => {
            let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config.fetch)?);
            run_harvest(&config, transport, stop).await?;
        }
    }
    Ok(())
}

pub async fn run_scan(
    config: &AppConfig,
    transport: Arc<dyn Transport>,
    stop: Arc<AtomicBool>,
) -> Result<ScanReport, AppError> {
    let fetcher = Arc::new(PoliteFetcher::new(transport, config.fetch.clone(), stop.clone()));
    let scanner = IndexScanner::new(
        fetcher.clone(),
        config.scan.clone(),
        config.platform_domain.clone(),
        stop,
    );
    let report = scanner.run().await?;
    log_fetch_totals(&fetcher);
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestReport {
    pub tenants_total: usize,
    pub tenants_skipped: usize,
    pub tenants_done: usize,
    pub api_resolved: usize,
    pub html_fallback: usize,
    pub failed: usize,
    pub records_seen: usize,
    pub emitted: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub failed_detail_urls: usize,
    pub interrupted: bool,
}

pub async fn run_harvest(
    config: &AppConfig,
    transport: Arc<dyn Transport>,
    stop: Arc<AtomicBool>,
) -> Result<HarvestReport, AppError> {
    let harvest_config = Arc::new(config.harvest.clone());
    let table = TenantTable::load(&config.registry.table)?;
    if table.is_empty() {
        warn!(table = %config.registry.table.display(), "tenant table is empty; run `registry` first");
    }

    let only = harvest_config
        .only_tenants
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect::<HashSet<_>>();
    let stale_after = i64::try_from(harvest_config.stale_after_hours)
        .ok()
        .and_then(ChronoDuration::try_hours)
        .unwrap_or(ChronoDuration::MAX);
    let now = Utc::now();

    let mut report = HarvestReport::default();
    let mut jobs = Vec::new();
    for tenant in table.tenants() {
        if !only.is_empty() && !only.contains(&tenant.host) {
            continue;
        }
        report.tenants_total += 1;
        match plan_for(tenant, harvest_config.reresolve, stale_after, now) {
            Plan::Skip => {
                debug!(
                    tenant = %tenant.host,
                    strategy = tenant.strategy.label(),
                    endpoint = tenant.resolved_endpoint().unwrap_or("-"),
                    "skipping classified tenant"
                );
                report.tenants_skipped += 1;
            }
            plan => jobs.push(TenantJob {
                tenant: tenant.clone(),
                plan,
            }),
        }
    }
    info!(
        tenants = jobs.len(),
        skipped = report.tenants_skipped,
        concurrency = harvest_config.tenant_concurrency,
        "harvest starting"
    );

    let mut writer = HarvestWriter::open(config, table, report)?;
    let fetcher = Arc::new(PoliteFetcher::new(transport, config.fetch.clone(), stop.clone()));
    let resolver = Arc::new(EndpointResolver::new(
        fetcher.clone(),
        Arc::new(AvatureHtmlParser),
        harvest_config.clone(),
    ));

    let (tx, mut rx) = mpsc::unbounded_channel::<HarvestEvent>();
    let concurrency = harvest_config.tenant_concurrency;
    let worker_stop = stop.clone();
    let worker = tokio::spawn(async move {
        harvest_tenants(jobs, resolver, concurrency, worker_stop, &tx).await;
    });

    let mut failure = None;
    while let Some(event) = rx.recv().await {
        if let Err(err) = writer.handle(event) {
            error!(error = %err, "cannot persist harvest output, stopping");
            stop.store(true, Ordering::Relaxed);
            failure = Some(err);
            break;
        }
    }
    drop(rx);
    if let Err(err) = worker.await {
        error!(error = %err, "harvest task join error");
    }
    if let Some(err) = failure {
        return Err(err.into());
    }

    let mut report = writer.finish()?;
    report.interrupted = stop.load(Ordering::Relaxed);
    log_fetch_totals(&fetcher);
    info!(
        tenants = report.tenants_done,
        api = report.api_resolved,
        html = report.html_fallback,
        failed = report.failed,
        records = report.records_seen,
        emitted = report.emitted,
        duplicates = report.duplicates,
        dropped = report.dropped,
        output = %config.harvest.output.display(),
        "harvest finished"
    );
    Ok(report)
}

fn log_fetch_totals(fetcher: &PoliteFetcher) {
    let stats = fetcher.stats();
    info!(
        requests = stats.requests,
        retries = stats.retries,
        failures = stats.failures,
        peak_per_host = stats.peak_per_host,
        "fetch totals"
    );
}

// Single owner of everything the harvest writes. Per tenant the order is
// output, then dedupe keys, then the tenant table.
struct HarvestWriter {
    output: OutputSink,
    dedupe: Deduplicator,
    failed_urls: LineLog,
    table: TenantTable,
    table_path: PathBuf,
    unsaved: usize,
    report: HarvestReport,
}

impl HarvestWriter {
    fn open(config: &AppConfig, table: TenantTable, report: HarvestReport) -> StorageResult<Self> {
        let harvest = &config.harvest;
        let dedupe = Deduplicator::open(&harvest.dedupe_store, harvest.fresh)?;
        if harvest.fresh {
            info!("fresh run, ignoring existing output");
        } else {
            dedupe.seed_from_output(&harvest.output, harvest.format)?;
        }
        if !dedupe.is_empty() {
            info!(keys = dedupe.len(), "previously emitted postings will be skipped");
        }
        Ok(Self {
            output: OutputSink::open(&harvest.output, harvest.format, harvest.fresh)?,
            dedupe,
            failed_urls: LineLog::open(&harvest.failed_urls, 64)?,
            table,
            table_path: config.registry.table.clone(),
            unsaved: 0,
            report,
        })
    }

    fn handle(&mut self, event: HarvestEvent) -> StorageResult<()> {
        match event {
            HarvestEvent::Tenant(outcome) => self.record_tenant(*outcome),
            HarvestEvent::Error(err) => {
                warn!(error = %err, "harvest worker error");
                Ok(())
            }
        }
    }

    fn record_tenant(&mut self, outcome: TenantOutcome) -> StorageResult<()> {
        let mut emitted = 0usize;
        for record in &outcome.records {
            if self.dedupe.should_emit(record) {
                self.output.write_record(record)?;
                emitted += 1;
            } else {
                self.report.duplicates += 1;
            }
        }
        self.output.flush()?;
        self.dedupe.flush()?;

        for url in &outcome.failed_detail_urls {
            self.failed_urls.append(url)?;
        }
        self.failed_urls.flush()?;

        self.report.tenants_done += 1;
        self.report.records_seen += outcome.records.len();
        self.report.emitted += emitted;
        self.report.dropped += outcome.dropped;
        self.report.failed_detail_urls += outcome.failed_detail_urls.len();

        let label = outcome.strategy.as_ref().map(Strategy::label).unwrap_or("unchanged");
        let previous = self
            .table
            .get(&outcome.host)
            .map(|tenant| tenant.strategy.label())
            .unwrap_or("-");
        match &outcome.strategy {
            Some(Strategy::ApiResolved { .. }) => self.report.api_resolved += 1,
            Some(Strategy::HtmlFallback { .. }) => self.report.html_fallback += 1,
            Some(Strategy::Failed { .. }) => self.report.failed += 1,
            Some(Strategy::Unresolved) | None => {}
        }
        info!(
            tenant = %outcome.host,
            strategy = label,
            previous,
            records = outcome.records.len(),
            emitted,
            dropped = outcome.dropped,
            "tenant done"
        );

        if let Some(strategy) = outcome.strategy {
            self.table.update_strategy(&outcome.host, strategy, Utc::now());
            self.unsaved += 1;
            if self.unsaved >= TABLE_SAVE_EVERY {
                self.table.save(&self.table_path)?;
                self.unsaved = 0;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> StorageResult<HarvestReport> {
        self.output.flush()?;
        self.dedupe.flush()?;
        self.failed_urls.sync()?;
        if self.unsaved > 0 {
            self.table.save(&self.table_path)?;
        }
        Ok(self.report)
    }
}
