use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::normalize::{NormalizeContext, normalize};
use super::registry::Tenant;
use super::resolver::{EndpointResolver, Plan};
use super::types::{HarvestEvent, TenantOutcome};

#[derive(Debug, Clone)]
pub struct TenantJob {
    pub tenant: Tenant,
    pub plan: Plan,
}

pub async fn harvest_tenants(
    jobs: Vec<TenantJob>,
    resolver: Arc<EndpointResolver>,
    concurrency: usize,
    stop: Arc<AtomicBool>,
    tx: &UnboundedSender<HarvestEvent>,
) {
    let concurrency = concurrency.max(1);
    let mut queue = jobs.into_iter().collect::<VecDeque<_>>();
    let total = queue.len();
    let mut finished = 0usize;

    let mut set = JoinSet::new();
    loop {
        while set.len() < concurrency {
            if stop.load(Ordering::Relaxed) {
                if !queue.is_empty() {
                    info!(remaining = queue.len(), "stop requested, not starting further tenants");
                    queue.clear();
                }
                break;
            }
            let Some(job) = queue.pop_front() else {
                break;
            };
            let resolver = resolver.clone();
            set.spawn(async move { process_tenant(job, resolver).await });
        }

        if set.is_empty() {
            break;
        }

        if let Some(joined) = set.join_next().await {
            finished += 1;
            match joined {
                Ok(outcome) => {
                    debug!(host = %outcome.host, finished, total, "tenant finished");
                    let _ = tx.send(HarvestEvent::Tenant(Box::new(outcome)));
                }
                Err(err) => {
                    let _ = tx.send(HarvestEvent::Error(format!("tenant worker failed: {err}")));
                }
            }
        }
    }
}

async fn process_tenant(job: TenantJob, resolver: Arc<EndpointResolver>) -> TenantOutcome {
    let TenantJob { tenant, plan } = job;
    let reclassify = !matches!(plan, Plan::Skip);
    let harvest = resolver.harvest(&tenant, plan).await;

    let ctx = NormalizeContext {
        canonical_url: tenant.canonical_url.clone(),
        company: tenant.company.clone(),
    };
    let mut dropped = harvest.skipped_items;
    let mut records = Vec::with_capacity(harvest.jobs.len());
    for raw in harvest.jobs {
        match normalize(raw, &ctx) {
            Ok(record) => records.push(record),
            Err(err) => {
                debug!(error = %err, "record skipped");
                dropped += 1;
            }
        }
    }

    let keep_previous = harvest.interrupted && records.is_empty();
    TenantOutcome {
        host: tenant.host,
        records,
        dropped,
        failed_detail_urls: harvest.failed_detail_urls,
        strategy: (reclassify && !keep_previous).then_some(harvest.strategy),
    }
}
