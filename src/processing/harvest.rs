//! The harvest cycle orchestrator: scrape, validate, dedup, persist,
//! retire, embed.

use std::sync::Arc;
use std::time::Instant;

use futures::future;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::dedup;
use crate::models::config::AppConfig;
use crate::normalize::normalize;
use crate::processing::embedding::{run_embedding_stage, Embedder};
use crate::processing::{AdapterReport, CycleReport};
use crate::repository::{
    HarvestGuard, RepositoryError, VehicleReader, VehicleWriter,
};
use crate::scrapers::{harvest_source, SourceScraper};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("a harvest cycle is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Run one full harvest cycle over the given adapters.
///
/// Adapter failures are isolated: each source contributes whatever it
/// managed to fetch and the cycle proceeds with the rest. The database
/// lock guarantees a single cycle at a time across processes.
pub async fn run_cycle<R, E>(
    repo: &R,
    sources: Vec<(Box<dyn SourceScraper>, u32)>,
    embedder: &mut E,
    cfg: &AppConfig,
) -> Result<CycleReport, CycleError>
where
    R: VehicleReader + VehicleWriter + HarvestGuard,
    E: Embedder,
{
    if !repo.claim_harvest_lock()? {
        log::warn!("harvest cycle requested while another is running");
        return Err(CycleError::AlreadyRunning);
    }

    let result = run_cycle_locked(repo, sources, embedder, cfg).await;

    if let Err(e) = repo.release_harvest_lock() {
        log::error!("failed to release harvest lock: {e}");
    }

    result
}

async fn run_cycle_locked<R, E>(
    repo: &R,
    sources: Vec<(Box<dyn SourceScraper>, u32)>,
    embedder: &mut E,
    cfg: &AppConfig,
) -> Result<CycleReport, CycleError>
where
    R: VehicleReader + VehicleWriter + HarvestGuard,
    E: Embedder,
{
    let started = Instant::now();

    let semaphore = Arc::new(Semaphore::new(cfg.harvest.worker_pool.max(1)));
    let tasks = sources.iter().map(|(scraper, pages)| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = semaphore.acquire().await.ok();
            harvest_source(scraper.as_ref(), *pages, &cfg.harvest).await
        }
    });
    let outcomes = future::join_all(tasks).await;

    let mut adapters = Vec::with_capacity(outcomes.len());
    let mut normalized = Vec::new();
    for outcome in outcomes {
        let fetched = outcome.listings.len();
        let mut rejected = 0usize;
        for raw in &outcome.listings {
            match normalize(raw, &cfg.validation) {
                Ok(listing) => normalized.push(listing),
                Err(e) => {
                    rejected += 1;
                    log::debug!("{}: rejected listing: {e}", outcome.source_id);
                }
            }
        }
        if let Some(reason) = &outcome.failure {
            log::warn!("{}: adapter failed: {reason}", outcome.source_id);
        }
        adapters.push(AdapterReport {
            source_id: outcome.source_id,
            items_fetched: fetched,
            items_rejected: rejected,
            pages_skipped: outcome.pages_skipped,
            failure: outcome.failure,
        });
    }

    // Deactivated vehicles stay in the match set: a listing that reappears
    // after retirement merges back into its original row, which apply_merges
    // reactivates.
    let existing = repo.list_all()?;
    let plan = dedup::plan_cycle(normalized, &existing, &cfg.dedup);

    let seen_ids: Vec<i32> = plan.updates.iter().map(|update| update.id).collect();
    repo.apply_merges(&plan.updates)?;
    // Retire before inserting creates so brand-new vehicles are not counted
    // as unseen in the cycle that discovered them.
    let deactivated = repo.retire_unseen(&seen_ids, cfg.harvest.retention_cycles)?;
    repo.create_vehicles(&plan.creates)?;

    let embedding = run_embedding_stage(repo, embedder, &cfg.embedding).await?;

    let report = CycleReport {
        adapters,
        merged: plan.stats.merged,
        created: plan.stats.created,
        conflicts: plan.stats.conflicts,
        deactivated,
        embedded: embedding.embedded,
        pending: embedding.pending,
        duration_secs: started.elapsed().as_secs(),
    };

    log::info!(
        "cycle done: sources={} merged={} created={} conflicts={} deactivated={} embedded={} pending={} duration_secs={}",
        report.adapters.len(),
        report.merged,
        report.created,
        report.conflicts,
        report.deactivated,
        report.embedded,
        report.pending,
        report.duration_secs,
    );

    Ok(report)
}
