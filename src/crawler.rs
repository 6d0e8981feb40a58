use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::extract::{extract_doses, DoseRecord};
use crate::fetch::{report_links, report_text, FetchError, PageSource};
use crate::frontier::ReportFrontier;
use crate::ledger::{ProgressLedger, ReportStatus};
use crate::settings::{DelayRange, Settings};
use crate::store::ReportStore;

const CATEGORY_LOG_EVERY: usize = 50;
const REPORT_LOG_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub workers: usize,
    pub max_reports_per_category: usize,
    pub category_delay: DelayRange,
    pub report_delay: DelayRange,
    pub site_root: String,
    pub report_base: String,
}

impl From<&Settings> for CrawlOptions {
    fn from(s: &Settings) -> Self {
        Self {
            workers: s.workers,
            max_reports_per_category: s.max_reports_per_category,
            category_delay: s.category_delay,
            report_delay: s.report_delay,
            site_root: s.site_root.clone(),
            report_base: s.report_base.clone(),
        }
    }
}

/// What a single fetch task reports back to the result loop.
#[derive(Debug)]
enum TaskOutcome<T> {
    Finished(T),
    Failed(String),
    Blocked(String),
    /// The pool was aborted before this task touched the network.
    Cancelled,
}

impl<T> TaskOutcome<T> {
    fn from_fetch(result: Result<T, FetchError>) -> Self {
        match result {
            Ok(v) => TaskOutcome::Finished(v),
            Err(e) if e.is_blocked() => TaskOutcome::Blocked(e.to_string()),
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }
}

/// Bounded set of fetch tasks feeding one result channel. Aborting closes the
/// semaphore and raises the cancel flag; tasks already fetching run to
/// completion and still deliver their outcome.
struct WorkerPool<T> {
    rx: mpsc::Receiver<(String, TaskOutcome<T>)>,
    semaphore: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
}

impl<T: Send + 'static> WorkerPool<T> {
    fn spawn<S, F, Fut>(
        source: Arc<S>,
        urls: Vec<String>,
        workers: usize,
        delay: DelayRange,
        work: F,
    ) -> Self
    where
        S: PageSource,
        F: Fn(Arc<S>, String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = TaskOutcome<T>> + Send + 'static,
    {
        let workers = workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(workers * 2);

        for url in urls {
            let source = Arc::clone(&source);
            let sem = Arc::clone(&semaphore);
            let cancel = Arc::clone(&cancel);
            let tx = tx.clone();
            let work = work.clone();

            tokio::spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = tx.send((url, TaskOutcome::Cancelled)).await;
                        return;
                    }
                };
                if cancel.load(Ordering::Acquire) {
                    let _ = tx.send((url, TaskOutcome::Cancelled)).await;
                    return;
                }
                tokio::time::sleep(delay.sample()).await;
                if cancel.load(Ordering::Acquire) {
                    let _ = tx.send((url, TaskOutcome::Cancelled)).await;
                    return;
                }
                let outcome = work(source, url.clone()).await;
                let _ = tx.send((url, outcome)).await;
            });
        }

        // rx closes once every task has reported
        drop(tx);

        Self {
            rx,
            semaphore,
            cancel,
        }
    }

    fn abort(&self) {
        self.cancel.store(true, Ordering::Release);
        self.semaphore.close();
    }

    async fn next(&mut self) -> Option<(String, TaskOutcome<T>)> {
        self.rx.recv().await
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

async fn scan_category<S: PageSource>(
    source: Arc<S>,
    url: String,
    opts: Arc<CrawlOptions>,
) -> TaskOutcome<Vec<String>> {
    let result = source
        .fetch(&url)
        .await
        .map(|html| report_links(&html, &opts.site_root, &opts.report_base));
    TaskOutcome::from_fetch(result)
}

async fn scrape_report<S: PageSource>(source: Arc<S>, url: String) -> TaskOutcome<Vec<DoseRecord>> {
    let result = source
        .fetch(&url)
        .await
        .map(|html| extract_doses(&report_text(&html)));
    TaskOutcome::from_fetch(result)
}

#[derive(Debug, Default)]
pub struct DiscoveryStats {
    pub categories: usize,
    pub scanned: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub blocked: bool,
}

/// Fetch every category page and collect report URLs, capped per category.
/// Fetch failures count as empty pages; a block stops further dispatch.
pub async fn discover_reports<S: PageSource>(
    source: Arc<S>,
    category_urls: Vec<String>,
    opts: &CrawlOptions,
) -> (ReportFrontier, DiscoveryStats) {
    let mut stats = DiscoveryStats {
        categories: category_urls.len(),
        ..Default::default()
    };
    let mut frontier = ReportFrontier::default();
    let shared = Arc::new(opts.clone());
    let pb = progress_bar(category_urls.len());
    pb.set_message("categories");

    let mut pool = WorkerPool::spawn(
        source,
        category_urls,
        opts.workers,
        opts.category_delay,
        move |src, url| scan_category(src, url, Arc::clone(&shared)),
    );

    let mut settled = 0usize;
    while let Some((url, outcome)) = pool.next().await {
        match outcome {
            TaskOutcome::Finished(urls) => {
                frontier.merge(urls, opts.max_reports_per_category);
                stats.scanned += 1;
            }
            TaskOutcome::Failed(e) => {
                debug!("Category {} failed: {}", url, e);
                stats.failed += 1;
            }
            TaskOutcome::Blocked(reason) => {
                warn!("Category scan stopped, {}", reason);
                stats.blocked = true;
                pool.abort();
            }
            TaskOutcome::Cancelled => stats.cancelled += 1,
        }
        settled += 1;
        if settled % CATEGORY_LOG_EVERY == 0 {
            info!("Scanned {} categories...", settled);
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Category scan: {} ok, {} failed, {} cancelled, {} unique reports",
        stats.scanned,
        stats.failed,
        stats.cancelled,
        frontier.len()
    );
    (frontier, stats)
}

#[derive(Debug, Default)]
pub struct ReportStats {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub records: usize,
    pub blocked: bool,
}

/// Fetch, extract and persist each report. The result loop is the only
/// writer of both the ledger and the store.
pub async fn fetch_reports<S: PageSource>(
    source: Arc<S>,
    urls: Vec<String>,
    opts: &CrawlOptions,
    ledger: &mut ProgressLedger,
    store: &ReportStore,
) -> ReportStats {
    let mut stats = ReportStats {
        total: urls.len(),
        ..Default::default()
    };
    let pb = progress_bar(urls.len());
    pb.set_message("reports");

    let mut pool = WorkerPool::spawn(source, urls, opts.workers, opts.report_delay, scrape_report);

    let mut settled = 0usize;
    while let Some((url, outcome)) = pool.next().await {
        let status = match outcome {
            TaskOutcome::Finished(doses) => match store.save(&url, &doses) {
                Ok(_) => {
                    stats.done += 1;
                    stats.records += doses.len();
                    Some(ReportStatus::Done)
                }
                Err(e) => {
                    warn!("Failed to store result for {}: {:#}", url, e);
                    stats.failed += 1;
                    Some(ReportStatus::Failed)
                }
            },
            TaskOutcome::Failed(e) => {
                debug!("Report {} failed: {}", url, e);
                stats.failed += 1;
                Some(ReportStatus::Failed)
            }
            TaskOutcome::Blocked(reason) => {
                if !stats.blocked {
                    warn!("Report fetch stopped, {}", reason);
                }
                stats.blocked = true;
                pool.abort();
                Some(ReportStatus::FailedBlocked)
            }
            TaskOutcome::Cancelled => {
                stats.cancelled += 1;
                None
            }
        };

        if let Some(status) = status {
            if let Err(e) = ledger.record(&url, status) {
                warn!("Failed to update progress for {}: {:#}", url, e);
            }
        }

        settled += 1;
        if settled % REPORT_LOG_EVERY == 0 {
            info!("Processed {}/{} reports...", settled, stats.total);
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Report fetch: {} done, {} failed, {} cancelled, {} dose records",
        stats.done, stats.failed, stats.cancelled, stats.records
    );
    stats
}

#[derive(Debug, Default)]
pub struct CrawlSummary {
    pub discovery: DiscoveryStats,
    pub reports: ReportStats,
    pub skipped: usize,
}

impl CrawlSummary {
    pub fn blocked(&self) -> bool {
        self.discovery.blocked || self.reports.blocked
    }
}

/// Both crawl phases: discover report URLs, drop ones already done, fetch the rest.
pub async fn crawl<S: PageSource>(
    source: Arc<S>,
    category_urls: Vec<String>,
    opts: &CrawlOptions,
    ledger: &mut ProgressLedger,
    store: &ReportStore,
) -> CrawlSummary {
    let (frontier, discovery) = discover_reports(Arc::clone(&source), category_urls, opts).await;
    if discovery.blocked {
        warn!("Category scan stopped early due to a block; continuing with what was found");
    }

    if frontier.is_empty() {
        warn!("No report URLs found on {} category pages", discovery.categories);
    }

    let (pending, skipped) = frontier.pending(ledger);
    info!(
        "Skipping {} already processed reports, queued {} for scraping",
        skipped,
        pending.len()
    );

    let reports = fetch_reports(source, pending, opts, ledger, store).await;
    CrawlSummary {
        discovery,
        reports,
        skipped,
    }
}
