//! Bounded worker pool that drains a queue of fetch targets against one host.

use crate::config::{PipelineConfig, ScraperConfig};
use crate::errors::FetchError;
use crate::models::FetchTarget;
use crate::scraper::PageSource;
use anyhow::{Result, bail};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// The result of fetching one target.
#[derive(Debug)]
pub struct FetchOutcome {
    pub target: FetchTarget,
    pub result: Result<String, FetchError>,
}

/// Per-worker courtesy pause between consecutive requests.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub delay: Duration,
    pub jitter: Duration,
}

impl RateLimit {
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.request_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Configured delay plus a random share of the jitter.
    fn next_pause(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = rand::rng().random_range(0..=jitter_ms);
        self.delay + Duration::from_millis(extra)
    }
}

type TargetQueue = Arc<Mutex<mpsc::Receiver<FetchTarget>>>;

pub struct RateLimitedFetcher<S> {
    source: Arc<S>,
    workers: usize,
    queue_capacity: usize,
    rate: RateLimit,
}

impl<S: PageSource + 'static> RateLimitedFetcher<S> {
    pub fn new(source: Arc<S>, workers: usize, queue_capacity: usize, rate: RateLimit) -> Self {
        Self {
            source,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
            rate,
        }
    }

    pub fn from_config(source: Arc<S>, pipeline: &PipelineConfig, scraper: &ScraperConfig) -> Self {
        Self::new(
            source,
            pipeline.workers,
            pipeline.queue_capacity,
            RateLimit::from_config(scraper),
        )
    }

    /// Enqueue every target and start the workers.
    ///
    /// Scheduling more targets than the queue holds is a caller error and
    /// nothing is fetched.
    pub fn start(&self, targets: Vec<FetchTarget>) -> Result<FetchRun> {
        if targets.len() > self.queue_capacity {
            bail!(
                "{} fetch targets exceed the queue capacity of {}",
                targets.len(),
                self.queue_capacity
            );
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        for target in targets {
            if queue_tx.try_send(target).is_err() {
                bail!("fetch queue rejected a target");
            }
        }
        drop(queue_tx);

        let queue: TargetQueue = Arc::new(Mutex::new(queue_rx));
        let (out_tx, out_rx) = mpsc::channel(self.workers);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handles = (0..self.workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&self.source),
                    Arc::clone(&queue),
                    out_tx.clone(),
                    cancel_rx.clone(),
                    self.rate,
                ))
            })
            .collect();

        Ok(FetchRun {
            outcomes: out_rx,
            cancel: cancel_tx,
            handles,
            queue,
        })
    }
}

/// A started fetch run. Receive outcomes until `None`, then `finish`.
pub struct FetchRun {
    outcomes: mpsc::Receiver<FetchOutcome>,
    cancel: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    queue: TargetQueue,
}

impl FetchRun {
    pub async fn next(&mut self) -> Option<FetchOutcome> {
        self.outcomes.recv().await
    }

    /// Stop workers from taking new targets. Requests already in flight
    /// still deliver their outcome.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait for the workers and return the targets nobody picked up.
    pub async fn finish(mut self) -> Vec<FetchTarget> {
        self.outcomes.close();
        while self.outcomes.recv().await.is_some() {}

        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("fetch worker panicked: {}", e);
            }
        }

        let mut queue = self.queue.lock().await;
        let mut leftover = Vec::new();
        while let Ok(target) = queue.try_recv() {
            leftover.push(target);
        }
        leftover
    }
}

async fn worker<S: PageSource>(
    id: usize,
    source: Arc<S>,
    queue: TargetQueue,
    out: mpsc::Sender<FetchOutcome>,
    mut cancel: watch::Receiver<bool>,
    rate: RateLimit,
) {
    loop {
        if *cancel.borrow() {
            debug!("worker {}: cancelled", id);
            break;
        }

        let next = queue.lock().await.recv().await;
        let Some(target) = next else { break };

        let result = source.fetch_page(&target).await;
        match &result {
            Ok(body) => info!("worker {}: fetched {} ({} bytes)", id, target.date, body.len()),
            Err(e) => warn!("worker {}: {} failed: {}", id, target.date, e),
        }

        if out.send(FetchOutcome { target, result }).await.is_err() {
            break;
        }

        tokio::select! {
            _ = sleep(rate.next_pause()) => {}
            Ok(()) = cancel.changed() => {}
        }
    }
    debug!("worker {}: done", id);
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::scraper::schedule::ReportUrls;
    use chrono::NaiveDate;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn targets(n: usize) -> Vec<FetchTarget> {
        ReportUrls::new("http://test.local", 300)
            .targets(NaiveDate::from_ymd_opt(2021, 6, 24).unwrap(), n)
            .unwrap()
    }

    fn source_for(targets: &[FetchTarget]) -> CannedSource {
        targets
            .iter()
            .fold(CannedSource::default(), |s, t| s.page(t.date, format!("page {}", t.date)))
    }

    #[tokio::test]
    async fn test_every_target_fetched_once() {
        let targets = targets(12);
        let source = Arc::new(source_for(&targets));
        let fetcher = RateLimitedFetcher::new(Arc::clone(&source), 4, 100, no_delay());

        let mut run = fetcher.start(targets.clone()).unwrap();
        let mut seen = HashSet::new();
        while let Some(outcome) = run.next().await {
            assert_eq!(outcome.result.unwrap(), format!("page {}", outcome.target.date));
            assert!(seen.insert(outcome.target.date));
        }
        let leftover = run.finish().await;

        assert!(leftover.is_empty());
        assert_eq!(seen.len(), 12);
        assert_eq!(source.calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_queue_overflow_is_rejected() {
        let source = Arc::new(CannedSource::default());
        let fetcher = RateLimitedFetcher::new(Arc::clone(&source), 2, 3, no_delay());

        assert!(fetcher.start(targets(4)).is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_leaves_rest_of_queue_untouched() {
        let targets = targets(6);
        let source = Arc::new(CannedSource::default().failing(targets[0].date, 500));
        let fetcher = RateLimitedFetcher::new(Arc::clone(&source), 1, 100, no_delay());

        let mut run = fetcher.start(targets).unwrap();
        let first = run.next().await.unwrap();
        assert!(first.result.is_err());
        run.cancel();
        assert!(run.is_cancelled());

        let mut delivered = 1;
        while run.next().await.is_some() {
            delivered += 1;
        }
        let leftover = run.finish().await;

        assert!(leftover.len() >= 3);
        assert_eq!(delivered + leftover.len(), 6);
    }

    #[tokio::test]
    async fn test_empty_schedule() {
        let source = Arc::new(CannedSource::default());
        let fetcher = RateLimitedFetcher::new(source, 3, 10, no_delay());
        let mut run = fetcher.start(Vec::new()).unwrap();
        assert!(run.next().await.is_none());
        assert!(run.finish().await.is_empty());
    }

    #[tokio::test]
    async fn test_single_worker_pauses_between_requests() {
        let targets = targets(4);
        let source = Arc::new(source_for(&targets));
        let rate = RateLimit {
            delay: Duration::from_millis(40),
            jitter: Duration::from_millis(10),
        };
        let fetcher = RateLimitedFetcher::new(Arc::clone(&source), 1, 10, rate);

        let mut run = fetcher.start(targets).unwrap();
        while run.next().await.is_some() {}
        run.finish().await;

        let stamps = source.requested_at.lock().unwrap().clone();
        assert_eq!(stamps.len(), 4);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= rate.delay, "gap {:?}", pair[1] - pair[0]);
        }
    }

    #[test]
    fn test_pause_stays_within_jitter() {
        let rate = RateLimit {
            delay: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..50 {
            let p = rate.next_pause();
            assert!(p >= Duration::from_millis(100) && p <= Duration::from_millis(150));
        }
    }
}
