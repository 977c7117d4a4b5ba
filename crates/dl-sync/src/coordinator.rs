use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use dl_common::RowRange;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::archive::LogArchive;
use crate::observer::{Observers, PauseGuard, SubscriptionId, SyncEvent, SyncObserver};

/// Minimum spacing between two archive passes.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

pub type OnDone = Box<dyn FnOnce() + Send>;

/// Time bounds and the archive rows they select.
#[derive(Debug, Clone, Copy, Default)]
struct Window {
    earliest: Option<i64>,
    latest: Option<i64>,
    range: Option<RowRange>,
    // a prune deleted rows but reclaiming space after it failed
    reclaim_owed: bool,
}

#[derive(Default)]
struct RateLimit {
    /// Completion signal of the pass that is running or scheduled.
    pending: Option<watch::Receiver<bool>>,
    last_start: Option<Instant>,
}

struct Inner {
    archive: Arc<dyn LogArchive>,
    /// Also the work lock: every operation that touches the archive holds it.
    window: AsyncMutex<Window>,
    rate: Mutex<RateLimit>,
    observers: Arc<Observers>,
}

/// Keeps the archive and every subscribed view in step.
///
/// Persists the write buffer (periodically and on demand), tracks the row
/// range selected by the time bounds, and tells observers which rows entered
/// or left it. Store I/O runs on the blocking pool, one operation at a time.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(archive: Arc<dyn LogArchive>, earliest: Option<i64>, latest: Option<i64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                archive,
                window: AsyncMutex::new(Window {
                    earliest,
                    latest,
                    range: None,
                    reclaim_owed: false,
                }),
                rate: Mutex::new(RateLimit::default()),
                observers: Arc::new(Observers::default()),
            }),
        }
    }

    pub fn archive(&self) -> Arc<dyn LogArchive> {
        self.inner.archive.clone()
    }

    // ── Observers ────────────────────────────────────────────────────

    pub fn subscribe(&self, observer: Arc<dyn SyncObserver>) -> SubscriptionId {
        self.inner.observers.subscribe(observer)
    }

    /// Subscribe and hand the observer the current range as a `Reset`,
    /// with no other event slipping in between.
    pub async fn attach(&self, observer: Arc<dyn SyncObserver>) -> SubscriptionId {
        let window = self.inner.window.lock().await;
        let id = self.inner.observers.subscribe(observer.clone());
        observer.reset(window.range);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Suspend periodic syncing and event delivery until the guard drops.
    pub fn pause(&self) -> PauseGuard {
        PauseGuard::new(self.inner.observers.clone())
    }

    pub fn is_paused(&self) -> bool {
        self.inner.observers.is_paused()
    }

    // ── State ────────────────────────────────────────────────────────

    pub async fn visible_range(&self) -> Option<RowRange> {
        self.inner.window.lock().await.range
    }

    pub async fn bounds(&self) -> (Option<i64>, Option<i64>) {
        let window = self.inner.window.lock().await;
        (window.earliest, window.latest)
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Compute the visible range, announce it, and sync every `tick`.
    pub async fn start(&self, tick: Duration) -> JoinHandle<()> {
        self.reload().await;

        let this = self.clone();
        tokio::spawn(async move {
            info!("Sync task started (every {:?})", tick);
            loop {
                tokio::time::sleep(tick).await;
                if this.is_paused() {
                    debug!("Sync tick skipped while paused");
                    continue;
                }
                this.sync().await;
            }
        })
    }

    /// Recompute the visible range from the archive and emit `Reset`.
    pub async fn reload(&self) {
        let mut window = self.inner.window.lock().await;
        let (earliest, latest) = (window.earliest, window.latest);
        let range = self
            .blocking(move |archive| archive.row_range_between(earliest, latest))
            .await;
        window.range = range;
        info!("Visible range reloaded: {:?}", range);
        self.inner.observers.emit(SyncEvent::Reset(range));
    }

    /// Request a sync without waiting; `on_done` runs once it has finished.
    pub fn sync_now(&self, on_done: Option<OnDone>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.sync().await;
            if let Some(on_done) = on_done {
                on_done();
            }
        });
    }

    /// Persist the buffer and publish rows that entered the window.
    ///
    /// At most one pass starts per `MIN_SYNC_INTERVAL`. A call that finds a
    /// pass running or scheduled joins it. A call within the interval after
    /// the last pass started schedules the next pass for the end of the
    /// interval; calls arriving until then join that one. Returns once the
    /// joined or scheduled pass has finished.
    pub async fn sync(&self) {
        let mut done = {
            let mut rate = self.inner.rate.lock().unwrap();
            if let Some(pending) = rate.pending.clone() {
                debug!("Sync already pending, joining it");
                pending
            } else {
                let now = Instant::now();
                let start_at = match rate.last_start {
                    Some(last) if now < last + MIN_SYNC_INTERVAL => last + MIN_SYNC_INTERVAL,
                    _ => now,
                };
                let (tx, rx) = watch::channel(false);
                rate.pending = Some(rx.clone());
                rate.last_start = Some(start_at);

                // detached, so a dropped caller cannot cut a pass short
                let this = self.clone();
                tokio::spawn(async move {
                    if start_at > Instant::now() {
                        debug!("Sync deferred by {:?}", start_at.saturating_duration_since(Instant::now()));
                        tokio::time::sleep_until(start_at).await;
                    }
                    this.run_pass().await;
                    this.inner.rate.lock().unwrap().pending = None;
                    let _ = tx.send(true);
                });
                rx
            }
        };

        if done.wait_for(|finished| *finished).await.is_err() {
            error!("Sync pass ended abnormally");
            self.inner.rate.lock().unwrap().pending = None;
        }
    }

    async fn run_pass(&self) {
        let mut window = self.inner.window.lock().await;
        let Window {
            earliest,
            latest,
            range,
            ..
        } = *window;

        let entering = self
            .blocking(move |archive: &dyn LogArchive| -> Option<RowRange> {
                let persisted = archive.persist()?;
                if earliest.is_none() && latest.is_none() {
                    return Some(persisted);
                }
                archive
                    .row_range_between(earliest, latest)
                    .and_then(|visible| visible.intersect(persisted))
            })
            .await;

        if let Some(rows) = entering {
            window.range = Some(range.map_or(rows, |r| r.union(rows)));
            debug!("Rows {} entered the visible range", rows);
            self.inner.observers.emit(SyncEvent::Insert(rows));
        }
    }

    /// Move the lower time bound. Only the rows between the old and the new
    /// bound are looked up: `Insert` when the window grows, `Remove` when it
    /// shrinks.
    pub async fn set_earliest(&self, earliest: Option<i64>) {
        let mut window = self.inner.window.lock().await;
        let old = window.earliest;
        if old == earliest {
            return;
        }
        window.earliest = earliest;
        let latest = window.latest;

        // `None` is the lowest possible lower bound
        let widening = match (old, earliest) {
            (Some(o), Some(n)) => n < o,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let (from, to) = if widening { (earliest, old) } else { (old, earliest) };
        let to = to.map(|t| latest.map_or(t, |l| t.min(l)));

        let (delta, range) = self
            .blocking(move |archive| {
                (
                    archive.row_range_between(from, to),
                    archive.row_range_between(earliest, latest),
                )
            })
            .await;
        window.range = range;
        self.emit_delta(widening, delta);
    }

    /// Move the upper time bound; the mirror image of `set_earliest`.
    pub async fn set_latest(&self, latest: Option<i64>) {
        let mut window = self.inner.window.lock().await;
        let old = window.latest;
        if old == latest {
            return;
        }
        window.latest = latest;
        let earliest = window.earliest;

        // `None` is the highest possible upper bound
        let widening = match (old, latest) {
            (Some(o), Some(n)) => n > o,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let (from, to) = if widening { (old, latest) } else { (latest, old) };
        let from = from.map(|f| earliest.map_or(f, |e| f.max(e)));

        let (delta, range) = self
            .blocking(move |archive| {
                (
                    archive.row_range_between(from, to),
                    archive.row_range_between(earliest, latest),
                )
            })
            .await;
        window.range = range;
        self.emit_delta(widening, delta);
    }

    fn emit_delta(&self, widening: bool, delta: Option<RowRange>) {
        let Some(delta) = delta else {
            debug!("Time bound moved, no rows affected");
            return;
        };
        let event = if widening {
            SyncEvent::Insert(delta)
        } else {
            SyncEvent::Remove(delta)
        };
        self.inner.observers.emit(event);
    }

    /// Delete logged queries for `domain` (see `LogStore::delete_matching`),
    /// reclaim the space and emit `PartialRemove` if anything was deleted.
    pub async fn delete_matching(&self, domain: &str, strict: bool, since: Option<i64>) -> usize {
        let mut window = self.inner.window.lock().await;
        let (earliest, latest) = (window.earliest, window.latest);
        let target = domain.to_string();

        let (deleted, range) = self
            .blocking(move |archive| {
                let deleted = archive.delete_matching(&target, strict, since);
                if deleted == 0 {
                    return (0, None);
                }
                archive.vacuum();
                (deleted, archive.row_range_between(earliest, latest))
            })
            .await;

        if deleted > 0 {
            info!("Deleted {} logged queries for {}", deleted, domain);
            window.range = range;
            self.inner
                .observers
                .emit(SyncEvent::PartialRemove(domain.to_string()));
        }
        deleted
    }

    /// Drop archive rows older than `cutoff` and reclaim the space. Observers
    /// get a `Reset` when rows were deleted. Errors from either step are
    /// returned so the caller can retry; a failed reclaim is attempted again
    /// on the next prune even when nothing new is deleted.
    pub async fn prune(&self, cutoff: i64) -> Result<usize> {
        let mut window = self.inner.window.lock().await;
        let (earliest, latest, owed) = (window.earliest, window.latest, window.reclaim_owed);

        let (deleted, reclaimed, range) = self
            .try_blocking(move |archive: &dyn LogArchive| -> Result<(usize, Result<()>, Option<RowRange>)> {
                let deleted = archive.prune(cutoff)?;
                if deleted == 0 && !owed {
                    return Ok((0, Ok(()), None));
                }
                let reclaimed = archive.reclaim();
                Ok((deleted, reclaimed, archive.row_range_between(earliest, latest)))
            })
            .await??;

        if deleted > 0 {
            info!("Pruned {} archived queries older than {}", deleted, cutoff);
            window.range = range;
            self.inner.observers.emit(SyncEvent::Reset(range));
        }
        window.reclaim_owed = reclaimed.is_err();
        reclaimed.context("Reclaiming space after prune failed")?;
        Ok(deleted)
    }

    async fn try_blocking<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn LogArchive) -> R + Send + 'static,
    {
        let archive = self.inner.archive.clone();
        Ok(tokio::task::spawn_blocking(move || f(archive.as_ref())).await?)
    }

    async fn blocking<R, F>(&self, f: F) -> R
    where
        R: Default + Send + 'static,
        F: FnOnce(&dyn LogArchive) -> R + Send + 'static,
    {
        self.try_blocking(f).await.unwrap_or_else(|e| {
            error!("Archive task failed: {}", e);
            R::default()
        })
    }
}
