use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dl_common::{DomainRecord, RowRange};
use dl_index::{SortedProjectionEngine, Sorting, UpdateOutcome};
use dl_store::{GroupQuery, is_same_or_subdomain, normalize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::archive::LogArchive;
use crate::coordinator::SyncCoordinator;
use crate::observer::{SubscriptionId, SyncEvent, SyncObserver};

const SEARCH_FILTER: &str = "search";
const BLOCKED_FILTER: &str = "blocked";

/// Presentation side of a view. Positions are projection positions and are
/// reported in order, each one valid after the changes before it.
pub trait ViewDelegate: Send + Sync {
    fn reset(&self);
    fn delete(&self, positions: Vec<usize>);
    fn insert(&self, position: usize);
    fn update(&self, position: usize);
    fn moved(&self, from: usize, to: usize);
}

/// Delegate that ignores everything.
pub struct NoopDelegate;

impl ViewDelegate for NoopDelegate {
    fn reset(&self) {}
    fn delete(&self, _positions: Vec<usize>) {}
    fn insert(&self, _position: usize) {}
    fn update(&self, _position: usize) {}
    fn moved(&self, _from: usize, _to: usize) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    Reset,
    Delete(Vec<usize>),
    Insert(usize),
    Update(usize),
    Move { from: usize, to: usize },
}

impl ViewChange {
    fn notify(self, delegate: &dyn ViewDelegate) {
        match self {
            ViewChange::Reset => delegate.reset(),
            ViewChange::Delete(positions) => delegate.delete(positions),
            ViewChange::Insert(at) => delegate.insert(at),
            ViewChange::Update(at) => delegate.update(at),
            ViewChange::Move { from, to } => delegate.moved(from, to),
        }
    }
}

impl From<UpdateOutcome> for ViewChange {
    fn from(outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::InPlace(at) => ViewChange::Update(at),
            UpdateOutcome::Moved { from, to } => ViewChange::Move { from, to },
            UpdateOutcome::Inserted(at) => ViewChange::Insert(at),
            UpdateOutcome::Deleted(at) => ViewChange::Delete(vec![at]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Total,
    Blocked,
    LastModified,
}

impl SortField {
    pub fn sorting(self, ascending: bool) -> Sorting<DomainRecord> {
        match self {
            SortField::Name => {
                Sorting::new("name", ascending, |a: &DomainRecord, b: &DomainRecord| a.domain < b.domain)
            }
            SortField::Total => Sorting::by_key("total", ascending, |r: &DomainRecord| r.total),
            SortField::Blocked => Sorting::by_key("blocked", ascending, |r: &DomainRecord| r.blocked),
            SortField::LastModified => {
                Sorting::by_key("last_modified", ascending, |r: &DomainRecord| r.last_modified)
            }
        }
    }
}

struct ViewState {
    engine: SortedProjectionEngine<DomainRecord>,
    /// Group key → backing index.
    keys: HashMap<String, usize>,
    range: Option<RowRange>,
}

impl ViewState {
    fn reindex(&mut self) {
        self.keys = self
            .engine
            .backing()
            .iter()
            .enumerate()
            .map(|(i, r)| (r.domain.clone(), i))
            .collect();
    }

    fn merge(&mut self, record: DomainRecord) -> Option<ViewChange> {
        match self.keys.get(&record.domain).copied() {
            Some(at) => {
                let mut merged = self.engine.get(at)?.clone();
                merged.merge(&record);
                self.engine.update(at, merged).map(ViewChange::from)
            }
            None => {
                let at = self.engine.len();
                self.keys.insert(record.domain.clone(), at);
                self.engine.insert(record).map(ViewChange::Insert)
            }
        }
    }

    fn replace(&mut self, at: usize, record: DomainRecord) -> Option<ViewChange> {
        self.engine.update(at, record).map(ViewChange::from)
    }

    fn remove(&mut self, mut indices: Vec<usize>) -> Option<ViewChange> {
        if indices.is_empty() {
            return None;
        }
        indices.sort_unstable();
        indices.dedup();
        let positions = self.engine.remove(&indices);
        self.reindex();
        (!positions.is_empty()).then_some(ViewChange::Delete(positions))
    }
}

struct ViewInner {
    archive: Arc<dyn LogArchive>,
    parent: Option<String>,
    state: Mutex<ViewState>,
    search: Arc<Mutex<String>>,
    delegate: Arc<dyn ViewDelegate>,
    received: AtomicU64,
    applied: watch::Sender<u64>,
}

impl ViewInner {
    fn query(&self, range: RowRange) -> GroupQuery {
        GroupQuery::in_range(range).with_parent(self.parent.clone())
    }

    /// Bring the engine in line with one sync event. Archive queries run
    /// without the state lock so readers are not held up.
    fn apply(&self, event: &SyncEvent) -> Vec<ViewChange> {
        match event {
            SyncEvent::Reset(range) => {
                let records = range
                    .map(|r| self.archive.grouped_by_domain(&self.query(r)))
                    .unwrap_or_default();
                let mut state = self.state.lock().unwrap();
                state.range = *range;
                state.engine.reset(records);
                state.reindex();
                vec![ViewChange::Reset]
            }
            SyncEvent::Insert(range) => {
                let records = self.archive.grouped_by_domain(&self.query(*range));
                let mut state = self.state.lock().unwrap();
                state.range = Some(state.range.map_or(*range, |r| r.union(*range)));
                records
                    .into_iter()
                    .filter_map(|record| state.merge(record))
                    .collect()
            }
            SyncEvent::Remove(range) => {
                let records = self.archive.grouped_by_domain(&self.query(*range));
                let mut state = self.state.lock().unwrap();
                state.range = state.range.and_then(|r| r.subtract_edge(*range));

                let mut changes = Vec::new();
                let mut emptied = Vec::new();
                for record in records {
                    let Some(at) = state.keys.get(&record.domain).copied() else {
                        continue;
                    };
                    let Some(mut current) = state.engine.get(at).cloned() else {
                        continue;
                    };
                    current.subtract(&record);
                    if current.is_empty() {
                        emptied.push(at);
                    } else {
                        changes.extend(state.replace(at, current));
                    }
                }
                changes.extend(state.remove(emptied));
                changes
            }
            SyncEvent::PartialRemove(domain) => self.refresh_matching(&normalize(domain)),
        }
    }

    /// Re-query every group related to `domain` and drop the ones that are
    /// gone.
    fn refresh_matching(&self, domain: &str) -> Vec<ViewChange> {
        let (range, affected): (Option<RowRange>, Vec<String>) = {
            let state = self.state.lock().unwrap();
            let affected = state
                .engine
                .backing()
                .iter()
                .filter(|r| is_same_or_subdomain(&r.domain, domain) || is_same_or_subdomain(domain, &r.domain))
                .map(|r| r.domain.clone())
                .collect();
            (state.range, affected)
        };

        let fresh: Vec<(String, Option<DomainRecord>)> = affected
            .into_iter()
            .map(|key| {
                let record = range.and_then(|r| {
                    let query = self.query(r).with_matching(key.clone());
                    self.archive.grouped_by_domain(&query).into_iter().next()
                });
                (key, record)
            })
            .collect();

        let mut state = self.state.lock().unwrap();
        let mut changes = Vec::new();
        let mut gone = Vec::new();
        for (key, record) in fresh {
            let Some(at) = state.keys.get(&key).copied() else {
                continue;
            };
            match record {
                Some(record) if !record.is_empty() => changes.extend(state.replace(at, record)),
                _ => gone.push(at),
            }
        }
        changes.extend(state.remove(gone));
        debug!("Refreshed groups for {}: {} change(s)", domain, changes.len());
        changes
    }
}

/// Work for the view's worker, handled in arrival order.
enum ViewMsg {
    Sync(SyncEvent),
    /// Filters or sorting changed; the delegate reloads everything.
    Redisplay,
}

fn enqueue(inner: &ViewInner, tx: &mpsc::UnboundedSender<ViewMsg>, msg: ViewMsg) {
    inner.received.fetch_add(1, Ordering::SeqCst);
    if tx.send(msg).is_err() {
        // worker gone; keep the counters consistent for `idle`
        inner.applied.send_modify(|n| *n += 1);
    }
}

/// Sends coordinator events to the view's worker.
struct ViewObserver {
    inner: Arc<ViewInner>,
    tx: mpsc::UnboundedSender<ViewMsg>,
}

impl ViewObserver {
    fn forward(&self, event: SyncEvent) {
        enqueue(&self.inner, &self.tx, ViewMsg::Sync(event));
    }
}

impl SyncObserver for ViewObserver {
    fn reset(&self, range: Option<RowRange>) {
        self.forward(SyncEvent::Reset(range));
    }

    fn insert(&self, range: RowRange) {
        self.forward(SyncEvent::Insert(range));
    }

    fn remove(&self, range: RowRange) {
        self.forward(SyncEvent::Remove(range));
    }

    fn partial_remove(&self, domain: &str) {
        self.forward(SyncEvent::PartialRemove(domain.to_string()));
    }
}

async fn run_view(inner: Arc<ViewInner>, mut rx: mpsc::UnboundedReceiver<ViewMsg>) {
    while let Some(msg) = rx.recv().await {
        let event = match msg {
            ViewMsg::Sync(event) => event,
            ViewMsg::Redisplay => {
                inner.delegate.reset();
                inner.applied.send_modify(|n| *n += 1);
                continue;
            }
        };
        let worker = inner.clone();
        match tokio::task::spawn_blocking(move || worker.apply(&event)).await {
            Ok(changes) => {
                for change in changes {
                    change.notify(inner.delegate.as_ref());
                }
            }
            Err(e) => error!("View update failed: {}", e),
        }
        inner.applied.send_modify(|n| *n += 1);
    }
    debug!("View worker stopped");
}

/// Live, grouped, filtered and sorted view of the query log.
///
/// A top-level view groups by domain; a view with a `parent` drills down
/// into the fqdns logged under that domain. Sync events are applied on a
/// worker task of its own, and the delegate is told what changed. Every
/// delegate call is made from that worker.
pub struct DomainView {
    inner: Arc<ViewInner>,
    tx: mpsc::UnboundedSender<ViewMsg>,
    coordinator: SyncCoordinator,
    subscription: SubscriptionId,
}

impl DomainView {
    /// Subscribe to `coordinator` and load the current range. Sorted by
    /// total queries, most first.
    pub async fn attach(
        coordinator: &SyncCoordinator,
        parent: Option<String>,
        delegate: Arc<dyn ViewDelegate>,
    ) -> Self {
        let engine = SortedProjectionEngine::with_records(
            Vec::new(),
            Some(SortField::Total.sorting(false)),
        );
        let inner = Arc::new(ViewInner {
            archive: coordinator.archive(),
            parent: parent.map(|p| normalize(&p)),
            state: Mutex::new(ViewState {
                engine,
                keys: HashMap::new(),
                range: None,
            }),
            search: Arc::new(Mutex::new(String::new())),
            delegate,
            received: AtomicU64::new(0),
            applied: watch::Sender::new(0),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_view(inner.clone(), rx));
        let observer = Arc::new(ViewObserver {
            inner: inner.clone(),
            tx: tx.clone(),
        });
        let subscription = coordinator.attach(observer).await;

        Self {
            inner,
            tx,
            coordinator: coordinator.clone(),
            subscription,
        }
    }

    /// Wait until every event delivered so far has been applied.
    pub async fn idle(&self) {
        let target = self.inner.received.load(Ordering::SeqCst);
        let mut applied = self.inner.applied.subscribe();
        let _ = applied.wait_for(|n| *n >= target).await;
    }

    pub fn parent(&self) -> Option<&str> {
        self.inner.parent.as_deref()
    }

    pub fn range(&self) -> Option<RowRange> {
        self.inner.state.lock().unwrap().range
    }

    pub fn display_count(&self) -> usize {
        self.inner.state.lock().unwrap().engine.display_count()
    }

    pub fn display_record(&self, at: usize) -> Option<DomainRecord> {
        self.inner.state.lock().unwrap().engine.display_record(at).cloned()
    }

    /// Visible records in display order.
    pub fn records(&self) -> Vec<DomainRecord> {
        self.inner
            .state
            .lock()
            .unwrap()
            .engine
            .display_iter()
            .cloned()
            .collect()
    }

    /// Queue a full reload for the delegate behind any pending sync changes.
    fn redisplay(&self) {
        enqueue(&self.inner, &self.tx, ViewMsg::Redisplay);
    }

    /// Only show groups containing `term`. An empty term clears the search.
    pub fn set_search(&self, term: &str) {
        let term = term.trim().to_lowercase();
        *self.inner.search.lock().unwrap() = term.clone();

        {
            let mut state = self.inner.state.lock().unwrap();
            let active = state.engine.layer_selection(SEARCH_FILTER).is_some();
            match (term.is_empty(), active) {
                (true, false) => return,
                (true, true) => {
                    state.engine.remove_filter(SEARCH_FILTER);
                }
                (false, true) => {
                    state.engine.reload_filter(SEARCH_FILTER);
                }
                (false, false) => {
                    let search = self.inner.search.clone();
                    state.engine.add_filter(
                        SEARCH_FILTER,
                        Box::new(move |r: &DomainRecord| {
                            r.domain.contains(search.lock().unwrap().as_str())
                        }),
                        None,
                    );
                }
            }
        }
        self.redisplay();
    }

    /// Only show groups with at least one blocked query.
    pub fn set_blocked_only(&self, enabled: bool) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let active = state.engine.layer_selection(BLOCKED_FILTER).is_some();
            if enabled == active {
                return;
            }
            if enabled {
                // stays in front of the search layer, which is reloaded more often
                state.engine.add_filter(
                    BLOCKED_FILTER,
                    Box::new(|r: &DomainRecord| r.blocked > 0),
                    Some(SEARCH_FILTER),
                );
            } else {
                state.engine.remove_filter(BLOCKED_FILTER);
            }
        }
        self.redisplay();
    }

    pub fn set_sort(&self, field: SortField, ascending: bool) {
        self.inner
            .state
            .lock()
            .unwrap()
            .engine
            .set_sorting(Some(field.sorting(ascending)));
        self.redisplay();
    }
}

impl Drop for DomainView {
    fn drop(&mut self) {
        // drops the observer; the worker ends once our sender goes too
        self.coordinator.unsubscribe(self.subscription);
    }
}
