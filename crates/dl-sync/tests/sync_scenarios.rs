use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use dl_common::{DomainRecord, RowRange};
use dl_store::{GroupQuery, LogStore};
use dl_sync::{
    DomainView, LogArchive, NoopDelegate, SortField, SyncCoordinator, SyncEvent, SyncObserver,
    ViewDelegate,
};
use tokio::sync::oneshot;

/// Counts persists on top of a real store.
struct CountingArchive {
    store: LogStore,
    persists: AtomicUsize,
}

impl LogArchive for CountingArchive {
    fn persist(&self) -> Option<RowRange> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        LogArchive::persist(&self.store)
    }
    fn row_range_between(&self, from: Option<i64>, to: Option<i64>) -> Option<RowRange> {
        LogArchive::row_range_between(&self.store, from, to)
    }
    fn grouped_by_domain(&self, query: &GroupQuery) -> Vec<DomainRecord> {
        LogArchive::grouped_by_domain(&self.store, query)
    }
    fn delete_matching(&self, domain: &str, strict: bool, since: Option<i64>) -> usize {
        LogArchive::delete_matching(&self.store, domain, strict, since)
    }
    fn vacuum(&self) {
        LogArchive::vacuum(&self.store)
    }
    fn prune(&self, cutoff: i64) -> Result<usize> {
        LogArchive::prune(&self.store, cutoff)
    }
    fn reclaim(&self) -> Result<()> {
        LogArchive::reclaim(&self.store)
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<SyncEvent>>);

impl Recorder {
    fn take(&self) -> Vec<SyncEvent> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl SyncObserver for Recorder {
    fn reset(&self, range: Option<RowRange>) {
        self.0.lock().unwrap().push(SyncEvent::Reset(range));
    }
    fn insert(&self, range: RowRange) {
        self.0.lock().unwrap().push(SyncEvent::Insert(range));
    }
    fn remove(&self, range: RowRange) {
        self.0.lock().unwrap().push(SyncEvent::Remove(range));
    }
    fn partial_remove(&self, domain: &str) {
        self.0.lock().unwrap().push(SyncEvent::PartialRemove(domain.to_string()));
    }
}

#[derive(Default)]
struct DeltaLog(Mutex<Vec<String>>);

impl ViewDelegate for DeltaLog {
    fn reset(&self) {
        self.0.lock().unwrap().push("reset".into());
    }
    fn delete(&self, positions: Vec<usize>) {
        self.0.lock().unwrap().push(format!("delete {:?}", positions));
    }
    fn insert(&self, position: usize) {
        self.0.lock().unwrap().push(format!("insert {}", position));
    }
    fn update(&self, position: usize) {
        self.0.lock().unwrap().push(format!("update {}", position));
    }
    fn moved(&self, from: usize, to: usize) {
        self.0.lock().unwrap().push(format!("move {} {}", from, to));
    }
}

fn summary(view: &DomainView) -> Vec<(String, i32, i32)> {
    view.records()
        .into_iter()
        .map(|r| (r.domain, r.total, r.blocked))
        .collect()
}

fn store_with(rows: &[(&str, bool, i64)]) -> Arc<LogStore> {
    let store = Arc::new(LogStore::open_in_memory().unwrap());
    for (fqdn, blocked, ts) in rows {
        store.append_at(fqdn, *blocked, *ts).unwrap();
    }
    store
}

#[tokio::test]
async fn two_sync_requests_share_one_persist() {
    let archive = Arc::new(CountingArchive {
        store: LogStore::open_in_memory().unwrap(),
        persists: AtomicUsize::new(0),
    });
    archive.store.append_at("a.com", false, 10).unwrap();
    let coordinator = SyncCoordinator::new(archive.clone(), None, None);

    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    coordinator.sync_now(Some(Box::new(move || {
        let _ = tx1.send(());
    })));
    coordinator.sync_now(Some(Box::new(move || {
        let _ = tx2.send(());
    })));

    rx1.await.unwrap();
    rx2.await.unwrap();
    assert_eq!(archive.persists.load(Ordering::SeqCst), 1);
    assert_eq!(archive.store.archive_len().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn sync_within_a_second_is_deferred_not_dropped() {
    let archive = Arc::new(CountingArchive {
        store: LogStore::open_in_memory().unwrap(),
        persists: AtomicUsize::new(0),
    });
    let coordinator = SyncCoordinator::new(archive.clone(), None, None);
    let started = tokio::time::Instant::now();

    coordinator.sync().await;
    assert_eq!(archive.persists.load(Ordering::SeqCst), 1);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    archive.store.append_at("second.com", false, 10).unwrap();

    // both requests land in the same window and share the deferred pass
    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    let seen = archive.clone();
    coordinator.sync_now(Some(Box::new(move || {
        let _ = tx1.send(seen.store.buffer_len().unwrap());
    })));
    coordinator.sync_now(Some(Box::new(move || {
        let _ = tx2.send(());
    })));

    assert_eq!(rx1.await.unwrap(), 0);
    rx2.await.unwrap();
    assert_eq!(archive.persists.load(Ordering::SeqCst), 2);
    assert_eq!(archive.store.archive_len().unwrap(), 1);
    assert!(started.elapsed() >= dl_sync::MIN_SYNC_INTERVAL);

    // a call after the window starts right away
    tokio::time::sleep(dl_sync::MIN_SYNC_INTERVAL).await;
    let before = tokio::time::Instant::now();
    coordinator.sync().await;
    assert_eq!(archive.persists.load(Ordering::SeqCst), 3);
    assert!(before.elapsed() < dl_sync::MIN_SYNC_INTERVAL);
}

#[tokio::test]
async fn moving_earliest_inserts_then_removes_the_same_rows() {
    let store = store_with(&[
        ("a.com", false, 10),
        ("b.com", false, 20),
        ("c.com", false, 30),
        ("d.com", false, 40),
    ]);
    store.persist().unwrap();

    let coordinator = SyncCoordinator::new(store.clone(), Some(25), None);
    let recorder = Arc::new(Recorder::default());
    coordinator.subscribe(recorder.clone());
    coordinator.reload().await;
    assert_eq!(recorder.take(), vec![SyncEvent::Reset(RowRange::new(3, 4))]);

    let view = DomainView::attach(&coordinator, None, Arc::new(NoopDelegate)).await;
    view.set_sort(SortField::Name, true);
    view.idle().await;
    assert_eq!(view.records().len(), 2);

    // rows with ts in [15, 25) enter
    coordinator.set_earliest(Some(15)).await;
    assert_eq!(recorder.take(), vec![SyncEvent::Insert(RowRange::new(2, 2).unwrap())]);
    view.idle().await;
    assert_eq!(
        summary(&view),
        vec![("b.com".to_string(), 1, 0), ("c.com".to_string(), 1, 0), ("d.com".to_string(), 1, 0)]
    );
    assert_eq!(view.range(), RowRange::new(2, 4));

    // and leave again
    coordinator.set_earliest(Some(25)).await;
    assert_eq!(recorder.take(), vec![SyncEvent::Remove(RowRange::new(2, 2).unwrap())]);
    view.idle().await;
    assert_eq!(summary(&view), vec![("c.com".to_string(), 1, 0), ("d.com".to_string(), 1, 0)]);
    assert_eq!(view.range(), RowRange::new(3, 4));

    // dropping the bound entirely brings back everything below it
    coordinator.set_earliest(None).await;
    assert_eq!(recorder.take(), vec![SyncEvent::Insert(RowRange::new(1, 2).unwrap())]);
}

#[tokio::test]
async fn end_to_end_group_and_delete() {
    let store = store_with(&[
        ("a.com", false, 10),
        ("www.a.com", false, 11),
        ("a.com", false, 12),
        ("b.com", true, 13),
    ]);
    let coordinator = SyncCoordinator::new(store.clone(), None, None);
    coordinator.reload().await;
    let delegate = Arc::new(DeltaLog::default());
    let view = DomainView::attach(&coordinator, None, delegate.clone()).await;
    view.set_sort(SortField::Name, true);

    coordinator.sync().await;
    view.idle().await;

    let groups = store.grouped_by_domain(&GroupQuery::default()).unwrap();
    let groups: Vec<_> = groups.into_iter().map(|r| (r.domain, r.total, r.blocked)).collect();
    assert_eq!(groups, vec![("a.com".to_string(), 3, 0), ("b.com".to_string(), 1, 1)]);
    assert_eq!(summary(&view), groups);

    assert_eq!(coordinator.delete_matching("a.com", false, None).await, 3);
    view.idle().await;
    assert_eq!(summary(&view), vec![("b.com".to_string(), 1, 1)]);
    assert_eq!(delegate.0.lock().unwrap().last().map(String::as_str), Some("delete [0]"));
}

#[tokio::test]
async fn sort_reset_follows_pending_sync_changes() {
    let store = store_with(&[("a.com", false, 10), ("b.com", true, 11)]);
    let coordinator = SyncCoordinator::new(store.clone(), None, None);
    let delegate = Arc::new(DeltaLog::default());
    let view = DomainView::attach(&coordinator, None, delegate.clone()).await;

    // the inserts may still be queued for the worker when sorting changes
    coordinator.sync().await;
    view.set_sort(SortField::Name, true);
    view.idle().await;

    let log = delegate.0.lock().unwrap().clone();
    assert_eq!(log.len(), 4, "{:?}", log);
    assert_eq!(log[0], "reset");
    assert!(log[1].starts_with("insert") && log[2].starts_with("insert"), "{:?}", log);
    assert_eq!(log[3], "reset");
}

#[tokio::test]
async fn strict_delete_keeps_subdomains() {
    let store = store_with(&[("a.com", false, 10), ("www.a.com", false, 11), ("x.www.a.com", false, 12)]);
    let coordinator = SyncCoordinator::new(store.clone(), None, None);
    let top = DomainView::attach(&coordinator, None, Arc::new(NoopDelegate)).await;
    let drill = DomainView::attach(&coordinator, Some("a.com".into()), Arc::new(NoopDelegate)).await;
    drill.set_sort(SortField::Name, true);
    coordinator.sync().await;
    top.idle().await;
    drill.idle().await;
    assert_eq!(drill.display_count(), 3);

    assert_eq!(coordinator.delete_matching("www.a.com", true, None).await, 1);
    top.idle().await;
    drill.idle().await;
    assert_eq!(summary(&top), vec![("a.com".to_string(), 2, 0)]);
    assert_eq!(
        summary(&drill),
        vec![("a.com".to_string(), 1, 0), ("x.www.a.com".to_string(), 1, 0)]
    );
}

#[tokio::test]
async fn paused_updates_are_delivered_on_continue() {
    let store = store_with(&[]);
    let coordinator = SyncCoordinator::new(store.clone(), None, None);
    let recorder = Arc::new(Recorder::default());
    coordinator.subscribe(recorder.clone());

    let outer = coordinator.pause();
    {
        let _inner = coordinator.pause();
        store.append_at("a.com", false, 10).unwrap();
        coordinator.sync().await;
    }
    // I/O still ran, delivery did not
    assert_eq!(store.archive_len().unwrap(), 1);
    assert!(recorder.take().is_empty());
    assert!(coordinator.is_paused());

    drop(outer);
    assert_eq!(recorder.take(), vec![SyncEvent::Insert(RowRange::new(1, 1).unwrap())]);
}

#[tokio::test]
async fn view_filters_and_sorting() {
    let store = store_with(&[
        ("ads.tracker.net", true, 10),
        ("tracker.net", false, 11),
        ("example.com", false, 12),
        ("example.com", false, 13),
        ("cdn.example.org", false, 14),
    ]);
    let coordinator = SyncCoordinator::new(store.clone(), None, None);
    let view = DomainView::attach(&coordinator, None, Arc::new(NoopDelegate)).await;
    coordinator.sync().await;
    view.idle().await;

    // most queried first
    let names: Vec<String> = view.records().into_iter().map(|r| r.domain).collect();
    assert_eq!(names, vec!["tracker.net", "example.com", "example.org"]);

    view.set_search("example");
    assert_eq!(view.display_count(), 2);
    view.set_search("EXAMPLE.O");
    assert_eq!(view.display_record(0).map(|r| r.domain).as_deref(), Some("example.org"));

    view.set_search("");
    view.set_blocked_only(true);
    assert_eq!(summary(&view), vec![("tracker.net".to_string(), 2, 1)]);

    view.set_blocked_only(false);
    view.set_sort(SortField::Total, true);
    let totals: Vec<i32> = view.records().into_iter().map(|r| r.total).collect();
    assert_eq!(totals, vec![1, 2, 2]);
}

#[tokio::test]
async fn view_survives_prune_reset() {
    let now = dl_common::now_ts();
    let store = store_with(&[("old.com", false, now - 90 * 86_400), ("new.com", false, now)]);
    let coordinator = SyncCoordinator::new(store.clone(), None, None);
    let view = DomainView::attach(&coordinator, None, Arc::new(NoopDelegate)).await;
    coordinator.sync().await;
    view.idle().await;
    assert_eq!(view.display_count(), 2);

    assert_eq!(coordinator.prune(now - 30 * 86_400).await.unwrap(), 1);
    view.idle().await;
    assert_eq!(summary(&view), vec![("new.com".to_string(), 1, 0)]);
    assert_eq!(view.range(), RowRange::new(2, 2));

    drop(view);
    assert_eq!(coordinator.observer_count(), 0);
}

#[tokio::test]
async fn reopened_store_resumes_after_last_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dnslog.sqlite");
    let path = path.to_str().unwrap();

    {
        let store = Arc::new(LogStore::open(path).unwrap());
        store.append_at("a.com", false, 10).unwrap();
        store.append_at("b.com", false, 20).unwrap();
        store.persist().unwrap();
        let coordinator = SyncCoordinator::new(store.clone(), None, None);
        assert_eq!(coordinator.prune(15).await.unwrap(), 1);
    }

    let store = Arc::new(LogStore::open(path).unwrap());
    let coordinator = SyncCoordinator::new(store.clone(), None, None);
    let recorder = Arc::new(Recorder::default());
    coordinator.subscribe(recorder.clone());
    coordinator.reload().await;
    assert_eq!(recorder.take(), vec![SyncEvent::Reset(RowRange::new(2, 2))]);

    store.append_at("c.com", false, 30).unwrap();
    coordinator.sync().await;
    assert_eq!(recorder.take(), vec![SyncEvent::Insert(RowRange::new(3, 3).unwrap())]);
    assert_eq!(coordinator.visible_range().await, RowRange::new(2, 3));
}
