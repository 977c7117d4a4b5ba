use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::normalize;
use crate::store::{BufferedQuery, LogStore};

const MAX_BATCH: usize = 100;

/// Non-blocking write path into the query buffer.
///
/// Handles are cheap to clone. Queries are batched by a background task
/// (up to 100 or every `flush_interval`) and inserted into SQLite.
#[derive(Clone)]
pub struct QueryLogger {
    sender: mpsc::UnboundedSender<Command>,
}

enum Command {
    Log(BufferedQuery),
    /// Write out the current batch, then acknowledge.
    Flush(oneshot::Sender<()>),
}

impl QueryLogger {
    /// Spawn the capture task. It exits, after a final flush, once every
    /// logger handle has been dropped.
    pub fn spawn(store: Arc<LogStore>, flush_interval: Duration) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_capture(store, receiver, flush_interval));
        (Self { sender }, handle)
    }

    pub fn log(&self, fqdn: &str, blocked: bool) {
        self.enqueue(BufferedQuery::new(normalize(fqdn), blocked));
    }

    pub fn log_at(&self, fqdn: &str, blocked: bool, ts: i64) {
        self.enqueue(BufferedQuery {
            ts,
            fqdn: normalize(fqdn),
            blocked,
        });
    }

    /// Resolves once everything logged before the call is in the buffer.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn enqueue(&self, query: BufferedQuery) {
        // Skip reverse DNS lookups
        if query.fqdn.ends_with(".in-addr.arpa") || query.fqdn.ends_with(".ip6.arpa") {
            return;
        }
        if self.sender.send(Command::Log(query)).is_err() {
            debug!("Query log channel closed");
        }
    }
}

async fn run_capture(
    store: Arc<LogStore>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    flush_interval: Duration,
) {
    info!("Query capture started");
    let mut batch: Vec<BufferedQuery> = Vec::new();

    // Fixed cadence, so a steady trickle of queries cannot postpone the flush
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(Command::Log(query)) => {
                        batch.push(query);
                        if batch.len() >= MAX_BATCH {
                            flush_batch(&store, &mut batch);
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        if !batch.is_empty() {
                            flush_batch(&store, &mut batch);
                        }
                        let _ = ack.send(());
                    }
                    None => {
                        info!("Query log channel closed, stopping capture");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush_batch(&store, &mut batch);
                }
            }
        }
    }

    // Flush remaining queries
    if !batch.is_empty() {
        flush_batch(&store, &mut batch);
    }
}

fn flush_batch(store: &LogStore, batch: &mut Vec<BufferedQuery>) {
    let queries: Vec<BufferedQuery> = batch.drain(..).collect();
    if let Err(e) = store.append_batch(&queries) {
        warn!("Failed to insert query batch: {}", e);
    } else {
        debug!("Buffered {} queries", queries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logger_flushes_on_close() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let (logger, handle) = QueryLogger::spawn(store.clone(), Duration::from_secs(60));

        logger.log("Example.com.", false);
        logger.log_at("ads.example.com", true, 42);
        logger.log("1.0.168.192.in-addr.arpa", false);
        drop(logger);
        handle.await.unwrap();

        assert_eq!(store.buffer_len().unwrap(), 2);
        let range = store.persist().unwrap().unwrap();
        assert_eq!(range.len(), 2);
    }

    #[tokio::test]
    async fn test_logger_flushes_full_batches() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let (logger, handle) = QueryLogger::spawn(store.clone(), Duration::from_secs(60));

        let clone = logger.clone();
        for i in 0..(MAX_BATCH + 5) {
            clone.log(&format!("host{}.example.com", i), false);
        }
        drop(clone);
        drop(logger);
        handle.await.unwrap();

        assert_eq!(store.buffer_len().unwrap(), MAX_BATCH + 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickle_is_flushed_on_interval() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let (logger, _handle) = QueryLogger::spawn(store.clone(), Duration::from_secs(10));

        // one query every four seconds, well short of a full batch
        for i in 0..3 {
            logger.log(&format!("host{}.example.com", i), false);
            tokio::time::sleep(Duration::from_secs(4)).await;
        }
        assert_eq!(store.buffer_len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let (logger, _handle) = QueryLogger::spawn(store.clone(), Duration::from_secs(3600));

        logger.log("a.com", false);
        logger.log("b.com", true);
        logger.flush().await;
        assert_eq!(store.buffer_len().unwrap(), 2);

        // nothing pending is fine too
        logger.flush().await;
        assert_eq!(store.buffer_len().unwrap(), 2);
    }
}
