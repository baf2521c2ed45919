//! Submission through scan, against the in-memory broker, store and content source.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use filescan_core::models::{FileId, FileRecord, FileStatus, Verdict};
use filescan_core::ScanConfig;
use filescan_db::{FileRecordStore, InMemoryFileRepository};
use filescan_services::{InMemoryContentFetcher, KeywordClassifier};
use filescan_worker::{
    ChannelManager, Connector, ConsumerStats, FileSubmission, MemoryBroker, PublisherConfig,
    QueueTopology, ScanPublisher, ScanWorker,
};

struct Pipeline {
    config: ScanConfig,
    broker: MemoryBroker,
    store: InMemoryFileRepository,
    content: InMemoryContentFetcher,
}

struct RunningWorker {
    stats: Arc<ConsumerStats>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningWorker {
    async fn settled(&self, count: u64) {
        while self.stats.settled() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) -> Arc<ConsumerStats> {
        self.shutdown.cancel();
        self.handle.await.unwrap();
        self.stats
    }
}

impl Pipeline {
    fn new() -> Self {
        Self::with_config(ScanConfig::default())
    }

    fn with_config(config: ScanConfig) -> Self {
        Self {
            config,
            broker: MemoryBroker::new(),
            store: InMemoryFileRepository::new(),
            content: InMemoryContentFetcher::new(),
        }
    }

    fn queue(&self) -> &str {
        &self.config.queue_name
    }

    fn pending(&self, id: &str, locator: &str) -> FileId {
        let id = FileId::new(id);
        self.store
            .insert(FileRecord::new_pending(id.clone(), "upload", locator));
        id
    }

    fn channels(&self) -> Arc<ChannelManager> {
        Arc::new(ChannelManager::new(
            Arc::new(self.broker.connector()),
            QueueTopology::from(&self.config),
        ))
    }

    /// The publishing side, with its own connection to the broker.
    fn publisher(&self) -> ScanPublisher {
        ScanPublisher::new(self.channels(), PublisherConfig::from(&self.config))
    }

    fn start_worker(&self) -> RunningWorker {
        let worker = ScanWorker::new(
            &self.config,
            Arc::new(self.broker.connector()),
            Arc::new(self.store.clone()),
            Arc::new(self.content.clone()),
            Arc::new(KeywordClassifier::default()),
        );
        let stats = worker.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });
        RunningWorker {
            stats,
            shutdown,
            handle,
        }
    }

    async fn record(&self, id: &FileId) -> FileRecord {
        self.store.get(id).await.unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn infected_and_clean_files_are_recorded() {
    let p = Pipeline::new();
    let f1 = p.pending("f1", "http://x/doc.pdf");
    let f2 = p.pending("f2", "http://x/clean.pdf");
    p.content.serve("http://x/doc.pdf", "<script>eval(atob(payload))</script>");
    p.content.serve("http://x/clean.pdf", "Quarterly report, nothing to see");

    let publisher = p.publisher();
    publisher.enqueue(&f1, "http://x/doc.pdf").await.unwrap();
    publisher.enqueue(&f2, "http://x/clean.pdf").await.unwrap();

    let worker = p.start_worker();
    worker.settled(2).await;
    let stats = worker.stop().await;

    assert_eq!(stats.acked(), 2);
    let infected = p.record(&f1).await;
    assert_eq!(infected.status, FileStatus::Scanned);
    assert_eq!(infected.result, Some(Verdict::Infected));
    assert!(infected.scanned_at.is_some());

    let clean = p.record(&f2).await;
    assert_eq!(clean.status, FileStatus::Scanned);
    assert_eq!(clean.result, Some(Verdict::Clean));
    assert!(clean.scanned_at.is_some());

    assert_eq!(p.broker.queue_len(p.queue()), 0);
    assert_eq!(p.broker.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn poison_message_does_not_block_the_queue() {
    let p = Pipeline::new();
    let f1 = p.pending("f1", "http://x/doc.pdf");
    p.content.serve("http://x/doc.pdf", "plain text");

    // Queue garbage ahead of a real request.
    let publisher = p.publisher();
    p.channels().channel().await.unwrap();
    p.broker.push_raw(p.queue(), b"{not json").unwrap();
    publisher.enqueue(&f1, "http://x/doc.pdf").await.unwrap();

    let worker = p.start_worker();
    worker.settled(2).await;
    let stats = worker.stop().await;

    assert_eq!(stats.rejected(), 1);
    assert_eq!(stats.acked(), 1);
    assert_eq!(p.record(&f1).await.result, Some(Verdict::Clean));
    let dead = p.config.dead_letter_queue.clone().unwrap();
    assert_eq!(p.broker.messages(&dead), vec![b"{not json".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_content_fails_open_after_the_timeout() {
    let p = Pipeline::new();
    let f1 = p.pending("f1", "http://x/slow.pdf");
    p.content.hang("http://x/slow.pdf");
    p.publisher().enqueue(&f1, "http://x/slow.pdf").await.unwrap();

    let start = tokio::time::Instant::now();
    let worker = p.start_worker();
    worker.settled(1).await;
    worker.stop().await;

    assert!(start.elapsed() >= p.config.fetch_timeout());
    let record = p.record(&f1).await;
    assert_eq!(record.status, FileStatus::Scanned);
    assert_eq!(record.result, Some(Verdict::Clean));
}

#[tokio::test(start_paused = true)]
async fn message_held_by_a_crashed_worker_is_redelivered_once_scanned() {
    let p = Pipeline::new();
    let f1 = p.pending("f1", "http://x/doc.pdf");
    p.content.serve("http://x/doc.pdf", "rm -rf / --no-preserve-root");
    let publisher = p.publisher();
    publisher.enqueue(&f1, "http://x/doc.pdf").await.unwrap();

    // A worker takes the message and dies before acknowledging it.
    let crashed = p.broker.connector().connect().await.unwrap();
    let taken = crashed.next_delivery(p.queue()).await.unwrap().unwrap();
    assert!(!taken.redelivered);
    assert_eq!(p.broker.queue_len(p.queue()), 0);
    crashed.close().await.unwrap();
    assert_eq!(p.broker.queue_len(p.queue()), 1);

    // A duplicate request for the same file arrives as well.
    publisher.enqueue(&f1, "http://x/doc.pdf").await.unwrap();

    let worker = p.start_worker();
    worker.settled(2).await;
    let stats = worker.stop().await;

    assert_eq!(stats.acked(), 2);
    let record = p.record(&f1).await;
    assert_eq!(record.status, FileStatus::Scanned);
    assert_eq!(record.result, Some(Verdict::Infected));
    assert_eq!(p.content.fetch_count("http://x/doc.pdf"), 1);
}

#[tokio::test(start_paused = true)]
async fn worker_resumes_after_broker_restart() {
    let p = Pipeline::new();
    let f1 = p.pending("f1", "http://x/a.pdf");
    let f2 = p.pending("f2", "http://x/b.pdf");
    p.content.serve("http://x/a.pdf", "hello");
    p.content.serve("http://x/b.pdf", "buy bitcoin now");

    let worker = p.start_worker();
    let publisher = p.publisher();
    publisher.enqueue(&f1, "http://x/a.pdf").await.unwrap();
    worker.settled(1).await;

    p.broker.restart();
    publisher.enqueue(&f2, "http://x/b.pdf").await.unwrap();
    worker.settled(2).await;
    let stats = worker.stop().await;

    assert_eq!(stats.acked(), 2);
    // Worker and publisher each opened a second connection after the restart.
    assert!(p.broker.connections_opened() >= 4);
    assert_eq!(p.record(&f1).await.result, Some(Verdict::Clean));
    assert_eq!(p.record(&f2).await.result, Some(Verdict::Infected));
}

#[tokio::test(start_paused = true)]
async fn submitted_files_end_in_a_consistent_state() {
    let p = Pipeline::new();
    let submission = FileSubmission::new(Arc::new(p.store.clone()), p.publisher());
    p.content.serve("http://x/1", "plain");
    p.content.serve("http://x/2", "EVAL(x)");

    let first = submission.submit("one.txt", "http://x/1").await.unwrap();
    let second = submission.submit("two.txt", "http://x/2").await.unwrap();

    // Publishing gives up for the third file; it never reaches the queue.
    p.broker.set_reachable(false);
    let third = submission.submit("three.txt", "http://x/3").await.unwrap();
    assert_eq!(third.status, FileStatus::Failed);
    p.broker.set_reachable(true);

    let worker = p.start_worker();
    worker.settled(2).await;
    worker.stop().await;

    let records = p.store.snapshot();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(FileRecord::is_consistent));
    assert_eq!(p.record(&first.id).await.result, Some(Verdict::Clean));
    assert_eq!(p.record(&second.id).await.result, Some(Verdict::Infected));
    let failed = p.record(&third.id).await;
    assert_eq!(failed.status, FileStatus::Failed);
    assert_eq!(failed.result, None);
}
