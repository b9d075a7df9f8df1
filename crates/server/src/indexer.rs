// crates/server/src/indexer.rs
//! Transcript indexer: initial scan, live watch, one serialized worker.
//!
//! All parse-and-upsert jobs flow through a single consumer so writes never
//! contend. The "is monitoring" state is not a boolean anyone sets: it is
//! the existence of the watcher subscription handle, installed
//! synchronously before `start` returns.

use hindsight_core::{parse_transcript, ErrorClass, ParseError};
use hindsight_db::indexer::{diff_against_state, scan_transcripts};
use hindsight_db::Store;
use notify::Watcher;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded job queue; submission blocks when full.
const JOB_QUEUE_CAPACITY: usize = 1024;
const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(1);
/// How often the store generation is polled for post-recovery re-scans.
const GENERATION_POLL: Duration = Duration::from_secs(5);

/// Progress counters surfaced to the CLI and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerProgress {
    pub files_discovered: usize,
    pub files_processed: usize,
    pub conversations_indexed: usize,
    pub files_failed: usize,
}

/// The indexer: one watcher, one queue, one consumer.
pub struct TranscriptIndexer {
    store: Store,
    transcripts_dir: PathBuf,
    jobs: mpsc::Sender<PathBuf>,
    inflight: Arc<Mutex<HashSet<PathBuf>>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    progress_tx: watch::Sender<IndexerProgress>,
    shutdown: CancellationToken,
}

impl TranscriptIndexer {
    /// Start the worker, subscribe the watcher, and kick off the initial
    /// scan. When this returns Ok, monitoring is active — not later, not
    /// from a deferred continuation.
    pub async fn start(
        store: Store,
        transcripts_dir: PathBuf,
    ) -> Result<Arc<Self>, notify::Error> {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let (progress_tx, _) = watch::channel(IndexerProgress::default());

        let indexer = Arc::new(Self {
            store,
            transcripts_dir: transcripts_dir.clone(),
            jobs: jobs_tx,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            watcher: Mutex::new(None),
            progress_tx,
            shutdown: CancellationToken::new(),
        });

        // Single consumer for all parse-and-upsert jobs.
        tokio::spawn(Self::worker_loop(indexer.clone(), jobs_rx));

        // Watcher events hop through an unbounded forwarder: the notify
        // callback thread never blocks, the pump applies the bounded
        // queue's back-pressure.
        let (event_tx, event_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                let Ok(event) = result else { return };
                let relevant = matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                );
                if !relevant {
                    return;
                }
                for path in event.paths {
                    if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                        let _ = event_tx.send(path);
                    }
                }
            })?;
        watcher.watch(&transcripts_dir, notify::RecursiveMode::Recursive)?;

        // The subscription is live; holding the handle IS the flag.
        if let Ok(mut slot) = indexer.watcher.lock() {
            *slot = Some(watcher);
        }

        tokio::spawn(Self::event_pump(indexer.clone(), event_rx));
        tokio::spawn(Self::run_initial_scan(indexer.clone()));
        tokio::spawn(Self::generation_watch(indexer.clone()));

        info!(dir = %transcripts_dir.display(), "transcript indexer monitoring");
        Ok(indexer)
    }

    /// True iff the OS filesystem subscription is active.
    pub fn is_monitoring(&self) -> bool {
        self.watcher
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn progress(&self) -> watch::Receiver<IndexerProgress> {
        self.progress_tx.subscribe()
    }

    /// Drop the subscription and stop the workers.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.watcher.lock() {
            slot.take();
        }
        self.shutdown.cancel();
    }

    /// Submit one file for (re-)indexing; deduplicates against in-flight
    /// work and blocks when the queue is full.
    pub async fn enqueue(&self, path: PathBuf) {
        {
            let Ok(mut inflight) = self.inflight.lock() else {
                return;
            };
            // Add-before-enqueue: a second event for the same path while
            // queued is a no-op.
            if !inflight.insert(path.clone()) {
                return;
            }
        }
        if self.jobs.send(path.clone()).await.is_err() {
            if let Ok(mut inflight) = self.inflight.lock() {
                inflight.remove(&path);
            }
        }
    }

    async fn event_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PathBuf>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(path) = event else { break };
                    self.enqueue(path).await;
                }
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, mut jobs: mpsc::Receiver<PathBuf>) {
        loop {
            let path = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(path) => path,
                    None => break,
                },
            };

            let outcome = self.process_file(&path).await;
            if let Ok(mut inflight) = self.inflight.lock() {
                inflight.remove(&path);
            }

            self.progress_tx.send_modify(|p| {
                p.files_processed += 1;
                match outcome {
                    Ok(()) => p.conversations_indexed += 1,
                    Err(()) => p.files_failed += 1,
                }
            });
        }
        debug!("indexer worker stopped");
    }

    /// Parse and store one file, retrying transient failures with backoff.
    /// The flat Err means "recorded as failed"; the queue moves on either way.
    async fn process_file(&self, path: &Path) -> Result<(), ()> {
        let mut attempt = 0u32;
        loop {
            match self.parse_and_store(path).await {
                Ok(()) => return Ok(()),
                Err(class) if class.is_retryable() && attempt < MAX_RETRIES => {
                    let backoff = RETRY_BASE * 2u32.saturating_pow(attempt);
                    warn!(file = ?path, attempt, "transient indexing failure, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(class) => {
                    warn!(file = ?path, class = %class, "file not indexed");
                    return Err(());
                }
            }
        }
    }

    async fn parse_and_store(&self, path: &Path) -> Result<(), ErrorClass> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ParseError::io(path, e).class())?;
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let parsed = parse_transcript(path).await.map_err(|e| e.class())?;
        if parsed.skipped_lines > 0 {
            debug!(file = ?path, skipped = parsed.skipped_lines, "tolerated undecodable lines");
        }

        let session_id = parsed.conversation.session_id.clone();
        self.store
            .index_transcript(parsed.conversation, parsed.messages)
            .await
            .map_err(|e| e.class())?;
        self.store
            .put_indexer_state(
                &path.to_string_lossy(),
                metadata.len() as i64,
                modified_at,
            )
            .await
            .map_err(|e| e.class())?;

        debug!(file = ?path, session = %session_id, "indexed");
        Ok(())
    }

    async fn run_initial_scan(self: Arc<Self>) {
        let scan = scan_transcripts(&self.transcripts_dir).await;
        let states = match self.store.indexer_states().await {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "could not load indexer state, re-indexing everything");
                Default::default()
            }
        };
        let diff = diff_against_state(&scan.files, &states);

        self.progress_tx.send_modify(|p| {
            p.files_discovered = scan.files.len();
            p.files_processed += diff.unchanged;
            p.conversations_indexed += diff.unchanged;
        });

        info!(
            discovered = scan.files.len(),
            changed = diff.changed.len(),
            unchanged = diff.unchanged,
            deleted = diff.deleted.len(),
            "initial transcript scan"
        );

        if !diff.deleted.is_empty() {
            let _ = self.store.remove_indexer_states(diff.deleted).await;
        }
        for file in diff.changed {
            self.enqueue(file.path).await;
        }
    }

    /// A recreated database file (generation bump) invalidates everything
    /// we thought was indexed: run a full re-scan.
    async fn generation_watch(self: Arc<Self>) {
        let mut last = self.store.generation();
        let mut ticker = tokio::time::interval(GENERATION_POLL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let current = self.store.generation();
                    if current != last {
                        warn!("store was recreated, scheduling full re-scan");
                        last = current;
                        self.clone().run_initial_scan().await;
                    }
                }
            }
        }
    }
}
