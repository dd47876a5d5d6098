//! Log stream multiplexing
//!
//! One tail task per running application reads the runtime's log stream into
//! a bounded ring buffer and a broadcast channel. Subscribers get a replay from
//! the buffer followed by live entries. A subscriber that falls more than the
//! channel capacity behind loses entries (visible as a sequence gap) instead
//! of slowing the tail or anyone else.

use crate::application::{AppId, LogEntry};
use crate::config::LogConfig;
use crate::errors::{CradleError, Result};
use crate::observability::logs_span;
use crate::runtime::{LogLine, LogLines};
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
    subscriber_capacity: usize,
    /// `None` once the log stream has ended
    sender: Option<broadcast::Sender<LogEntry>>,
}

/// Ring buffer and fan-out channel for one container start
struct AppLog {
    buffer: Mutex<LogBuffer>,
}

impl AppLog {
    fn new(config: &LogConfig) -> Self {
        let (sender, _) = broadcast::channel(config.subscriber_capacity);
        Self {
            buffer: Mutex::new(LogBuffer {
                entries: VecDeque::with_capacity(config.buffer_capacity),
                capacity: config.buffer_capacity,
                next_seq: 1,
                subscriber_capacity: config.subscriber_capacity,
                sender: Some(sender),
            }),
        }
    }

    fn push(&self, line: LogLine) -> u64 {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = LogEntry {
            seq: buffer.next_seq,
            timestamp: line.timestamp.unwrap_or_else(Utc::now),
            stream: line.stream,
            payload: line.payload,
        };
        buffer.next_seq += 1;
        if buffer.entries.len() == buffer.capacity {
            buffer.entries.pop_front();
        }
        buffer.entries.push_back(entry.clone());
        if let Some(sender) = &buffer.sender {
            // No subscribers is not an error
            let _ = sender.send(entry);
        }
        buffer.next_seq - 1
    }

    /// End of stream: live subscribers drain what they have, then see `None`
    fn close(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender = None;
    }

    fn subscribe(&self, from_seq: u64) -> LogSubscription {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let replay: VecDeque<LogEntry> = buffer
            .entries
            .iter()
            .filter(|entry| entry.seq >= from_seq)
            .cloned()
            .collect();
        let receiver = match &buffer.sender {
            Some(sender) => sender.subscribe(),
            // Already closed: replay only
            None => broadcast::channel(buffer.subscriber_capacity.max(1)).1,
        };
        LogSubscription {
            replay,
            receiver,
            next_seq: from_seq,
        }
    }

    fn latest_seq(&self) -> Option<u64> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.entries.back().map(|entry| entry.seq)
    }
}

/// Replay followed by live entries
///
/// Entries arrive in sequence order; a jump in `seq` means entries were
/// dropped for this subscriber.
pub struct LogSubscription {
    replay: VecDeque<LogEntry>,
    receiver: broadcast::Receiver<LogEntry>,
    /// Lowest sequence number still wanted
    next_seq: u64,
}

impl LogSubscription {
    /// Next entry, or `None` once the container's log stream is discarded
    pub async fn next(&mut self) -> Option<LogEntry> {
        if let Some(entry) = self.replay.pop_front() {
            self.next_seq = entry.seq + 1;
            return Some(entry);
        }
        loop {
            match self.receiver.recv().await {
                Ok(entry) if entry.seq < self.next_seq => continue,
                Ok(entry) => {
                    self.next_seq = entry.seq + 1;
                    return Some(entry);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Log subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct Tail {
    log: Arc<AppLog>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-application log buffers and their tail tasks
pub struct LogMultiplexer {
    config: LogConfig,
    tails: Mutex<HashMap<AppId, Tail>>,
}

impl LogMultiplexer {
    pub fn new(config: LogConfig) -> Self {
        Self {
            config,
            tails: Mutex::new(HashMap::new()),
        }
    }

    /// Start tailing `lines` into a fresh buffer; sequence numbers restart at 1
    pub fn attach(&self, app_id: &AppId, container_id: &str, mut lines: LogLines) {
        self.detach(app_id);

        let log = Arc::new(AppLog::new(&self.config));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let log = Arc::clone(&log);
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = lines.next() => match next {
                            Some(Ok(line)) => {
                                log.push(line);
                            }
                            Some(Err(e)) => {
                                warn!("Log stream failed: {}", e);
                                break;
                            }
                            None => {
                                debug!("Log stream ended");
                                break;
                            }
                        },
                    }
                }
                log.close();
            }
            .instrument(logs_span(app_id.as_str(), container_id))
        });

        self.tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app_id.clone(), Tail { log, cancel, task });
    }

    /// Stop the tail and discard the buffer; subscribers see the end of stream
    pub fn detach(&self, app_id: &AppId) {
        let tail = self
            .tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app_id);
        if let Some(tail) = tail {
            tail.cancel.cancel();
            tail.task.abort();
            tail.log.close();
            debug!("Detached log tail for {}", app_id);
        }
    }

    /// A tail exists and its stream has not ended
    pub fn is_attached(&self, app_id: &AppId) -> bool {
        self.tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .map_or(false, |tail| !tail.task.is_finished())
    }

    /// Subscribe from `from_seq` (1 = oldest available)
    pub fn subscribe(&self, app_id: &AppId, from_seq: u64) -> Result<LogSubscription> {
        let tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        let tail = tails
            .get(app_id)
            .ok_or_else(|| CradleError::ContainerUnavailable {
                app_id: app_id.to_string(),
                message: "logs are only available while the application is running".to_string(),
            })?;
        Ok(tail.log.subscribe(from_seq))
    }

    /// Sequence number of the newest buffered entry
    pub fn latest_seq(&self, app_id: &AppId) -> Option<u64> {
        let tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        tails.get(app_id).and_then(|tail| tail.log.latest_seq())
    }
}

impl Drop for LogMultiplexer {
    fn drop(&mut self) {
        let tails = self.tails.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, tail) in tails.drain() {
            tail.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::LogStream;
    use std::time::Duration;

    fn line(payload: &str) -> LogLine {
        LogLine {
            stream: LogStream::Stdout,
            timestamp: None,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn config(buffer_capacity: usize, subscriber_capacity: usize) -> LogConfig {
        LogConfig {
            buffer_capacity,
            subscriber_capacity,
        }
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let log = AppLog::new(&config(46, 64));
        for i in 1..=50 {
            log.push(line(&format!("line {}", i)));
        }
        // Buffer now holds 5..=50
        let mut subscription = log.subscribe(10);
        for expected in 10..=50 {
            assert_eq!(subscription.next().await.unwrap().seq, expected);
        }
        log.push(line("line 51"));
        let live = subscription.next().await.unwrap();
        assert_eq!(live.seq, 51);
        assert_eq!(live.payload, b"line 51");
    }

    #[tokio::test]
    async fn test_request_older_than_buffer_starts_at_oldest() {
        let log = AppLog::new(&config(3, 8));
        for i in 1..=5 {
            log.push(line(&i.to_string()));
        }
        let mut subscription = log.subscribe(1);
        assert_eq!(subscription.next().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_gap_without_blocking() {
        let log = AppLog::new(&config(100, 4));
        let mut slow = log.subscribe(1);
        for i in 1..=20 {
            log.push(line(&i.to_string()));
        }
        let first = slow.next().await.unwrap();
        assert!(first.seq > 1, "expected a gap, got {}", first.seq);
        let second = slow.next().await.unwrap();
        assert_eq!(second.seq, first.seq + 1);

        let mut fresh = log.subscribe(1);
        assert_eq!(fresh.next().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_finished_stream_ends_subscriptions() {
        let mux = LogMultiplexer::new(config(10, 10));
        let app = AppId::from("app1");
        let stream = futures::stream::iter(vec![Ok(line("a")), Ok(line("b"))]).boxed();
        mux.attach(&app, "c1", stream);
        let mut early = mux.subscribe(&app, 1).unwrap();

        let mut finished = false;
        for _ in 0..100 {
            if !mux.is_attached(&app) {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished, "tail still attached after its stream ended");

        // Subscribers before and after the end both drain the buffer, then end
        let mut late = mux.subscribe(&app, 1).unwrap();
        for subscription in [&mut early, &mut late] {
            let mut seqs = Vec::new();
            while let Some(entry) = tokio::time::timeout(Duration::from_secs(1), subscription.next())
                .await
                .unwrap()
            {
                seqs.push(entry.seq);
            }
            assert_eq!(seqs, vec![1, 2]);
        }
        assert_eq!(mux.latest_seq(&app), Some(2));
    }

    #[tokio::test]
    async fn test_attach_detach_resets_sequence() {
        let mux = LogMultiplexer::new(config(10, 10));
        let app = AppId::from("app1");
        assert!(mux.subscribe(&app, 1).is_err());

        let stream = futures::stream::iter(vec![Ok(line("a")), Ok(line("b"))]).boxed();
        mux.attach(&app, "c1", stream);
        let mut subscription = mux.subscribe(&app, 1).unwrap();
        assert_eq!(subscription.next().await.unwrap().seq, 1);
        assert_eq!(subscription.next().await.unwrap().seq, 2);

        mux.detach(&app);
        let next = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(!mux.is_attached(&app));

        let stream = futures::stream::iter(vec![Ok(line("c"))]).boxed();
        mux.attach(&app, "c2", stream);
        let mut subscription = mux.subscribe(&app, 1).unwrap();
        let entry = subscription.next().await.unwrap();
        assert_eq!(entry.seq, 1);
        assert_eq!(entry.payload, b"c");
    }
}
