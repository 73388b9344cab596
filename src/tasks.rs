use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, Id, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{Aria2Client, watch_events};
use crate::lifecycle::LifecycleController;
use crate::progress::ProgressReporter;

const EVENT_BUFFER: usize = 64;

/// Spawns the engine watcher, the lifecycle dispatcher and the progress loop.
/// Cancelling the returned token stops the progress loop.
pub fn start_background_tasks(
    client: Aria2Client,
    poll_interval: Duration,
    lifecycle: Arc<LifecycleController>,
    reporter: ProgressReporter,
) -> CancellationToken {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    // 1. Engine notifications
    tokio::spawn(watch_events(client, poll_interval, tx));
    info!("Watching download engine every {poll_interval:?}");

    // 2. One handler per notification
    tokio::spawn(lifecycle.run(rx));

    // 3. Progress and cancellation loop
    let stop = reporter.stop_token();
    tokio::spawn(reporter.run());
    stop
}

/// Background tasks grouped under a tag so they can be cancelled together.
#[derive(Clone, Default)]
pub struct TaskTags {
    inner: Arc<Mutex<TagMap>>,
}

#[derive(Default)]
struct TagMap {
    running: HashMap<String, Vec<AbortHandle>>,
    /// Tags aborted since their last `forget`; tasks spawned under them never run.
    aborted: HashSet<String>,
}

impl TaskTags {
    fn map(&self) -> MutexGuard<'_, TagMap> {
        // A poisoned map only ever holds abort handles, still safe to use.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn<F>(&self, tag: &str, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut map = self.map();
        let aborted = map.aborted.contains(tag);
        let tags = self.clone();
        let key = tag.to_string();
        let handle = tokio::spawn(async move {
            if aborted {
                std::future::pending::<()>().await;
            }
            let output = future.await;
            tags.finished(&key, tokio::task::id());
            output
        });
        if aborted {
            handle.abort();
            return handle;
        }

        let entry = map.running.entry(tag.to_string()).or_default();
        entry.retain(|h| !h.is_finished());
        entry.push(handle.abort_handle());
        handle
    }

    fn finished(&self, tag: &str, id: Id) {
        let mut map = self.map();
        if let Some(entry) = map.running.get_mut(tag) {
            entry.retain(|h| h.id() != id && !h.is_finished());
            if entry.is_empty() {
                map.running.remove(tag);
            }
        }
    }

    /// Aborts every task carrying `tag`, returning how many were still running.
    /// Later spawns under `tag` are aborted too, until [`TaskTags::forget`].
    pub fn abort(&self, tag: &str) -> usize {
        let mut map = self.map();
        map.aborted.insert(tag.to_string());
        let handles = map.running.remove(tag).unwrap_or_default();
        handles
            .into_iter()
            .filter(|h| !h.is_finished())
            .inspect(|h| h.abort())
            .count()
    }

    /// Drops all bookkeeping for `tag` once nothing will spawn under it again.
    pub fn forget(&self, tag: &str) {
        let mut map = self.map();
        map.aborted.remove(tag);
        map.running.remove(tag);
    }

    /// Tasks under `tag` that can still be scheduled.
    #[cfg(test)]
    pub fn live(&self, tag: &str) -> usize {
        self.map()
            .running
            .get(tag)
            .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        let map = self.map();
        map.running.len() + map.aborted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn abort_cancels_only_matching_tag() {
        let tags = TaskTags::default();
        let slow = tags.spawn("gid-1", tokio::time::sleep(Duration::from_secs(60)));
        let other = tags.spawn("gid-2", tokio::time::sleep(Duration::from_secs(60)));

        assert_eq!(tags.live("gid-1"), 1);
        assert_eq!(tags.abort("gid-1"), 1);
        assert_eq!(tags.live("gid-1"), 0);

        let err = slow.await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(tags.live("gid-2"), 1);

        tags.abort("gid-2");
        assert!(other.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn finished_tasks_are_not_live() {
        let tags = TaskTags::default();
        let done = tags.spawn("gid", async { 5 });
        assert_eq!(done.await.unwrap(), 5);
        assert_eq!(tags.live("gid"), 0);
        assert_eq!(tags.abort("gid"), 0);
    }

    #[tokio::test]
    async fn spawn_after_abort_never_runs() {
        let tags = TaskTags::default();
        assert_eq!(tags.abort("gid"), 0);

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let late = tags.spawn("gid", async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(late.await.unwrap_err().is_cancelled());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(tags.live("gid"), 0);

        tags.forget("gid");
        assert_eq!(tags.spawn("gid", async { 1 }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn finished_tags_are_dropped() {
        let tags = TaskTags::default();
        for i in 0..3 {
            tags.spawn(&format!("seed-gid{i}"), async {}).await.unwrap();
        }
        assert_eq!(tags.tracked(), 0);
    }
}
