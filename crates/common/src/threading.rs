use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicUsize,
    threads: Mutex<BTreeMap<usize, ThreadInfo>>,
}

impl RegistryInner {
    fn threads(&self) -> MutexGuard<'_, BTreeMap<usize, ThreadInfo>> {
        self.threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ThreadInfo {
    name: String,
    started_at: Instant,
}

/// Names and tracks the OS threads the daemon runs next to its async runtime.
#[derive(Clone, Default)]
pub struct ThreadRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    pub name: String,
    pub uptime: Duration,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<ThreadHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let join_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| anyhow!("failed to spawn thread '{name}': {e}"))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.threads().insert(
            id,
            ThreadInfo {
                name: name.clone(),
                started_at: Instant::now(),
            },
        );

        Ok(ThreadHandle {
            name,
            id,
            handle: Some(join_handle),
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn active_count(&self) -> usize {
        self.inner.threads().len()
    }

    pub fn summaries(&self) -> Vec<ThreadSummary> {
        self.inner
            .threads()
            .values()
            .map(|info| ThreadSummary {
                name: info.name.clone(),
                uptime: info.started_at.elapsed(),
            })
            .collect()
    }
}

pub struct ThreadHandle {
    name: String,
    id: usize,
    handle: Option<JoinHandle<()>>,
    inner: Arc<RegistryInner>,
}

impl ThreadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn join(mut self) -> thread::Result<()> {
        self.inner.threads().remove(&self.id);
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // Dropping without join detaches the thread.
        self.inner.threads().remove(&self.id);
    }
}
