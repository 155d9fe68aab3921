use super::HitStore;
use crate::hit::Hit;
use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Volatile FIFO store; pending hits are lost with the process.
#[derive(Default)]
pub struct MemoryHitStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    open: bool,
    hits: VecDeque<Hit>,
}

impl MemoryHitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory hit store lock poisoned"))
    }

    fn lock_open(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        if !inner.open {
            return Err(anyhow!("hit store is closed"));
        }
        Ok(inner)
    }
}

impl HitStore for MemoryHitStore {
    fn open(&self) -> Result<()> {
        self.lock()?.open = true;
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.open = false;
        }
    }

    fn is_open(&self) -> bool {
        self.inner.lock().map(|inner| inner.open).unwrap_or(false)
    }

    fn add_hit(&self, hit: &Hit) -> Result<()> {
        self.lock_open()?.hits.push_back(hit.clone());
        Ok(())
    }

    fn add_hits(&self, hits: Vec<Hit>) -> Result<()> {
        self.lock_open()?.hits.extend(hits);
        Ok(())
    }

    fn fetch_hits(&self, max_count: usize, remove: bool) -> Result<Vec<Hit>> {
        let mut inner = self.lock_open()?;
        let count = max_count.min(inner.hits.len());
        if remove {
            Ok(inner.hits.drain(..count).collect())
        } else {
            Ok(inner.hits.iter().take(count).cloned().collect())
        }
    }

    fn len(&self) -> Result<usize> {
        Ok(self.lock()?.hits.len())
    }
}
