// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable FIFO lists keyed by name.
//!
//! Items are stored as the raw JSON strings produced by
//! [`crate::event::QueuedItem::encode`], so a batch that has to be put back is
//! re-queued byte for byte.

pub mod redis;

use crate::errors::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends `items` to the tail of `queue` as one operation.
    async fn push_tail_many(&self, queue: &str, items: &[String]) -> Result<(), QueueError>;

    async fn push_tail(&self, queue: &str, item: String) -> Result<(), QueueError> {
        self.push_tail_many(queue, std::slice::from_ref(&item)).await
    }

    /// Returns the head of `queue` without removing it.
    async fn peek_head(&self, queue: &str) -> Result<Option<String>, QueueError>;

    /// Removes and returns the head of `queue`, or `None` when it is empty.
    async fn pop_head(&self, queue: &str) -> Result<Option<String>, QueueError>;

    /// Puts `item` back in front of every other item in `queue`.
    async fn push_head(&self, queue: &str, item: String) -> Result<(), QueueError>;

    /// Puts `items` back at the head of `queue`, keeping their order: after
    /// the call `items[0]` is the head.
    async fn push_head_many(&self, queue: &str, items: Vec<String>) -> Result<(), QueueError> {
        for item in items.into_iter().rev() {
            self.push_head(queue, item).await?;
        }
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, QueueError>;

    /// Names of the non-empty queues whose name starts with `prefix`.
    async fn queues(&self, prefix: &str) -> Result<Vec<String>, QueueError>;
}

/// In-process store. Used by tests and when no Redis URL is configured; its
/// contents do not survive a restart.
#[derive(Default)]
pub struct MemoryQueueStore {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, VecDeque<String>>>, QueueError> {
        self.queues
            .lock()
            .map_err(|_| QueueError::Unavailable("memory queue store lock poisoned".to_string()))
    }

    /// Snapshot of `queue`, head first.
    pub fn contents(&self, queue: &str) -> Vec<String> {
        match self.queues.lock() {
            Ok(queues) => queues
                .get(queue)
                .map(|items| items.iter().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push_tail_many(&self, queue: &str, items: &[String]) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut queues = self.lock()?;
        queues
            .entry(queue.to_string())
            .or_default()
            .extend(items.iter().cloned());
        Ok(())
    }

    async fn peek_head(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let queues = self.lock()?;
        Ok(queues.get(queue).and_then(|items| items.front().cloned()))
    }

    async fn pop_head(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let mut queues = self.lock()?;
        Ok(queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn push_head(&self, queue: &str, item: String) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        queues.entry(queue.to_string()).or_default().push_front(item);
        Ok(())
    }

    async fn push_head_many(&self, queue: &str, items: Vec<String>) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        let entry = queues.entry(queue.to_string()).or_default();
        for item in items.into_iter().rev() {
            entry.push_front(item);
        }
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        let queues = self.lock()?;
        Ok(queues.get(queue).map_or(0, VecDeque::len))
    }

    async fn queues(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let queues = self.lock()?;
        let mut names: Vec<String> = queues
            .iter()
            .filter(|(name, items)| name.starts_with(prefix) && !items.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Memory store with switchable failures, for error-path tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryQueueStore,
    pops_left: Mutex<Option<usize>>,
    failing_tail_prefix: Mutex<Option<String>>,
}

#[cfg(test)]
impl FlakyStore {
    /// Lets `pops` more `pop_head` calls through, then fails every later one.
    pub(crate) fn fail_pops_after(&self, pops: usize) {
        *self.pops_left.lock().unwrap() = Some(pops);
    }

    /// Fails tail pushes to every queue whose name starts with `prefix`.
    pub(crate) fn fail_tail_pushes_to(&self, prefix: &str) {
        *self.failing_tail_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    fn unavailable() -> QueueError {
        QueueError::Unavailable("injected failure".to_string())
    }
}

#[cfg(test)]
#[async_trait]
impl QueueStore for FlakyStore {
    async fn push_tail_many(&self, queue: &str, items: &[String]) -> Result<(), QueueError> {
        let failing = self.failing_tail_prefix.lock().unwrap().clone();
        if failing.is_some_and(|prefix| queue.starts_with(&prefix)) {
            return Err(Self::unavailable());
        }
        self.inner.push_tail_many(queue, items).await
    }

    async fn peek_head(&self, queue: &str) -> Result<Option<String>, QueueError> {
        self.inner.peek_head(queue).await
    }

    async fn pop_head(&self, queue: &str) -> Result<Option<String>, QueueError> {
        {
            let mut pops_left = self.pops_left.lock().unwrap();
            match pops_left.as_mut() {
                Some(0) => return Err(Self::unavailable()),
                Some(left) => *left -= 1,
                None => {}
            }
        }
        self.inner.pop_head(queue).await
    }

    async fn push_head(&self, queue: &str, item: String) -> Result<(), QueueError> {
        self.inner.push_head(queue, item).await
    }

    async fn push_head_many(&self, queue: &str, items: Vec<String>) -> Result<(), QueueError> {
        self.inner.push_head_many(queue, items).await
    }

    async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        self.inner.len(queue).await
    }

    async fn queues(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        self.inner.queues(prefix).await
    }
}
