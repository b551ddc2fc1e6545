// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::QueueError;
use crate::queue_store::QueueStore;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::debug;

/// Queue store backed by Redis lists. Every queue is one list; pushes and pops
/// map onto `RPUSH`, `LPUSH` and `LPOP`, each of which is atomic on the server.
/// Queue discovery uses `SCAN` rather than `KEYS`.
pub struct RedisQueueStore {
    conn: MultiplexedConnection,
}

impl RedisQueueStore {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("Connected to queue store at {}", client.get_connection_info().addr);
        Ok(Self { conn })
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push_tail_many(&self, queue: &str, items: &[String]) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: usize = conn.rpush(queue, items.to_vec()).await?;
        Ok(())
    }

    async fn peek_head(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let item: Option<String> = conn.lindex(queue, 0).await?;
        Ok(item)
    }

    async fn pop_head(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let item: Option<String> = conn.lpop(queue, None).await?;
        Ok(item)
    }

    async fn push_head(&self, queue: &str, item: String) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: usize = conn.lpush(queue, item).await?;
        Ok(())
    }

    /// `LPUSH a b c` leaves `c` at the head, so the items go in reversed.
    async fn push_head_many(&self, queue: &str, items: Vec<String>) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }
        let reversed: Vec<String> = items.into_iter().rev().collect();
        let mut conn = self.conn.clone();
        let _: usize = conn.lpush(queue, reversed).await?;
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }

    // Redis drops lists once they are empty, so every key returned is
    // non-empty. `SCAN` may report a key more than once.
    async fn queues(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let mut names = Vec::new();
        let mut iter = conn.scan_match::<_, String>(format!("{prefix}*")).await?;
        while let Some(name) = iter.next_item().await {
            names.push(name);
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}
