// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Packs the head of a tenant queue into a size-bounded batch.

use crate::errors::QueueError;
use crate::event::{Event, QueuedItem};
use crate::queue_store::QueueStore;
use tracing::{error, warn};

/// A contiguous prefix of one tenant queue.
#[derive(Debug, Default)]
pub struct Batch {
    /// Events in queue order, as they go on the wire.
    pub events: Vec<Event>,
    /// The stored strings the events were decoded from, used to put the batch
    /// back unchanged.
    pub raw: Vec<String>,
    /// Exact size of `events` serialized as a compact JSON array.
    pub size_bytes: usize,
    /// Popped items that could not be decoded.
    pub discarded: Vec<String>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Compact JSON size of one event.
pub fn event_size(event: &Event) -> Result<usize, serde_json::Error> {
    Ok(serde_json::to_vec(event)?.len())
}

/// Size of a JSON array of `count` items whose encodings add up to
/// `content_bytes`: brackets plus one comma between neighbours.
pub fn serialized_size(count: usize, content_bytes: usize) -> usize {
    2 + content_bytes + count.saturating_sub(1)
}

/// Accumulates events while tracking the serialized size of the array.
#[derive(Debug)]
pub struct BatchBuilder {
    limit: usize,
    content_bytes: usize,
    batch: Batch,
}

impl BatchBuilder {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            content_bytes: 0,
            batch: Batch::default(),
        }
    }

    /// Size of the array after appending an event of `event_size` bytes.
    fn size_with(&self, event_size: usize) -> usize {
        serialized_size(self.batch.len() + 1, self.content_bytes + event_size)
    }

    /// Whether an event of `event_size` bytes can be appended. An empty
    /// builder accepts anything so a single oversized event still ships.
    pub fn fits(&self, event_size: usize) -> bool {
        self.batch.is_empty() || self.size_with(event_size) <= self.limit
    }

    pub fn push(&mut self, event: Event, raw: String, event_size: usize) {
        let size = self.size_with(event_size);
        if size > self.limit {
            warn!(
                "Event of {} bytes exceeds the batch limit of {} bytes, sending it alone",
                event_size, self.limit
            );
        }
        self.content_bytes += event_size;
        self.batch.size_bytes = size;
        self.batch.events.push(event);
        self.batch.raw.push(raw);
    }

    pub fn discard(&mut self, raw: String) {
        self.batch.discarded.push(raw);
    }

    pub fn finish(self) -> Batch {
        self.batch
    }
}

/// Takes events off the head of `queue` for as long as they fit in `limit`
/// bytes. Each head is peeked first and only popped once it is known to fit,
/// so the first event that does not fit never leaves the queue.
///
/// If the store fails mid-way, everything popped so far, undecodable items
/// included, is put back in its original order before the error is returned.
pub async fn build_batch(
    store: &dyn QueueStore,
    queue: &str,
    limit: usize,
) -> Result<Batch, QueueError> {
    let mut builder = BatchBuilder::new(limit);
    let mut popped: Vec<String> = Vec::new();

    loop {
        let raw = match store.peek_head(queue).await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(err) => {
                restore(store, queue, popped).await;
                return Err(err);
            }
        };

        let decoded = QueuedItem::decode(&raw)
            .and_then(|item| event_size(&item.event).map(|size| (item.event, size)));
        if let Ok((_, size)) = &decoded {
            if !builder.fits(*size) {
                break;
            }
        }

        // Only the pass holding the tenant pops from its queue, so the head
        // is still the item just peeked.
        match store.pop_head(queue).await {
            Ok(Some(_)) => popped.push(raw.clone()),
            Ok(None) => break,
            Err(err) => {
                restore(store, queue, popped).await;
                return Err(err);
            }
        }

        match decoded {
            Ok((event, size)) => builder.push(event, raw, size),
            Err(err) => {
                warn!("Dropping undecodable item from {}: {}", queue, err);
                builder.discard(raw);
            }
        }
    }

    Ok(builder.finish())
}

/// Best effort: puts popped items back at the head of `queue`.
async fn restore(store: &dyn QueueStore, queue: &str, popped: Vec<String>) {
    if popped.is_empty() {
        return;
    }
    let count = popped.len();
    if let Err(err) = store.push_head_many(queue, popped).await {
        error!("Lost {} items from {} while restoring: {}", count, queue, err);
    }
}
