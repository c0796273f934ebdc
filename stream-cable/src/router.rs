//! Process-local stream registry.
//!
//! Maps a stream name to the channels currently streaming from it. The
//! registry only holds weak references: a channel is owned by its
//! connection, and a channel that has been dropped without unsubscribing is
//! skipped (and pruned) the next time its stream is resolved.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::trace;

use crate::channel::{Channel, ChannelId};

#[derive(Default)]
pub struct Router {
    streams: Mutex<HashMap<String, HashMap<ChannelId, Weak<Channel>>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel` under `stream`. Returns `false` when the pair was
    /// already registered.
    pub fn subscribe(&self, stream: &str, channel: &Arc<Channel>) -> bool {
        let mut streams = self.lock();
        let added = streams
            .entry(stream.to_string())
            .or_default()
            .insert(channel.id(), Arc::downgrade(channel))
            .is_none();

        if added {
            trace!(stream, channel = channel.id(), "stream subscription added");
        }
        added
    }

    /// Removes the registration. Returns `false` when there was none.
    pub fn unsubscribe(&self, stream: &str, channel: &Channel) -> bool {
        let mut streams = self.lock();
        let Some(members) = streams.get_mut(stream) else {
            return false;
        };

        let removed = members.remove(&channel.id()).is_some();
        if members.is_empty() {
            streams.remove(stream);
        }

        if removed {
            trace!(stream, channel = channel.id(), "stream subscription removed");
        }
        removed
    }

    /// Snapshot of the channels streaming from `stream`.
    ///
    /// The returned list is detached from the registry, so callers may
    /// suspend while iterating it. Iteration order is unspecified.
    pub fn subscribers(&self, stream: &str) -> Vec<Arc<Channel>> {
        let mut streams = self.lock();
        let Some(members) = streams.get_mut(stream) else {
            return Vec::new();
        };

        let mut live = Vec::with_capacity(members.len());
        members.retain(|_, weak| match weak.upgrade() {
            Some(channel) => {
                live.push(channel);
                true
            }
            None => false,
        });

        if members.is_empty() {
            streams.remove(stream);
        }
        live
    }

    pub fn is_subscribed(&self, stream: &str, channel: &Channel) -> bool {
        self.lock()
            .get(stream)
            .is_some_and(|members| members.contains_key(&channel.id()))
    }

    pub fn subscriber_count(&self, stream: &str) -> usize {
        self.lock().get(stream).map_or(0, HashMap::len)
    }

    /// Names of every stream with at least one registration.
    pub fn streams(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    // The map is left consistent by every critical section, so a panic
    // elsewhere while holding the lock does not invalidate it.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<ChannelId, Weak<Channel>>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
