use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::models::TrackedChannel;
use super::notification::{Notification, NotificationSink};
use super::query_cache::{QueryCache, QueryKey};

pub const MAX_TRACKED_CHANNELS: usize = 100;
pub const MAX_CHANNELS_MESSAGE: &str = "You can track a maximum of 100 channels.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackError {
    #[error("You can track a maximum of 100 channels.")]
    Capacity,
    #[error("Channel records need a non-empty id and display name.")]
    InvalidChannel,
}

/// How a store mutation settled.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The authoritative result became canonical.
    Committed(Vec<TrackedChannel>),
    /// Nothing to do; the list is unchanged.
    Unchanged(Vec<TrackedChannel>),
    /// Rejected; the pre-mutation list was restored.
    Failed(TrackError),
}

impl MutationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

pub fn validate_channel(channel: &TrackedChannel) -> Result<(), TrackError> {
    match channel.id.is_empty() || channel.display_name.is_empty() {
        true => Err(TrackError::InvalidChannel),
        false => Ok(()),
    }
}

/// Schema check applied to every list that is read, committed or persisted.
pub fn validate_channels(channels: &[TrackedChannel]) -> Result<(), TrackError> {
    if channels.len() > MAX_TRACKED_CHANNELS {
        return Err(TrackError::Capacity);
    }
    channels.iter().try_for_each(validate_channel)
}

/// Decode and validate a list read from the cache or a blob.
pub fn parse_channels(value: serde_json::Value) -> Result<Vec<TrackedChannel>, String> {
    let channels: Vec<TrackedChannel> = match value {
        serde_json::Value::Null => return Ok(Vec::new()),
        other => serde_json::from_value(other).map_err(|e| e.to_string())?,
    };
    validate_channels(&channels).map_err(|e| e.to_string())?;
    Ok(channels)
}

/// Prepend `channel` unless it is already tracked.
pub fn add_channel(
    channels: &[TrackedChannel],
    channel: &TrackedChannel,
) -> Result<Vec<TrackedChannel>, TrackError> {
    validate_channel(channel)?;
    // Duplicate before capacity: re-adding at exactly 100 is a no-op, not an error.
    if channels.iter().any(|c| c.id == channel.id) {
        return Ok(channels.to_vec());
    }
    if channels.len() >= MAX_TRACKED_CHANNELS {
        return Err(TrackError::Capacity);
    }
    let mut updated = Vec::with_capacity(channels.len() + 1);
    updated.push(channel.clone());
    updated.extend_from_slice(channels);
    validate_channels(&updated)?;
    Ok(updated)
}

pub fn remove_channel(channels: &[TrackedChannel], id: &str) -> Vec<TrackedChannel> {
    channels.iter().filter(|c| c.id != id).cloned().collect()
}

/// Remove the element at `from` and reinsert it at `to`.
pub fn move_to_index<T: Clone>(items: &[T], from: usize, to: usize) -> Vec<T> {
    let mut moved = items.to_vec();
    if from < moved.len() && to < moved.len() {
        let item = moved.remove(from);
        moved.insert(to, item);
    }
    moved
}

/// Move `active_id` to where `over_id` sits. Unknown or equal ids are a no-op.
pub fn reorder_channels(
    channels: &[TrackedChannel],
    active_id: &str,
    over_id: &str,
) -> Result<Vec<TrackedChannel>, TrackError> {
    let old_index = channels.iter().position(|c| c.id == active_id);
    let new_index = channels.iter().position(|c| c.id == over_id);
    match (old_index, new_index) {
        (Some(from), Some(to)) if from != to => {
            let updated = move_to_index(channels, from, to);
            validate_channels(&updated)?;
            Ok(updated)
        }
        _ => Ok(channels.to_vec()),
    }
}

fn quoted_or_channel(display_name: Option<&str>) -> String {
    match display_name {
        Some(name) => format!("\"{}\"", name),
        None => "channel".to_string(),
    }
}

/// The ordered list of tracked channels, mutated optimistically.
///
/// Every mutation takes the same path: cancel in-flight reads of the list,
/// snapshot it, apply the change speculatively, compute the authoritative
/// result from the snapshot, then either commit that result or put the
/// snapshot back verbatim. The list is re-read from the cache afterwards
/// whatever happened.
pub struct TrackedChannelStore {
    cache: Arc<QueryCache>,
    notifier: Arc<dyn NotificationSink>,
    write_lock: Mutex<()>,
}

impl TrackedChannelStore {
    pub fn new(cache: Arc<QueryCache>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            cache,
            notifier,
            write_lock: Mutex::new(()),
        }
    }

    pub fn channels(&self) -> Vec<TrackedChannel> {
        self.cache
            .get_data(&QueryKey::TrackedChannels)
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<serde_json::Value> {
        self.cache.subscribe(QueryKey::TrackedChannels)
    }

    pub fn len(&self) -> usize {
        self.channels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= MAX_TRACKED_CHANNELS
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels().iter().any(|c| c.id == id)
    }

    pub async fn add(&self, channel: TrackedChannel) -> MutationOutcome {
        let outcome = self
            .mutate("add", |channels| add_channel(channels, &channel))
            .await;
        match &outcome {
            MutationOutcome::Committed(_) => {
                info!(id = %channel.id, "tracked channel added");
                self.notifier.notify(Notification::success(format!(
                    "Channel \"{}\" added.",
                    channel.display_name
                )));
            }
            MutationOutcome::Unchanged(_) => {
                self.notifier.notify(Notification::info(format!(
                    "Channel \"{}\" is already tracked.",
                    channel.display_name
                )));
            }
            MutationOutcome::Failed(TrackError::Capacity) => {
                self.notifier.notify(Notification::error(MAX_CHANNELS_MESSAGE));
            }
            MutationOutcome::Failed(err) => {
                warn!(error = %err, "rejected channel record");
                self.notifier.notify(Notification::error(format!(
                    "Failed to add channel \"{}\".",
                    channel.display_name
                )));
            }
        }
        outcome
    }

    /// Removing an id that is not tracked still succeeds.
    pub async fn remove(&self, id: &str, display_name_hint: Option<&str>) -> MutationOutcome {
        let outcome = self
            .mutate("remove", |channels| Ok(remove_channel(channels, id)))
            .await;
        let name = quoted_or_channel(display_name_hint);
        let outcome = match outcome {
            MutationOutcome::Unchanged(list) => MutationOutcome::Committed(list),
            other => other,
        };
        match &outcome {
            MutationOutcome::Failed(_) => self
                .notifier
                .notify(Notification::error(format!("Failed to remove {}.", name))),
            _ => {
                info!(id, "tracked channel removed");
                self.notifier
                    .notify(Notification::success(format!("Successfully removed {}.", name)));
            }
        }
        outcome
    }

    pub async fn reorder(&self, active_id: &str, over_id: &str) -> MutationOutcome {
        let outcome = self
            .mutate("reorder", |channels| {
                reorder_channels(channels, active_id, over_id)
            })
            .await;
        match &outcome {
            MutationOutcome::Committed(_) => {
                debug!(active_id, over_id, "tracked channels reordered");
                self.notifier
                    .notify(Notification::success("Channel order updated."));
            }
            MutationOutcome::Unchanged(_) => {}
            MutationOutcome::Failed(err) => {
                warn!(error = %err, "reorder rejected");
                self.notifier
                    .notify(Notification::error("Failed to reorder channels."));
            }
        }
        outcome
    }

    /// Re-read the canonical list and discard it if it no longer validates.
    pub fn refresh(&self) -> Vec<TrackedChannel> {
        let guard = self.cache.begin_fetch(QueryKey::TrackedChannels);
        let raw = self.cache.get_raw(&QueryKey::TrackedChannels);
        let channels = match parse_channels(raw) {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "invalid tracked channels in cache, resetting");
                self.cache
                    .set_data(QueryKey::TrackedChannels, &Vec::<TrackedChannel>::new());
                Vec::new()
            }
        };
        self.cache.finish_fetch(&guard);
        channels
    }

    async fn mutate<F>(&self, operation: &str, apply: F) -> MutationOutcome
    where
        F: Fn(&[TrackedChannel]) -> Result<Vec<TrackedChannel>, TrackError>,
    {
        let _serialized = self.write_lock.lock().await;

        self.cache.cancel_queries(&QueryKey::TrackedChannels);
        let snapshot = self.channels();

        // Speculative step; an invalid result simply keeps the prior list.
        if let Ok(optimistic) = apply(&snapshot)
            && validate_channels(&optimistic).is_ok()
            && optimistic != snapshot
        {
            self.cache.set_data(QueryKey::TrackedChannels, &optimistic);
        }

        let outcome = match apply(&snapshot) {
            Ok(updated) if updated == snapshot => {
                self.cache.set_data(QueryKey::TrackedChannels, &snapshot);
                MutationOutcome::Unchanged(snapshot)
            }
            Ok(updated) => {
                self.cache.set_data(QueryKey::TrackedChannels, &updated);
                MutationOutcome::Committed(updated)
            }
            Err(err) => {
                debug!(operation, error = %err, "rolling back tracked channels");
                self.cache.set_data(QueryKey::TrackedChannels, &snapshot);
                MutationOutcome::Failed(err)
            }
        };

        self.refresh();
        outcome
    }
}
