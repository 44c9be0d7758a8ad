use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use jiff::Timestamp;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::models::{Channel, TokenData, TrackedChannel};
use super::query_cache::{QueryCache, QueryKey};
use crate::api::{HelixStream, HelixUser, TwitchApi};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Join live streams and user records onto the tracked list.
///
/// Missing records degrade to offline / no picture instead of failing.
pub fn merge_channel_status(
    tracked: &[TrackedChannel],
    streams: &[HelixStream],
    users: &[HelixUser],
) -> HashMap<String, Channel> {
    let users_by_id: HashMap<&str, &HelixUser> =
        users.iter().map(|u| (u.id.as_str(), u)).collect();
    let streams_by_user: HashMap<&str, &HelixStream> =
        streams.iter().map(|s| (s.user_id.as_str(), s)).collect();

    tracked
        .iter()
        .map(|channel| {
            let stream = streams_by_user.get(channel.id.as_str()).copied();
            let user = users_by_id.get(channel.id.as_str()).copied();
            (channel.id.clone(), Channel::from_status(channel, stream, user))
        })
        .collect()
}

/// Fetch streams and users for the tracked set concurrently and merge them.
pub async fn fetch_channel_status(
    api: &dyn TwitchApi,
    access_token: &str,
    tracked: &[TrackedChannel],
) -> Result<HashMap<String, Channel>> {
    let ids: Vec<String> = tracked.iter().map(|c| c.id.clone()).collect();
    let (streams, users) = futures::try_join!(
        api.streams_by_user_ids(access_token, &ids),
        api.users_by_ids(access_token, &ids),
    )?;
    Ok(merge_channel_status(tracked, &streams, &users))
}

/// What the channel list displays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    /// Status key the channels were computed for.
    pub key: String,
    pub channels: HashMap<String, Channel>,
    /// Last failure, cleared by the next success.
    pub error: Option<String>,
    pub is_loading: bool,
    pub updated_at: Option<Timestamp>,
}

impl StatusSnapshot {
    /// Channels in tracked order; ids without status yet are skipped.
    pub fn ordered(&self, tracked: &[TrackedChannel]) -> Vec<Channel> {
        tracked
            .iter()
            .filter_map(|c| self.channels.get(&c.id).cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No token, no tracked channels or no client id.
    Disabled,
    Updated,
    Failed,
    /// The tracked set or token changed while fetching.
    Superseded,
}

fn status_key_string(key: &QueryKey) -> String {
    match key {
        QueryKey::ChannelStatus(ids) => ids.clone(),
        _ => String::new(),
    }
}

/// Polls live status for the tracked set.
pub struct ChannelStatusPoller {
    api: Arc<dyn TwitchApi>,
    cache: Arc<QueryCache>,
    interval: Duration,
    snapshot: watch::Sender<StatusSnapshot>,
}

impl ChannelStatusPoller {
    pub fn new(api: Arc<dyn TwitchApi>, cache: Arc<QueryCache>, interval: Duration) -> Self {
        let (snapshot, _) = watch::channel(StatusSnapshot::default());
        Self {
            api,
            cache,
            interval,
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.borrow().clone()
    }

    fn inputs(&self) -> (Vec<TrackedChannel>, Option<TokenData>, QueryKey) {
        let tracked: Vec<TrackedChannel> = self
            .cache
            .get_data(&QueryKey::TrackedChannels)
            .unwrap_or_default();
        let token = self.cache.get_data(&QueryKey::Token);
        let key = QueryKey::channel_status(&tracked);
        (tracked, token, key)
    }

    pub fn current_key(&self) -> QueryKey {
        self.inputs().2
    }

    /// Run one fetch cycle for the current tracked set.
    pub async fn refresh(&self) -> RefreshOutcome {
        let (tracked, token, key) = self.inputs();
        let key_string = status_key_string(&key);

        let token = match token {
            Some(token) if !tracked.is_empty() && self.api.client_id().is_some() => token,
            _ => {
                self.cache.cancel_queries_where(QueryKey::is_channel_status);
                self.snapshot.send_modify(|s| {
                    s.key = key_string;
                    s.channels.clear();
                    s.error = None;
                    s.is_loading = false;
                });
                return RefreshOutcome::Disabled;
            }
        };

        // Only the current set may have a fetch in flight.
        self.cache
            .cancel_queries_where(|k| k.is_channel_status() && *k != key);
        let guard = self.cache.begin_fetch(key.clone());
        self.snapshot.send_modify(|s| s.is_loading = true);

        let result = tokio::select! {
            _ = guard.cancelled() => None,
            result = fetch_channel_status(self.api.as_ref(), &token.access_token, &tracked) => Some(result),
        };
        self.cache.finish_fetch(&guard);

        let Some(result) = result else {
            debug!(key = %key_string, "status fetch cancelled");
            return RefreshOutcome::Superseded;
        };
        // The token is part of the input too: a logout mid-fetch must not repopulate.
        let (_, current_token, current_key) = self.inputs();
        if current_key != key || current_token.as_ref() != Some(&token) {
            debug!(key = %key_string, "discarding status for a superseded tracked set");
            return RefreshOutcome::Superseded;
        }

        match result {
            Ok(channels) => {
                debug!(key = %key_string, channels = channels.len(), "channel status updated");
                self.cache.set_data(key, &channels);
                self.snapshot.send_modify(|s| {
                    s.key = key_string;
                    s.channels = channels;
                    s.error = None;
                    s.is_loading = false;
                    s.updated_at = Some(Timestamp::now());
                });
                RefreshOutcome::Updated
            }
            Err(e) => {
                warn!(error = ?e, "channel status refresh failed");
                // Keep showing the last good mapping.
                self.snapshot.send_modify(|s| {
                    s.error = Some(format!("{:#}", e));
                    s.is_loading = false;
                });
                RefreshOutcome::Failed
            }
        }
    }

    /// Refresh on every tick and whenever the tracked list or token changes,
    /// until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tracked_rx = self.cache.subscribe(QueryKey::TrackedChannels);
        let mut token_rx = self.cache.subscribe(QueryKey::Token);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut rerun = false;
        let mut last_fetched: Option<QueryKey> = None;

        loop {
            if !rerun {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                    changed = tracked_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // Reorders and commit writes keep the same id set.
                        if last_fetched.as_ref() == Some(&self.current_key()) {
                            continue;
                        }
                    }
                    changed = token_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            let fetching = self.current_key();
            let refresh = self.refresh();
            tokio::pin!(refresh);
            let outcome = loop {
                tokio::select! {
                    outcome = &mut refresh => break outcome,
                    changed = tracked_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // Abandon the fetch once the tracked set it was for is gone.
                        if self.current_key() != fetching {
                            self.cache.cancel_queries(&fetching);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            };
            debug!(?outcome, "status cycle finished");
            rerun = outcome == RefreshOutcome::Superseded;
            last_fetched = Some(fetching);
            ticker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(user_id: &str, viewers: u64) -> HelixStream {
        HelixStream {
            user_id: user_id.to_string(),
            viewers,
        }
    }

    fn user(id: &str) -> HelixUser {
        HelixUser {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            profile_picture_url: format!("https://img/{}.png", id),
        }
    }

    #[test]
    fn test_merge_marks_only_streaming_channels_online() {
        let tracked = vec![TrackedChannel::new("1", "One"), TrackedChannel::new("2", "Two")];
        let merged = merge_channel_status(&tracked, &[stream("1", 42)], &[user("1"), user("2")]);

        assert!(merged["1"].is_online);
        assert_eq!(merged["1"].viewer_count, Some(42));
        assert!(!merged["2"].is_online);
        assert_eq!(merged["2"].viewer_count, None);
        assert_eq!(merged["2"].profile_picture_url.as_deref(), Some("https://img/2.png"));
    }

    #[test]
    fn test_merge_keeps_tracked_display_name_and_tolerates_missing_users() {
        let tracked = vec![TrackedChannel::new("9", "Tracked Name")];
        let merged = merge_channel_status(&tracked, &[stream("9", 3)], &[]);

        assert_eq!(merged["9"].display_name, "Tracked Name");
        assert_eq!(merged["9"].profile_picture_url, None);
        assert!(merged["9"].is_online);
    }

    #[test]
    fn test_merge_ignores_streams_for_untracked_ids() {
        let tracked = vec![TrackedChannel::new("1", "One")];
        let merged = merge_channel_status(&tracked, &[stream("77", 5)], &[]);
        assert_eq!(merged.len(), 1);
        assert!(!merged["1"].is_online);
    }

    #[test]
    fn test_snapshot_ordered_follows_tracked_order() {
        let tracked = vec![
            TrackedChannel::new("b", "B"),
            TrackedChannel::new("a", "A"),
            TrackedChannel::new("c", "C"),
        ];
        let snapshot = StatusSnapshot {
            channels: merge_channel_status(&tracked[..2], &[], &[]),
            ..StatusSnapshot::default()
        };
        let ordered: Vec<String> = snapshot.ordered(&tracked).into_iter().map(|c| c.id).collect();
        assert_eq!(ordered, vec!["b", "a"]);
    }
}
