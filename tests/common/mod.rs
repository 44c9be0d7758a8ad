#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Url;

use twitch_opticon::api::{HelixChannelSearchResult, HelixStream, HelixUser, TokenInfo, TwitchApi};
use twitch_opticon::internal::auth::Clock;
use twitch_opticon::internal::models::TrackedChannel;
use twitch_opticon::internal::notification::{Notification, NotificationSink, NotificationType};
use twitch_opticon::internal::redirect::Redirect;

pub const NOW_MS: i64 = 1_700_000_000_000;

/// In-memory Twitch with call counters and switchable failures.
#[derive(Default)]
pub struct FakeApi {
    pub client_id: Option<String>,
    pub token_user_id: Mutex<Option<String>>,
    pub users: Mutex<Vec<HelixUser>>,
    pub streams: Mutex<Vec<HelixStream>>,
    pub search_rows: Mutex<Vec<HelixChannelSearchResult>>,
    pub latency: Mutex<Option<Duration>>,
    pub fail_token_info: AtomicBool,
    pub fail_users: AtomicBool,
    pub fail_streams: AtomicBool,
    pub fail_search: AtomicBool,
    pub token_info_calls: AtomicUsize,
    pub users_calls: AtomicUsize,
    pub streams_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            client_id: Some("test-client".to_string()),
            ..Self::default()
        }
    }

    pub fn without_client_id() -> Self {
        Self::default()
    }

    pub fn with_user(self, id: &str, display_name: &str) -> Self {
        *self.token_user_id.lock().unwrap() = Some(id.to_string());
        self.users.lock().unwrap().push(helix_user(id, display_name));
        self
    }

    pub fn add_user(&self, id: &str, display_name: &str) {
        self.users.lock().unwrap().push(helix_user(id, display_name));
    }

    pub fn set_streams(&self, streams: &[(&str, u64)]) {
        *self.streams.lock().unwrap() = streams
            .iter()
            .map(|(id, viewers)| HelixStream {
                user_id: id.to_string(),
                viewers: *viewers,
            })
            .collect();
    }

    pub fn set_search_rows(&self, rows: &[(&str, &str, bool)]) {
        *self.search_rows.lock().unwrap() = rows
            .iter()
            .map(|(id, name, live)| HelixChannelSearchResult {
                id: id.to_string(),
                display_name: name.to_string(),
                is_live: *live,
                thumbnail_url: format!("https://thumb/{}.jpg", id),
            })
            .collect();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn remote_calls(&self) -> usize {
        self.token_info_calls.load(Ordering::SeqCst)
            + self.users_calls.load(Ordering::SeqCst)
            + self.streams_calls.load(Ordering::SeqCst)
            + self.search_calls.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

pub fn helix_user(id: &str, display_name: &str) -> HelixUser {
    HelixUser {
        id: id.to_string(),
        display_name: display_name.to_string(),
        profile_picture_url: format!("https://img/{}.png", id),
    }
}

#[async_trait]
impl TwitchApi for FakeApi {
    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    async fn token_info(&self, _access_token: &str) -> Result<TokenInfo> {
        self.token_info_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if self.fail_token_info.load(Ordering::SeqCst) {
            bail!("token_info: token rejected");
        }
        Ok(TokenInfo {
            client_id: self.client_id.clone(),
            login: None,
            user_id: self.token_user_id.lock().unwrap().clone(),
            scopes: vec!["user:read:email".to_string()],
            expires_in: Some(3600),
        })
    }

    async fn users_by_ids(&self, _access_token: &str, ids: &[String]) -> Result<Vec<HelixUser>> {
        self.users_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if self.fail_users.load(Ordering::SeqCst) {
            bail!("users_by_ids failed");
        }
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|u| ids.contains(&u.id))
            .cloned()
            .collect())
    }

    async fn streams_by_user_ids(
        &self,
        _access_token: &str,
        ids: &[String],
    ) -> Result<Vec<HelixStream>> {
        self.streams_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if self.fail_streams.load(Ordering::SeqCst) {
            bail!("streams_by_user_ids failed");
        }
        Ok(self
            .streams
            .lock()
            .unwrap()
            .iter()
            .filter(|s| ids.contains(&s.user_id))
            .cloned()
            .collect())
    }

    async fn search_channels(
        &self,
        _access_token: &str,
        term: &str,
    ) -> Result<Vec<HelixChannelSearchResult>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if self.fail_search.load(Ordering::SeqCst) {
            bail!("search_channels failed for {:?}", term);
        }
        Ok(self.search_rows.lock().unwrap().clone())
    }
}

/// Records initiated redirects and serves a fragment once.
#[derive(Default)]
pub struct FakeRedirect {
    pub initiated: Mutex<Vec<Url>>,
    pub fragment: Mutex<Option<String>>,
}

impl FakeRedirect {
    pub fn landed_with(fragment: &str) -> Self {
        Self {
            fragment: Mutex::new(Some(fragment.to_string())),
            ..Self::default()
        }
    }

    pub fn land(&self, fragment: &str) {
        *self.fragment.lock().unwrap() = Some(fragment.to_string());
    }
}

impl Redirect for FakeRedirect {
    fn initiate(&self, url: &Url) -> Result<()> {
        self.initiated.lock().unwrap().push(url.clone());
        Ok(())
    }

    fn capture_fragment_once(&self) -> Option<String> {
        self.fragment
            .lock()
            .unwrap()
            .take()
            .filter(|f| f.contains("access_token"))
    }
}

pub struct FixedClock(pub AtomicI64);

impl FixedClock {
    pub fn at(now_ms: i64) -> Self {
        Self(AtomicI64::new(now_ms))
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub notifications: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<(NotificationType, String)> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|n| (n.notification_type, n.message.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.notifications.lock().unwrap().clear();
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().unwrap().push(notification);
    }
}

pub fn channels(ids: &[&str]) -> Vec<TrackedChannel> {
    ids.iter()
        .map(|id| TrackedChannel::new(*id, format!("Channel {}", id)))
        .collect()
}

pub fn ids(channels: &[TrackedChannel]) -> Vec<String> {
    channels.iter().map(|c| c.id.clone()).collect()
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
