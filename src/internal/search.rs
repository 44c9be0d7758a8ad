use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::models::SearchResult;
use super::query_cache::{QueryCache, QueryKey};
use crate::api::{HelixChannelSearchResult, HelixUser, TwitchApi};

pub const MIN_CHANNEL_SEARCH_QUERY_LENGTH: usize = 2;
pub const DEFAULT_SEARCH_STALE_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum SearchError {
    /// A newer term started before this one resolved.
    #[error("search superseded by a newer term")]
    Superseded,
    #[error("Failed to search channels: {0:#}")]
    Remote(#[from] anyhow::Error),
}

/// True when `term` is long enough to hit the remote search.
pub fn is_searchable(term: &str) -> bool {
    term.chars().count() >= MIN_CHANNEL_SEARCH_QUERY_LENGTH
}

/// Attach profile pictures, falling back to the thumbnail from the search row.
pub fn enrich_results(
    results: Vec<HelixChannelSearchResult>,
    users: &[HelixUser],
) -> Vec<SearchResult> {
    let pictures: HashMap<&str, &str> = users
        .iter()
        .filter(|u| !u.profile_picture_url.is_empty())
        .map(|u| (u.id.as_str(), u.profile_picture_url.as_str()))
        .collect();

    results
        .into_iter()
        .map(|r| {
            let profile_picture_url = pictures
                .get(r.id.as_str())
                .map(|url| url.to_string())
                .unwrap_or(r.thumbnail_url);
            SearchResult {
                id: r.id,
                display_name: r.display_name,
                is_online: r.is_live,
                viewer_count: None,
                profile_picture_url,
            }
        })
        .collect()
}

/// Hint shown in place of an empty result list.
pub fn empty_state_message(term: &str, results_len: usize, is_fetching: bool) -> String {
    let length = term.chars().count();
    if length > 0 && length < MIN_CHANNEL_SEARCH_QUERY_LENGTH {
        format!(
            "Type at least {} characters to search.",
            MIN_CHANNEL_SEARCH_QUERY_LENGTH
        )
    } else if length >= MIN_CHANNEL_SEARCH_QUERY_LENGTH && results_len == 0 && !is_fetching {
        format!("No channels found for \"{}\".", term)
    } else {
        "Search for Twitch channels above.".to_string()
    }
}

/// Channel lookup by free-text term, cached per term.
///
/// Receives already-debounced terms; see [`crate::utils::debounce`].
pub struct ChannelSearch {
    api: Arc<dyn TwitchApi>,
    cache: Arc<QueryCache>,
    stale_time: Duration,
}

impl ChannelSearch {
    pub fn new(api: Arc<dyn TwitchApi>, cache: Arc<QueryCache>, stale_time: Duration) -> Self {
        Self {
            api,
            cache,
            stale_time,
        }
    }

    pub fn is_fetching(&self, term: &str) -> bool {
        self.cache.is_fetching(&QueryKey::channel_search(term))
    }

    pub async fn search(
        &self,
        term: &str,
        access_token: Option<&str>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let (Some(access_token), Some(_)) = (access_token, self.api.client_id()) else {
            return Ok(Vec::new());
        };
        if !is_searchable(term) {
            return Ok(Vec::new());
        }

        let key = QueryKey::channel_search(term);
        if !self.cache.is_stale(&key, self.stale_time)
            && let Some(cached) = self.cache.get_data::<Vec<SearchResult>>(&key)
        {
            debug!(term, results = cached.len(), "search served from cache");
            return Ok(cached);
        }

        self.cache
            .cancel_queries_where(|k| k.is_channel_search() && *k != key);
        let guard = self.cache.begin_fetch(key.clone());

        let fetched = tokio::select! {
            _ = guard.cancelled() => None,
            fetched = self.fetch(access_token, term) => Some(fetched),
        };
        self.cache.finish_fetch(&guard);

        let results = match fetched {
            Some(results) if !guard.is_cancelled() => results?,
            _ => {
                debug!(term, "search superseded");
                return Err(SearchError::Superseded);
            }
        };
        self.cache.set_data(key, &results);
        Ok(results)
    }

    async fn fetch(&self, access_token: &str, term: &str) -> anyhow::Result<Vec<SearchResult>> {
        let results = self.api.search_channels(access_token, term).await?;
        if results.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
        let users = match self.api.users_by_ids(access_token, &ids).await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = ?e, "profile lookup for search results failed, using thumbnails");
                Vec::new()
            }
        };
        Ok(enrich_results(results, &users))
    }
}
