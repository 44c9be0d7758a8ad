use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Result, anyhow};
use reqwest::Url;
use strum_macros::Display;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::models::{AuthUser, NEVER_EXPIRES, TokenData};
use super::query_cache::{QueryCache, QueryKey};
use super::redirect::Redirect;
use crate::api::TwitchApi;
use crate::config::AppConfig;
use crate::utils::url::{fragment_param, with_query};

/// Tokens are treated as expired this long before the reported lifetime ends.
pub const EXPIRY_SAFETY_MARGIN_MS: i64 = 60_000;

pub trait Clock: Send + Sync {
    /// Current time in Unix milliseconds.
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        jiff::Timestamp::now().as_millisecond()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AuthPhase {
    Restoring,
    LoggedOut,
    PendingValidation,
    LoggedIn,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub authorize_url: String,
}

impl AuthSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri().to_string(),
            scope: config.scope.clone(),
            authorize_url: config.authorize_url.clone(),
        }
    }
}

/// Absent, non-numeric or non-positive lifetimes never expire.
pub fn expires_at_from(expires_in: Option<&str>, now_ms: i64) -> i64 {
    let seconds = expires_in
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s > 0.0);
    match seconds {
        Some(s) => now_ms
            .saturating_add((s * 1000.0) as i64)
            .saturating_sub(EXPIRY_SAFETY_MARGIN_MS),
        None => NEVER_EXPIRES,
    }
}

/// Parse an implicit-grant fragment. `None` when it carries no usable token.
pub fn token_from_fragment(fragment: &str, now_ms: i64) -> Option<TokenData> {
    let access_token = fragment_param(fragment, "access_token").filter(|t| !t.is_empty())?;
    let expires_in = fragment_param(fragment, "expires_in");
    Some(TokenData {
        access_token,
        expires_at: expires_at_from(expires_in.as_deref(), now_ms),
    })
}

#[derive(Debug, Default)]
struct AuthState {
    token: Option<TokenData>,
    user: Option<AuthUser>,
}

/// Owns the access token and the user it resolves to.
///
/// Token and user are mirrored into the query cache so other components
/// observe them; changes made to the cache by anyone else are folded back
/// by [`TokenManager::spawn_cache_sync`].
pub struct TokenManager {
    api: Arc<dyn TwitchApi>,
    cache: Arc<QueryCache>,
    redirect: Arc<dyn Redirect>,
    clock: Arc<dyn Clock>,
    settings: AuthSettings,
    restoring: watch::Receiver<bool>,
    state: RwLock<AuthState>,
    validating: Mutex<Option<String>>,
}

impl TokenManager {
    pub fn new(
        api: Arc<dyn TwitchApi>,
        cache: Arc<QueryCache>,
        redirect: Arc<dyn Redirect>,
        clock: Arc<dyn Clock>,
        settings: AuthSettings,
        restoring: watch::Receiver<bool>,
    ) -> Self {
        let state = AuthState {
            token: cache.get_data(&QueryKey::Token),
            user: cache.get_data(&QueryKey::User),
        };
        Self {
            api,
            cache,
            redirect,
            clock,
            settings,
            restoring,
            state: RwLock::new(state),
            validating: Mutex::new(None),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, AuthState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, AuthState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_restoring(&self) -> bool {
        *self.restoring.borrow()
    }

    fn phase_of(&self, state: &AuthState) -> AuthPhase {
        match (self.is_restoring(), &state.token, &state.user) {
            (true, _, _) => AuthPhase::Restoring,
            (false, None, _) => AuthPhase::LoggedOut,
            (false, Some(_), None) => AuthPhase::PendingValidation,
            (false, Some(_), Some(_)) => AuthPhase::LoggedIn,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase_of(&self.read_state())
    }

    pub fn is_authenticated(&self) -> bool {
        let state = self.read_state();
        state.token.is_some() && state.user.is_some()
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_state()
            .token
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    pub fn token(&self) -> Option<TokenData> {
        self.read_state().token.clone()
    }

    pub fn user(&self) -> Option<AuthUser> {
        self.read_state().user.clone()
    }

    pub fn authorize_url(&self) -> Result<Url> {
        with_query(
            &self.settings.authorize_url,
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("response_type", "token"),
                ("scope", self.settings.scope.as_str()),
            ],
        )
    }

    /// Hand the authorization page to the host. The result arrives later as a
    /// url fragment picked up by [`TokenManager::initialize`].
    pub fn login(&self) -> Result<()> {
        let url = self.authorize_url()?;
        self.redirect.initiate(&url)
    }

    pub fn logout(&self) {
        {
            let mut state = self.write_state();
            state.token = None;
            state.user = None;
        }
        *self.validating.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.cache.clear_data(QueryKey::Token);
        self.cache.clear_data(QueryKey::User);
        info!("logged out");
    }

    /// Settle the token after startup or after landing on the redirect url.
    pub async fn initialize(&self) -> AuthPhase {
        let mut restoring = self.restoring.clone();
        // An error means the persister is gone, so nothing is restoring.
        let _ = restoring.wait_for(|r| !*r).await;

        match self.redirect.capture_fragment_once() {
            Some(fragment) => self.adopt_fragment(&fragment),
            None => self.adopt_cached(),
        }
        self.validate_if_needed().await
    }

    fn adopt_fragment(&self, fragment: &str) {
        let Some(token) = token_from_fragment(fragment, self.clock.now_ms()) else {
            debug!("redirect fragment carried no access token");
            return;
        };
        info!(never_expires = token.never_expires(), "received access token");
        let token_changed = {
            let mut state = self.write_state();
            let changed = state.token.as_ref() != Some(&token);
            // The previous user belongs to whichever token came before.
            if changed {
                state.user = None;
            }
            state.token = Some(token.clone());
            changed
        };
        self.cache.set_data(QueryKey::Token, &token);
        if token_changed {
            self.cache.clear_data(QueryKey::User);
        }
    }

    fn adopt_cached(&self) {
        let Some(cached) = self.cache.get_data::<TokenData>(&QueryKey::Token) else {
            return;
        };
        match cached.is_expired(self.clock.now_ms()) {
            false => {
                let user = self.cache.get_data::<AuthUser>(&QueryKey::User);
                let mut state = self.write_state();
                state.token = Some(cached);
                if user.is_some() {
                    state.user = user;
                }
            }
            true => {
                info!("cached access token expired, clearing");
                {
                    let mut state = self.write_state();
                    state.token = None;
                    state.user = None;
                }
                self.cache.clear_data(QueryKey::Token);
                self.cache.clear_data(QueryKey::User);
            }
        }
    }

    /// The validated token is still the one both we and the cache hold.
    fn is_current(&self, token: &TokenData) -> bool {
        self.read_state().token.as_ref() == Some(token)
            && self.cache.get_data::<TokenData>(&QueryKey::Token).as_ref() == Some(token)
    }

    /// Resolve the user for a token that has none yet. Any failure logs out.
    pub async fn validate_if_needed(&self) -> AuthPhase {
        if self.is_restoring() {
            return AuthPhase::Restoring;
        }

        let token = {
            let mut state = self.write_state();
            if state.token.is_none() && state.user.is_some() {
                state.user = None;
            }
            match (&state.token, &state.user) {
                (Some(token), None) => token.clone(),
                _ => return self.phase_of(&state),
            }
        };

        {
            let mut validating = self.validating.lock().unwrap_or_else(PoisonError::into_inner);
            if validating.as_deref() == Some(token.access_token.as_str()) {
                return AuthPhase::PendingValidation;
            }
            *validating = Some(token.access_token.clone());
        }

        let resolved = self.resolve_user(&token.access_token).await;

        {
            let mut validating = self.validating.lock().unwrap_or_else(PoisonError::into_inner);
            if validating.as_deref() == Some(token.access_token.as_str()) {
                *validating = None;
            }
        }

        if !self.is_current(&token) {
            debug!("discarding validation result for a superseded token");
            return self.phase();
        }

        match resolved {
            Ok(user) => {
                info!(user_id = %user.id, display_name = %user.display_name, "token validated");
                self.write_state().user = Some(user.clone());
                self.cache.set_data(QueryKey::User, &user);
            }
            Err(e) => {
                error!(error = ?e, "Failed to fetch Twitch user or token invalid");
                {
                    let mut state = self.write_state();
                    state.token = None;
                    state.user = None;
                }
                self.cache.clear_data(QueryKey::Token);
                self.cache.clear_data(QueryKey::User);
            }
        }
        self.phase()
    }

    async fn resolve_user(&self, access_token: &str) -> Result<AuthUser> {
        let info = self.api.token_info(access_token).await?;
        let user_id = info
            .user_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("Token info did not contain a user ID"))?;
        let user = self
            .api
            .user_by_id(access_token, &user_id)
            .await?
            .ok_or_else(|| anyhow!("Failed to fetch user details despite valid token info"))?;
        Ok(AuthUser {
            id: user.id,
            display_name: user.display_name,
        })
    }

    fn apply_cached_token(&self) {
        let cached = self.cache.get_data::<TokenData>(&QueryKey::Token);
        let cleared = cached.is_none();
        {
            let mut state = self.write_state();
            state.token = cached;
            if cleared {
                state.user = None;
            }
        }
        if cleared && self.cache.get_data::<AuthUser>(&QueryKey::User).is_some() {
            self.cache.clear_data(QueryKey::User);
        }
    }

    fn apply_cached_user(&self) {
        self.write_state().user = self.cache.get_data(&QueryKey::User);
    }

    /// Follow external writes to the token and user cache keys until shutdown.
    pub fn spawn_cache_sync(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut token_rx = self.cache.subscribe(QueryKey::Token);
        let mut user_rx = self.cache.subscribe(QueryKey::User);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    changed = token_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        manager.apply_cached_token();
                    }
                    changed = user_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        manager.apply_cached_user();
                    }
                }

                let validator = Arc::clone(&manager);
                tokio::spawn(async move {
                    validator.validate_if_needed().await;
                });
            }
        })
    }
}
