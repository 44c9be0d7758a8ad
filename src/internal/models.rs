use serde::{Deserialize, Serialize};

use crate::api::{HelixStream, HelixUser};

/// Expiry sentinel for tokens issued without a reported lifetime.
pub const NEVER_EXPIRES: i64 = 9_007_199_254_740_991;

/// A channel the user has chosen to monitor. This is the persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedChannel {
    pub id: String,
    pub display_name: String,
}

impl TrackedChannel {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// A tracked channel enriched with live status for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub display_name: String,
    pub is_online: bool,
    /// Only populated while `is_online` is true.
    pub viewer_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
}

impl Channel {
    pub fn from_status(
        tracked: &TrackedChannel,
        stream: Option<&HelixStream>,
        user: Option<&HelixUser>,
    ) -> Self {
        Self {
            id: tracked.id.clone(),
            display_name: tracked.display_name.clone(),
            is_online: stream.is_some(),
            viewer_count: stream.map(|s| s.viewers),
            profile_picture_url: user.map(|u| u.profile_picture_url.clone()),
        }
    }
}

/// One row of a channel search response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub display_name: String,
    pub is_online: bool,
    /// The search endpoint never reports viewers.
    pub viewer_count: Option<u64>,
    pub profile_picture_url: String,
}

impl SearchResult {
    pub fn as_tracked(&self) -> TrackedChannel {
        TrackedChannel::new(self.id.clone(), self.display_name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub access_token: String,
    /// Unix milliseconds, or [`NEVER_EXPIRES`].
    pub expires_at: i64,
}

impl TokenData {
    pub fn never_expires(&self) -> bool {
        self.expires_at == NEVER_EXPIRES
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        !(self.never_expires() || self.expires_at > now_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_channel_wire_shape() {
        let json = serde_json::to_string(&TrackedChannel::new("42", "Shroud")).unwrap();
        assert_eq!(json, r#"{"id":"42","displayName":"Shroud"}"#);
    }

    #[test]
    fn test_channel_offline_has_no_viewers() {
        let tracked = TrackedChannel::new("1", "one");
        let channel = Channel::from_status(&tracked, None, None);
        assert!(!channel.is_online);
        assert_eq!(channel.viewer_count, None);
        assert_eq!(channel.profile_picture_url, None);
    }

    #[test]
    fn test_token_expiry() {
        let token = TokenData {
            access_token: "abc".to_string(),
            expires_at: 1_000,
        };
        assert!(!token.is_expired(999));
        assert!(token.is_expired(1_000));

        let forever = TokenData {
            access_token: "abc".to_string(),
            expires_at: NEVER_EXPIRES,
        };
        assert!(!forever.is_expired(i64::MAX));
    }
}
