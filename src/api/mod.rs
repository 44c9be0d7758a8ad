use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

const HELIX_API_BASE_URL: &str = "https://api.twitch.tv/helix/";
const ID_API_BASE_URL: &str = "https://id.twitch.tv/oauth2/";

/// Largest page Helix returns for id-keyed lookups.
const HELIX_PAGE_SIZE: &str = "100";

/// Result of validating an access token.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenInfo {
    pub client_id: Option<String>,
    pub login: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HelixUser {
    pub id: String,
    pub display_name: String,
    #[serde(rename = "profile_image_url", default)]
    pub profile_picture_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HelixStream {
    pub user_id: String,
    #[serde(rename = "viewer_count")]
    pub viewers: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HelixChannelSearchResult {
    pub id: String,
    pub display_name: String,
    pub is_live: bool,
    #[serde(default)]
    pub thumbnail_url: String,
}

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
}

/// The remote operations the tracker relies on.
#[async_trait]
pub trait TwitchApi: Send + Sync {
    /// The application's client id, if one is configured.
    fn client_id(&self) -> Option<&str>;

    async fn token_info(&self, access_token: &str) -> Result<TokenInfo>;

    async fn users_by_ids(&self, access_token: &str, ids: &[String]) -> Result<Vec<HelixUser>>;

    /// Absence of an entry for an id means that channel is offline.
    async fn streams_by_user_ids(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<HelixStream>>;

    async fn search_channels(
        &self,
        access_token: &str,
        term: &str,
    ) -> Result<Vec<HelixChannelSearchResult>>;

    async fn user_by_id(&self, access_token: &str, id: &str) -> Result<Option<HelixUser>> {
        let users = self.users_by_ids(access_token, &[id.to_string()]).await?;
        Ok(users.into_iter().find(|u| u.id == id))
    }
}

/// HTTP client for the Twitch Helix and OAuth endpoints.
///
/// Errors are `anyhow` with context naming the failed operation so callers
/// can log them without losing the underlying reqwest cause.
#[derive(Clone)]
pub struct HelixClient {
    client: Client,
    client_id: String,
    helix_base_url: String,
    id_base_url: String,
}

impl HelixClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_base_urls(client_id, HELIX_API_BASE_URL, ID_API_BASE_URL)
    }

    /// Point the client at alternative base urls (each ending in `/`).
    pub fn with_base_urls(
        client_id: impl Into<String>,
        helix_base_url: impl Into<String>,
        id_base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            client_id: client_id.into(),
            helix_base_url: helix_base_url.into(),
            id_base_url: id_base_url.into(),
        }
    }

    /// GET a Helix endpoint with app credentials and decode the `data` array.
    async fn get_helix<T>(
        &self,
        path: &str,
        access_token: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.helix_base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("Client-Id", &self.client_id)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("failed to send GET request to {}", url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned an error status", url))?;

        let page: HelixPage<T> = resp
            .json()
            .await
            .with_context(|| format!("failed to parse JSON response from {}", url))?;
        Ok(page.data)
    }
}

#[async_trait]
impl TwitchApi for HelixClient {
    fn client_id(&self) -> Option<&str> {
        match self.client_id.trim().is_empty() {
            true => None,
            false => Some(self.client_id.as_str()),
        }
    }

    async fn token_info(&self, access_token: &str) -> Result<TokenInfo> {
        let url = format!("{}validate", self.id_base_url);
        let info: TokenInfo = self
            .client
            .get(&url)
            .header("Authorization", format!("OAuth {}", access_token))
            .send()
            .await
            .context("token_info: failed to reach validation endpoint")?
            .error_for_status()
            .context("token_info: token rejected")?
            .json()
            .await
            .context("token_info: failed to parse validation response")?;

        if let Some(issued_to) = info.client_id.as_deref()
            && issued_to != self.client_id
        {
            bail!("token_info: token was issued to a different client id");
        }
        Ok(info)
    }

    async fn users_by_ids(&self, access_token: &str, ids: &[String]) -> Result<Vec<HelixUser>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query: Vec<(&str, &str)> = ids.iter().map(|id| ("id", id.as_str())).collect();
        self.get_helix("users", access_token, &query)
            .await
            .with_context(|| format!("users_by_ids failed for {} ids", ids.len()))
    }

    async fn streams_by_user_ids(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<HelixStream>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: Vec<(&str, &str)> =
            ids.iter().map(|id| ("user_id", id.as_str())).collect();
        query.push(("first", HELIX_PAGE_SIZE));
        self.get_helix("streams", access_token, &query)
            .await
            .with_context(|| format!("streams_by_user_ids failed for {} ids", ids.len()))
    }

    async fn search_channels(
        &self,
        access_token: &str,
        term: &str,
    ) -> Result<Vec<HelixChannelSearchResult>> {
        self.get_helix("search/channels", access_token, &[("query", term)])
            .await
            .with_context(|| format!("search_channels failed for {:?}", term))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> HelixClient {
        let base = format!("{}/", server.url());
        HelixClient::with_base_urls("test-client", base.clone(), base)
    }

    #[tokio::test]
    async fn test_users_by_ids_sends_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/users")
            .match_query(Matcher::UrlEncoded("id".into(), "7".into()))
            .match_header("client-id", "test-client")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"id":"7","login":"seven","display_name":"Seven","profile_image_url":"https://img/7.png"}]}"#,
            )
            .create_async()
            .await;

        let users = client_for(&server)
            .users_by_ids("tok", &["7".to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].display_name, "Seven");
        assert_eq!(users[0].profile_picture_url, "https://img/7.png");
    }

    #[tokio::test]
    async fn test_empty_id_list_skips_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", Matcher::Any).expect(0).create_async().await;

        let client = client_for(&server);
        assert!(client.users_by_ids("tok", &[]).await.unwrap().is_empty());
        assert!(client.streams_by_user_ids("tok", &[]).await.unwrap().is_empty());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_info_rejects_foreign_client_id() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/validate")
            .match_header("authorization", "OAuth tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"client_id":"someone-else","login":"a","user_id":"1","scopes":[],"expires_in":100}"#)
            .create_async()
            .await;

        let err = client_for(&server).token_info("tok").await.unwrap_err();
        assert!(err.to_string().contains("different client id"));
    }

    #[tokio::test]
    async fn test_token_info_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/validate")
            .with_status(401)
            .with_body(r#"{"status":401,"message":"invalid access token"}"#)
            .create_async()
            .await;

        let err = client_for(&server).token_info("tok").await.unwrap_err();
        assert!(err.to_string().contains("token rejected"));
    }

    #[tokio::test]
    async fn test_network_error_has_context() {
        let client = HelixClient::with_base_urls("c", "http://localhost:1/", "http://localhost:1/");
        let err = client
            .search_channels("tok", "rust")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("search_channels failed"));
    }

    #[test]
    fn test_client_id_blank_is_none() {
        assert_eq!(HelixClient::new("  ").client_id(), None);
        assert_eq!(HelixClient::new("abc").client_id(), Some("abc"));
    }
}
