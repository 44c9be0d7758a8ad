mod common;

use std::sync::Arc;
use std::time::Duration;

use mockito::Matcher;

use common::{FakeRedirect, FixedClock, NOW_MS, channels};
use twitch_opticon::api::{HelixClient, TwitchApi};
use twitch_opticon::internal::auth::{AuthPhase, AuthSettings, TokenManager};
use twitch_opticon::internal::models::{NEVER_EXPIRES, TokenData};
use twitch_opticon::internal::persist::{MemoryBlobStore, Persister};
use twitch_opticon::internal::query_cache::{QueryCache, QueryKey};
use twitch_opticon::internal::search::ChannelSearch;
use twitch_opticon::internal::status::{ChannelStatusPoller, RefreshOutcome};

fn client_for(server: &mockito::ServerGuard) -> HelixClient {
    let base = format!("{}/", server.url());
    HelixClient::with_base_urls("test-client", base.clone(), base)
}

fn token() -> TokenData {
    TokenData {
        access_token: "tok".to_string(),
        expires_at: NEVER_EXPIRES,
    }
}

#[tokio::test]
async fn test_integration_streams_request_shape() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/streams")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("user_id".into(), "1".into()),
            Matcher::UrlEncoded("user_id".into(), "2".into()),
            Matcher::UrlEncoded("first".into(), "100".into()),
        ]))
        .match_header("client-id", "test-client")
        .match_header("authorization", "Bearer tok")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":"s1","user_id":"1","user_name":"One","viewer_count":42,"type":"live"}],"pagination":{}}"#)
        .create_async()
        .await;

    let streams = client_for(&server)
        .streams_by_user_ids("tok", &["1".to_string(), "2".to_string()])
        .await
        .expect("Failed to fetch streams");

    mock.assert_async().await;
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].user_id, "1");
    assert_eq!(streams[0].viewers, 42);
}

#[tokio::test]
async fn test_integration_search_channels() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/search/channels")
        .match_query(Matcher::UrlEncoded("query".into(), "shroud tv".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":"37402112","broadcaster_login":"shroud","display_name":"shroud","is_live":true,"thumbnail_url":"https://thumb/shroud.jpg","title":"x"}]}"#)
        .create_async()
        .await;

    let rows = client_for(&server)
        .search_channels("tok", "shroud tv")
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_live);
    assert_eq!(rows[0].thumbnail_url, "https://thumb/shroud.jpg");
}

#[tokio::test]
async fn test_integration_user_by_id_missing_is_none() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/users")
        .match_query(Matcher::UrlEncoded("id".into(), "404".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[]}"#)
        .create_async()
        .await;

    let user = client_for(&server).user_by_id("tok", "404").await.unwrap();
    assert_eq!(user, None);
}

#[tokio::test]
async fn test_integration_login_flow_against_helix() {
    let mut server = mockito::Server::new_async().await;
    let validate = server
        .mock("GET", "/validate")
        .match_header("authorization", "OAuth fresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"client_id":"test-client","login":"seven","user_id":"7","scopes":["user:read:email"],"expires_in":5000}"#)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/users")
        .match_query(Matcher::UrlEncoded("id".into(), "7".into()))
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":"7","login":"seven","display_name":"Seven","profile_image_url":"https://img/7.png"}]}"#)
        .create_async()
        .await;

    let cache = Arc::new(QueryCache::new());
    let persister = Persister::new(Arc::new(MemoryBlobStore::new()), Arc::clone(&cache));
    let tokens = TokenManager::new(
        Arc::new(client_for(&server)),
        Arc::clone(&cache),
        Arc::new(FakeRedirect::landed_with("access_token=fresh&expires_in=5000")),
        Arc::new(FixedClock::at(NOW_MS)),
        AuthSettings {
            client_id: "test-client".to_string(),
            redirect_uri: "http://localhost:3000".to_string(),
            scope: "user:read:email".to_string(),
            authorize_url: format!("{}/authorize", server.url()),
        },
        persister.restoring(),
    );
    persister.restore();

    assert_eq!(tokens.initialize().await, AuthPhase::LoggedIn);
    assert_eq!(tokens.user().map(|u| u.display_name), Some("Seven".to_string()));

    validate.assert_async().await;
    users.assert_async().await;
}

#[tokio::test]
async fn test_integration_rejected_token_logs_out() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/validate")
        .with_status(401)
        .with_body(r#"{"status":401,"message":"invalid access token"}"#)
        .create_async()
        .await;

    let cache = Arc::new(QueryCache::new());
    let persister = Persister::new(Arc::new(MemoryBlobStore::new()), Arc::clone(&cache));
    let tokens = TokenManager::new(
        Arc::new(client_for(&server)),
        Arc::clone(&cache),
        Arc::new(FakeRedirect::landed_with("access_token=revoked")),
        Arc::new(FixedClock::at(NOW_MS)),
        AuthSettings {
            client_id: "test-client".to_string(),
            redirect_uri: "http://localhost:3000".to_string(),
            scope: "user:read:email".to_string(),
            authorize_url: "https://id.twitch.tv/oauth2/authorize".to_string(),
        },
        persister.restoring(),
    );
    persister.restore();

    assert_eq!(tokens.initialize().await, AuthPhase::LoggedOut);
    assert_eq!(cache.get_data::<TokenData>(&QueryKey::Token), None);
}

#[tokio::test]
async fn test_integration_status_poll_against_helix() {
    let mut server = mockito::Server::new_async().await;
    let _streams = server
        .mock("GET", "/streams")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"user_id":"1","viewer_count":7}]}"#)
        .create_async()
        .await;
    let _users = server
        .mock("GET", "/users")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":"1","display_name":"One","profile_image_url":"https://img/1.png"},{"id":"2","display_name":"Two","profile_image_url":"https://img/2.png"}]}"#)
        .create_async()
        .await;

    let cache = Arc::new(QueryCache::new());
    cache.set_data(QueryKey::Token, &token());
    let tracked = channels(&["1", "2"]);
    cache.set_data(QueryKey::TrackedChannels, &tracked);
    let poller = ChannelStatusPoller::new(
        Arc::new(client_for(&server)),
        Arc::clone(&cache),
        Duration::from_secs(10),
    );

    assert_eq!(poller.refresh().await, RefreshOutcome::Updated);
    let ordered = poller.snapshot().ordered(&tracked);
    assert_eq!(ordered[0].viewer_count, Some(7));
    assert!(!ordered[1].is_online);
    assert_eq!(ordered[1].profile_picture_url.as_deref(), Some("https://img/2.png"));
}

#[tokio::test]
async fn test_integration_search_survives_users_outage() {
    let mut server = mockito::Server::new_async().await;
    let _search = server
        .mock("GET", "/search/channels")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":"9","display_name":"Nine","is_live":false,"thumbnail_url":"https://thumb/9.jpg"}]}"#)
        .create_async()
        .await;
    let _users = server
        .mock("GET", "/users")
        .match_query(Matcher::Any)
        .with_status(503)
        .create_async()
        .await;

    let search = ChannelSearch::new(
        Arc::new(client_for(&server)),
        Arc::new(QueryCache::new()),
        Duration::from_secs(300),
    );
    let results = search.search("nine", Some("tok")).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].profile_picture_url, "https://thumb/9.jpg");
    assert_eq!(results[0].viewer_count, None);
}
