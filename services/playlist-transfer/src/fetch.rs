//!
//! src/fetch.rs  Andrew Belles  Oct 3rd, 2025
//!
//! Defines the requests sent to Spotify and the client that turns them
//! into http calls. Requests are plain data so a retry can rebuild the
//! exact same call instead of cloning a consumed body.
//!

use async_trait::async_trait;
use reqwest::{Client, header, redirect};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::time::{Duration, Instant};

use crate::config::{HttpConfig, SpotifyConfig};
use crate::lookup::AccessCredential;
use crate::types::{PlaylistId, UserId};
use crate::TransferError;

pub const CREATED_PLAYLIST_DESCRIPTION: &str = "Created by csv-to-spotify";

/// Spotify rejects more than 100 uris per add-items call
pub const MAX_URIS_PER_REQUEST: usize = 100;

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder  {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, TransferError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_helper(http)
        .default_headers(h)
        .build()
        .map_err(|e| TransferError::Http(format!("build client: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post
}

/// Immutable description of one Spotify api call, relative to api_base
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>
}

impl ApiRequest {
    fn get(path: impl Into<String>) -> Self {
        Self { method: ApiMethod::Get, path: path.into(), query: Vec::new(), body: None }
    }

    fn post(path: impl Into<String>, body: Value) -> Self {
        Self { method: ApiMethod::Post, path: path.into(), query: Vec::new(), body: Some(body) }
    }

    fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// GET /v1/search?q=...&type=track&limit=1&market=..
    pub fn search_track(expression: &str, market: &str) -> Self {
        Self::get("search")
            .with_query("q", expression)
            .with_query("type", "track")
            .with_query("limit", "1")
            .with_query("market", market)
    }

    /// GET /v1/users/{user_id}/playlists
    pub fn user_playlists(user: &UserId, limit: u32, offset: u32) -> Self {
        Self::get(format!("users/{}/playlists", user.0))
            .with_query("limit", limit.to_string())
            .with_query("offset", offset.to_string())
    }

    /// POST /v1/users/{user_id}/playlists
    pub fn create_playlist(user: &UserId, name: &str) -> Self {
        Self::post(format!("users/{}/playlists", user.0), json!({
            "name": name,
            "public": false,
            "description": CREATED_PLAYLIST_DESCRIPTION
        }))
    }

    /// POST /v1/playlists/{playlist_id}/tracks
    pub fn add_items(playlist: &PlaylistId, uris: &[String]) -> Self {
        Self::post(format!("playlists/{}/tracks", playlist.0), json!({ "uris": uris }))
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String
}

impl ApiResponse {
    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

    pub fn is_client_error(&self) -> bool { (400..500).contains(&self.status) }

    pub fn is_server_error(&self) -> bool { (500..600).contains(&self.status) }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransferError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// A fresh access token and, when Spotify rotates it, a new refresh token
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub credential: AccessCredential,
    pub refresh_token: Option<String>
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    pub tracks: SearchTracks
}

#[derive(Debug, Deserialize)]
pub struct SearchTracks {
    #[serde(default)]
    pub items: Vec<TrackMetaData>
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackMetaData {
    pub uri: String,
    #[serde(default)]
    pub name: String
}

#[derive(Debug, Deserialize)]
pub struct UserPlaylists {
    #[serde(default)]
    pub items: Vec<PlaylistSummary>,
    pub next: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistSummary {
    pub id: String,
    pub name: String
}

#[derive(Debug, Deserialize)]
pub struct CreatedPlaylist {
    pub id: String
}

/// Seam between the lookup engine and the wire, production uses
/// `SpotifyClient`, tests use canned fixtures
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    /// Authorization code flow refresh grant
    async fn refresh_access_token(&self, refresh_token: &str) ->
        Result<TokenGrant, TransferError>;

    /// Sends one request, any status is a successful return
    async fn execute(&self, request: &ApiRequest, bearer: &str) ->
        Result<ApiResponse, TransferError>;
}

#[derive(Clone, Debug)]
pub struct SpotifyClient {
    pub http: Client,
    pub cfg: SpotifyConfig
}

impl SpotifyClient {
    pub fn new(http_config: &HttpConfig, cfg: &SpotifyConfig) ->
        Result<Self, TransferError> {

        let http = base_client(http_config)?;
        Ok( Self {
            http,
            cfg: cfg.clone()
        })
    }

    pub fn token_request(&self, refresh_token: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.cfg.token_url.clone())
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token)
            ])
    }

    /// Builds a brand new reqwest request from the immutable description
    pub fn build(&self, request: &ApiRequest, bearer: &str) ->
        Result<reqwest::RequestBuilder, TransferError> {
        let url = self.cfg.api_base.join(&request.path)
            .map_err(|e| TransferError::Http(format!("bad path {}: {e}", request.path)))?;

        let rb = match request.method {
            ApiMethod::Get  => self.http.get(url),
            ApiMethod::Post => self.http.post(url)
        };
        let rb = rb.bearer_auth(bearer).query(&request.query);
        Ok(match &request.body {
            Some(body) => rb.json(body),
            None => rb
        })
    }
}

#[async_trait]
impl SpotifyApi for SpotifyClient {
    async fn refresh_access_token(&self, refresh_token: &str) ->
        Result<TokenGrant, TransferError> {
        let response = self.token_request(refresh_token)
            .send()
            .await
            .map_err(|e| TransferError::Credential(format!("token request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Credential(
                format!("token endpoint returned {status}: {body}")
            ));
        }

        let token: TokenResponse = response.json().await
            .map_err(|e| TransferError::Credential(format!("token body: {e}")))?;

        let expires_in = token.expires_in.unwrap_or(3600);
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        Ok( TokenGrant {
            credential: AccessCredential { token: token.access_token, expiry },
            refresh_token: token.refresh_token
        })
    }

    async fn execute(&self, request: &ApiRequest, bearer: &str) ->
        Result<ApiResponse, TransferError> {
        let response = self.build(request, bearer)?.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok( ApiResponse { status, body } )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> bool {
        std::env::var("LIVE_HTTP").ok().as_deref() == Some("1")
    }

    #[test]
    fn search_request_carries_filters() {
        let req = ApiRequest::search_track("artist:The Beatles track:Yesterday", "IL");
        assert_eq!(req.method, ApiMethod::Get);
        assert_eq!(req.path, "search");
        assert!(req.query.contains(&("type".to_string(), "track".to_string())));
        assert!(req.query.contains(&("limit".to_string(), "1".to_string())));
        assert!(req.query.contains(&("market".to_string(), "IL".to_string())));
        assert!(req.body.is_none());
    }

    #[test]
    fn create_playlist_is_private_with_description() {
        let req = ApiRequest::create_playlist(&UserId::from("u1"), "road trip");
        assert_eq!(req.path, "users/u1/playlists");
        let body = req.body.unwrap();
        assert_eq!(body["name"], "road trip");
        assert_eq!(body["public"], false);
        assert_eq!(body["description"], CREATED_PLAYLIST_DESCRIPTION);
    }

    #[test]
    fn search_response_decodes_without_items() {
        let res = ApiResponse { status: 200, body: r#"{"tracks":{"total":0}}"#.into() };
        let parsed: SearchResponse = res.json().unwrap();
        assert!(parsed.tracks.items.is_empty());
        assert!(res.is_success());
    }

    #[test]
    fn search_item_keeps_uri_and_name() {
        let body = r#"{"tracks":{"total":1,"items":[
            {"id":"3BQHpFgAp4l80e1XslIjNI","uri":"spotify:track:3BQHpFgAp4l80e1XslIjNI",
             "name":"Yesterday - Remastered 2009","popularity":70}
        ]}}"#;
        let res = ApiResponse { status: 200, body: body.into() };
        let parsed: SearchResponse = res.json().unwrap();
        let track = &parsed.tracks.items[0];
        assert_eq!(track.uri, "spotify:track:3BQHpFgAp4l80e1XslIjNI");
        assert_eq!(track.name, "Yesterday - Remastered 2009");
    }

    #[tokio::test]
    async fn spotify_search_testbench() -> Result<(), TransferError> {
        dotenvy::dotenv().ok();

        if !live() {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }

        let refresh = std::env::var("TEST_REFRESH_TOKEN")
            .map_err(|_| TransferError::Config("TEST_REFRESH_TOKEN was not set".into()))?;
        let cfgs = crate::config::load_config()?;
        let spotify = SpotifyClient::new(&cfgs.http, &cfgs.spotify)?;

        let grant = spotify.refresh_access_token(&refresh).await?;
        let query = crate::types::TrackQuery::new("The Beatles", "Yesterday");
        let response = spotify.execute(
            &ApiRequest::search_track(&query.search_expression(), &cfgs.spotify.market),
            &grant.credential.token
        ).await?;
        assert!(response.is_success());

        let parsed: SearchResponse = response.json()?;
        println!("search: {:#?}", parsed.tracks.items);
        assert!(!parsed.tracks.items.is_empty());

        Ok(())
    }
}
