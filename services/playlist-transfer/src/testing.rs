//! Canned Spotify responses shared by the unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{Duration, Instant};

use crate::fetch::{ApiMethod, ApiRequest, ApiResponse, SpotifyApi, TokenGrant};
use crate::lookup::AccessCredential;
use crate::TransferError;

#[derive(Debug, Clone, Copy)]
pub enum Mode {
    /// Answers searches from the seeded catalog
    Catalog,
    /// Every api call returns this status
    Always(u16),
    /// The first n api calls return the status, then Catalog
    FailFirst(u32, u16)
}

pub struct FixtureApi {
    mode: Mode,
    catalog: HashMap<String, String>,
    playlists: Mutex<Vec<(String, String)>>,
    refresh_calls: AtomicU32,
    execute_calls: AtomicU32,
    refresh_limit: AtomicU32,
    requests: Mutex<Vec<ApiRequest>>
}

impl FixtureApi {
    pub fn new(mode: Mode) -> Self {
        let mut catalog = HashMap::new();
        let seed = [
            ("The Beatles", "Yesterday", "spotify:track:3BQHpFgAp4l80e1XslIjNI"),
            ("Tame Impala", "Breathe Deeper", "spotify:track:6GtOsEzNUhJghrIf6UTbRV"),
            ("Radiohead", "Airbag", "spotify:track:6dsq7Nt5mIFzvm5kIYNORy"),
            ("Portishead", "Roads", "spotify:track:1Xwy1ZLpjbB4ZC8n1dpSS4"),
            ("Massive Attack", "Teardrop", "spotify:track:67Hna13dNDkZvBpTXRIaOJ")
        ];
        for (artist, title, uri) in seed {
            catalog.insert(format!("artist:{artist} track:{title}"), uri.to_string());
        }
        Self {
            mode,
            catalog,
            playlists: Mutex::new(Vec::new()),
            refresh_calls: AtomicU32::new(0),
            execute_calls: AtomicU32::new(0),
            refresh_limit: AtomicU32::new(u32::MAX),
            requests: Mutex::new(Vec::new())
        }
    }

    pub fn catalog() -> Self {
        Self::new(Mode::Catalog)
    }

    pub fn with_playlist(self, id: &str, name: &str) -> Self {
        self.playlists.lock().push((id.to_string(), name.to_string()));
        self
    }

    /// Every refresh from now on is rejected
    pub fn fail_refresh(&self) {
        self.refresh_limit.store(self.refresh_calls(), Ordering::SeqCst);
    }

    /// Only the first n refreshes succeed
    pub fn fail_refresh_after(self, n: u32) -> Self {
        self.refresh_limit.store(n, Ordering::SeqCst);
        self
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> u32 {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    fn respond(status: u16, body: serde_json::Value) -> ApiResponse {
        ApiResponse { status, body: body.to_string() }
    }

    fn answer(&self, request: &ApiRequest) -> ApiResponse {
        match (request.method, request.path.as_str()) {
            (ApiMethod::Get, "search") => {
                let expression = request.query.iter()
                    .find(|(k, _)| k == "q")
                    .map(|(_, v)| v.as_str())
                    .unwrap_or_default();
                match self.catalog.get(expression) {
                    Some(uri) => {
                        let id = uri.rsplit(':').next().unwrap_or_default();
                        Self::respond(200, json!({
                            "tracks": { "items": [{ "id": id, "uri": uri, "name": expression }], "total": 1 }
                        }))
                    }
                    None => Self::respond(200, json!({ "tracks": { "items": [], "total": 0 } }))
                }
            }
            (ApiMethod::Get, path) if path.ends_with("/playlists") => {
                let items: Vec<_> = self.playlists.lock().iter()
                    .map(|(id, name)| json!({ "id": id, "name": name }))
                    .collect();
                Self::respond(200, json!({ "items": items, "next": null }))
            }
            (ApiMethod::Post, path) if path.ends_with("/playlists") => {
                let id = format!("created-{}", self.playlists.lock().len());
                let name = request.body.as_ref()
                    .and_then(|b| b["name"].as_str())
                    .unwrap_or_default()
                    .to_string();
                self.playlists.lock().push((id.clone(), name));
                Self::respond(201, json!({ "id": id }))
            }
            (ApiMethod::Post, path) if path.ends_with("/tracks") => {
                Self::respond(201, json!({ "snapshot_id": "snap" }))
            }
            _ => Self::respond(404, json!({ "error": "no fixture" }))
        }
    }
}

#[async_trait]
impl SpotifyApi for FixtureApi {
    async fn refresh_access_token(&self, refresh_token: &str) ->
        Result<TokenGrant, TransferError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n > self.refresh_limit.load(Ordering::SeqCst) {
            return Err(TransferError::Credential(format!("refresh rejected for {refresh_token}")));
        }
        Ok( TokenGrant {
            credential: AccessCredential {
                token: format!("access-{n}"),
                expiry: Instant::now() + Duration::from_secs(3600)
            },
            refresh_token: None
        })
    }

    async fn execute(&self, request: &ApiRequest, _bearer: &str) ->
        Result<ApiResponse, TransferError> {
        let n = self.execute_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request.clone());
        Ok(match self.mode {
            Mode::Catalog => self.answer(request),
            Mode::Always(status) => Self::respond(status, json!({ "error": status })),
            Mode::FailFirst(count, status) if n <= count =>
                Self::respond(status, json!({ "error": status })),
            Mode::FailFirst(..) => self.answer(request)
        })
    }
}
