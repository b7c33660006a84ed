use serde::{Deserialize, Serialize};

// End-user identity, doubles as the job id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self { UserId(s.to_string()) }
}


// spotify:track:... uri returned by search
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpotifyTrackUri(pub String);


#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaylistId(pub String);


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackQuery {
    pub artist: String,
    pub title: String
}

impl TrackQuery {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self { artist: artist.into(), title: title.into() }
    }

    /// Spotify field filter syntax
    pub fn search_expression(&self) -> String {
        format!("artist:{} track:{}", self.artist, self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackLookupResult {
    pub found: bool,
    pub external_id: Option<SpotifyTrackUri>
}

impl TrackLookupResult {
    pub fn found(uri: SpotifyTrackUri) -> Self {
        Self { found: true, external_id: Some(uri) }
    }

    pub fn not_found() -> Self {
        Self { found: false, external_id: None }
    }
}
