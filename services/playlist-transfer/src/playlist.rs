//!
//! src/playlist.rs  Andrew Belles  Oct 5th, 2025
//!
//! Terminal action of a job: find or create the target playlist and
//! push the collected tracks into it
//!

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::fetch::{ApiRequest, CreatedPlaylist, MAX_URIS_PER_REQUEST, UserPlaylists};
use crate::lookup::LookupEngine;
use crate::types::{PlaylistId, SpotifyTrackUri, UserId};
use crate::TransferError;

const PLAYLIST_PAGE_SIZE: u32 = 50;
const PLAYLIST_MAX_PAGES: u32 = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistHandle {
    pub id: PlaylistId,
    pub name: String,
    pub created: bool
}

#[async_trait]
pub trait PlaylistService: Send + Sync {
    async fn create_or_reuse_playlist(&self, user: &UserId, name: &str) ->
        Result<PlaylistHandle, TransferError>;

    async fn populate_playlist(&self, playlist: &PlaylistHandle, uris: &[SpotifyTrackUri]) ->
        Result<(), TransferError>;
}

/// Playlist calls go through the job's engine so they share its
/// credential and retry budget
pub struct SpotifyPlaylists {
    engine: Arc<LookupEngine>
}

impl SpotifyPlaylists {
    pub fn new(engine: Arc<LookupEngine>) -> Self {
        Self { engine }
    }

    async fn find_existing(&self, user: &UserId, name: &str) ->
        Result<Option<PlaylistId>, TransferError> {
        for page in 0..PLAYLIST_MAX_PAGES {
            let request = ApiRequest::user_playlists(
                user, PLAYLIST_PAGE_SIZE, page * PLAYLIST_PAGE_SIZE
            );
            let response = self.engine.request(&request).await?;
            if !response.is_success() {
                return Err(TransferError::Status { status: response.status, path: request.path });
            }

            let playlists: UserPlaylists = response.json()?;
            if let Some(found) = playlists.items.iter().find(|p| p.name == name) {
                return Ok(Some(PlaylistId(found.id.clone())));
            }
            if playlists.next.is_none() {
                break;
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PlaylistService for SpotifyPlaylists {
    async fn create_or_reuse_playlist(&self, user: &UserId, name: &str) ->
        Result<PlaylistHandle, TransferError> {
        if let Some(id) = self.find_existing(user, name).await? {
            info!(user = %user, playlist = %id.0, name, "playlist.reuse");
            return Ok(PlaylistHandle { id, name: name.to_string(), created: false });
        }

        let request = ApiRequest::create_playlist(user, name);
        let response = self.engine.request(&request).await?;
        if !response.is_success() {
            return Err(TransferError::Status { status: response.status, path: request.path });
        }
        let created: CreatedPlaylist = response.json()?;
        info!(user = %user, playlist = %created.id, name, "playlist.created");

        Ok( PlaylistHandle { id: PlaylistId(created.id), name: name.to_string(), created: true } )
    }

    async fn populate_playlist(&self, playlist: &PlaylistHandle, uris: &[SpotifyTrackUri]) ->
        Result<(), TransferError> {
        for chunk in uris.chunks(MAX_URIS_PER_REQUEST) {
            let uris: Vec<String> = chunk.iter().map(|u| u.0.clone()).collect();
            let request = ApiRequest::add_items(&playlist.id, &uris);
            let response = self.engine.request(&request).await?;
            if !response.is_success() {
                return Err(TransferError::Status { status: response.status, path: request.path });
            }
            debug!(playlist = %playlist.id.0, added = uris.len(), "playlist.items.added");
        }
        info!(playlist = %playlist.id.0, total = uris.len(), "playlist.populated");
        Ok(())
    }
}
