//!
//! src/lookup.rs  Andrew Belles  Oct 3rd, 2025
//!
//! Track lookup engine. One instance per job: owns the job's access
//! credential and a retry budget shared by every request it issues.
//! A 4xx means the token most likely expired, so the engine waits,
//! refreshes and resends. A 5xx is handed back untouched.
//!

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::fetch::{ApiRequest, ApiResponse, SearchResponse, SpotifyApi};
use crate::types::{SpotifyTrackUri, TrackLookupResult, TrackQuery, UserId};
use crate::TransferError;

#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub token: String,
    pub expiry: Instant
}

impl AccessCredential {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry
    }
}

#[derive(Debug)]
struct CredentialState {
    refresh_token: String,
    access: Option<AccessCredential>
}

pub struct LookupEngine {
    api: Arc<dyn SpotifyApi>,
    user: UserId,
    market: String,
    credential: Mutex<CredentialState>,

    // shared by all lookups of the job, never replenished
    max_retries: u32,
    retries_used: AtomicU32,
    retry_delay: Duration
}

impl std::fmt::Debug for LookupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupEngine")
            .field("user", &self.user)
            .field("market", &self.market)
            .field("max_retries", &self.max_retries)
            .field("retries_used", &self.retries_used())
            .finish()
    }
}

impl LookupEngine {
    pub fn new(
        api: Arc<dyn SpotifyApi>,
        user: UserId,
        refresh_token: String,
        market: impl Into<String>,
        cfg: &TransferConfig
    ) -> Self {
        Self {
            api,
            user,
            market: market.into(),
            credential: Mutex::new(CredentialState { refresh_token, access: None }),
            max_retries: cfg.max_retries,
            retries_used: AtomicU32::new(0),
            retry_delay: cfg.retry_delay
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used.load(Ordering::Acquire)
    }

    /// Exchanges the refresh token for a new access token. Any failure
    /// is reported as a credential error, which is fatal to the job.
    pub async fn refresh_credential(&self) -> Result<(), TransferError> {
        let mut state = self.credential.lock().await;
        let grant = self.api.refresh_access_token(&state.refresh_token).await
            .map_err(|e| match e {
                TransferError::Credential(_) => e,
                other => TransferError::Credential(other.to_string())
            })?;

        if let Some(rotated) = grant.refresh_token {
            state.refresh_token = rotated;
        }
        debug!(user = %self.user, "lookup.credential.refreshed");
        state.access = Some(grant.credential);
        Ok(())
    }

    /// Current access token, refreshed first once past its expiry
    async fn bearer(&self) -> Result<String, TransferError> {
        {
            let state = self.credential.lock().await;
            match &state.access {
                Some(access) if !access.is_expired() => return Ok(access.token.clone()),
                Some(_) => {}
                None => return Err(TransferError::Credential("no access token fetched".into()))
            }
        }

        debug!(user = %self.user, "lookup.credential.expired");
        self.refresh_credential().await?;
        let state = self.credential.lock().await;
        state.access.as_ref()
            .map(|access| access.token.clone())
            .ok_or_else(|| TransferError::Credential("no access token fetched".into()))
    }

    /// Claims one retry from the shared budget
    fn take_retry(&self) -> bool {
        self.retries_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.max_retries).then_some(used + 1)
            })
            .is_ok()
    }

    /// Sends a request, refreshing the credential and resending on 4xx
    /// while the shared budget lasts. Each attempt is rebuilt from `request`.
    pub async fn request(&self, request: &ApiRequest) -> Result<ApiResponse, TransferError> {
        loop {
            let bearer = self.bearer().await?;
            let response = self.api.execute(request, &bearer).await?;
            debug!(path = %request.path, status = response.status, "lookup.request");

            if !response.is_client_error() {
                return Ok(response);
            }

            if !self.take_retry() {
                warn!(
                    path = %request.path, status = response.status,
                    max_retries = self.max_retries, "lookup.retry.exhausted"
                );
                return Err(TransferError::RetriesExhausted(request.path.clone()));
            }

            warn!(
                path = %request.path, status = response.status,
                body = %response.body, attempt = self.retries_used(),
                delay_ms = self.retry_delay.as_millis() as u64, "lookup.retry"
            );
            sleep(self.retry_delay).await;
            self.refresh_credential().await?;
        }
    }

    /// Looks up one track. Only credential failures surface as errors,
    /// anything else the track just counts as not found.
    pub async fn lookup(&self, query: &TrackQuery) -> Result<TrackLookupResult, TransferError> {
        let request = ApiRequest::search_track(&query.search_expression(), &self.market);
        let response = match self.request(&request).await {
            Ok(r) => r,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, artist = %query.artist, title = %query.title,
                    "lookup.track.failed");
                return Ok(TrackLookupResult::not_found());
            }
        };

        if response.is_server_error() {
            warn!(status = response.status, artist = %query.artist, title = %query.title,
                "lookup.track.server_error");
            return Ok(TrackLookupResult::not_found());
        }
        if !response.is_success() {
            warn!(status = response.status, artist = %query.artist, title = %query.title,
                "lookup.track.status");
            return Ok(TrackLookupResult::not_found());
        }

        let parsed: SearchResponse = match response.json() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "lookup.track.decode");
                return Ok(TrackLookupResult::not_found());
            }
        };

        Ok(match parsed.tracks.items.into_iter().next() {
            Some(track) => {
                info!(artist = %query.artist, title = %query.title, uri = %track.uri,
                    matched = %track.name, "lookup.track.found");
                TrackLookupResult::found(SpotifyTrackUri(track.uri))
            }
            None => {
                debug!(artist = %query.artist, title = %query.title, "lookup.track.missing");
                TrackLookupResult::not_found()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixtureApi, Mode};

    fn engine(api: Arc<FixtureApi>, retries: u32) -> LookupEngine {
        let cfg = TransferConfig { max_retries: retries, ..TransferConfig::default() };
        LookupEngine::new(api, UserId::from("u1"), "refresh-0".into(), "US", &cfg)
    }

    #[tokio::test(start_paused = true)]
    async fn exact_match_is_found_with_stable_uri() {
        let api = Arc::new(FixtureApi::catalog());
        let engine = engine(api.clone(), 7);
        engine.refresh_credential().await.unwrap();

        let query = TrackQuery::new("The Beatles", "Yesterday");
        let first = engine.lookup(&query).await.unwrap();
        let second = engine.lookup(&query).await.unwrap();

        assert!(first.found);
        assert_eq!(first.external_id, Some(SpotifyTrackUri(
            "spotify:track:3BQHpFgAp4l80e1XslIjNI".into())));
        assert_eq!(first, second);

        let missing = engine.lookup(&TrackQuery::new("Nobody", "Nothing")).await.unwrap();
        assert_eq!(missing, TrackLookupResult::not_found());
        assert_eq!(engine.retries_used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn always_429_exhausts_exactly_n_retries() {
        let api = Arc::new(FixtureApi::new(Mode::Always(429)));
        let engine = engine(api.clone(), 4);
        engine.refresh_credential().await.unwrap();
        let refreshes_before = api.refresh_calls();

        let request = ApiRequest::search_track("artist:a track:b", "US");
        let err = engine.request(&request).await.unwrap_err();

        assert!(matches!(err, TransferError::RetriesExhausted(_)));
        assert_eq!(api.refresh_calls() - refreshes_before, 4);
        assert_eq!(api.execute_calls(), 5);
        assert_eq!(engine.retries_used(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_shared_across_lookups() {
        let api = Arc::new(FixtureApi::new(Mode::Always(401)));
        let engine = engine(api.clone(), 2);
        engine.refresh_credential().await.unwrap();

        let query = TrackQuery::new("The Beatles", "Yesterday");
        assert_eq!(engine.lookup(&query).await.unwrap(), TrackLookupResult::not_found());
        let refreshes = api.refresh_calls();
        let calls = api.execute_calls();

        // second lookup fails on its first 4xx, no refresh left
        assert_eq!(engine.lookup(&query).await.unwrap(), TrackLookupResult::not_found());
        assert_eq!(api.refresh_calls(), refreshes);
        assert_eq!(api.execute_calls(), calls + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_not_retried() {
        let api = Arc::new(FixtureApi::new(Mode::Always(503)));
        let engine = engine(api.clone(), 7);
        engine.refresh_credential().await.unwrap();

        let result = engine.lookup(&TrackQuery::new("The Beatles", "Yesterday")).await.unwrap();
        assert!(!result.found);
        assert_eq!(api.execute_calls(), 1);
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(engine.retries_used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_401_recovers_after_refresh() {
        let api = Arc::new(FixtureApi::new(Mode::FailFirst(2, 401)));
        let engine = engine(api.clone(), 7);
        engine.refresh_credential().await.unwrap();

        let result = engine.lookup(&TrackQuery::new("The Beatles", "Yesterday")).await.unwrap();
        assert!(result.found);
        assert_eq!(engine.retries_used(), 2);
        assert_eq!(api.refresh_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_during_retry_is_fatal() {
        let api = Arc::new(FixtureApi::new(Mode::Always(401)));
        let engine = engine(api.clone(), 7);
        engine.refresh_credential().await.unwrap();
        api.fail_refresh();

        let err = engine.lookup(&TrackQuery::new("The Beatles", "Yesterday"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_refreshed_before_sending() {
        let api = Arc::new(FixtureApi::catalog());
        let engine = engine(api.clone(), 7);
        engine.refresh_credential().await.unwrap();

        tokio::time::advance(Duration::from_secs(3601)).await;
        let result = engine.lookup(&TrackQuery::new("The Beatles", "Yesterday")).await.unwrap();

        assert!(result.found);
        assert_eq!(api.refresh_calls(), 2);
        assert_eq!(api.execute_calls(), 1);
        assert_eq!(engine.retries_used(), 0);
    }

    #[tokio::test]
    async fn lookup_without_credential_is_fatal() {
        let api = Arc::new(FixtureApi::catalog());
        let engine = engine(api.clone(), 7);
        let err = engine.lookup(&TrackQuery::new("The Beatles", "Yesterday"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Credential(_)));
        assert_eq!(api.execute_calls(), 0);
    }
}
