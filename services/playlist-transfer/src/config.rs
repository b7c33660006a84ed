use url::Url;
use std::path::PathBuf;
use std::time;
use crate::TransferError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 30000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

/// Constants for the lookup pipeline
pub const LOOKUP_MAX_RETRIES: u32 = 7;
pub const LOOKUP_RETRY_DELAY: u64 = 5000;
pub const TRACK_BATCH_SIZE: usize = 3;
pub const TRACK_LOOKUP_INTERVAL: u64 = 5;

pub const CONNECTION_CAPACITY: usize = 64;

pub const SERVICE_NAME: &str = "playlist-transfer";

/// Wrapper over env::var to return an invalid enviroment var error
fn env_check(s: &str) -> Result<String, TransferError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(TransferError::Config(format!("{s} was not set"))),
    }
}

/// Parses an optional numeric env var, a malformed value is an error
/// rather than a silent default
fn env_parse<T: std::str::FromStr>(s: &str, default: T) -> Result<T, TransferError> {
    match std::env::var(s) {
        Ok(v) => v.trim().parse::<T>()
            .map_err(|_| TransferError::Config(format!("{s} invalid: {v}"))),
        Err(_) => Ok(default)
    }
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
}

/// Configuration that Spotify expects when hitting endpoints
#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: Url,
    pub api_base: Url,
    pub market: String
}

fn build_spotify() -> Result<SpotifyConfig, TransferError> {
    let client_id     = env_check("SPOTIFY_CLIENT_ID")?;
    let client_secret = env_check("SPOTIFY_CLIENT_SECRET")?;

    // form urls
    let token_url = std::env::var("SPOTIFY_TOKEN_URL")
        .unwrap_or_else(|_| "https://accounts.spotify.com/api/token".to_string());

    let api_base  = std::env::var("SPOTIFY_API_BASE")
        .unwrap_or_else(|_| "https://api.spotify.com/v1/".to_string());

    let token_url = Url::parse(&token_url)
        .map_err(|e| TransferError::Config(
                format!("SPOTIFY_TOKEN_URL invalid {e}")
        ))?;

    let mut api_base  = Url::parse(&api_base)
        .map_err(|e| TransferError::Config(
                format!("SPOTIFY_API_BASE invalid {e}")
        ))?;

    ensure_https(&token_url).map_err(TransferError::Config)?;
    ensure_https(&api_base).map_err(TransferError::Config)?;
    ensure_trailing_slash(&mut api_base);

    // TODO: derive market from the user's profile country instead of env
    let market = std::env::var("MARKET").unwrap_or_else(|_| "US".to_string());

    Ok( SpotifyConfig { client_id, client_secret, token_url, api_base, market })
}

///
/// Configuration for Http timeouts, pools, etc.
///
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS
        }
    }
}

///
/// Configuration for how lookups are throttled and retried
///
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub batch_size: usize,              // tracks looked up concurrently
    pub lookup_interval: time::Duration, // wait before each batch
    pub max_retries: u32,               // shared by every request of a job
    pub retry_delay: time::Duration     // fixed, no exponential growth
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: TRACK_BATCH_SIZE,
            lookup_interval: time::Duration::from_secs(TRACK_LOOKUP_INTERVAL),
            max_retries: LOOKUP_MAX_RETRIES,
            retry_delay: time::Duration::from_millis(LOOKUP_RETRY_DELAY)
        }
    }
}

fn build_transfer() -> Result<TransferConfig, TransferError> {
    let batch_size = env_parse("TRACK_BATCH_SIZE", TRACK_BATCH_SIZE)?;
    if batch_size == 0 {
        return Err(TransferError::Config("TRACK_BATCH_SIZE must be > 0".into()));
    }
    let interval    = env_parse("TRACK_LOOKUP_INTERVAL", TRACK_LOOKUP_INTERVAL)?;
    let max_retries = env_parse("LOOKUP_MAX_RETRIES", LOOKUP_MAX_RETRIES)?;
    let delay_ms    = env_parse("LOOKUP_RETRY_DELAY_MS", LOOKUP_RETRY_DELAY)?;

    Ok( TransferConfig {
        batch_size,
        lookup_interval: time::Duration::from_secs(interval),
        max_retries,
        retry_delay: time::Duration::from_millis(delay_ms)
    })
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub allowed_origins: Vec<String>
}

fn build_server() -> Result<ServerConfig, TransferError> {
    let port = env_parse("PORT", 8000_u16)?;
    let allowed_origins = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Ok( ServerConfig { port, allowed_origins } )
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub connection_capacity: usize  // outbound queue per websocket, full means drop
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connection_capacity: CONNECTION_CAPACITY
        }
    }
}

///
/// Configuration for Logger
///
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub service: &'static str,
    pub filter_directives: String,
    pub include_file_line: bool,
    pub include_target: bool,
    /// Daily rolling files here instead of stdout
    pub log_dir: Option<PathBuf>
}

impl LoggingConfig {
    pub fn for_service(service: &'static str) -> Self {
        Self {
            service,
            filter_directives: format!("info,{}=debug,reqwest=warn", service.replace('-', "_")),
            include_file_line: true,
            include_target: true,
            log_dir: None
        }
    }

    pub fn file_prefix(&self) -> String {
        format!("{}.log", self.service)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::for_service(SERVICE_NAME)
    }
}

fn build_logging() -> LoggingConfig {
    let log_dir = std::env::var("LOG_DIR").ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    LoggingConfig { log_dir, ..LoggingConfig::default() }
}

///
/// AppConfig which holds everything the service needs at startup
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spotify: SpotifyConfig,
    pub http: HttpConfig,
    pub transfer: TransferConfig,
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, TransferError> {
    dotenvy::dotenv().ok();

    let spotify  = build_spotify()?;
    let http     = HttpConfig::default();
    let transfer = build_transfer()?;
    let server   = build_server()?;
    let bus      = BusConfig::default();
    let logging  = build_logging();

    Ok( AppConfig { spotify, http, transfer, server, bus, logging } )
}
