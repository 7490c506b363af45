use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;

use crate::protocol::MAX_FRAME_BYTES;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Address the server listens on and the client connects to.
    pub server_addr: String,
    pub upload_dir: String,
    pub history_page_size: usize,
    pub push_buffer: usize,
    /// Longest request line the server reads before closing the connection,
    /// capped at what clients will send.
    pub max_frame_bytes: usize,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let history_page_size: usize = parse_or(&lookup, "HISTORY_PAGE_SIZE", 50)?;
        if history_page_size == 0 {
            return Err(anyhow!("HISTORY_PAGE_SIZE must be greater than zero"));
        }
        let retry_base_ms: u64 = parse_or(&lookup, "RETRY_BASE_DELAY_MS", 100)?;
        Ok(Config {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "./chat.db".to_string()),
            server_addr: lookup("SERVER_PORT").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            upload_dir: lookup("UPLOAD_DIR").unwrap_or_else(|| "./uploads".to_string()),
            history_page_size,
            push_buffer: parse_or(&lookup, "PUSH_BUFFER", 100)?,
            max_frame_bytes: parse_or(&lookup, "MAX_FRAME_BYTES", MAX_FRAME_BYTES)?.min(MAX_FRAME_BYTES),
            retry: RetryPolicy {
                max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 3)?,
                initial_backoff: Duration::from_millis(retry_base_ms),
                ..RetryPolicy::default()
            },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}
