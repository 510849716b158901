use anyhow::{anyhow, Context, Result};
use std::env;

pub const DEFAULT_LOG_FILTER: &str = "mispelis=info,actix_web=info";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `mongodb://…`, `mongodb+srv://…` or `sled:<path>`.
    pub db_url: String,
    pub port: u16,
}

impl Settings {
    /// Reads `DB_URL` and `PORT` from the process environment.
    pub fn new() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let db_url = lookup("DB_URL").ok_or_else(|| anyhow!("DB_URL is not set"))?;
        let port = lookup("PORT").ok_or_else(|| anyhow!("PORT is not set"))?;
        let port = port
            .trim()
            .parse::<u16>()
            .with_context(|| format!("PORT is not a valid port number: {:?}", port))?;
        Ok(Settings { db_url, port })
    }
}
