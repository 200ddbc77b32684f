use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;

use crate::orchestrator::Pacing;

// Compiled-in copy of prompts/system.md.
pub const BUILTIN_SYSTEM_PROMPT: &str = include_str!("../../prompts/system.md");

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct DataApiSettings {
    pub base_url: String,
    pub timeout: Duration,
}

/// Credentials for the Upstash-compatible KV REST endpoint backing the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvSettings {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub llm: LlmSettings,
    pub data_api: DataApiSettings,
    pub catalog_path: Option<PathBuf>,
    pub system_prompt_path: Option<PathBuf>,
    pub pacing: Pacing,
    pub bind_addr: SocketAddr,
    pub development: bool,
    pub kv: Option<KvSettings>,
}

impl Settings {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set in .env")?;
        let llm = LlmSettings {
            api_key,
            model: var("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            api_base: var("OPENAI_API_BASE").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        };

        let data_api = DataApiSettings {
            base_url: var("DATA_API_BASE_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            timeout: Duration::from_secs(parse_or(&var, "DATA_API_TIMEOUT_SECS", 30)?),
        };

        let pacing = Pacing {
            min: Duration::from_millis(parse_or(&var, "BERACHAT_STREAM_DELAY_MIN_MS", 10)?),
            max: Duration::from_millis(parse_or(&var, "BERACHAT_STREAM_DELAY_MAX_MS", 30)?),
        };
        if pacing.min > pacing.max {
            bail!(
                "BERACHAT_STREAM_DELAY_MIN_MS ({:?}) exceeds BERACHAT_STREAM_DELAY_MAX_MS ({:?})",
                pacing.min,
                pacing.max
            );
        }

        let bind_addr = parse_or(&var, "BERACHAT_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;

        let environment = var("BERACHAT_ENV")
            .or_else(|| var("NODE_ENV"))
            .unwrap_or_else(|| "production".to_string());

        let kv_timeout = Duration::from_secs(parse_or(&var, "KV_TIMEOUT_SECS", 3)?);
        let kv = match (var("KV_REST_API_URL"), var("KV_REST_API_TOKEN")) {
            (Some(url), Some(token)) => Some(KvSettings {
                url,
                token,
                timeout: kv_timeout,
            }),
            _ => None,
        };

        Ok(Self {
            llm,
            data_api,
            catalog_path: var("BERACHAT_CATALOG_PATH").map(PathBuf::from),
            system_prompt_path: var("BERACHAT_SYSTEM_PROMPT_PATH").map(PathBuf::from),
            pacing,
            bind_addr,
            development: environment.eq_ignore_ascii_case("development"),
            kv,
        })
    }

    /// The rate-limit backend, if one is configured and we are not in local development.
    pub fn rate_limit_backend(&self) -> Option<&KvSettings> {
        if self.development {
            return None;
        }
        self.kv.as_ref()
    }

    pub async fn system_prompt(&self) -> Result<String> {
        match &self.system_prompt_path {
            Some(path) => fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt at '{}'", path.display())),
            None => Ok(BUILTIN_SYSTEM_PROMPT.to_string()),
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}='{raw}' is invalid: {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_fill_everything_but_the_api_key() {
        let s = settings(&[("OPENAI_API_KEY", "sk-test")]).unwrap();

        assert_eq!(s.llm.model, "gpt-4o");
        assert_eq!(s.llm.api_base, "https://api.openai.com/v1");
        assert_eq!(s.data_api.base_url, "http://localhost:3000");
        assert_eq!(s.data_api.timeout, Duration::from_secs(30));
        assert_eq!(s.pacing.min, Duration::from_millis(10));
        assert_eq!(s.pacing.max, Duration::from_millis(30));
        assert_eq!(s.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert!(!s.development);
        assert!(s.rate_limit_backend().is_none());
    }

    #[test]
    fn api_key_is_required() {
        let err = settings(&[]).unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn rate_limiting_needs_both_credentials_outside_development() {
        let kv = [
            ("OPENAI_API_KEY", "sk-test"),
            ("KV_REST_API_URL", "https://kv.example.com"),
            ("KV_REST_API_TOKEN", "secret"),
        ];

        let s = settings(&kv).unwrap();
        assert_eq!(
            s.rate_limit_backend(),
            Some(&KvSettings {
                url: "https://kv.example.com".into(),
                token: "secret".into(),
                timeout: Duration::from_secs(3),
            })
        );

        let s = settings(&[kv[0], kv[1], kv[2], ("KV_TIMEOUT_SECS", "1")]).unwrap();
        assert_eq!(s.rate_limit_backend().unwrap().timeout, Duration::from_secs(1));

        let s = settings(&[kv[0], kv[1]]).unwrap();
        assert!(s.rate_limit_backend().is_none());

        let s = settings(&[kv[0], kv[1], kv[2], ("NODE_ENV", "development")]).unwrap();
        assert!(s.development);
        assert!(s.rate_limit_backend().is_none());

        // BERACHAT_ENV wins over NODE_ENV.
        let s = settings(&[kv[0], kv[1], kv[2], ("NODE_ENV", "development"), ("BERACHAT_ENV", "production")]).unwrap();
        assert!(s.rate_limit_backend().is_some());
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = settings(&[("OPENAI_API_KEY", "sk"), ("DATA_API_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("DATA_API_TIMEOUT_SECS"));
    }

    #[test]
    fn inverted_delay_bounds_are_rejected() {
        let err = settings(&[
            ("OPENAI_API_KEY", "sk"),
            ("BERACHAT_STREAM_DELAY_MIN_MS", "50"),
            ("BERACHAT_STREAM_DELAY_MAX_MS", "5"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("BERACHAT_STREAM_DELAY_MIN_MS"));
    }

    #[tokio::test]
    async fn system_prompt_defaults_to_the_builtin_briefing() {
        let s = settings(&[("OPENAI_API_KEY", "sk")]).unwrap();
        let prompt = s.system_prompt().await.unwrap();
        assert!(prompt.contains("Proof-of-Liquidity"));
    }

    #[tokio::test]
    async fn system_prompt_can_be_overridden_from_disk() {
        let path = std::env::temp_dir().join(format!("berachat-prompt-{}.md", std::process::id()));
        fs::write(&path, "You are a test.").await.unwrap();

        let s = settings(&[
            ("OPENAI_API_KEY", "sk"),
            ("BERACHAT_SYSTEM_PROMPT_PATH", path.to_str().unwrap()),
        ])
        .unwrap();
        let prompt = s.system_prompt().await.unwrap();
        fs::remove_file(&path).await.unwrap();

        assert_eq!(prompt, "You are a test.");
    }
}
