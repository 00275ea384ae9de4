use std::time::Duration;

use anyhow::Context;

use crate::session::LoginPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub auto_reply_delay: Duration,
    pub session_inactivity: time::Duration,
    pub login_policy: LoginPolicy,
    pub seed_demo_conversations: bool,
    pub allowed_origin: Option<String>,
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite://peerconnect.db".to_owned(),
            bind_addr: "0.0.0.0:8080".to_owned(),
            auto_reply_delay: Duration::from_secs(2),
            session_inactivity: time::Duration::minutes(60),
            login_policy: LoginPolicy::CreateMissing,
            seed_demo_conversations: true,
            allowed_origin: None,
            event_capacity: 64,
        }
    }
}

impl Config {
    /// Reads `.env` (if any) and then the process environment.
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();
        Config::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let mut config = Config::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(ms) = lookup("AUTO_REPLY_DELAY_MS") {
            let ms: u64 = ms.trim().parse().context("AUTO_REPLY_DELAY_MS must be a number of milliseconds")?;
            config.auto_reply_delay = Duration::from_millis(ms);
        }
        if let Some(minutes) = lookup("SESSION_INACTIVITY_MINUTES") {
            let minutes: i64 = minutes.trim().parse().context("SESSION_INACTIVITY_MINUTES must be a number")?;
            anyhow::ensure!(minutes > 0, "SESSION_INACTIVITY_MINUTES must be positive");
            config.session_inactivity = time::Duration::minutes(minutes);
        }
        if let Some(policy) = lookup("LOGIN_POLICY") {
            config.login_policy = policy.parse()?;
        }
        if let Some(seed) = lookup("SEED_DEMO_CONVERSATIONS") {
            config.seed_demo_conversations = parse_flag(&seed).context("SEED_DEMO_CONVERSATIONS must be true or false")?;
        }
        config.allowed_origin = lookup("ALLOWED_ORIGIN").filter(|origin| !origin.trim().is_empty());
        if let Some(capacity) = lookup("EVENT_CAPACITY") {
            config.event_capacity = capacity.trim().parse().context("EVENT_CAPACITY must be a number")?;
            anyhow::ensure!(config.event_capacity > 0, "EVENT_CAPACITY must be positive");
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a flag: {other}"),
    }
}
