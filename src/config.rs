use serde::Deserialize;
use base64::Engine as _;
use rand::RngCore;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub bind_addr: String,
    pub public_url: String,
    /// Base64-encoded 32- or 64-byte key used to sign/encrypt cookies
    pub cookie_key_base64: String,
    pub session_ttl_secs: u64,
    /// Defaults to true when `public_url` is https.
    pub secure_cookies: Option<bool>,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            public_url: "http://127.0.0.1:8080".to_string(),
            cookie_key_base64: String::new(),
            session_ttl_secs: 30 * 60,
            secure_cookies: None,
        }
    }
}

impl ServerCfg {
    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
            .unwrap_or_else(|| self.public_url.starts_with("https://"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbCfg {
    /// e.g. sqlite://token-keeper.db or a plain file path
    pub url: String,
}

impl Default for DbCfg {
    fn default() -> Self {
        Self { url: "sqlite://token-keeper.db".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderCfg {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Absolute callback URL registered with the provider. Derived from
    /// `server.public_url` when empty.
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderCfg {
    fn default() -> Self {
        Self {
            auth_url: "https://app-eu1.hubspot.com/oauth/authorize".to_string(),
            token_url: "https://api.hubapi.com/oauth/v1/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            scopes: vec![
                "crm.objects.contacts.read".to_string(),
                "crm.objects.companies.read".to_string(),
                "crm.objects.companies.write".to_string(),
                "crm.objects.deals.read".to_string(),
            ],
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshCfg {
    pub buffer_secs: u64,
    pub min_interval_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RefreshCfg {
    fn default() -> Self {
        Self {
            buffer_secs: 300,
            min_interval_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerCfg {
    pub join_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    /// Period of the sweep that reaps rows no session can reach.
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self { join_timeout_ms: 5_000, stop_timeout_ms: 10_000, sweep_interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerCfg,
    pub db: DbCfg,
    pub provider: ProviderCfg,
    pub refresh: RefreshCfg,
    pub scheduler: SchedulerCfg,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        // token-keeper.toml, then SECTION__KEY environment variables
        let settings = config::Config::builder()
            .add_source(config::File::with_name("token-keeper").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("provider.scopes"),
            )
            .build()?;
        let mut cfg: AppConfig = settings.try_deserialize()?;
        cfg.apply_flat_env();

        if cfg.server.cookie_key_base64.is_empty() {
            // Generate a dev key (64 bytes) and keep it in-memory only
            let mut key = [0u8; 64];
            rand::rngs::OsRng.fill_bytes(&mut key);
            cfg.server.cookie_key_base64 = base64::engine::general_purpose::STANDARD.encode(key);
            tracing::warn!(
                "COOKIE_KEY_BASE64 not provided; generated a temporary dev key. Sessions will be invalidated on restart."
            );
        }
        if cfg.provider.client_id.is_empty() {
            tracing::warn!("provider client id is empty; logins will be rejected by the provider");
        }
        Ok(cfg)
    }

    // Flat names fill whatever the nested sources left empty.
    fn apply_flat_env(&mut self) {
        let fill = |slot: &mut String, var: &str| {
            if slot.is_empty() {
                if let Ok(v) = std::env::var(var) {
                    *slot = v;
                }
            }
        };
        fill(&mut self.server.cookie_key_base64, "COOKIE_KEY_BASE64");
        fill(&mut self.provider.client_id, "OAUTH_CLIENT_ID");
        fill(&mut self.provider.client_secret, "OAUTH_CLIENT_SECRET");
        fill(&mut self.provider.redirect_uri, "OAUTH_REDIRECT_URI");
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if self.db.url == DbCfg::default().url {
                self.db.url = url;
            }
        }
    }

    pub fn redirect_uri(&self) -> String {
        if self.provider.redirect_uri.is_empty() {
            format!("{}/oauth-callback/", self.server.public_url.trim_end_matches('/'))
        } else {
            self.provider.redirect_uri.clone()
        }
    }

    pub fn refresh_buffer(&self) -> time::Duration {
        time::Duration::seconds(self.refresh.buffer_secs as i64)
    }

    pub fn session_ttl(&self) -> time::Duration {
        time::Duration::seconds(self.server.session_ttl_secs as i64)
    }

    pub fn provider_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.provider.timeout_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scheduler.sweep_interval_secs.max(1))
    }

    pub fn scheduler_config(&self) -> crate::scheduler::SchedulerConfig {
        crate::scheduler::SchedulerConfig {
            join_timeout: std::time::Duration::from_millis(self.scheduler.join_timeout_ms),
            stop_timeout: std::time::Duration::from_millis(self.scheduler.stop_timeout_ms),
        }
    }
}

pub fn decode_cookie_key(b64: &str) -> anyhow::Result<[u8; 64]> {
    // tower-cookies expects 64 bytes key for Private (32 for signing + 32 for encryption)
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid COOKIE_KEY_BASE64: {}", e))?;
    let mut out = [0u8; 64];
    match bytes.len() {
        32 => {
            out[..32].copy_from_slice(&bytes);
            out[32..].copy_from_slice(&bytes);
        }
        64 => out.copy_from_slice(&bytes),
        n => {
            return Err(anyhow::anyhow!(
                "COOKIE_KEY_BASE64 must decode to 32 or 64 bytes, got {}",
                n
            ))
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_key_accepts_32_and_64_bytes() {
        let engine = base64::engine::general_purpose::STANDARD;
        let short = decode_cookie_key(&engine.encode([7u8; 32])).unwrap();
        assert_eq!(&short[..32], &short[32..]);
        assert!(decode_cookie_key(&engine.encode([1u8; 64])).is_ok());
        assert!(decode_cookie_key(&engine.encode([1u8; 16])).is_err());
        assert!(decode_cookie_key("not base64!").is_err());
    }

    #[test]
    fn redirect_uri_falls_back_to_public_url() {
        let mut cfg = AppConfig::default();
        cfg.server.public_url = "https://keeper.example.com/".into();
        assert_eq!(cfg.redirect_uri(), "https://keeper.example.com/oauth-callback/");
        assert!(cfg.server.secure_cookies());

        cfg.provider.redirect_uri = "https://other.example.com/cb".into();
        assert_eq!(cfg.redirect_uri(), "https://other.example.com/cb");
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.refresh_buffer(), time::Duration::minutes(5));
        assert_eq!(cfg.session_ttl(), time::Duration::minutes(30));
        assert!(!cfg.server.secure_cookies());
    }
}
