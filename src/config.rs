use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Endpoint the Dispatch Gateway posts outbound messages to.
    pub delivery_webhook_url: String,
    /// Bearer token for the delivery provider.
    pub delivery_token: String,
    /// Shared secret for inbound webhooks (intake, delivery-status). Optional
    /// to ease local development; a warning is logged when absent.
    pub webhook_secret: Option<String>,
    /// Display name of the automated agent, as it appears in the Responsibles
    /// list and in `responsible` labels.
    pub agent_display_name: String,
    /// Per-attempt timeout for delivery provider calls, in seconds.
    pub dispatch_timeout_secs: u64,
    /// Additional dispatch attempts after the first (0 disables retries).
    pub dispatch_max_retries: u32,
    /// When set, agent-owned conversations answer inbound messages with this
    /// body automatically.
    pub auto_reply_body: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            delivery_webhook_url: std::env::var("DELIVERY_WEBHOOK_URL")
                .map_err(|_| anyhow::anyhow!("DELIVERY_WEBHOOK_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DELIVERY_WEBHOOK_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("DELIVERY_WEBHOOK_URL must start with http:// or https://");
                    }
                    Ok(url)
                })?,
            delivery_token: std::env::var("DELIVERY_TOKEN")
                .map_err(|_| anyhow::anyhow!("DELIVERY_TOKEN environment variable required"))
                .and_then(|token| {
                    if token.trim().is_empty() {
                        anyhow::bail!("DELIVERY_TOKEN cannot be empty");
                    }
                    Ok(token)
                })?,
            webhook_secret: std::env::var("WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            agent_display_name: std::env::var("AGENT_DISPLAY_NAME")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "Assistente".to_string()),
            dispatch_timeout_secs: std::env::var("DISPATCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DISPATCH_TIMEOUT_SECS must be a positive number"))?,
            dispatch_max_retries: std::env::var("DISPATCH_MAX_RETRIES")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DISPATCH_MAX_RETRIES must be a small number"))?,
            auto_reply_body: std::env::var("AUTO_REPLY_BODY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Delivery webhook URL: {}", config.delivery_webhook_url);
        tracing::debug!("Agent display name: {}", config.agent_display_name);
        tracing::debug!("Server Port: {}", config.port);
        if config.webhook_secret.is_none() {
            tracing::warn!("WEBHOOK_SECRET not set; inbound webhooks are unauthenticated");
        }

        Ok(config)
    }
}
