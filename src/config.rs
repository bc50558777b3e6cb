//! Runtime configuration loaded from environment variables.

/// Engine configuration shared across routes, the orchestrator, and the poller.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Shared secret expected in `X-CRON-SECRET` on the poll endpoint.
    pub cron_secret: String,
    /// Master switch for the cron-triggered poller.
    pub cron_enabled: bool,
    /// Mail address of the buying organization; used for direction detection.
    pub buyer_address: String,
    /// When set, outbound mail is redirected to `demo_recipient` while the
    /// draft keeps showing the real supplier address.
    pub demo_mode: bool,
    pub demo_recipient: String,
    /// OAuth client for the mail provider.
    pub mail_client_id: Option<String>,
    pub mail_client_secret: Option<String>,
    pub mail_redirect_uri: Option<String>,
    /// API key for the LLM fallback parser and the chat loop.
    pub llm_api_key: Option<String>,
    pub llm_api_base: String,
    pub llm_model: String,
    /// Default lookback window for inbox searches, in days.
    pub default_lookback_days: i64,
    /// Restrict inbox queries to the supplier address. Off by default so
    /// sandbox accounts still match.
    pub inbox_supplier_filter: bool,
    /// Allow destructive demo endpoints (`/confirmations/reset`).
    pub allow_reset: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let cron_secret = std::env::var("CRON_SECRET").unwrap_or_default();
        let cron_enabled = env_flag("CRON_ENABLED", true);
        let buyer_address =
            std::env::var("BUYER_MAIL_ADDRESS").unwrap_or_else(|_| "buyer@example.com".into());
        let demo_mode = env_flag("DEMO_MODE", false);
        let demo_recipient =
            std::env::var("DEMO_RECIPIENT").unwrap_or_else(|_| "demo-inbox@example.com".into());
        let mail_client_id = std::env::var("MAIL_CLIENT_ID").ok();
        let mail_client_secret = std::env::var("MAIL_CLIENT_SECRET").ok();
        let mail_redirect_uri = std::env::var("MAIL_REDIRECT_URI").ok();
        let llm_api_key = std::env::var("LLM_API_KEY").ok();
        let llm_api_base = std::env::var("LLM_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let llm_model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        let default_lookback_days = std::env::var("INBOX_LOOKBACK_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(30);
        let inbox_supplier_filter = env_flag("INBOX_SUPPLIER_FILTER", false);
        let allow_reset = env_flag("ALLOW_CONFIRMATIONS_RESET", demo_mode);

        Self {
            cron_secret,
            cron_enabled,
            buyer_address,
            demo_mode,
            demo_recipient,
            mail_client_id,
            mail_client_secret,
            mail_redirect_uri,
            llm_api_key,
            llm_api_base,
            llm_model,
            default_lookback_days,
            inbox_supplier_filter,
            allow_reset,
        }
    }
}
