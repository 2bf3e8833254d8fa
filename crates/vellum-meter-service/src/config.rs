//! Service configuration.

use vellum_meter_core::WindowPolicy;

/// Runtime configuration for the metering service, sourced from
/// environment variables with sensible defaults for local development.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Socket address the HTTP server binds to.
    pub listen_addr: String,
    /// HMAC secret used to verify bearer tokens. When unset, every
    /// request is treated as anonymous.
    pub auth_secret: Option<String>,
    /// Expected `aud` claim on bearer tokens.
    pub auth_audience: String,
    /// Shared key for service-to-service endpoints (refunds).
    pub service_api_key: Option<String>,
    /// Shared key for admin endpoints (limit changes).
    pub admin_api_key: Option<String>,
    /// Per-window allowance for authenticated users without an explicit
    /// per-account override.
    pub default_user_limit: i64,
    /// Lifetime allowance for anonymous visitors.
    pub anonymous_limit: i64,
    /// When authenticated quota windows reset.
    pub window_policy: WindowPolicy,
    /// Seconds of inactivity after which a session is considered idle.
    pub idle_timeout_seconds: i64,
    /// Seconds between background sweep runs (window resets and
    /// rollup reconciliation).
    pub sweep_interval_seconds: u64,
    /// Allowed CORS origins. Empty means same-origin only.
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// Per-request timeout in seconds.
    pub request_timeout_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            auth_secret: None,
            auth_audience: "vellum-meter".to_string(),
            service_api_key: None,
            admin_api_key: None,
            default_user_limit: 100,
            anonymous_limit: 10,
            window_policy: WindowPolicy::FirstOfMonth,
            idle_timeout_seconds: 1800,
            sweep_interval_seconds: 300,
            cors_origins: Vec::new(),
            max_body_bytes: 64 * 1024,
            request_timeout_seconds: 30,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env_or("LISTEN_ADDR", defaults.listen_addr),
            auth_secret: std::env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty()),
            auth_audience: env_or("AUTH_AUDIENCE", defaults.auth_audience),
            service_api_key: std::env::var("SERVICE_API_KEY").ok().filter(|s| !s.is_empty()),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok().filter(|s| !s.is_empty()),
            default_user_limit: env_parsed("DEFAULT_USER_LIMIT", defaults.default_user_limit),
            anonymous_limit: env_parsed("ANONYMOUS_LIMIT", defaults.anonymous_limit),
            window_policy: window_policy_from_env(defaults.window_policy),
            idle_timeout_seconds: env_parsed("IDLE_TIMEOUT_SECONDS", defaults.idle_timeout_seconds),
            sweep_interval_seconds: env_parsed(
                "SWEEP_INTERVAL_SECONDS",
                defaults.sweep_interval_seconds,
            ),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            max_body_bytes: env_parsed("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_parsed(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `WINDOW_POLICY`: either `first_of_month` or `anniversary:<day>`
/// with a day-of-month between 1 and 31. Unrecognized values fall back
/// to the default with a warning.
fn window_policy_from_env(default: WindowPolicy) -> WindowPolicy {
    let Ok(raw) = std::env::var("WINDOW_POLICY") else {
        return default;
    };
    match parse_window_policy(&raw) {
        Some(policy) => policy,
        None => {
            tracing::warn!(value = %raw, "unrecognized WINDOW_POLICY, using default");
            default
        }
    }
}

fn parse_window_policy(raw: &str) -> Option<WindowPolicy> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("first_of_month") {
        return Some(WindowPolicy::FirstOfMonth);
    }
    let day = raw.strip_prefix("anniversary:")?.parse::<u32>().ok()?;
    if (1..=31).contains(&day) {
        Some(WindowPolicy::Anniversary { day })
    } else {
        None
    }
}
