use std::time::Duration;

use crate::approval::ApprovalPolicy;

/// Process-level settings for the gateway service, read from the environment.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub port: u16,
    pub approval: ApprovalPolicy,
    /// Prefix for public image URLs handed back from uploads.
    pub public_base_url: String,
    pub frontend_url: String,
    /// Keep-alive comment interval on the SSE change stream.
    pub sse_keepalive: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        fn var_or(name: &str, default: &str) -> String { std::env::var(name).unwrap_or_else(|_| default.to_string()) }
        let port = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let public_base_url = std::env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));
        Self {
            bind_addr: var_or("BIND_ADDR", "0.0.0.0"),
            port,
            approval: ApprovalPolicy::from_env(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            frontend_url: var_or("FRONTEND_URL", "http://localhost:3000"),
            sse_keepalive: Duration::from_secs(
                std::env::var("SSE_KEEPALIVE_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(15),
            ),
        }
    }
}

/// Names of env vars that must be set before the server starts.
pub const REQUIRED_ENV: &[&str] = &["JWT_SECRET"];

/// Returns a human readable problem per missing or invalid variable.
pub fn validate_env() -> Vec<String> {
    let mut problems = Vec::new();
    for var in REQUIRED_ENV {
        if std::env::var(var).is_err() {
            problems.push(format!("missing required environment variable {var}"));
        }
    }
    if let Ok(secret) = std::env::var("JWT_SECRET") {
        if secret.len() < 32 {
            problems.push("JWT_SECRET must be at least 32 characters long".to_string());
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn short_secret_is_reported() {
        std::env::set_var("JWT_SECRET", "short");
        let problems = validate_env();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("32"));
        std::env::set_var("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        assert!(validate_env().is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn defaults_apply_without_env() {
        std::env::remove_var("PORT");
        std::env::remove_var("PUBLIC_BASE_URL");
        std::env::remove_var("APPROVAL_THRESHOLD");
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.public_base_url, "http://localhost:8080");
        assert_eq!(cfg.approval, ApprovalPolicy::default());
    }
}
