use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Development,
    Staging,
    Production,
}

impl Profile {
    pub fn from_env() -> Self {
        std::env::var("APP_PROFILE")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "development" | "dev" => Some(Self::Development),
                "staging" | "stage" => Some(Self::Staging),
                "production" | "prod" => Some(Self::Production),
                _ => None,
            })
            .unwrap_or(Self::Development)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

/// Per-profile fallbacks. Rates are decimal strings so they parse through the
/// same path as env overrides.
#[derive(Debug, Deserialize, Clone)]
pub struct ProfileDefaults {
    pub database_url: Option<String>,
    pub redis_url: String,
    pub gateway_base_url: String,
    pub crm_base_url: String,
    pub default_inbound_rate: String,
    pub default_outbound_rate: String,
    pub crm_rate_per_second: u64,
    pub crm_rate_per_day: u64,
    pub delivery_timeout_secs: u64,
    pub mirror_schedule: String,
    pub log_format: String,
}

impl ProfileDefaults {
    pub fn for_profile(profile: Profile) -> Self {
        let base = Self {
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            gateway_base_url: "https://api.transmitsms.com".to_string(),
            crm_base_url: "https://services.leadconnectorhq.com".to_string(),
            default_inbound_rate: "0.074".to_string(),
            default_outbound_rate: "0.074".to_string(),
            crm_rate_per_second: 10,
            crm_rate_per_day: 200_000,
            delivery_timeout_secs: 30,
            mirror_schedule: "0 */15 * * * *".to_string(),
            log_format: "text".to_string(),
        };

        match profile {
            Profile::Development => base,
            Profile::Staging => Self {
                redis_url: "redis://redis:6379".to_string(),
                log_format: "json".to_string(),
                ..base
            },
            Profile::Production => Self {
                redis_url: "redis://redis:6379".to_string(),
                log_format: "json".to_string(),
                delivery_timeout_secs: 20,
                ..base
            },
        }
    }
}
