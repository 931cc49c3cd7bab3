//! Connection strings and worker configuration.
//!
//! `WorkerOptions` follows the builder struct style used elsewhere in
//! this crate: sensible defaults plus a handful of `with_*` setters. The
//! connection-string parser reads a semicolon-separated `key=value`
//! format, the same shape several cloud SDKs use for service connection
//! strings.

use std::collections::HashMap;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::versioning::VersioningPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field '{0}' in connection string")]
    MissingField(&'static str),

    #[error("unrecognized authentication mode: {0}")]
    UnrecognizedAuthentication(String),

    #[error("malformed connection string entry: {0}")]
    MalformedEntry(String),
}

/// Authentication modes recognized in the `Authentication` field of a
/// connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    /// No credentials; suitable for local/dev task hubs.
    None,
    /// The default credential-chain probe (environment, managed identity,
    /// then interactive, in that order).
    DefaultAzure,
    /// Managed-identity style auth, scoped to an optional client id.
    ManagedIdentity { client_id: Option<String> },
    /// Workload identity federation (e.g. Kubernetes service-account
    /// token exchange).
    WorkloadIdentity,
    /// Credentials supplied entirely via environment variables.
    Environment,
    /// Delegates to an already-authenticated `az` CLI session.
    AzureCli,
    /// Delegates to an already-authenticated Azure PowerShell session.
    AzurePowerShell,
    /// Delegates to cached Visual Studio credentials.
    VisualStudio,
    /// Delegates to cached Visual Studio Code credentials.
    VisualStudioCode,
    /// Opens an interactive browser login.
    InteractiveBrowser,
}

/// Parsed form of the connection string:
/// `Endpoint=...;Authentication=...;TaskHub=...;ClientId=...;TenantId=...;AdditionallyAllowedTenants=...`
///
/// Keys are matched case-insensitively; unknown keys are ignored rather
/// than rejected, so forward-compatible fields don't break older clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint: String,
    pub authentication: Authentication,
    pub task_hub: String,
    pub tenant_id: Option<String>,
    pub additionally_allowed_tenants: Vec<String>,
}

impl ConnectionInfo {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for entry in raw.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedEntry(entry.to_string()))?;
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let endpoint = fields.get("endpoint").cloned().ok_or(ConfigError::MissingField("Endpoint"))?;
        let task_hub = fields.get("taskhub").cloned().ok_or(ConfigError::MissingField("TaskHub"))?;
        let client_id = fields.get("clientid").cloned();
        let tenant_id = fields.get("tenantid").cloned();
        let additionally_allowed_tenants = fields
            .get("additionallyallowedtenants")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let authentication = match fields.get("authentication").map(|s| s.to_ascii_lowercase()) {
            None => Authentication::None,
            Some(mode) => match mode.as_str() {
                "none" => Authentication::None,
                "defaultazure" => Authentication::DefaultAzure,
                "managedidentity" => Authentication::ManagedIdentity { client_id },
                "workloadidentity" => Authentication::WorkloadIdentity,
                "environment" => Authentication::Environment,
                "azurecli" => Authentication::AzureCli,
                "azurepowershell" => Authentication::AzurePowerShell,
                "visualstudio" => Authentication::VisualStudio,
                "visualstudiocode" => Authentication::VisualStudioCode,
                "interactivebrowser" => Authentication::InteractiveBrowser,
                other => return Err(ConfigError::UnrecognizedAuthentication(other.to_string())),
            },
        };

        Ok(Self {
            endpoint,
            authentication,
            task_hub,
            tenant_id,
            additionally_allowed_tenants,
        })
    }
}

/// Worker tuning knobs. Every field maps to one row of the
/// configuration table; defaults mirror the table's stated defaults.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_concurrent_activities: usize,
    pub max_concurrent_orchestrations: usize,
    pub maximum_timer_interval: Duration,
    pub external_payload_threshold_bytes: usize,
    pub versioning: VersioningPolicy,
    pub retry_defaults: RetryPolicy,
    pub enable_entity_support: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_activities: 100,
            max_concurrent_orchestrations: 100,
            maximum_timer_interval: Duration::from_secs(3 * 24 * 60 * 60),
            external_payload_threshold_bytes: crate::converter::EXTERNALIZATION_THRESHOLD_BYTES,
            versioning: VersioningPolicy::default(),
            retry_defaults: RetryPolicy::default(),
            enable_entity_support: true,
        }
    }
}

impl WorkerOptions {
    pub fn builder() -> WorkerOptionsBuilder {
        WorkerOptionsBuilder::default()
    }
}

#[derive(Default)]
pub struct WorkerOptionsBuilder {
    options: OptionsOverrides,
}

#[derive(Default)]
struct OptionsOverrides {
    max_concurrent_activities: Option<usize>,
    max_concurrent_orchestrations: Option<usize>,
    maximum_timer_interval: Option<Duration>,
    external_payload_threshold_bytes: Option<usize>,
    versioning: Option<VersioningPolicy>,
    retry_defaults: Option<RetryPolicy>,
    enable_entity_support: Option<bool>,
}

impl WorkerOptionsBuilder {
    pub fn max_concurrent_activities(mut self, n: usize) -> Self {
        self.options.max_concurrent_activities = Some(n);
        self
    }

    pub fn max_concurrent_orchestrations(mut self, n: usize) -> Self {
        self.options.max_concurrent_orchestrations = Some(n);
        self
    }

    pub fn maximum_timer_interval(mut self, d: Duration) -> Self {
        self.options.maximum_timer_interval = Some(d);
        self
    }

    pub fn external_payload_threshold_bytes(mut self, n: usize) -> Self {
        self.options.external_payload_threshold_bytes = Some(n);
        self
    }

    pub fn versioning(mut self, policy: VersioningPolicy) -> Self {
        self.options.versioning = Some(policy);
        self
    }

    pub fn retry_defaults(mut self, policy: RetryPolicy) -> Self {
        self.options.retry_defaults = Some(policy);
        self
    }

    pub fn enable_entity_support(mut self, enabled: bool) -> Self {
        self.options.enable_entity_support = Some(enabled);
        self
    }

    pub fn build(self) -> WorkerOptions {
        let defaults = WorkerOptions::default();
        WorkerOptions {
            max_concurrent_activities: self.options.max_concurrent_activities.unwrap_or(defaults.max_concurrent_activities),
            max_concurrent_orchestrations: self
                .options
                .max_concurrent_orchestrations
                .unwrap_or(defaults.max_concurrent_orchestrations),
            maximum_timer_interval: self.options.maximum_timer_interval.unwrap_or(defaults.maximum_timer_interval),
            external_payload_threshold_bytes: self
                .options
                .external_payload_threshold_bytes
                .unwrap_or(defaults.external_payload_threshold_bytes),
            versioning: self.options.versioning.unwrap_or(defaults.versioning),
            retry_defaults: self.options.retry_defaults.unwrap_or(defaults.retry_defaults),
            enable_entity_support: self.options.enable_entity_support.unwrap_or(defaults.enable_entity_support),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_connection_string() {
        let info = ConnectionInfo::parse(
            "Endpoint=https://hub.example.com:4443;Authentication=ManagedIdentity;TaskHub=my-hub;ClientId=abc123;TenantId=tenant1;AdditionallyAllowedTenants=t2,t3",
        )
        .unwrap();
        assert_eq!(info.endpoint, "https://hub.example.com:4443");
        assert_eq!(info.task_hub, "my-hub");
        assert_eq!(info.authentication, Authentication::ManagedIdentity { client_id: Some("abc123".into()) });
        assert_eq!(info.tenant_id.as_deref(), Some("tenant1"));
        assert_eq!(info.additionally_allowed_tenants, vec!["t2", "t3"]);
    }

    #[test]
    fn defaults_authentication_to_none() {
        let info = ConnectionInfo::parse("Endpoint=http://localhost:9091;TaskHub=dev").unwrap();
        assert_eq!(info.authentication, Authentication::None);
    }

    #[test]
    fn missing_task_hub_errors() {
        let result = ConnectionInfo::parse("Endpoint=http://localhost:9091");
        assert!(matches!(result, Err(ConfigError::MissingField("TaskHub"))));
    }

    #[test]
    fn recognizes_every_documented_authentication_mode() {
        let modes = [
            ("DefaultAzure", Authentication::DefaultAzure),
            ("WorkloadIdentity", Authentication::WorkloadIdentity),
            ("AzureCli", Authentication::AzureCli),
            ("AzurePowerShell", Authentication::AzurePowerShell),
            ("VisualStudio", Authentication::VisualStudio),
            ("VisualStudioCode", Authentication::VisualStudioCode),
            ("InteractiveBrowser", Authentication::InteractiveBrowser),
        ];
        for (raw, expected) in modes {
            let info = ConnectionInfo::parse(&format!("Endpoint=http://localhost:9091;TaskHub=dev;Authentication={raw}")).unwrap();
            assert_eq!(info.authentication, expected);
        }
    }

    #[test]
    fn unrecognized_authentication_errors() {
        let result = ConnectionInfo::parse("Endpoint=http://localhost:9091;TaskHub=dev;Authentication=Kerberos");
        assert!(matches!(result, Err(ConfigError::UnrecognizedAuthentication(_))));
    }

    #[test]
    fn builder_overrides_defaults() {
        let options = WorkerOptions::builder().max_concurrent_activities(5).enable_entity_support(false).build();
        assert_eq!(options.max_concurrent_activities, 5);
        assert!(!options.enable_entity_support);
        assert_eq!(options.max_concurrent_orchestrations, 100);
    }
}
