//! Deployment request model and validation

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::ManagerError;

/// Deployment substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Local process on the host
    Local,

    /// Docker container
    Container,

    /// Cloud provider package upload
    Cloud,

    /// Static file host
    Static,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Local => "local",
            TargetKind::Container => "container",
            TargetKind::Cloud => "cloud",
            TargetKind::Static => "static",
        }
    }
}

impl std::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(TargetKind::Local),
            "container" | "docker" => Ok(TargetKind::Container),
            "cloud" => Ok(TargetKind::Cloud),
            "static" => Ok(TargetKind::Static),
            _ => Err(format!("Unknown target kind: {}", s)),
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment environment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvKind {
    Development,
    Staging,
    Production,
    /// Operator-defined environment name
    Custom(String),
}

impl EnvKind {
    pub fn as_str(&self) -> &str {
        match self {
            EnvKind::Development => "development",
            EnvKind::Staging => "staging",
            EnvKind::Production => "production",
            EnvKind::Custom(name) => name,
        }
    }
}

impl std::str::FromStr for EnvKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(EnvKind::Development),
            "staging" => Ok(EnvKind::Staging),
            "production" | "prod" => Ok(EnvKind::Production),
            other if !other.is_empty() && other.chars().all(identifier_char) => {
                Ok(EnvKind::Custom(other.to_string()))
            }
            other => Err(format!("Invalid environment name: {:?}", other)),
        }
    }
}

impl std::fmt::Display for EnvKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for EnvKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for EnvKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One environment variable as submitted by the caller.
///
/// The list form (rather than a map) is deliberate: duplicate names must be
/// rejected at validation time, and a map would merge them silently.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvVarSpec {
    pub name: String,

    pub value: SecretString,

    /// Marked secret: value is redacted in every external representation
    #[serde(default)]
    pub secret: bool,
}

/// A validated environment variable
#[derive(Debug, Clone)]
pub struct EnvVar {
    value: SecretString,
    secret: bool,
}

impl EnvVar {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: SecretString::from(value.into()),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: SecretString::from(value.into()),
            secret: true,
        }
    }

    /// The raw value, for handing to the started process. Never log this.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }
}

impl Serialize for EnvVar {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if self.secret {
            serializer.serialize_str("[REDACTED]")
        } else {
            serializer.serialize_str(self.value.expose_secret())
        }
    }
}

/// A deployment request as received from the caller, before validation
#[derive(Debug, Clone, Deserialize)]
pub struct RawDeployRequest {
    pub project_name: String,

    /// Target kind: 'local', 'container', 'cloud', 'static'
    pub target: String,

    /// Environment: 'development', 'staging', 'production', or a custom name
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub env: Vec<EnvVarSpec>,

    #[serde(default)]
    pub build_command: Option<String>,

    #[serde(default)]
    pub start_command: Option<String>,

    /// Build context for container targets; defaults to the project directory
    #[serde(default)]
    pub build_context: Option<PathBuf>,

    /// Opaque credentials handle for cloud targets; never embedded in logs
    #[serde(default)]
    pub credentials_ref: Option<String>,

    #[serde(default)]
    pub health_check_url: Option<String>,
}

fn default_environment() -> String {
    "production".to_string()
}

/// An accepted, immutable deployment configuration
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentConfig {
    pub project_name: String,
    pub target: TargetKind,
    pub environment: EnvKind,
    pub port: Option<u16>,
    pub env_vars: BTreeMap<String, EnvVar>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_context: Option<PathBuf>,
    /// Opaque handle resolved by the cloud driver; redacted everywhere
    #[serde(skip_serializing)]
    pub credentials_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<Url>,
    /// Resolved project directory inside the workspace
    pub project_dir: PathBuf,
}

fn identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn identifier_safe(s: &str) -> bool {
    !s.is_empty() && s.chars().all(identifier_char)
}

/// Validate a raw deployment request against the current port usage snapshot.
///
/// Pure over its inputs: no side effects, no registry mutation. The snapshot
/// covers instances currently holding a port for each target kind; the
/// transactional reservation happens later, at submission.
pub fn validate(
    raw: RawDeployRequest,
    workspace: &Path,
    active_ports: &HashSet<(TargetKind, u16)>,
) -> Result<DeploymentConfig, ManagerError> {
    if !identifier_safe(&raw.project_name) {
        return Err(ManagerError::ValidationError(format!(
            "Project name must be non-empty and contain only [A-Za-z0-9_-]: {:?}",
            raw.project_name
        )));
    }

    let target: TargetKind = raw
        .target
        .parse()
        .map_err(ManagerError::ValidationError)?;

    let environment: EnvKind = raw
        .environment
        .parse()
        .map_err(ManagerError::ValidationError)?;

    if let Some(port) = raw.port {
        if port == 0 {
            return Err(ManagerError::ValidationError(
                "Port must be in range 1-65535".to_string(),
            ));
        }
        if active_ports.contains(&(target, port)) {
            return Err(ManagerError::ConflictError(format!(
                "Port {} is already bound by an active {} deployment",
                port, target
            )));
        }
    }

    let mut env_vars = BTreeMap::new();
    for spec in raw.env {
        if !identifier_safe(&spec.name) {
            return Err(ManagerError::ValidationError(format!(
                "Invalid environment variable name: {:?}",
                spec.name
            )));
        }
        let var = EnvVar {
            value: spec.value,
            secret: spec.secret,
        };
        if env_vars.insert(spec.name.clone(), var).is_some() {
            return Err(ManagerError::ValidationError(format!(
                "Duplicate environment variable: {}",
                spec.name
            )));
        }
    }

    let project_dir = workspace.join(&raw.project_name);

    let build_context = match target {
        TargetKind::Container => {
            let context = raw.build_context.unwrap_or_else(|| project_dir.clone());
            if !context.exists() {
                return Err(ManagerError::ValidationError(format!(
                    "Container build context does not exist: {}",
                    context.display()
                )));
            }
            Some(context)
        }
        _ => raw.build_context,
    };

    if target == TargetKind::Cloud
        && raw.credentials_ref.as_deref().unwrap_or("").is_empty()
    {
        return Err(ManagerError::ValidationError(
            "Cloud target requires a credentials reference".to_string(),
        ));
    }

    if target == TargetKind::Local && raw.start_command.as_deref().unwrap_or("").is_empty() {
        return Err(ManagerError::ValidationError(
            "Local target requires a start command".to_string(),
        ));
    }

    let health_check_url = match raw.health_check_url {
        Some(s) => {
            let parsed: Url = s
                .parse()
                .map_err(|e| ManagerError::ValidationError(format!("Invalid health check URL: {}", e)))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ManagerError::ValidationError(format!(
                    "Health check URL must be http(s): {}",
                    parsed
                )));
            }
            Some(parsed)
        }
        None => None,
    };

    Ok(DeploymentConfig {
        project_name: raw.project_name,
        target,
        environment,
        port: raw.port,
        env_vars,
        build_command: raw.build_command.filter(|c| !c.is_empty()),
        start_command: raw.start_command.filter(|c| !c.is_empty()),
        build_context,
        credentials_ref: raw.credentials_ref,
        health_check_url,
        project_dir,
    })
}
