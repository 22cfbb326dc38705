// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Layered configuration.
//!
//! Every setting is resolved in the same order: explicit argument, then the
//! environment snapshot, then the built-in default. The environment is
//! captured once into an [`EnvSnapshot`] and never re-read, so concurrent
//! mutation of the process environment cannot change a running supervisor.
//!
//! Our own variables live under the `LLAMA_WARDEN_` prefix. The endpoint is
//! read from llama-server's own `LLAMA_ARG_HOST` / `LLAMA_ARG_PORT`, which
//! are passed through to the child untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Prefix shared by every variable this crate reads.
pub const ENV_PREFIX: &str = "LLAMA_WARDEN_";

pub const ENV_START_TIMEOUT: &str = "LLAMA_WARDEN_START_TIMEOUT";
pub const ENV_TAG: &str = "LLAMA_WARDEN_TAG";
pub const ENV_ARCHIVE_URL: &str = "LLAMA_WARDEN_ARCHIVE_URL";
pub const ENV_BINARY_DIR: &str = "LLAMA_WARDEN_BINARY_DIR";
pub const ENV_RELEASES_DIR: &str = "LLAMA_WARDEN_RELEASES_DIR";
pub const ENV_LOG: &str = "LLAMA_WARDEN_LOG";

pub const ENV_HOST: &str = "LLAMA_ARG_HOST";
pub const ENV_PORT: &str = "LLAMA_ARG_PORT";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Default readiness timeout (seconds).
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 300;

/// Prefixes of variables that configure llama-server itself.
const SERVER_VAR_PREFIXES: &[&str] = &["LLAMA_ARG_", "LLAMA_LOG_"];

/// Prefixes of variables that select a model.
const MODEL_VAR_PREFIXES: &[&str] = &["LLAMA_ARG_MODEL", "LLAMA_ARG_HF", "LLAMA_ARG_MMPROJ"];

// =============================================================================
// ENVIRONMENT SNAPSHOT
// =============================================================================

/// Immutable copy of the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    ///
    /// Variables whose name or value is not valid Unicode are skipped.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// An empty environment.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// This snapshot with `pairs` layered on top; later pairs win.
    pub fn with_overrides<I, K, V>(&self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut vars = self.vars.clone();
        vars.extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self { vars }
    }

    /// Look up a variable; empty values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Parse a timeout given in (possibly fractional) seconds.
pub fn parse_timeout_secs(key: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| WardenError::config(format!("{key}={raw:?} is not a number of seconds")))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(WardenError::config(format!(
            "{key}={raw:?} must be a positive number of seconds"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Resolve the readiness timeout: explicit > environment > default.
pub fn resolve_start_timeout(explicit: Option<Duration>, env: &EnvSnapshot) -> Result<Duration> {
    if let Some(timeout) = explicit {
        return Ok(timeout);
    }
    match env.get(ENV_START_TIMEOUT) {
        Some(raw) => parse_timeout_secs(ENV_START_TIMEOUT, raw),
        None => Ok(Duration::from_secs(DEFAULT_START_TIMEOUT_SECS)),
    }
}

// =============================================================================
// SERVER ENDPOINT
// =============================================================================

/// Host and port llama-server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve host and port: explicit > `LLAMA_ARG_HOST`/`LLAMA_ARG_PORT` > defaults.
    pub fn resolve(host: Option<&str>, port: Option<u16>, env: &EnvSnapshot) -> Result<Self> {
        let host = host
            .map(str::to_string)
            .or_else(|| env.get(ENV_HOST).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        if host.trim().is_empty() {
            return Err(WardenError::config("host must not be empty"));
        }

        let port = match port {
            Some(port) => port,
            None => match env.get(ENV_PORT) {
                Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                    WardenError::config(format!("{ENV_PORT}={raw:?} is not a valid port"))
                })?,
                None => DEFAULT_PORT,
            },
        };
        if port == 0 {
            return Err(WardenError::config("port 0 cannot be probed for readiness"));
        }

        Ok(Self { host, port })
    }

    /// Base URL clients should use. A wildcard bind address is reached via loopback.
    pub fn base_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" => "127.0.0.1",
            "::" | "[::]" => "[::1]",
            other => other,
        };
        format!("http://{}:{}", host, self.port)
    }

    /// Liveness probe URL.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// =============================================================================
// ENVIRONMENT OVERLAY
// =============================================================================

/// Environment handed to the child process.
///
/// Starts from a snapshot of the parent environment; explicit entries set
/// through the builder methods always override what the snapshot contained.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentOverlay {
    base: BTreeMap<String, String>,
    explicit: BTreeMap<String, String>,
}

impl EnvironmentOverlay {
    /// Overlay on top of the given environment.
    pub fn from_snapshot(env: &EnvSnapshot) -> Self {
        Self {
            base: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            explicit: BTreeMap::new(),
        }
    }

    /// Set a variable explicitly.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.explicit.insert(key.into(), value.into());
        self
    }

    /// Model file to load (`LLAMA_ARG_MODEL`).
    pub fn model(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().display().to_string();
        self.set("LLAMA_ARG_MODEL", path)
    }

    /// Hugging Face repository to pull the model from (`LLAMA_ARG_HF_REPO`).
    pub fn hf_repo(self, repo: impl Into<String>) -> Self {
        self.set("LLAMA_ARG_HF_REPO", repo)
    }

    /// Context size in tokens (`LLAMA_ARG_CTX_SIZE`).
    pub fn ctx_size(self, tokens: u32) -> Self {
        self.set("LLAMA_ARG_CTX_SIZE", tokens.to_string())
    }

    /// Drop model-selection variables inherited from the parent environment.
    ///
    /// Explicitly set entries are kept.
    pub fn without_model_vars(mut self) -> Self {
        self.base
            .retain(|k, _| !MODEL_VAR_PREFIXES.iter().any(|p| k.starts_with(p)));
        self
    }

    /// Drop every inherited `LLAMA_ARG_*` / `LLAMA_LOG_*` variable.
    ///
    /// Explicitly set entries are kept.
    pub fn without_server_vars(mut self) -> Self {
        self.base
            .retain(|k, _| !SERVER_VAR_PREFIXES.iter().any(|p| k.starts_with(p)));
        self
    }

    /// Explicitly set value for `key`, if any.
    pub fn explicit(&self, key: &str) -> Option<&str> {
        self.explicit.get(key).map(|v| v.as_str())
    }

    /// The merged environment for a child bound to `endpoint` and loaded from `binary_dir`.
    ///
    /// The endpoint is always written last so the child listens where the
    /// supervisor probes.
    pub fn render(&self, endpoint: &ServerEndpoint, binary_dir: &Path) -> BTreeMap<String, String> {
        let mut env = self.base.clone();
        env.extend(self.explicit.iter().map(|(k, v)| (k.clone(), v.clone())));

        if !cfg!(windows) {
            let lib_var = if cfg!(target_os = "macos") {
                "DYLD_LIBRARY_PATH"
            } else {
                "LD_LIBRARY_PATH"
            };
            let dir = binary_dir.display().to_string();
            let value = match env.get(lib_var) {
                Some(existing) if !existing.is_empty() => format!("{dir}:{existing}"),
                _ => dir,
            };
            env.insert(lib_var.to_string(), value);
        }

        env.insert(ENV_HOST.to_string(), endpoint.host.clone());
        env.insert(ENV_PORT.to_string(), endpoint.port.to_string());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_treats_empty_as_unset() {
        let env = EnvSnapshot::from_pairs([("A", ""), ("B", "x")]);
        assert_eq!(env.get("A"), None);
        assert_eq!(env.get("B"), Some("x"));
    }

    #[test]
    fn test_start_timeout_precedence() {
        let env = EnvSnapshot::from_pairs([(ENV_START_TIMEOUT, "12.5")]);
        assert_eq!(
            resolve_start_timeout(Some(Duration::from_secs(2)), &env).unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(
            resolve_start_timeout(None, &env).unwrap(),
            Duration::from_millis(12_500)
        );
        assert_eq!(
            resolve_start_timeout(None, &EnvSnapshot::empty()).unwrap(),
            Duration::from_secs(DEFAULT_START_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_start_timeout_rejects_garbage() {
        let env = EnvSnapshot::from_pairs([(ENV_START_TIMEOUT, "soon")]);
        assert!(matches!(
            resolve_start_timeout(None, &env),
            Err(WardenError::Configuration(_))
        ));
        let env = EnvSnapshot::from_pairs([(ENV_START_TIMEOUT, "-1")]);
        assert!(resolve_start_timeout(None, &env).is_err());
    }

    #[test]
    fn test_endpoint_precedence() {
        let env = EnvSnapshot::from_pairs([(ENV_HOST, "0.0.0.0"), (ENV_PORT, "9000")]);

        let endpoint = ServerEndpoint::resolve(None, None, &env).unwrap();
        assert_eq!(endpoint, ServerEndpoint::new("0.0.0.0", 9000));

        let endpoint = ServerEndpoint::resolve(Some("localhost"), Some(9100), &env).unwrap();
        assert_eq!(endpoint, ServerEndpoint::new("localhost", 9100));

        let endpoint = ServerEndpoint::resolve(None, None, &EnvSnapshot::empty()).unwrap();
        assert_eq!(endpoint, ServerEndpoint::default());
    }

    #[test]
    fn test_endpoint_rejects_bad_port() {
        let env = EnvSnapshot::from_pairs([(ENV_PORT, "eighty")]);
        assert!(matches!(
            ServerEndpoint::resolve(None, None, &env),
            Err(WardenError::Configuration(_))
        ));
    }

    #[test]
    fn test_wildcard_host_uses_loopback_url() {
        let endpoint = ServerEndpoint::new("0.0.0.0", 8080);
        assert_eq!(endpoint.base_url(), "http://127.0.0.1:8080");
        assert_eq!(endpoint.health_url(), "http://127.0.0.1:8080/health");
    }

    #[test]
    fn test_overlay_explicit_wins_and_endpoint_is_forced() {
        let env = EnvSnapshot::from_pairs([
            ("LLAMA_ARG_CTX_SIZE", "2048"),
            (ENV_PORT, "1234"),
            ("PATH", "/usr/bin"),
        ]);
        let overlay = EnvironmentOverlay::from_snapshot(&env).ctx_size(8192);
        let rendered = overlay.render(&ServerEndpoint::new("127.0.0.1", 8081), Path::new("/r"));

        assert_eq!(rendered["LLAMA_ARG_CTX_SIZE"], "8192");
        assert_eq!(rendered[ENV_PORT], "8081");
        assert_eq!(rendered["PATH"], "/usr/bin");
    }

    #[test]
    fn test_without_model_vars_keeps_explicit() {
        let env = EnvSnapshot::from_pairs([
            ("LLAMA_ARG_MODEL", "/old.gguf"),
            ("LLAMA_ARG_HF_REPO", "org/repo"),
            ("LLAMA_ARG_MMPROJ", "/proj.gguf"),
            ("LLAMA_ARG_THREADS", "4"),
        ]);
        let overlay = EnvironmentOverlay::from_snapshot(&env)
            .without_model_vars()
            .model("/new.gguf");
        let rendered = overlay.render(&ServerEndpoint::default(), Path::new("/r"));

        assert_eq!(rendered["LLAMA_ARG_MODEL"], "/new.gguf");
        assert!(!rendered.contains_key("LLAMA_ARG_HF_REPO"));
        assert!(!rendered.contains_key("LLAMA_ARG_MMPROJ"));
        assert_eq!(rendered["LLAMA_ARG_THREADS"], "4");
    }

    #[test]
    fn test_without_server_vars() {
        let env = EnvSnapshot::from_pairs([("LLAMA_ARG_THREADS", "4"), ("LLAMA_LOG_COLORS", "1")]);
        let rendered = EnvironmentOverlay::from_snapshot(&env)
            .without_server_vars()
            .render(&ServerEndpoint::default(), Path::new("/r"));
        assert!(!rendered.contains_key("LLAMA_ARG_THREADS"));
        assert!(!rendered.contains_key("LLAMA_LOG_COLORS"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_library_path_prepends_binary_dir() {
        let env = EnvSnapshot::from_pairs([("LD_LIBRARY_PATH", "/usr/local/lib")]);
        let rendered = EnvironmentOverlay::from_snapshot(&env)
            .render(&ServerEndpoint::default(), Path::new("/cache/b6780"));
        assert_eq!(rendered["LD_LIBRARY_PATH"], "/cache/b6780:/usr/local/lib");
    }
}
