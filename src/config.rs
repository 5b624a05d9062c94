//! Configuration options recognized by the core (spec §6).
//!
//! Follows the teacher's serde-struct-plus-`Default` convention for
//! configuration (`ccos::sandbox::config::SandboxConfig`,
//! `ccos::sandbox::resources::ResourceLimits`) and its `toml` dependency for
//! on-disk configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Off,
    Allow(Vec<String>),
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        NetworkPolicy::Off
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub memory_bytes: u64,
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub network: NetworkPolicy,
    pub fs_roots: Vec<PathBuf>,
    pub max_procs: u32,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpu_ms: 5_000,
            wall_ms: 10_000,
            network: NetworkPolicy::Off,
            fs_roots: Vec::new(),
            max_procs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    pub treat_medium_as_fatal: bool,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            treat_medium_as_fatal: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub allowed_modules: HashSet<String>,
    pub capability_check_ttl_ms: u64,
    pub sandbox: SandboxSettings,
    pub analyzer: AnalyzerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_modules: default_allowed_modules(),
            capability_check_ttl_ms: 1_000,
            sandbox: SandboxSettings::default(),
            analyzer: AnalyzerSettings::default(),
        }
    }
}

fn default_allowed_modules() -> HashSet<String> {
    ["math", "string", "collections", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    pub fn from_toml_str(s: &str) -> CoreResult<Self> {
        toml::from_str(s).map_err(|e| CoreError::Generic(format!("invalid config: {}", e)))
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn is_module_allowed(&self, module: &str) -> bool {
        self.allowed_modules.contains(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_allows_only_stdlib_modules() {
        let cfg = Config::default();
        assert!(cfg.is_module_allowed("math"));
        assert!(!cfg.is_module_allowed("os"));
        assert!(!cfg.is_module_allowed("subprocess"));
    }

    #[test]
    fn parses_from_toml() {
        let toml_src = r#"
            allowed_modules = ["math", "net"]
            capability_check_ttl_ms = 5000

            [sandbox]
            memory_bytes = 1048576
            cpu_ms = 1000
            wall_ms = 2000
            max_procs = 0
            network = { allow = ["api.example.com"] }

            [analyzer]
            treat_medium_as_fatal = true
        "#;
        let cfg = Config::from_toml_str(toml_src).unwrap();
        assert!(cfg.is_module_allowed("net"));
        assert_eq!(cfg.sandbox.memory_bytes, 1_048_576);
        assert!(cfg.analyzer.treat_medium_as_fatal);
        assert_eq!(
            cfg.sandbox.network,
            NetworkPolicy::Allow(vec!["api.example.com".to_string()])
        );
    }

    #[test]
    fn loads_from_a_toml_file_on_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"allowed_modules = ["math"]"#).unwrap();
        writeln!(file, "capability_check_ttl_ms = 2500").unwrap();
        let cfg = Config::from_file(file.path()).unwrap();
        assert!(cfg.is_module_allowed("math"));
        assert_eq!(cfg.capability_check_ttl_ms, 2500);
    }
}
