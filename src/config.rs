//! Layered configuration for labtriage.
//!
//! Settings are read from `.labtriage/labtriage.toml`, then overridden by
//! environment variables, then by CLI flags. Every field has a default, so a
//! missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! backend = "sqlite"          # or "jsonl"
//! path = "sessions.db"        # relative to .labtriage/
//!
//! [engine]
//! session_lock_timeout_ms = 0 # 0 rejects a concurrent call immediately
//! max_steps_per_call = 32
//!
//! [interpreter]
//! provider = "chat"           # or "rules" for the offline parser
//! base_url = "https://openrouter.ai/api/v1"
//! model = "google/gemini-2.5-flash"
//! api_key_env = "OPENAI_API_KEY"
//! max_tokens = 3500
//! temperature = 0.1
//! timeout_secs = 60
//! max_retries = 2
//! max_input_chars = 7000
//!
//! [specialists]
//! default_location = "94110"
//!
//! [[specialists.directory]]
//! name = "Bay Endocrine Clinic"
//! specialty = "Endocrinologist"
//! location = "San Francisco, CA 94110"
//!
//! [records]
//! fhir_base_url = "https://hapi.fhir.org/baseR4"
//! timeout_secs = 30
//! max_retries = 2
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! cors_origins = ["http://localhost:3000", "http://localhost:5173"]
//!
//! [logging]
//! filter = "labtriage=info"
//! format = "pretty"           # or "json"
//! directory = "logs"          # optional daily-rolling log files
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DATA_DIR: &str = ".labtriage";
pub const CONFIG_FILE: &str = "labtriage.toml";

// ── [store] ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Jsonl,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Sqlite => "sqlite",
            StoreBackend::Jsonl => "jsonl",
        }
    }

    fn default_path(&self) -> &'static str {
        match self {
            StoreBackend::Sqlite => "sessions.db",
            StoreBackend::Jsonl => "sessions",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    /// File (sqlite) or directory (jsonl); relative paths resolve under `.labtriage/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ── [engine] ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// How long a call waits for another traversal of the same session
    /// before failing with `session_busy`.
    #[serde(default)]
    pub session_lock_timeout_ms: u64,
    #[serde(default = "default_max_steps_per_call")]
    pub max_steps_per_call: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            session_lock_timeout_ms: 0,
            max_steps_per_call: default_max_steps_per_call(),
        }
    }
}

fn default_max_steps_per_call() -> usize {
    32
}

// ── [interpreter] ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterProvider {
    /// OpenAI-compatible chat completions endpoint.
    #[default]
    Chat,
    /// Offline line parser; no network access.
    Rules,
}

impl InterpreterProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterpreterProvider::Chat => "chat",
            InterpreterProvider::Rules => "rules",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterSection {
    #[serde(default)]
    pub provider: InterpreterProvider,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_interpreter_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for InterpreterSection {
    fn default() -> Self {
        Self {
            provider: InterpreterProvider::default(),
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_interpreter_timeout(),
            max_retries: default_max_retries(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "google/gemini-2.5-flash".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    3500
}

fn default_temperature() -> f64 {
    0.1
}

fn default_interpreter_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_input_chars() -> usize {
    7000
}

// ── [specialists] ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub specialty: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecialistsSection {
    /// Used when a session was created without a patient location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_location: Option<String>,
    #[serde(default)]
    pub directory: Vec<DirectoryEntry>,
}

// ── [records] ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsSection {
    #[serde(default = "default_fhir_base_url")]
    pub fhir_base_url: String,
    #[serde(default = "default_records_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RecordsSection {
    fn default() -> Self {
        Self {
            fhir_base_url: default_fhir_base_url(),
            timeout_secs: default_records_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_fhir_base_url() -> String {
    "https://hapi.fhir.org/baseR4".to_string()
}

fn default_records_timeout() -> u64 {
    30
}

// ── [server] ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

// ── [logging] ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Daily-rolling log files go here; relative paths resolve under `.labtriage/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

fn default_log_filter() -> String {
    "labtriage=info".to_string()
}

// ── labtriage.toml ────────────────────────────────────────────────────

/// The complete labtriage.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriageToml {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub interpreter: InterpreterSection,
    #[serde(default)]
    pub specialists: SpecialistsSection,
    #[serde(default)]
    pub records: RecordsSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl TriageToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse labtriage.toml")
    }

    /// Load `labtriage.toml` from `data_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize labtriage.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("LABTRIAGE_STORE_PATH").filter(|p| !p.is_empty()) {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(tokens) = lookup("OPENROUTER_MAX_TOKENS").and_then(|v| v.trim().parse().ok()) {
            self.interpreter.max_tokens = tokens;
        }
        if let Some(url) = lookup("HAPI_FHIR_BASE_URL").filter(|u| !u.is_empty()) {
            self.records.fhir_base_url = url;
        }
        if let Some(port) = lookup("LABTRIAGE_PORT").and_then(|v| v.trim().parse().ok()) {
            self.server.port = port;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_steps_per_call == 0 {
            warnings.push("engine.max_steps_per_call is 0: no step can ever run".to_string());
        }

        if !(0.0..=2.0).contains(&self.interpreter.temperature) {
            warnings.push(format!(
                "interpreter.temperature {} is outside 0.0-2.0",
                self.interpreter.temperature
            ));
        }
        if self.interpreter.provider == InterpreterProvider::Chat {
            if !self.interpreter.base_url.starts_with("http") {
                warnings.push(format!(
                    "interpreter.base_url '{}' is not an http(s) URL",
                    self.interpreter.base_url
                ));
            }
            if self.interpreter.api_key_env.trim().is_empty() {
                warnings.push("interpreter.api_key_env is empty".to_string());
            }
        }
        if self.interpreter.max_input_chars < 500 {
            warnings.push(format!(
                "interpreter.max_input_chars {} will truncate most lab reports",
                self.interpreter.max_input_chars
            ));
        }

        if !self.records.fhir_base_url.starts_with("http") {
            warnings.push(format!(
                "records.fhir_base_url '{}' is not an http(s) URL",
                self.records.fhir_base_url
            ));
        }

        for (i, entry) in self.specialists.directory.iter().enumerate() {
            if entry.name.trim().is_empty() || entry.specialty.trim().is_empty() {
                warnings.push(format!(
                    "specialists.directory[{}] needs both a name and a specialty",
                    i
                ));
            }
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.filter).is_err() {
            warnings.push(format!(
                "logging.filter '{}' is not a valid filter directive",
                self.logging.filter
            ));
        }

        warnings
    }
}

// ── Resolved configuration ────────────────────────────────────────────

/// Runtime configuration: labtriage.toml merged with environment and CLI.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub toml: TriageToml,
    pub verbose: bool,
}

impl TriageConfig {
    /// Load from `project_dir/.labtriage`, applying process environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let data_dir = project_dir.join(DATA_DIR);
        let mut toml = TriageToml::load_or_default(&data_dir)?;
        toml.apply_env(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            data_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn store_path(&self) -> PathBuf {
        let path = self
            .toml
            .store
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.toml.store.backend.default_path()));
        self.resolve(path)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.directory.clone().map(|p| self.resolve(p))
    }

    /// API key for the chat interpreter, read from the configured variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.toml.interpreter.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.data_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_gives_defaults() {
        let toml = TriageToml::parse("").unwrap();
        assert_eq!(toml.store.backend, StoreBackend::Sqlite);
        assert_eq!(toml.engine.max_steps_per_call, 32);
        assert_eq!(toml.interpreter.model, "google/gemini-2.5-flash");
        assert_eq!(toml.interpreter.max_tokens, 3500);
        assert_eq!(toml.records.fhir_base_url, "https://hapi.fhir.org/baseR4");
        assert_eq!(toml.server.cors_origins.len(), 2);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = TriageToml::parse(
            r#"
            [store]
            backend = "jsonl"
            path = "/var/lib/labtriage"

            [engine]
            session_lock_timeout_ms = 250

            [interpreter]
            provider = "rules"

            [specialists]
            default_location = "94110"

            [[specialists.directory]]
            name = "Dr. A"
            specialty = "Cardiologist"
            location = "San Francisco"
            rating = 4.5

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(toml.store.backend, StoreBackend::Jsonl);
        assert_eq!(toml.engine.session_lock_timeout_ms, 250);
        assert_eq!(toml.interpreter.provider, InterpreterProvider::Rules);
        assert_eq!(toml.specialists.directory.len(), 1);
        assert_eq!(toml.specialists.directory[0].rating, Some(4.5));
        assert_eq!(toml.logging.format, LogFormat::Json);
        // Untouched fields keep their defaults.
        assert_eq!(toml.engine.max_steps_per_call, 32);
    }

    #[test]
    fn test_unknown_backend_is_a_parse_error() {
        assert!(TriageToml::parse("[store]\nbackend = \"mongo\"").is_err());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("OPENROUTER_MAX_TOKENS", "1200"),
            ("HAPI_FHIR_BASE_URL", "http://localhost:8080/fhir"),
            ("LABTRIAGE_PORT", "9001"),
            ("LABTRIAGE_STORE_PATH", "/tmp/triage.db"),
        ]
        .into_iter()
        .collect();

        let mut toml = TriageToml::parse("[interpreter]\nmax_tokens = 500").unwrap();
        toml.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(toml.interpreter.max_tokens, 1200);
        assert_eq!(toml.records.fhir_base_url, "http://localhost:8080/fhir");
        assert_eq!(toml.server.port, 9001);
        assert_eq!(toml.store.path, Some(PathBuf::from("/tmp/triage.db")));
    }

    #[test]
    fn test_unparseable_env_values_are_ignored() {
        let mut toml = TriageToml::default();
        toml.apply_env(|k| (k == "OPENROUTER_MAX_TOKENS").then(|| "lots".to_string()));
        assert_eq!(toml.interpreter.max_tokens, 3500);
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut toml = TriageToml::default();
        toml.engine.max_steps_per_call = 0;
        toml.interpreter.temperature = 3.0;
        toml.records.fhir_base_url = "ftp://nope".into();
        toml.specialists.directory.push(DirectoryEntry {
            name: "".into(),
            specialty: "Cardiologist".into(),
            location: "x".into(),
            distance: None,
            rating: None,
            url: None,
        });

        let warnings = toml.validate();
        assert_eq!(warnings.len(), 4, "{:?}", warnings);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let toml = TriageToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.server.port, 8000);
    }

    #[test]
    fn test_save_then_load_preserves_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = TriageToml::default();
        toml.store.backend = StoreBackend::Jsonl;
        toml.specialists.default_location = Some("10001".into());
        toml.save(&path).unwrap();

        let loaded = TriageToml::load(&path).unwrap();
        assert_eq!(loaded.store.backend, StoreBackend::Jsonl);
        assert_eq!(loaded.specialists.default_location.as_deref(), Some("10001"));
    }

    #[test]
    fn test_store_path_resolves_under_data_dir() {
        let config = TriageConfig {
            project_dir: PathBuf::from("/proj"),
            data_dir: PathBuf::from("/proj/.labtriage"),
            toml: TriageToml::default(),
            verbose: false,
        };
        assert_eq!(config.store_path(), PathBuf::from("/proj/.labtriage/sessions.db"));

        let mut jsonl = config.clone();
        jsonl.toml.store.backend = StoreBackend::Jsonl;
        assert_eq!(jsonl.store_path(), PathBuf::from("/proj/.labtriage/sessions"));

        let mut absolute = config.clone();
        absolute.toml.store.path = Some(PathBuf::from("/data/x.db"));
        assert_eq!(absolute.store_path(), PathBuf::from("/data/x.db"));
    }
}
