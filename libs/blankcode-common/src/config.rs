// Execution configuration shared by the worker and the CLI.
// Environment first, optional languages.json overrides on top.
use crate::types::Language;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_LANGUAGES_CONFIG: &str = "config/languages.json";

/// Read an environment variable, falling back to `default` when unset.
/// A value that is set but unparsable is an error, not a silent default.
pub fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        _ => Ok(default),
    }
}

/// Per-language override entry from languages.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageOverride {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub cpu_limit: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageOverride>,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub pids_limit: i64,
    pub docker_enabled: bool,
    /// Where workspaces are written by this process.
    pub workspace_dir: PathBuf,
    /// The same directory as the Docker daemon sees it, when the worker
    /// itself runs in a container with a shared mount.
    pub workspace_host_dir: Option<PathBuf>,
    pub images: HashMap<Language, String>,
    pub default_image: String,
    overrides: HashMap<Language, LanguageOverride>,
}

fn default_image_for(language: Language) -> String {
    let family = match language {
        Language::Typescript | Language::Javascript => "typescript",
        Language::Python => "python",
        Language::Go => "go",
        Language::Rust => "rust",
        Language::React => "react",
        Language::Vue => "vue",
        Language::Node => "node",
    };
    format!("blankcode/runner-{}:latest", family)
}

fn image_env_key(language: Language) -> &'static str {
    match language {
        Language::Typescript => "DOCKER_IMAGE_TS",
        Language::Javascript => "DOCKER_IMAGE_JS",
        Language::Python => "DOCKER_IMAGE_PYTHON",
        Language::Go => "DOCKER_IMAGE_GO",
        Language::Rust => "DOCKER_IMAGE_RUST",
        Language::React => "DOCKER_IMAGE_REACT",
        Language::Vue => "DOCKER_IMAGE_VUE",
        Language::Node => "DOCKER_IMAGE_NODE",
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            pids_limit: 50,
            docker_enabled: true,
            workspace_dir: std::env::temp_dir().join("blankcode-exec"),
            workspace_host_dir: None,
            images: Language::ALL
                .iter()
                .map(|l| (*l, default_image_for(*l)))
                .collect(),
            default_image: "blankcode/runner-typescript:latest".to_string(),
            overrides: HashMap::new(),
        }
    }
}

impl ExecutionConfig {
    /// Build from environment variables, then apply languages.json if present.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let mut config = Self {
            timeout_ms: env_or("EXECUTION_TIMEOUT_MS", defaults.timeout_ms)?,
            memory_limit_mb: env_or("EXECUTION_MEMORY_MB", defaults.memory_limit_mb)?,
            cpu_limit: env_or("EXECUTION_CPU_LIMIT", defaults.cpu_limit)?,
            pids_limit: env_or("EXECUTION_PIDS_LIMIT", defaults.pids_limit)?,
            docker_enabled: std::env::var("DOCKER_ENABLED")
                .map(|v| v.trim() != "false")
                .unwrap_or(true),
            workspace_dir: std::env::var("WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_dir),
            workspace_host_dir: std::env::var("WORKSPACE_HOST_DIR").ok().map(PathBuf::from),
            images: Language::ALL
                .iter()
                .map(|l| {
                    let image = std::env::var(image_env_key(*l))
                        .unwrap_or_else(|_| default_image_for(*l));
                    (*l, image)
                })
                .collect(),
            default_image: std::env::var("DOCKER_IMAGE_DEFAULT")
                .unwrap_or(defaults.default_image),
            overrides: HashMap::new(),
        };

        let overrides_path = std::env::var("LANGUAGES_CONFIG")
            .unwrap_or_else(|_| DEFAULT_LANGUAGES_CONFIG.to_string());
        let overrides_path = Path::new(&overrides_path);
        if overrides_path.exists() {
            config.load_overrides(overrides_path)?;
        }

        if config.timeout_ms == 0 {
            bail!("EXECUTION_TIMEOUT_MS must be greater than zero");
        }
        Ok(config)
    }

    /// Apply per-language overrides from a languages.json file.
    pub fn load_overrides(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.apply_overrides_json(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn apply_overrides_json(&mut self, content: &str) -> Result<()> {
        let parsed: LanguagesJson = serde_json::from_str(content)?;
        for entry in parsed.languages {
            let language = Language::parse(&entry.name)
                .ok_or_else(|| anyhow::anyhow!("Unknown language '{}'", entry.name))?;
            if let Some(image) = &entry.image {
                self.images.insert(language, image.clone());
            }
            self.overrides.insert(language, entry);
        }
        Ok(())
    }

    /// Sandbox image for a language, falling back to the default image.
    pub fn image_for(&self, language: Language) -> &str {
        self.images
            .get(&language)
            .map(String::as_str)
            .unwrap_or(&self.default_image)
    }

    pub fn memory_limit_for(&self, language: Language) -> u32 {
        self.overrides
            .get(&language)
            .and_then(|o| o.memory_limit_mb)
            .unwrap_or(self.memory_limit_mb)
    }

    pub fn cpu_limit_for(&self, language: Language) -> f32 {
        self.overrides
            .get(&language)
            .and_then(|o| o.cpu_limit)
            .unwrap_or(self.cpu_limit)
    }

    /// Configured language names, for startup logging.
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.images.keys().map(|l| l.to_string()).collect();
        names.sort();
        names
    }
}
