// Language configuration management for the execution runner
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Placeholder replaced with the artifact path when building the command line
pub const FILE_PLACEHOLDER: &str = "{file}";
/// Placeholder replaced with the language tag when building the command line
pub const LANGUAGE_PLACEHOLDER: &str = "{language}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
}

impl LanguageExecution {
    /// Program and argv for one run of `file`.
    ///
    /// `{file}` and `{language}` are substituted in every argument. When no
    /// argument mentions `{file}` the path is appended as the last argument.
    pub fn command_line(&self, file: &Path, language: &str) -> (String, Vec<String>) {
        let file = file.to_string_lossy();
        let mut saw_file = false;

        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                saw_file |= arg.contains(FILE_PLACEHOLDER);
                arg.replace(FILE_PLACEHOLDER, &file)
                    .replace(LANGUAGE_PLACEHOLDER, language)
            })
            .collect();

        if !saw_file {
            args.push(file.into_owned());
        }

        (self.command.clone(), args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub execution: LanguageExecution,
}

fn default_version() -> String {
    "latest".to_string()
}

impl LanguageConfig {
    pub fn new(name: &str, command: &str, args: &[&str], file_extension: &str) -> Self {
        Self {
            name: name.to_string(),
            version: default_version(),
            execution: LanguageExecution {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                file_extension: file_extension.to_string(),
            },
        }
    }

    /// File extension without the leading dot
    pub fn extension(&self) -> &str {
        self.execution.file_extension.trim_start_matches('.')
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LanguagesJson {
    pub languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone, Default)]
pub struct LanguageConfigManager {
    configs: BTreeMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// The minimal mapping every deployment supports
    pub fn builtin() -> Self {
        let mut manager = Self::default();
        manager.insert(LanguageConfig::new("javascript", "node", &[], "js"));
        manager.insert(LanguageConfig::new("python", "python3", &["-u"], "py"));
        manager.insert(LanguageConfig::new("java", "java", &[], "java"));
        manager
    }

    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load from `config_path` when it exists, otherwise use [`Self::builtin`]
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            warn!(
                path = %config_path.display(),
                "Language config not found, using built-in languages"
            );
            Ok(Self::builtin())
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;

        let mut manager = Self::default();
        for lang in languages_json.languages {
            if lang.name.trim().is_empty() || lang.extension().is_empty() {
                bail!("Language entries need a name and a file extension");
            }
            manager.insert(lang);
        }

        if manager.configs.is_empty() {
            bail!("No languages configured");
        }
        Ok(manager)
    }

    pub fn insert(&mut self, config: LanguageConfig) {
        self.configs.insert(config.name.to_lowercase(), config);
    }

    /// Get configuration for a language tag, case-insensitively
    pub fn get_config(&self, language: &str) -> Option<&LanguageConfig> {
        self.configs.get(&language.to_lowercase())
    }

    pub fn remove(&mut self, language: &str) -> Option<LanguageConfig> {
        self.configs.remove(&language.to_lowercase())
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.configs.values()
    }

    /// Write the current set back out in the languages.json format.
    /// An empty set is refused, since [`Self::load`] would reject the file.
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if self.configs.is_empty() {
            bail!("Refusing to write {}: no languages configured", config_path.display());
        }

        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let languages_json = LanguagesJson {
            languages: self.configs.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&languages_json)?;
        fs::write(config_path, content + "\n")
            .with_context(|| format!("Failed to write {}", config_path.display()))
    }
}
