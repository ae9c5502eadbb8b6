use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptingConfig {
    #[serde(default = "ScriptingConfig::default_resources_root")]
    pub resources_root: PathBuf,
    #[serde(default = "ScriptingConfig::default_theme")]
    pub default_theme: String,
    #[serde(default = "ScriptingConfig::default_script_extension")]
    pub script_extension: String,
}

impl ScriptingConfig {
    fn default_resources_root() -> PathBuf {
        PathBuf::from("assets")
    }

    fn default_theme() -> String {
        "classic".to_string()
    }

    fn default_script_extension() -> String {
        "lua".to_string()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ScriptingConfigOverrides) {
        if let Some(root) = &overrides.resources_root {
            self.resources_root = root.clone();
        }
        if let Some(theme) = &overrides.theme {
            self.default_theme = theme.clone();
        }
    }
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            resources_root: Self::default_resources_root(),
            default_theme: Self::default_theme(),
            script_extension: Self::default_script_extension(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptingConfigOverrides {
    pub resources_root: Option<PathBuf>,
    pub theme: Option<String>,
}

impl ScriptingConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.resources_root.is_none() && self.theme.is_none()
    }
}
