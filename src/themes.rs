use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

use crate::templates::TemplateKind;

/// Resolves which script file backs a template name under the active theme.
///
/// The candidate relative path `templates/<kind dir>/<name>.<ext>` is first
/// searched under `<resources root>/themes/<active theme>`, then one path
/// component is stripped from the search base per step until the resources
/// root itself has been tried. Themes therefore only carry the scripts they
/// override; everything else falls back toward the shared defaults.
pub struct ThemeResolver {
    resources_root: PathBuf,
    active_theme: String,
}

impl ThemeResolver {
    pub fn new(resources_root: impl Into<PathBuf>, active_theme: impl Into<String>) -> Self {
        Self { resources_root: resources_root.into(), active_theme: active_theme.into() }
    }

    pub fn active_theme(&self) -> &str {
        &self.active_theme
    }

    pub fn set_active_theme(&mut self, name: impl Into<String>) {
        self.active_theme = name.into();
    }

    pub fn resources_root(&self) -> &Path {
        &self.resources_root
    }

    pub fn resolve(&self, kind: TemplateKind, name: &str, extension: &str) -> Result<PathBuf> {
        let mut file = PathBuf::from(name);
        if file.extension().is_none() {
            file.set_extension(extension);
        }
        let candidate = Path::new("templates").join(kind.directory()).join(file);

        let mut base = self.resources_root.join("themes").join(&self.active_theme);
        loop {
            let path = base.join(&candidate);
            if path.is_file() {
                return Ok(path);
            }
            if base == self.resources_root {
                break;
            }
            match base.parent() {
                Some(parent) => base = parent.to_path_buf(),
                None => break,
            }
        }
        Err(anyhow!(
            "no script found for {} template '{}' (theme '{}', root {})",
            kind.label(),
            name,
            self.active_theme,
            self.resources_root.display()
        ))
    }
}
