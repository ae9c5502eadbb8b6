use crate::config::ScriptingConfigOverrides;
use anyhow::{anyhow, bail, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    resources: Option<PathBuf>,
    theme: Option<String>,
    watch: bool,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            if !flag.starts_with("--") {
                bail!("Unexpected argument '{flag}'. Use --config/--resources/--theme with values, or --watch.");
            }
            let key = &flag[2..];
            if key == "watch" {
                overrides.watch = true;
                continue;
            }
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => {
                    overrides.config = Some(PathBuf::from(value));
                }
                "resources" => {
                    overrides.resources = Some(PathBuf::from(value));
                }
                "theme" => {
                    overrides.theme = Some(value);
                }
                _ => bail!("Unknown flag '{flag}'. Supported flags: --config, --resources, --theme, --watch."),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn watch_enabled(&self) -> bool {
        self.watch
    }

    pub fn into_config_overrides(self) -> ScriptingConfigOverrides {
        ScriptingConfigOverrides { resources_root: self.resources, theme: self.theme }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_resources_and_theme() {
        let args = ["app", "--config", "game.json", "--resources", "content", "--theme", "neon"];
        let overrides = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(overrides.config, Some(PathBuf::from("game.json")));
        assert_eq!(overrides.resources, Some(PathBuf::from("content")));
        assert_eq!(overrides.theme.as_deref(), Some("neon"));
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["app", "--theme", "classic", "--theme", "space"];
        let overrides = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(overrides.theme.as_deref(), Some("space"));
    }

    #[test]
    fn watch_is_a_bare_flag() {
        let overrides = CliOverrides::parse(["app", "--watch", "--theme", "neon"])
            .expect("parse overrides");
        assert!(overrides.watch_enabled());
        assert_eq!(overrides.theme.as_deref(), Some("neon"));
        assert!(!CliOverrides::parse(["app"]).expect("empty parse").watch_enabled());
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["app", "--theme"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags() {
        let err = CliOverrides::parse(["app", "--foo", "bar"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
    }
}
