pub mod cli;
pub mod config;
pub mod host;
pub mod libraries;
pub mod scripts;
pub mod templates;
pub mod themes;
pub mod watch;

pub use config::{ScriptingConfig, ScriptingConfigOverrides};
pub use host::ScriptHost;
pub use libraries::{LibraryRegistry, NATIVE_LIBRARY_NAMES};
pub use templates::{EntityTemplate, TemplateKind, TemplateRegistry};
pub use themes::ThemeResolver;
pub use watch::{ScriptChange, ScriptWatcher};
