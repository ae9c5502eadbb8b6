use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Result};
use mlua::{Lua, Table};

use crate::config::ScriptingConfig;
use crate::libraries::LibraryRegistry;
use crate::scripts::{self, ScriptRegistry};
use crate::templates::TemplateKind;
use crate::themes::ThemeResolver;

pub(crate) struct HostState {
    pub(crate) config: ScriptingConfig,
    pub(crate) scripts: ScriptRegistry,
    pub(crate) libraries: LibraryRegistry,
    pub(crate) themes: ThemeResolver,
    next_template_id: u64,
}

impl HostState {
    fn allocate_template_id(&mut self) -> u64 {
        let id = self.next_template_id;
        self.next_template_id += 1;
        id
    }
}

/// Owns the guest runtime and every scripting-side registry.
///
/// One host is constructed at startup and passed by reference to whatever
/// loads or dispatches templates; there are no global singletons. The host is
/// strictly single-threaded: scripts never run concurrently with each other
/// or with host logic, and the execution call stack relies on that.
pub struct ScriptHost {
    state: Rc<RefCell<HostState>>,
    lua: Lua,
}

impl ScriptHost {
    pub fn new(config: ScriptingConfig) -> Result<Self> {
        let lua = Lua::new();
        let themes =
            ThemeResolver::new(config.resources_root.clone(), config.default_theme.clone());
        let state = Rc::new(RefCell::new(HostState {
            config,
            scripts: ScriptRegistry::new(),
            libraries: LibraryRegistry::with_native_libraries(),
            themes,
            next_template_id: 1,
        }));
        install_sandbox(&lua, &state)?;
        Ok(Self { state, lua })
    }

    /// Direct access to the guest runtime, mainly for embedders that build
    /// custom library namespaces or host-side tables.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn active_theme(&self) -> String {
        self.state.borrow().themes.active_theme().to_string()
    }

    pub fn set_active_theme(&mut self, name: &str) {
        self.state.borrow_mut().themes.set_active_theme(name);
    }

    /// Locates the script file backing a template name under the active
    /// theme, falling back toward the shared resources root.
    pub fn resolve_template(&self, kind: TemplateKind, name: &str) -> Result<PathBuf> {
        let st = self.state.borrow();
        st.themes.resolve(kind, name, &st.config.script_extension)
    }

    /// Loads (or reuses) the script at `path` and runs its top-level code.
    /// Returns the canonical path that keys the unit in the registry.
    pub fn load_script(&mut self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let canonical = self.ensure_script(path.as_ref())?;
        self.run_script(&canonical)?;
        Ok(canonical)
    }

    /// Loads the script without running it; failed loads are not cached.
    pub(crate) fn ensure_script(&self, path: &Path) -> Result<PathBuf> {
        let (canonical, _newly_loaded) =
            self.state.borrow_mut().scripts.get_or_load(&self.lua, path)?;
        Ok(canonical)
    }

    pub(crate) fn run_script(&self, path: &Path) -> Result<()> {
        scripts::run_unit_at(&self.lua, &self.state, std::slice::from_ref(&path.to_path_buf()))
    }

    /// Recompiles a cached unit whose source changed on disk, preserving its
    /// namespace. Returns whether a recompile happened.
    pub(crate) fn refresh_script(&self, path: &Path) -> Result<bool> {
        self.state.borrow_mut().scripts.refresh_if_changed(&self.lua, path)
    }

    /// Namespace table of a loaded script, keyed by canonical path.
    pub fn script_namespace(&self, path: &Path) -> Result<Table> {
        self.state
            .borrow()
            .scripts
            .unit(path)
            .map(|unit| unit.namespace().clone())
            .ok_or_else(|| anyhow!("script '{}' is not loaded", path.display()))
    }

    /// Path of the script currently executing, or `None` outside any script.
    pub fn current_script(&self) -> Option<PathBuf> {
        self.state.borrow().scripts.current_script().map(Path::to_path_buf)
    }

    /// Namespace of the script currently executing, if any.
    pub fn current_namespace(&self) -> Option<Table> {
        self.state.borrow().scripts.current_namespace()
    }

    pub fn loaded_script_count(&self) -> usize {
        self.state.borrow().scripts.loaded_count()
    }

    /// Registers a custom library under `name`. The builder populates the
    /// library's namespace the first time it is opened; it must not run
    /// scripts or call back into the host.
    pub fn register_library(
        &mut self,
        name: &str,
        dependencies: &[&str],
        builder: impl Fn(&Lua, &Table) -> Result<()> + 'static,
    ) {
        self.state.borrow_mut().libraries.register(name, dependencies, builder);
    }

    /// Host-side library open into an arbitrary target table.
    pub fn open_library(&mut self, name: &str, target: &Table) -> Result<()> {
        self.state.borrow_mut().libraries.open(&self.lua, name, target)
    }

    pub fn has_library(&self, name: &str) -> bool {
        self.state.borrow().libraries.contains(name)
    }

    pub(crate) fn allocate_template_id(&self) -> u64 {
        self.state.borrow_mut().allocate_template_id()
    }

    /// Deterministically drops every cached script unit and any leftover
    /// call-stack frames. Also runs on drop.
    pub fn shutdown(&mut self) {
        self.state.borrow_mut().scripts.clear();
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Installs `include`, `openlib`, and `import` as true globals. Script
/// namespaces receive aliases to these before every run; each consults the
/// call-stack top to learn which script asked.
fn install_sandbox(lua: &Lua, state: &Rc<RefCell<HostState>>) -> Result<()> {
    let globals = lua.globals();

    let st = Rc::clone(state);
    let include = lua
        .create_function(move |lua, path: String| {
            scripts::include_from_running(lua, &st, &path).map_err(into_lua_error)
        })
        .map_err(|err| anyhow!("registering include: {err}"))?;
    globals
        .set("include", include)
        .map_err(|err| anyhow!("exposing include: {err}"))?;

    let st = Rc::clone(state);
    let openlib = lua
        .create_function(move |lua, name: String| {
            open_into_running(lua, &st, &name).map_err(into_lua_error)
        })
        .map_err(|err| anyhow!("registering openlib: {err}"))?;
    globals
        .set("openlib", openlib)
        .map_err(|err| anyhow!("exposing openlib: {err}"))?;

    let st = Rc::clone(state);
    let import = lua
        .create_function(move |lua, path: String| {
            scripts::import_from_running(lua, &st, &path).map_err(into_lua_error)
        })
        .map_err(|err| anyhow!("registering import: {err}"))?;
    globals
        .set("import", import)
        .map_err(|err| anyhow!("exposing import: {err}"))?;

    Ok(())
}

fn open_into_running(lua: &Lua, state: &Rc<RefCell<HostState>>, name: &str) -> Result<()> {
    let mut st = state.borrow_mut();
    let namespace = st
        .scripts
        .current_namespace()
        .ok_or_else(|| anyhow!("openlib('{name}') called outside of a running script"))?;
    st.libraries.open(lua, name, &namespace)
}

fn into_lua_error(err: anyhow::Error) -> mlua::Error {
    mlua::Error::RuntimeError(format!("{err:#}"))
}
