use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context, Result};
use mlua::{Function, Lua, Table, Value};

use crate::host::HostState;

/// Global functions aliased into every script namespace before it runs.
/// They are the only way script code reaches the host's capability system.
pub const SANDBOX_ENTRY_POINTS: &[&str] = &["include", "openlib", "import"];

/// One loaded, compiled script file plus its namespace table.
///
/// The namespace is the chunk's environment: the only global scope the
/// script's top-level code can see or mutate. Included children share the
/// namespace table by reference and live in the parent's child map; `import`ed
/// modules are independent top-level units with their own namespace.
pub struct ScriptUnit {
    path: PathBuf,
    chunk: Function,
    namespace: Table,
    last_modified: Option<SystemTime>,
    ancestry: Vec<PathBuf>,
    children: HashMap<PathBuf, ScriptUnit>,
}

impl ScriptUnit {
    /// Compiles the file at `path` (already canonical) against `namespace`.
    /// A compile failure constructs nothing: the caller keeps no partial unit.
    fn load(lua: &Lua, path: &Path, namespace: Table, ancestry: Vec<PathBuf>) -> Result<Self> {
        let source =
            fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let chunk = compile_chunk(lua, path, &source, &namespace)?;
        Ok(Self {
            path: path.to_path_buf(),
            chunk,
            namespace,
            last_modified: file_modified(path),
            ancestry,
            children: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn namespace(&self) -> &Table {
        &self.namespace
    }

    pub(crate) fn chunk(&self) -> &Function {
        &self.chunk
    }

    pub fn ancestry(&self) -> &[PathBuf] {
        &self.ancestry
    }

    /// Recompiles the chunk when the source file changed on disk, keeping the
    /// namespace (and therefore top-level script state) intact.
    fn refresh_if_changed(&mut self, lua: &Lua) -> Result<bool> {
        let modified = file_modified(&self.path);
        let stale = match (modified, self.last_modified) {
            (Some(current), Some(previous)) => current > previous,
            _ => true,
        };
        if !stale {
            return Ok(false);
        }
        let source = fs::read_to_string(&self.path)
            .with_context(|| format!("Reading {}", self.path.display()))?;
        self.chunk = compile_chunk(lua, &self.path, &source, &self.namespace)?;
        self.last_modified = modified;
        Ok(true)
    }

    /// Reuses or constructs the included child for `target`, refusing any path
    /// already on this unit's include chain.
    fn ensure_child(&mut self, lua: &Lua, target: &Path) -> Result<()> {
        if self.path == target || self.ancestry.iter().any(|ancestor| ancestor == target) {
            bail!("recursive inclusion of '{}' forbidden", target.display());
        }
        if !self.children.contains_key(target) {
            let mut ancestry = self.ancestry.clone();
            ancestry.push(self.path.clone());
            let child = ScriptUnit::load(lua, target, self.namespace.clone(), ancestry)?;
            self.children.insert(target.to_path_buf(), child);
        }
        Ok(())
    }

    fn descend_mut(&mut self, address: &[PathBuf]) -> Option<&mut ScriptUnit> {
        match address.split_first() {
            None => Some(self),
            Some((head, rest)) => {
                self.children.get_mut(head).and_then(|child| child.descend_mut(rest))
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct StackFrame {
    /// Cache-key chain addressing the running unit: top-level path first,
    /// then one include step per element.
    pub(crate) address: Vec<PathBuf>,
    pub(crate) namespace: Table,
}

impl StackFrame {
    fn script(&self) -> Option<&Path> {
        self.address.last().map(PathBuf::as_path)
    }
}

/// Path-keyed cache of top-level script units plus the stack of currently
/// executing scripts. The stack top is the only way sandbox-exposed global
/// functions learn which namespace asked for them.
///
/// Single-threaded by design: frames are pushed and popped around guest
/// execution without any synchronization.
pub struct ScriptRegistry {
    units: HashMap<PathBuf, ScriptUnit>,
    stack: Vec<StackFrame>,
}

impl ScriptRegistry {
    pub(crate) fn new() -> Self {
        Self { units: HashMap::new(), stack: Vec::new() }
    }

    /// Returns the canonical path and whether the unit was loaded just now.
    /// A cache hit recompiles the chunk first when the source file changed on
    /// disk, so re-loading always runs current code. A unit that fails to
    /// load is not cached, so the load stays retryable.
    pub(crate) fn get_or_load(&mut self, lua: &Lua, path: &Path) -> Result<(PathBuf, bool)> {
        let canonical = canonicalize_script_path(path)?;
        if let Some(unit) = self.units.get_mut(&canonical) {
            unit.refresh_if_changed(lua)?;
            return Ok((canonical, false));
        }
        let namespace = lua
            .create_table()
            .map_err(|err| anyhow!("creating namespace for {}: {err}", canonical.display()))?;
        let unit = ScriptUnit::load(lua, &canonical, namespace, Vec::new())?;
        self.units.insert(canonical.clone(), unit);
        Ok((canonical, true))
    }

    pub fn unit(&self, path: &Path) -> Option<&ScriptUnit> {
        self.units.get(path)
    }

    pub fn loaded_count(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn refresh_if_changed(&mut self, lua: &Lua, path: &Path) -> Result<bool> {
        match self.units.get_mut(path) {
            Some(unit) => unit.refresh_if_changed(lua),
            None => bail!("script '{}' is not loaded", path.display()),
        }
    }

    fn find_unit_mut(&mut self, address: &[PathBuf]) -> Option<&mut ScriptUnit> {
        let (head, rest) = address.split_first()?;
        self.units.get_mut(head).and_then(|unit| unit.descend_mut(rest))
    }

    pub(crate) fn push_frame(&mut self, address: Vec<PathBuf>, namespace: Table) {
        self.stack.push(StackFrame { address, namespace });
    }

    pub(crate) fn pop_frame(&mut self) {
        self.stack.pop();
    }

    /// Path of the script whose code is currently running, if any.
    pub fn current_script(&self) -> Option<&Path> {
        self.stack.last().and_then(StackFrame::script)
    }

    /// Namespace of the script whose code is currently running, if any.
    pub fn current_namespace(&self) -> Option<Table> {
        self.stack.last().map(|frame| frame.namespace.clone())
    }

    pub(crate) fn current_frame(&self) -> Option<StackFrame> {
        self.stack.last().cloned()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Drops every cached unit and any leftover frames. Safe on an empty
    /// stack; this is the only teardown path.
    pub(crate) fn clear(&mut self) {
        self.units.clear();
        self.stack.clear();
    }
}

/// Executes the unit addressed by `address`: aliases the sandbox entry points
/// into its namespace, pushes a call-stack frame, runs the chunk with the
/// namespace as its only global scope, and pops the frame on success and
/// failure alike.
pub(crate) fn run_unit_at(
    lua: &Lua,
    state: &Rc<RefCell<HostState>>,
    address: &[PathBuf],
) -> Result<()> {
    let display = address.last().map(|p| p.display().to_string()).unwrap_or_default();
    let (chunk, namespace) = {
        let mut st = state.borrow_mut();
        let unit = st
            .scripts
            .find_unit_mut(address)
            .ok_or_else(|| anyhow!("script '{display}' is not loaded"))?;
        (unit.chunk().clone(), unit.namespace().clone())
    };
    expose_sandbox_entry_points(lua, &namespace)?;
    state.borrow_mut().scripts.push_frame(address.to_vec(), namespace);
    let outcome = chunk.call::<()>(());
    state.borrow_mut().scripts.pop_frame();
    outcome.map_err(|err| anyhow!("Running {display}: {err}"))
}

/// `include(path)` from inside a running script: namespace-sharing inclusion.
/// The target runs against the including unit's own namespace table.
pub(crate) fn include_from_running(
    lua: &Lua,
    state: &Rc<RefCell<HostState>>,
    raw: &str,
) -> Result<()> {
    let (parent_address, extension) = {
        let st = state.borrow();
        let frame = st
            .scripts
            .current_frame()
            .ok_or_else(|| anyhow!("include('{raw}') called outside of a running script"))?;
        (frame.address, st.config.script_extension.clone())
    };
    let parent_path = parent_address
        .last()
        .cloned()
        .ok_or_else(|| anyhow!("include('{raw}'): empty call-stack frame"))?;
    let resolved = resolve_script_path(raw, parent_path.parent(), &extension);
    let target = canonicalize_script_path(&resolved)?;

    let child_address = {
        let mut st = state.borrow_mut();
        let parent = st
            .scripts
            .find_unit_mut(&parent_address)
            .ok_or_else(|| anyhow!("include('{raw}'): including script is no longer loaded"))?;
        parent.ensure_child(lua, &target)?;
        let mut address = parent_address;
        address.push(target);
        address
    };
    run_unit_at(lua, state, &child_address)
}

/// `import(path)` from inside a running script: loads-or-reuses the target as
/// an independent unit with its own namespace and returns that namespace as
/// the export table. A reused import returns the cached table without
/// re-executing the module.
pub(crate) fn import_from_running(
    lua: &Lua,
    state: &Rc<RefCell<HostState>>,
    raw: &str,
) -> Result<Table> {
    let (current_path, extension) = {
        let st = state.borrow();
        let frame = st
            .scripts
            .current_frame()
            .ok_or_else(|| anyhow!("import('{raw}') called outside of a running script"))?;
        let path = frame
            .script()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("import('{raw}'): empty call-stack frame"))?;
        (path, st.config.script_extension.clone())
    };
    let resolved = resolve_script_path(raw, current_path.parent(), &extension);
    let (canonical, newly_loaded) = state.borrow_mut().scripts.get_or_load(lua, &resolved)?;
    if newly_loaded {
        run_unit_at(lua, state, std::slice::from_ref(&canonical))?;
    }
    let namespace = {
        let st = state.borrow();
        st.scripts
            .unit(&canonical)
            .map(|unit| unit.namespace().clone())
            .ok_or_else(|| anyhow!("import('{raw}'): module vanished from the registry"))?
    };
    Ok(namespace)
}

pub(crate) fn expose_sandbox_entry_points(lua: &Lua, namespace: &Table) -> Result<()> {
    let globals = lua.globals();
    for name in SANDBOX_ENTRY_POINTS {
        let value: Value = globals
            .get(*name)
            .map_err(|err| anyhow!("fetching sandbox entry point '{name}': {err}"))?;
        namespace
            .set(*name, value)
            .map_err(|err| anyhow!("aliasing sandbox entry point '{name}': {err}"))?;
    }
    Ok(())
}

/// Applies the default extension when none is present and resolves relative
/// paths against the requesting script's directory.
pub(crate) fn resolve_script_path(
    raw: &str,
    relative_to: Option<&Path>,
    extension: &str,
) -> PathBuf {
    let mut path = PathBuf::from(raw);
    if path.extension().is_none() {
        path.set_extension(extension);
    }
    if path.is_absolute() {
        return path;
    }
    match relative_to {
        Some(dir) => dir.join(path),
        None => path,
    }
}

pub(crate) fn canonicalize_script_path(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path)
        .with_context(|| format!("Script file not accessible: {}", path.display()))
}

fn compile_chunk(lua: &Lua, path: &Path, source: &str, namespace: &Table) -> Result<Function> {
    lua.load(source)
        .set_name(path.display().to_string())
        .set_environment(namespace.clone())
        .into_function()
        .map_err(|err| anyhow!("Compiling {}: {err}", path.display()))
}

fn file_modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok().and_then(|meta| meta.modified().ok())
}
