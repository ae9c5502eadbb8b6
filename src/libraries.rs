use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use mlua::{Lua, Table, Value};

/// Reserved names for the guest language's own facilities.
pub const NATIVE_LIBRARY_NAMES: &[&str] =
    &["base", "coroutine", "string", "table", "math", "io", "os", "debug"];

/// Globals copied by the `base` library, one name at a time.
const BASE_FUNCTIONS: &[&str] = &[
    "assert",
    "error",
    "getmetatable",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "print",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
];

enum LibrarySource {
    /// A fixed facility of the guest runtime, identified by reserved name.
    Native(&'static str),
    /// Host-defined constructor that populates a fresh namespace once.
    Custom(Box<dyn Fn(&Lua, &Table) -> Result<()>>),
}

struct LibraryEntry {
    dependencies: Vec<String>,
    source: LibrarySource,
    built: Option<Table>,
}

/// Named, dependency-ordered capability bundles copied into script namespaces
/// on demand.
///
/// A library's constructor runs at most once per registry lifetime; every
/// later `open` only re-copies the built namespace's current keys into the
/// requesting target. The copy follows the guest language's own
/// copy-or-share-by-handle semantics: tables and functions are shared
/// handles, so two scripts that open the same library get independent
/// bindings but may share composite values.
pub struct LibraryRegistry {
    entries: HashMap<String, LibraryEntry>,
}

impl LibraryRegistry {
    pub(crate) fn with_native_libraries() -> Self {
        let mut entries = HashMap::new();
        for name in NATIVE_LIBRARY_NAMES {
            entries.insert(
                (*name).to_string(),
                LibraryEntry {
                    dependencies: Vec::new(),
                    source: LibrarySource::Native(name),
                    built: None,
                },
            );
        }
        Self { entries }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registers a custom library. Duplicate names are reported and ignored
    /// so accidental double registration surfaces early.
    ///
    /// The builder only receives the Lua state and the library's fresh
    /// namespace; it must not run scripts or call back into the host.
    pub fn register(
        &mut self,
        name: &str,
        dependencies: &[&str],
        builder: impl Fn(&Lua, &Table) -> Result<()> + 'static,
    ) {
        if self.entries.contains_key(name) {
            eprintln!("[library] duplicate registration of '{name}' ignored");
            return;
        }
        self.entries.insert(
            name.to_string(),
            LibraryEntry {
                dependencies: dependencies.iter().map(|dep| (*dep).to_string()).collect(),
                source: LibrarySource::Custom(Box::new(builder)),
                built: None,
            },
        );
    }

    /// Opens `name` into `target`: dependencies first (strict pre-order),
    /// then the library's own keys. A dependency chain that reaches back to a
    /// name already being opened fails fast with a cycle error.
    pub fn open(&mut self, lua: &Lua, name: &str, target: &Table) -> Result<()> {
        let mut opening = Vec::new();
        self.open_inner(lua, name, target, &mut opening)
    }

    fn open_inner(
        &mut self,
        lua: &Lua,
        name: &str,
        target: &Table,
        opening: &mut Vec<String>,
    ) -> Result<()> {
        if opening.iter().any(|pending| pending == name) {
            bail!("cyclic library dependency: {} -> {name}", opening.join(" -> "));
        }
        let dependencies = match self.entries.get(name) {
            Some(entry) => entry.dependencies.clone(),
            None => bail!("unknown library '{name}'"),
        };
        opening.push(name.to_string());
        let outcome = self.open_resolved(lua, name, &dependencies, target, opening);
        opening.pop();
        outcome
    }

    fn open_resolved(
        &mut self,
        lua: &Lua,
        name: &str,
        dependencies: &[String],
        target: &Table,
        opening: &mut Vec<String>,
    ) -> Result<()> {
        for dependency in dependencies {
            self.open_inner(lua, dependency, target, opening)
                .with_context(|| format!("opening dependency '{dependency}' of '{name}'"))?;
        }
        let built = self.build_if_needed(lua, name)?;
        copy_table_entries(&built, target)
            .with_context(|| format!("copying library '{name}' into namespace"))
    }

    fn build_if_needed(&mut self, lua: &Lua, name: &str) -> Result<Table> {
        if let Some(built) = self.entries.get(name).and_then(|entry| entry.built.clone()) {
            return Ok(built);
        }
        let built = {
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| anyhow!("unknown library '{name}'"))?;
            match &entry.source {
                LibrarySource::Native(tag) => build_native_namespace(lua, tag)?,
                LibrarySource::Custom(builder) => {
                    let namespace = lua
                        .create_table()
                        .map_err(|err| anyhow!("creating namespace for library '{name}': {err}"))?;
                    builder(lua, &namespace)
                        .with_context(|| format!("constructing library '{name}'"))?;
                    if namespace.clone().pairs::<Value, Value>().next().is_none() {
                        bail!("library '{name}' constructor produced an empty namespace");
                    }
                    namespace
                }
            }
        };
        if let Some(entry) = self.entries.get_mut(name) {
            entry.built = Some(built.clone());
        }
        Ok(built)
    }
}

fn build_native_namespace(lua: &Lua, name: &str) -> Result<Table> {
    let globals = lua.globals();
    let namespace = lua
        .create_table()
        .map_err(|err| anyhow!("creating namespace for native library '{name}': {err}"))?;
    if name == "base" {
        for function in BASE_FUNCTIONS {
            let value: Value = globals
                .get(*function)
                .map_err(|err| anyhow!("reading global '{function}': {err}"))?;
            if !value.is_nil() {
                namespace
                    .set(*function, value)
                    .map_err(|err| anyhow!("copying global '{function}': {err}"))?;
            }
        }
    } else {
        let value: Value = globals
            .get(name)
            .map_err(|err| anyhow!("reading global '{name}': {err}"))?;
        if value.is_nil() {
            bail!("native library '{name}' is not present in this Lua build");
        }
        namespace
            .set(name, value)
            .map_err(|err| anyhow!("copying native library '{name}': {err}"))?;
    }
    Ok(namespace)
}

fn copy_table_entries(source: &Table, target: &Table) -> Result<()> {
    for pair in source.clone().pairs::<Value, Value>() {
        let (key, value) = pair.map_err(|err| anyhow!("iterating library namespace: {err}"))?;
        target
            .set(key, value)
            .map_err(|err| anyhow!("copying library entry: {err}"))?;
    }
    Ok(())
}
