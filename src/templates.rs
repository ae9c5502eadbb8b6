use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use mlua::{Function, FromLuaMulti, IntoLuaMulti, Table, Value};

use crate::host::ScriptHost;

/// The object kinds that can be backed by a script template. The directory
/// name decides where the theme resolver looks for the template's file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    Theme,
    Skybox,
    Block,
    Model,
    Tile,
    Ball,
    Mob,
    Menu,
}

impl TemplateKind {
    pub fn directory(self) -> &'static str {
        match self {
            TemplateKind::Theme => "themes",
            TemplateKind::Skybox => "skyboxes",
            TemplateKind::Block => "blocks",
            TemplateKind::Model => "models",
            TemplateKind::Tile => "tiles",
            TemplateKind::Ball => "balls",
            TemplateKind::Mob => "mobs",
            TemplateKind::Menu => "menus",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TemplateKind::Theme => "theme",
            TemplateKind::Skybox => "skybox",
            TemplateKind::Block => "block",
            TemplateKind::Model => "model",
            TemplateKind::Tile => "tile",
            TemplateKind::Ball => "ball",
            TemplateKind::Mob => "mob",
            TemplateKind::Menu => "menu",
        }
    }
}

/// A behavior definition backed by one script unit, dispatched via named
/// hooks the script may or may not define.
///
/// Hook resolution is cached per name: the first dispatch probes the
/// namespace once and remembers either the function handle or a no-hook
/// sentinel, so dispatching an undefined hook costs one lookup total, not one
/// per call. The cache is cleared on reload.
pub struct EntityTemplate {
    id: u64,
    name: String,
    kind: TemplateKind,
    script_path: Option<PathBuf>,
    namespace: Option<Table>,
    hook_cache: HashMap<String, Option<Function>>,
    namespace_probes: u64,
}

impl EntityTemplate {
    pub fn new(name: impl Into<String>, kind: TemplateKind) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind,
            script_path: None,
            namespace: None,
            hook_cache: HashMap::new(),
            namespace_probes: 0,
        }
    }

    /// Numeric identity assigned at load time; stable across reloads.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    pub fn is_loaded(&self) -> bool {
        self.namespace.is_some()
    }

    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    /// How many times hook resolution had to probe the namespace. Diagnostic;
    /// stays flat once every dispatched hook name has been cached.
    pub fn namespace_probes(&self) -> u64 {
        self.namespace_probes
    }

    /// Resolves the template's file under the active theme, runs the script,
    /// and invokes `OnInit` if the script defines one. Fails without state
    /// change when already loaded, when no file resolves, or when the script
    /// does not compile.
    pub fn load(&mut self, host: &mut ScriptHost) -> Result<()> {
        if self.is_loaded() {
            eprintln!("[template] {} '{}' is already loaded", self.kind.label(), self.name);
            bail!("template '{}' is already loaded", self.name);
        }
        let file = host
            .resolve_template(self.kind, &self.name)
            .with_context(|| format!("locating {} template '{}'", self.kind.label(), self.name))?;
        let path = host.ensure_script(&file)?;
        if self.id == 0 {
            self.id = host.allocate_template_id();
        }
        self.hook_cache.clear();
        host.run_script(&path)
            .with_context(|| format!("running {} template '{}'", self.kind.label(), self.name))?;
        self.namespace = Some(host.script_namespace(&path)?);
        self.script_path = Some(path);
        self.on_init();
        Ok(())
    }

    /// Tears down via `OnDestroy`, clears the hook cache, re-runs the script
    /// against the same namespace (top-level state persists unless the script
    /// resets it), and re-invokes `OnInit`. The numeric id never changes.
    /// Picks up edited source from disk before re-running.
    pub fn reload(&mut self, host: &mut ScriptHost) -> Result<()> {
        if !self.is_loaded() {
            bail!("template '{}' is not loaded", self.name);
        }
        let path = self
            .script_path
            .clone()
            .ok_or_else(|| anyhow!("template '{}' lost its script path", self.name))?;
        self.on_destroy();
        self.hook_cache.clear();
        host.refresh_script(&path)
            .with_context(|| format!("refreshing {} template '{}'", self.kind.label(), self.name))?;
        host.run_script(&path)
            .with_context(|| format!("re-running {} template '{}'", self.kind.label(), self.name))?;
        self.on_init();
        Ok(())
    }

    /// Invokes `OnDestroy` and detaches the template from its script. The
    /// template can be loaded again afterwards; its id is retained.
    pub fn unload(&mut self) {
        if !self.is_loaded() {
            return;
        }
        self.on_destroy();
        self.hook_cache.clear();
        self.namespace = None;
        self.script_path = None;
    }

    fn hook(&mut self, name: &str) -> Option<Function> {
        if let Some(cached) = self.hook_cache.get(name) {
            return cached.clone();
        }
        self.namespace_probes += 1;
        let resolved = self.namespace.as_ref().and_then(|namespace| {
            match namespace.get::<Value>(name) {
                Ok(Value::Function(function)) => Some(function),
                _ => None,
            }
        });
        self.hook_cache.insert(name.to_string(), resolved.clone());
        resolved
    }

    /// Dispatches a hook for its side effects. An undefined hook is a silent
    /// no-op; a guest error is logged with the hook name and swallowed.
    pub fn vcall(&mut self, name: &str, args: impl IntoLuaMulti) {
        let Some(function) = self.hook(name) else {
            return;
        };
        if let Err(err) = function.call::<()>(args) {
            eprintln!("[template] hook '{name}' failed in '{}': {err}", self.name);
        }
    }

    /// Dispatches a hook expecting a return value; `default` is returned when
    /// the hook is undefined or raises.
    pub fn call<A, R>(&mut self, name: &str, args: A, default: R) -> R
    where
        A: IntoLuaMulti,
        R: FromLuaMulti,
    {
        let Some(function) = self.hook(name) else {
            return default;
        };
        match function.call::<R>(args) {
            Ok(value) => value,
            Err(err) => {
                eprintln!("[template] hook '{name}' failed in '{}': {err}", self.name);
                default
            }
        }
    }

    pub fn on_init(&mut self) {
        self.vcall("OnInit", ());
    }

    pub fn on_destroy(&mut self) {
        self.vcall("OnDestroy", ());
    }

    pub fn on_construct(&mut self) {
        self.vcall("OnConstruct", ());
    }

    pub fn on_block_construct(&mut self) {
        self.vcall("OnBlockConstruct", ());
    }

    pub fn on_block_side_construct(&mut self, side: i64) {
        self.vcall("OnBlockSideConstruct", side);
    }

    pub fn on_update(&mut self, dt: f64) {
        self.vcall("OnUpdate", dt);
    }

    pub fn on_update_side(&mut self, side: i64, dt: f64) {
        self.vcall("OnUpdateSide", (side, dt));
    }

    pub fn on_render(&mut self) {
        self.vcall("OnRender", ());
    }

    pub fn on_render_side(&mut self, side: i64) {
        self.vcall("OnRenderSide", side);
    }

    pub fn on_collide(&mut self, args: impl IntoLuaMulti) {
        self.vcall("OnCollide", args);
    }

    pub fn on_load(&mut self) {
        self.vcall("OnLoad", ());
    }
}

/// Name-keyed template cache for one object kind. `load` on a cached name
/// reloads the existing template; a failed load never leaves a
/// half-registered entry behind.
pub struct TemplateRegistry {
    kind: TemplateKind,
    templates: HashMap<String, EntityTemplate>,
}

impl TemplateRegistry {
    pub fn new(kind: TemplateKind) -> Self {
        Self { kind, templates: HashMap::new() }
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    pub fn load(&mut self, host: &mut ScriptHost, name: &str) -> Result<&mut EntityTemplate> {
        if self.templates.contains_key(name) {
            let template = self
                .templates
                .get_mut(name)
                .ok_or_else(|| anyhow!("template cache entry '{name}' vanished"))?;
            template.reload(host)?;
            return Ok(template);
        }
        let mut template = EntityTemplate::new(name, self.kind);
        if let Err(err) = template.load(host) {
            eprintln!("[template] failed to load {} '{name}': {err:#}", self.kind.label());
            return Err(err);
        }
        Ok(self.templates.entry(name.to_string()).or_insert(template))
    }

    pub fn get(&self, name: &str) -> Option<&EntityTemplate> {
        self.templates.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut EntityTemplate> {
        self.templates.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Unloads (with `OnDestroy`) and drops every cached template.
    pub fn clear(&mut self) {
        for template in self.templates.values_mut() {
            template.unload();
        }
        self.templates.clear();
    }
}
