//! Behaviour templates and the registry that compiles and caches them.
//!
//! A template is compiled once per id and shared behind an `Arc`; every entity
//! running the behaviour gets its own instance from [`BehaviourTemplate::instantiate`].
//! Reloading an id swaps the cached template for a new version, while instances
//! already running keep the `Arc` they were created from.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rhai::{Engine, AST};
use tracing::{debug, info, warn};

use crate::behaviour::script::{register_script_api, ScriptBehaviour};
use crate::behaviour::Behaviour;
use crate::config::ScriptConfig;
use crate::error::BehaviourError;

/// Builds Rust-implemented behaviours. Closures returning a boxed behaviour qualify.
pub trait BehaviourFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn Behaviour>>;
}

impl<F> BehaviourFactory for F
where
    F: Fn() -> anyhow::Result<Box<dyn Behaviour>> + Send + Sync,
{
    fn create(&self) -> anyhow::Result<Box<dyn Behaviour>> {
        self()
    }
}

/// A compiled Rhai behaviour: the AST plus the hook functions it defines.
pub struct ScriptProgram {
    engine: Arc<Engine>,
    ast: AST,
    functions: HashSet<(String, usize)>,
    source_hash: blake3::Hash,
}

impl ScriptProgram {
    pub fn compile(engine: Arc<Engine>, id: &str, source: &str) -> Result<Self, BehaviourError> {
        let mut ast = engine.compile(source).map_err(|err| BehaviourError::Compilation {
            id: id.to_string(),
            message: err.0.to_string(),
            line: err.1.line(),
            column: err.1.position(),
        })?;
        ast.set_source(id);
        let functions =
            ast.iter_functions().map(|func| (func.name.to_string(), func.params.len())).collect::<HashSet<_>>();
        Ok(Self { engine, ast, functions, source_hash: blake3::hash(source.as_bytes()) })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }

    pub fn has_function(&self, name: &str, arity: usize) -> bool {
        self.functions.iter().any(|(candidate, params)| candidate == name && *params == arity)
    }

    pub fn source_hash(&self) -> String {
        self.source_hash.to_hex().to_string()
    }
}

#[derive(Clone)]
pub enum TemplateKind {
    Script(Arc<ScriptProgram>),
    Native(Arc<dyn BehaviourFactory>),
}

/// Immutable, shared representation of one behaviour version.
pub struct BehaviourTemplate {
    id: String,
    version: u64,
    source_path: Option<PathBuf>,
    kind: TemplateKind,
}

impl BehaviourTemplate {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn kind(&self) -> &TemplateKind {
        &self.kind
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, TemplateKind::Native(_))
    }

    /// Creates a fresh per-entity instance. Script top-level statements run here.
    pub fn instantiate(&self) -> Result<Box<dyn Behaviour>, BehaviourError> {
        let instantiation = |message: String| BehaviourError::Instantiation { id: self.id.clone(), message };
        match &self.kind {
            TemplateKind::Native(factory) => factory.create().map_err(|err| instantiation(format!("{err:#}"))),
            TemplateKind::Script(program) => ScriptBehaviour::new(&self.id, Arc::clone(program))
                .map(|behaviour| Box::new(behaviour) as Box<dyn Behaviour>)
                .map_err(|err| instantiation(format!("{err:#}"))),
        }
    }
}

impl fmt::Debug for BehaviourTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviourTemplate")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("source_path", &self.source_path)
            .field("native", &self.is_native())
            .finish()
    }
}

/// Outcome of compiling one file during [`BehaviourRegistry::preload_dir`].
#[derive(Debug)]
pub struct PreloadEntry {
    pub id: String,
    pub path: PathBuf,
    pub result: Result<u64, BehaviourError>,
}

/// Resolves behaviour ids to compiled templates and caches the result.
///
/// Failures are cached as well: a missing or broken behaviour keeps returning the
/// recorded error until [`reload`](Self::reload) or [`invalidate`](Self::invalidate).
pub struct BehaviourRegistry {
    engine: Arc<Engine>,
    root: PathBuf,
    extension: String,
    templates: RwLock<HashMap<String, Arc<BehaviourTemplate>>>,
    failures: RwLock<HashMap<String, BehaviourError>>,
    natives: RwLock<HashMap<String, Arc<dyn BehaviourFactory>>>,
    versions: RwLock<HashMap<String, u64>>,
    /// One gate per id so concurrent loads of the same behaviour compile it once.
    build_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    compilations: AtomicU64,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn hold<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BehaviourRegistry {
    pub fn new(config: &ScriptConfig) -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        if let Some(limit) = config.max_operations {
            engine.set_max_operations(limit);
        }
        register_script_api(&mut engine);
        Self {
            engine: Arc::new(engine),
            root: config.root.clone(),
            extension: config.extension.trim_start_matches('.').to_string(),
            templates: RwLock::default(),
            failures: RwLock::default(),
            natives: RwLock::default(),
            versions: RwLock::default(),
            build_gates: Mutex::default(),
            compilations: AtomicU64::new(0),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::new(&ScriptConfig { root: root.into(), ..ScriptConfig::default() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical id: forward slashes, no leading `./`, no script extension.
    pub fn normalize_id(&self, id_or_path: &str) -> String {
        let mut id = id_or_path.trim().replace('\\', "/");
        while let Some(rest) = id.strip_prefix("./") {
            id = rest.to_string();
        }
        let suffix = format!(".{}", self.extension);
        if let Some(stripped) = id.strip_suffix(&suffix) {
            id = stripped.to_string();
        }
        id
    }

    pub fn resolve_path(&self, id: &str) -> PathBuf {
        let file = format!("{id}.{}", self.extension);
        if Path::new(&file).is_absolute() {
            PathBuf::from(file)
        } else {
            self.root.join(file)
        }
    }

    /// Registers a Rust-implemented behaviour under `id`. Natives win over script files.
    pub fn register_native<F>(&self, id: &str, factory: F)
    where
        F: BehaviourFactory + 'static,
    {
        let id = self.normalize_id(id);
        write_lock(&self.natives).insert(id.clone(), Arc::new(factory));
        self.invalidate(&id);
    }

    /// Returns the cached template, compiling it on first use.
    pub fn load(&self, id_or_path: &str) -> Result<Arc<BehaviourTemplate>, BehaviourError> {
        let id = self.normalize_id(id_or_path);
        if let Some(cached) = self.cached(&id) {
            return cached;
        }
        let gate = self.build_gate(&id);
        let _building = hold(&gate);
        // Another caller may have finished the build while we waited.
        if let Some(cached) = self.cached(&id) {
            return cached;
        }
        match self.build(&id) {
            Ok(template) => {
                write_lock(&self.templates).insert(id, Arc::clone(&template));
                Ok(template)
            }
            Err(err) => Err(self.record_failure(&id, err)),
        }
    }

    pub fn get_script(&self, id: &str) -> Option<Arc<BehaviourTemplate>> {
        read_lock(&self.templates).get(&self.normalize_id(id)).cloned()
    }

    pub fn failure(&self, id: &str) -> Option<BehaviourError> {
        read_lock(&self.failures).get(&self.normalize_id(id)).cloned()
    }

    /// Compiles `id` again under a new version. On failure the previous template is
    /// dropped from the cache and the failure recorded; live instances are untouched.
    pub fn reload(&self, id: &str) -> Result<Arc<BehaviourTemplate>, BehaviourError> {
        let id = self.normalize_id(id);
        let gate = self.build_gate(&id);
        let _building = hold(&gate);
        write_lock(&self.failures).remove(&id);
        match self.build(&id) {
            Ok(template) => {
                info!(behaviour = %id, version = template.version, "behaviour reloaded");
                write_lock(&self.templates).insert(id, Arc::clone(&template));
                Ok(template)
            }
            Err(err) => {
                write_lock(&self.templates).remove(&id);
                Err(self.record_failure(&id, err))
            }
        }
    }

    /// Forgets the cached template and any recorded failure for `id`.
    pub fn invalidate(&self, id: &str) -> bool {
        let id = self.normalize_id(id);
        let had_template = write_lock(&self.templates).remove(&id).is_some();
        let had_failure = write_lock(&self.failures).remove(&id).is_some();
        had_template || had_failure
    }

    /// Ids (cached or failed) whose source file is `path`.
    pub fn ids_for_path(&self, path: &Path) -> Vec<String> {
        let target = absolute(path);
        let mut ids: Vec<String> = read_lock(&self.templates)
            .keys()
            .chain(read_lock(&self.failures).keys())
            .filter(|id| absolute(&self.resolve_path(id)) == target)
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_lock(&self.templates).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn template_count(&self) -> usize {
        read_lock(&self.templates).len()
    }

    /// Number of compile attempts so far, successful or not.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Compiles every script below `dir`, in path order.
    pub fn preload_dir(&self, dir: &Path) -> anyhow::Result<Vec<PreloadEntry>> {
        let scripts = collect_scripts(dir, &self.extension)?;
        let root = absolute(&self.root);
        let mut entries = Vec::with_capacity(scripts.len());
        for path in scripts {
            let full = absolute(&path);
            let id = match full.strip_prefix(&root) {
                Ok(relative) => self.normalize_id(&relative.to_string_lossy()),
                Err(_) => self.normalize_id(&full.to_string_lossy()),
            };
            let result = self.load(&id).map(|template| template.version());
            entries.push(PreloadEntry { id, path, result });
        }
        Ok(entries)
    }

    fn cached(&self, id: &str) -> Option<Result<Arc<BehaviourTemplate>, BehaviourError>> {
        if let Some(template) = read_lock(&self.templates).get(id) {
            return Some(Ok(Arc::clone(template)));
        }
        read_lock(&self.failures).get(id).map(|err| Err(err.clone()))
    }

    fn build_gate(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(hold(&self.build_gates).entry(id.to_string()).or_default())
    }

    fn next_version(&self, id: &str) -> u64 {
        let mut versions = write_lock(&self.versions);
        let version = versions.entry(id.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    fn build(&self, id: &str) -> Result<Arc<BehaviourTemplate>, BehaviourError> {
        if id.is_empty() {
            return Err(BehaviourError::NotFound { id: String::new(), searched: None });
        }
        let native = read_lock(&self.natives).get(id).cloned();
        if let Some(factory) = native {
            return Ok(Arc::new(BehaviourTemplate {
                id: id.to_string(),
                version: self.next_version(id),
                source_path: None,
                kind: TemplateKind::Native(factory),
            }));
        }

        let path = self.resolve_path(id);
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(BehaviourError::NotFound { id: id.to_string(), searched: Some(path) });
            }
            Err(err) => return Err(BehaviourError::Io { id: id.to_string(), message: err.to_string() }),
        };
        self.compilations.fetch_add(1, Ordering::Relaxed);
        let program = ScriptProgram::compile(Arc::clone(&self.engine), id, &source)?;
        let version = self.next_version(id);
        debug!(behaviour = id, version, hash = %program.source_hash(), "behaviour compiled");
        Ok(Arc::new(BehaviourTemplate {
            id: id.to_string(),
            version,
            source_path: Some(path),
            kind: TemplateKind::Script(Arc::new(program)),
        }))
    }

    fn record_failure(&self, id: &str, err: BehaviourError) -> BehaviourError {
        warn!(behaviour = id, error = %err, "behaviour unavailable");
        write_lock(&self.failures).insert(id.to_string(), err.clone());
        err
    }
}

impl fmt::Debug for BehaviourRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviourRegistry")
            .field("root", &self.root)
            .field("templates", &self.cached_ids())
            .field("failures", &read_lock(&self.failures).len())
            .field("natives", &read_lock(&self.natives).len())
            .finish()
    }
}

/// Absolute, canonical form of `path`. Files that no longer exist resolve through
/// their parent directory so removals still match.
pub(crate) fn absolute(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (absolute.parent(), absolute.file_name()) {
        if let Ok(parent) = fs::canonicalize(parent) {
            return parent.join(name);
        }
    }
    absolute
}

fn collect_scripts(root: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    use anyhow::Context;

    let mut out = Vec::new();
    if root.is_file() {
        if root.extension().and_then(|ext| ext.to_str()) == Some(extension) {
            out.push(root.to_path_buf());
        }
        return Ok(out);
    }
    for entry in fs::read_dir(root).with_context(|| format!("Reading '{}'", root.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            out.extend(collect_scripts(&path, extension)?);
        } else if path.extension().and_then(|ext| ext.to_str()) == Some(extension) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
