//! Kernelspec discovery and caching.
//!
//! Kernelspecs are enumerated by an external call (`jupyter kernelspec list`
//! by default) that prints one `<name> <path>` pair per line after a header.
//! Each `<path>` holds a `kernel.json` describing how to launch the kernel.
//!
//! Enumeration spawns a subprocess, so the result is cached as an immutable
//! snapshot. A snapshot is only ever replaced wholesale: readers holding the
//! previous `Arc` keep seeing the full previous set, and kernels that vanish
//! from a new enumeration simply disappear.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock, RwLock};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::KernelspecStoreConfig;
use crate::error::{Error, Result};

/// Placeholder in `argv` replaced by the connection file path at launch.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// Placeholder in `argv` replaced by the kernelspec's own directory.
pub const RESOURCE_DIR_PLACEHOLDER: &str = "{resource_dir}";

/// Contents of a `kernel.json` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelJson {
    pub argv: Vec<String>,
    pub display_name: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A discovered kernel definition.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Kernelspec {
    pub name: String,
    pub resource_dir: PathBuf,
    #[serde(flatten)]
    pub spec: KernelJson,
}

impl Kernelspec {
    pub fn display_name(&self) -> &str {
        &self.spec.display_name
    }

    pub fn language(&self) -> &str {
        &self.spec.language
    }

    pub fn argv(&self) -> &[String] {
        &self.spec.argv
    }

    /// Whether some `argv` element carries the connection file placeholder.
    pub fn has_connection_placeholder(&self) -> bool {
        self.spec
            .argv
            .iter()
            .any(|arg| arg.contains(CONNECTION_FILE_PLACEHOLDER))
    }

    /// `argv` with placeholders substituted for a concrete connection file.
    pub fn launch_argv(&self, connection_file: &Path) -> Vec<String> {
        let connection_file = connection_file.to_string_lossy();
        let resource_dir = self.resource_dir.to_string_lossy();
        self.spec
            .argv
            .iter()
            .map(|arg| {
                arg.replace(CONNECTION_FILE_PLACEHOLDER, &connection_file)
                    .replace(RESOURCE_DIR_PLACEHOLDER, &resource_dir)
            })
            .collect()
    }

    /// Build the launch command for this kernel.
    pub fn command(&self, connection_file: &Path) -> Result<tokio::process::Command> {
        let argv = self.launch_argv(connection_file);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Discovery(format!("kernelspec '{}' has an empty argv", self.name)))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        if let Some(env) = &self.spec.env {
            cmd.envs(env);
        }
        Ok(cmd)
    }
}

/// An immutable, ordered set of kernelspecs from one enumeration.
#[derive(Debug, Clone, Default)]
pub struct KernelspecSnapshot {
    specs: Vec<Kernelspec>,
    index: HashMap<String, usize>,
}

impl KernelspecSnapshot {
    /// Build a snapshot, keeping the first entry for any repeated name.
    pub fn new(specs: Vec<Kernelspec>) -> Self {
        let mut kept = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        for spec in specs {
            if index.contains_key(&spec.name) {
                warn!(
                    "[kernelspec] Duplicate kernelspec '{}' at {:?} ignored",
                    spec.name, spec.resource_dir
                );
                continue;
            }
            index.insert(spec.name.clone(), kept.len());
            kept.push(spec);
        }
        Self { specs: kept, index }
    }

    /// Exact, case-sensitive lookup.
    pub fn get(&self, name: &str) -> Option<&Kernelspec> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// First kernelspec, in enumeration order, whose name starts with `prefix`.
    ///
    /// An empty or missing prefix never matches.
    pub fn find_by_prefix(&self, prefix: Option<&str>) -> Option<&Kernelspec> {
        let prefix = prefix.filter(|p| !p.is_empty())?;
        self.specs.iter().find(|spec| spec.name.starts_with(prefix))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Kernelspec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Process-wide cache of kernelspecs.
///
/// The cache is populated on first use and refreshed only by an explicit
/// `discover(true)`. Most callers share `KernelspecStore::shared()`; tests
/// build private stores with their own enumeration command.
pub struct KernelspecStore {
    config: KernelspecStoreConfig,
    snapshot: RwLock<Option<Arc<KernelspecSnapshot>>>,
    /// Serialises enumeration so only one subprocess runs at a time.
    discovery: tokio::sync::Mutex<()>,
}

static SHARED: OnceLock<Arc<KernelspecStore>> = OnceLock::new();

impl KernelspecStore {
    pub fn new(config: KernelspecStoreConfig) -> Self {
        Self {
            config,
            snapshot: RwLock::new(None),
            discovery: tokio::sync::Mutex::new(()),
        }
    }

    /// The process-wide store, configured from the environment.
    pub fn shared() -> Arc<KernelspecStore> {
        SHARED
            .get_or_init(|| Arc::new(KernelspecStore::new(KernelspecStoreConfig::from_env())))
            .clone()
    }

    pub fn config(&self) -> &KernelspecStoreConfig {
        &self.config
    }

    /// The cached snapshot, without triggering discovery.
    pub fn snapshot(&self) -> Option<Arc<KernelspecSnapshot>> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, snapshot: Arc<KernelspecSnapshot>) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }

    /// Enumerate kernelspecs, reusing the cache unless `force` is set.
    ///
    /// On failure the previous cache, if any, is left untouched.
    pub async fn discover(&self, force: bool) -> Result<Arc<KernelspecSnapshot>> {
        if !force {
            if let Some(snapshot) = self.snapshot() {
                return Ok(snapshot);
            }
        }

        let _guard = self.discovery.lock().await;

        // Another caller may have populated the cache while we waited.
        if !force {
            if let Some(snapshot) = self.snapshot() {
                return Ok(snapshot);
            }
        }

        let snapshot = Arc::new(self.enumerate().await?);
        info!(
            "[kernelspec] Discovered {} kernelspec(s): {:?}",
            snapshot.len(),
            snapshot.names().collect::<Vec<_>>()
        );
        self.replace(snapshot.clone());
        Ok(snapshot)
    }

    /// Exact lookup, discovering on first use.
    pub async fn get(&self, name: &str) -> Result<Kernelspec> {
        let snapshot = self.discover(false).await?;
        snapshot
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Prefix lookup, discovering on first use. `None` when nothing matches.
    pub async fn find_by_prefix(&self, prefix: Option<&str>) -> Result<Option<Kernelspec>> {
        let snapshot = self.discover(false).await?;
        Ok(snapshot.find_by_prefix(prefix).cloned())
    }

    /// Resolve a human-supplied name: exact match first, then prefix.
    pub async fn resolve(&self, name: &str) -> Result<Kernelspec> {
        let snapshot = self.discover(false).await?;
        snapshot
            .get(name)
            .or_else(|| snapshot.find_by_prefix(Some(name)))
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn enumerate(&self) -> Result<KernelspecSnapshot> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| Error::Discovery("empty enumeration command".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            "[kernelspec] Running {:?} with {}={:?}",
            self.config.command,
            self.config.path_var,
            std::env::var_os(&self.config.path_var)
        );

        let output = cmd.output().await.map_err(|e| {
            warn!("[kernelspec] Failed to run {:?}: {}", self.config.command, e);
            Error::Discovery(format!("failed to run `{}`: {}", self.config.command.join(" "), e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "[kernelspec] {:?} exited with {}: {}",
                self.config.command,
                output.status,
                stderr.trim()
            );
            return Err(Error::Discovery(format!(
                "`{}` exited with {}: {}",
                self.config.command.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| Error::Discovery(format!("enumeration output is not UTF-8: {}", e)))?;

        let mut specs = Vec::new();
        for (name, resource_dir) in parse_listing(&stdout)? {
            specs.push(read_kernelspec(name, resource_dir).await?);
        }
        Ok(KernelspecSnapshot::new(specs))
    }
}

/// Parse enumeration output into `(name, path)` pairs.
///
/// The first line is a header and is discarded. Blank lines are skipped.
/// The path is everything after the first run of whitespace, so paths with
/// spaces survive.
pub fn parse_listing(output: &str) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for line in output.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let split = line
            .find(char::is_whitespace)
            .ok_or_else(|| Error::Discovery(format!("malformed kernelspec line: {:?}", line)))?;
        let (name, path) = line.split_at(split);
        entries.push((name.to_string(), PathBuf::from(path.trim())));
    }
    Ok(entries)
}

async fn read_kernelspec(name: String, resource_dir: PathBuf) -> Result<Kernelspec> {
    let path = resource_dir.join("kernel.json");
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| Error::Discovery(format!("cannot read {}: {}", path.display(), e)))?;
    let spec: KernelJson = serde_json::from_str(&content)
        .map_err(|e| Error::Discovery(format!("invalid {}: {}", path.display(), e)))?;

    let kernelspec = Kernelspec {
        name,
        resource_dir,
        spec,
    };
    if !kernelspec.has_connection_placeholder() {
        warn!(
            "[kernelspec] '{}' argv has no {} placeholder",
            kernelspec.name, CONNECTION_FILE_PLACEHOLDER
        );
    }
    Ok(kernelspec)
}
