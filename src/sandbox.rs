//! Sandbox materialization: turning parsed blocks into a per-service
//! directory with sources, manifests, and installed dependencies.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::blocks::{self, Block, BlockKind};
use crate::cache::{self, DependencyCache};
use crate::config::{CacheConfig, ServiceConfig};
use crate::errors::{PactownError, Result};
use crate::manifest::{self, MANIFEST_FILE, SandboxManifest};
use crate::runtime::{
    self, CallbackSink, DRIVERS, NullSink, OutputSink, RuntimeDriver, RuntimeKind,
    detect_runtime_with,
};

const README_HASH_FILE: &str = ".pactown-readme-hash";
const DEPS_FINGERPRINT_FILE: &str = ".pactown-deps-fingerprint";

/// Shared line callback for streaming install output to a caller.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A materialized per-service directory.
#[derive(Clone, Debug)]
pub struct Sandbox {
    pub path: PathBuf,
    pub service_name: String,
    pub runtime: RuntimeKind,
    pub port: u16,
    pub manifest: SandboxManifest,
    /// Command from the `run` block, or the runtime's default.
    pub run_command: Option<String>,
    pub deps_fingerprint: Option<String>,
    /// Dependencies came out of the cache instead of a fresh install.
    pub cache_hit: bool,
    /// The directory was left untouched because the README hash matched.
    pub reused: bool,
    /// Set by the caller once the service process is running.
    pub pid: Option<u32>,
}

/// Creates and refreshes sandboxes under one root directory.
pub struct SandboxManager {
    root: PathBuf,
    dep_cache: Arc<DependencyCache>,
    drivers: Vec<Arc<dyn RuntimeDriver>>,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>, cache_config: CacheConfig) -> Self {
        Self::with_drivers(root, cache_config, DRIVERS.clone())
    }

    /// Construct with an explicit driver table instead of the built-in one.
    pub fn with_drivers(
        root: impl Into<PathBuf>,
        cache_config: CacheConfig,
        drivers: Vec<Arc<dyn RuntimeDriver>>,
    ) -> Self {
        Self {
            root: root.into(),
            dep_cache: Arc::new(DependencyCache::new(cache_config)),
            drivers,
        }
    }

    pub fn dep_cache(&self) -> &Arc<DependencyCache> {
        &self.dep_cache
    }

    pub fn sandbox_dir(&self, service_name: &str) -> PathBuf {
        self.root.join(service_name)
    }

    /// Materialize (or reuse) the sandbox for `service`.
    ///
    /// `readme_path` always wins over `service.readme`; the latter is kept
    /// only so downstream consumers can compare the two as strings. When the
    /// stored README hash matches, existing files are left untouched and the
    /// previous sandbox is returned.
    pub async fn create_sandbox(
        &self,
        service: &ServiceConfig,
        readme_path: &Path,
        install_dependencies: bool,
        on_log: Option<LogCallback>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<Sandbox> {
        let sandbox_dir = self.sandbox_dir(&service.name);
        tokio::fs::create_dir_all(&sandbox_dir)
            .await
            .map_err(|e| PactownError::io(&sandbox_dir, e))?;

        let content = tokio::fs::read_to_string(readme_path)
            .await
            .map_err(|e| PactownError::io(readme_path, e))?;
        let content_hash = blake3::hash(content.as_bytes()).to_hex().to_string();

        let doc = blocks::parse_document(&content)?;
        let file_paths = blocks::extract_file_paths(&doc.blocks);
        let dep_specs = blocks::extract_dep_specs(&doc.blocks);
        let deps_langs = deps_block_langs(&doc.blocks);
        let explicit = explicit_runtime_hint(service, &doc.blocks);

        let runtime =
            detect_runtime_with(&self.drivers, explicit.as_deref(), &deps_langs, &file_paths);
        let driver = self.driver_for(runtime);
        let fp = cache::fingerprint(runtime, &dep_specs);

        let reused = self.matches_stored_hash(&sandbox_dir, &content_hash).await;

        let run_command = blocks::extract_run_command(&doc.blocks).or_else(|| {
            driver
                .as_ref()
                .and_then(|d| d.default_run_command(&file_paths))
        });

        let mut env_keys = blocks::extract_env_keys(&doc.blocks);
        if let Some(extra) = env {
            env_keys.extend(extra.keys().cloned());
        }

        let manifest = SandboxManifest::new(
            &service.name,
            runtime,
            dep_specs.clone(),
            run_command.clone().unwrap_or_default(),
            service.port,
            service.health_check.clone(),
            env_keys,
        );

        if reused {
            log::info!(
                "sandbox for '{}' is up to date (README hash unchanged)",
                service.name
            );
        } else {
            self.materialize_files(&sandbox_dir, &doc.blocks)?;
            if let Some(driver) = &driver {
                driver.prepare(&sandbox_dir)?;
            }
            manifest::write_sandbox_files(&sandbox_dir, &manifest)?;
        }

        let mut cache_hit = false;
        if install_dependencies {
            if let Some(driver) = &driver {
                cache_hit = self
                    .ensure_dependencies(&sandbox_dir, driver.clone(), &fp, &dep_specs, env, on_log)
                    .await?;
            }
        }

        if !reused {
            let hash_path = sandbox_dir.join(README_HASH_FILE);
            tokio::fs::write(&hash_path, &content_hash)
                .await
                .map_err(|e| PactownError::io(&hash_path, e))?;
        }

        Ok(Sandbox {
            path: sandbox_dir,
            service_name: service.name.clone(),
            runtime,
            port: service.port,
            manifest,
            run_command,
            deps_fingerprint: driver.is_some().then(|| fp.clone()),
            cache_hit,
            reused,
            pid: None,
        })
    }

    fn driver_for(&self, kind: RuntimeKind) -> Option<Arc<dyn RuntimeDriver>> {
        self.drivers
            .iter()
            .find(|driver| driver.kind() == kind)
            .cloned()
    }

    async fn matches_stored_hash(&self, sandbox_dir: &Path, content_hash: &str) -> bool {
        if !sandbox_dir.join(MANIFEST_FILE).exists() {
            return false;
        }
        match tokio::fs::read_to_string(sandbox_dir.join(README_HASH_FILE)).await {
            Ok(previous) => previous.trim() == content_hash,
            Err(_) => false,
        }
    }

    /// Write every `file` block under the sandbox, creating intermediate
    /// directories. Paths must stay inside the sandbox.
    fn materialize_files(&self, sandbox_dir: &Path, doc_blocks: &[Block]) -> Result<()> {
        for block in doc_blocks.iter().filter(|b| b.kind == BlockKind::File) {
            let rel = block.get_path().ok_or_else(|| PactownError::Parse {
                line: block.line,
                message: "file block is missing a path= entry".into(),
            })?;
            let rel_path = sanitized_relative(rel).ok_or_else(|| PactownError::Parse {
                line: block.line,
                message: format!("file path '{rel}' escapes the sandbox"),
            })?;

            let dest = sandbox_dir.join(rel_path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| PactownError::io(parent, e))?;
            }
            let mut data = block.body.clone();
            if !data.ends_with('\n') {
                data.push('\n');
            }
            std::fs::write(&dest, data).map_err(|e| PactownError::io(&dest, e))?;
            log::debug!("materialized {}", dest.display());
        }
        Ok(())
    }

    /// Bring the sandbox's dependency tree up to date for `fp`. Returns true
    /// when the tree came from the cache.
    ///
    /// The fingerprint lock is held across consult → install → publish, so a
    /// concurrent install of the same set serializes and the loser sees a
    /// hit.
    async fn ensure_dependencies(
        &self,
        sandbox_dir: &Path,
        driver: Arc<dyn RuntimeDriver>,
        fp: &str,
        specs: &[String],
        env: Option<&BTreeMap<String, String>>,
        on_log: Option<LogCallback>,
    ) -> Result<bool> {
        let fp_path = sandbox_dir.join(DEPS_FINGERPRINT_FILE);
        let installed_fp = std::fs::read_to_string(&fp_path)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if installed_fp == fp && driver.has_installed_marker(sandbox_dir) {
            log::debug!("sandbox dependencies already match fingerprint {fp}");
            return Ok(false);
        }

        let lock = self.dep_cache.lock_for(fp);
        let _guard = lock.lock().await;

        let cache = self.dep_cache.clone();
        let runtime = driver.kind();

        if let Some(entry) = cache.get_cached(runtime, fp) {
            log::info!("dependency cache hit for {runtime} ({fp})");
            let dir = sandbox_dir.to_path_buf();
            let cache_for_task = cache.clone();
            run_blocking(move || cache_for_task.rehydrate(&entry, &dir)).await?;
            std::fs::write(&fp_path, fp).map_err(|e| PactownError::io(&fp_path, e))?;
            return Ok(true);
        }

        log::info!("dependency cache miss for {runtime} ({fp}); installing");
        if let Some(env) = env {
            log::debug!("install environment overrides: {}", redacted_env(env));
        }

        let env_owned = env.cloned().unwrap_or_default();
        let mut sink: Box<dyn OutputSink> = match on_log {
            Some(callback) => Box::new(CallbackSink::new(callback)),
            None => Box::new(NullSink),
        };
        runtime::run_install(driver.as_ref(), sandbox_dir, specs, &env_owned, sink.as_mut())
            .await?;

        let dir = sandbox_dir.to_path_buf();
        let fp_owned = fp.to_string();
        run_blocking(move || cache.store(runtime, &fp_owned, &dir).map(|_| ())).await?;

        std::fs::write(&fp_path, fp).map_err(|e| PactownError::io(&fp_path, e))?;
        Ok(false)
    }
}

/// Offload blocking filesystem work (snapshot and rehydration walks) to
/// the worker pool.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PactownError::Spawn(format!("blocking task failed: {e}")))?
}

/// Languages declared on `deps` blocks, in document order. For the old
/// dialect the language token (when present) is the first meta token.
fn deps_block_langs(doc_blocks: &[Block]) -> Vec<String> {
    doc_blocks
        .iter()
        .filter(|block| block.kind == BlockKind::Deps)
        .filter_map(|block| {
            if block.lang.is_empty() {
                block.meta.split_whitespace().next().map(String::from)
            } else {
                Some(block.lang.clone())
            }
        })
        .collect()
}

/// Explicit runtime hint: the `target` block's `runtime=` key, then the
/// service-level target override.
fn explicit_runtime_hint(service: &ServiceConfig, doc_blocks: &[Block]) -> Option<String> {
    doc_blocks
        .iter()
        .filter(|block| block.kind == BlockKind::Target)
        .find_map(|block| block.meta_value("runtime").map(String::from))
        .or_else(|| service.target.clone())
}

/// Normalize a block-provided path to a safe relative path, rejecting
/// absolute paths and parent-directory escapes.
fn sanitized_relative(raw: &str) -> Option<PathBuf> {
    let path = Path::new(raw);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Render an env map for diagnostics with secret-shaped values masked.
fn redacted_env(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| {
            if secret_shaped(key) {
                format!("{key}=***")
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn secret_shaped(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["TOKEN", "SECRET", "PASSWORD", "CREDENTIAL", "APIKEY", "API_KEY"]
        .iter()
        .any(|marker| upper.contains(marker))
}
