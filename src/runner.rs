//! Top-level orchestration: parse → sandbox → install → spawn → health.
//!
//! `fast_run` is the inline-content entry point: the README text is written
//! to a temporary file that is guaranteed to exist while the sandbox
//! manager reads it and to be gone by the time the call returns, on every
//! exit path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::blocks::{self, BlockKind};
use crate::cache::CacheStats;
use crate::config::{CacheConfig, ServiceConfig, SupervisorConfig};
use crate::errors::{PactownError, Result};
use crate::policy::{SecurityPolicy, TokenBucketPolicy};
use crate::runtime::{RuntimeDriver, detect_runtime, driver_for};
use crate::sandbox::{LogCallback, Sandbox, SandboxManager};
use crate::supervisor::{ProcessHandle, ProcessSupervisor, ensure_port_free};
use crate::targets::check_language_coherence;

/// Structured result of a run attempt; failures carry the error kind slug
/// and, for policy denials, a retry hint.
#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub message: String,
    pub kind: Option<String>,
    pub service_id: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub cache_hit: bool,
    pub delay_hint_seconds: Option<f64>,
}

impl RunOutcome {
    fn failure(service_id: &str, port: u16, err: PactownError) -> Self {
        let delay_hint_seconds = match &err {
            PactownError::PolicyDenied { delay_seconds, .. } => *delay_seconds,
            _ => None,
        };
        Self {
            success: false,
            message: err.to_string(),
            kind: Some(err.kind().to_string()),
            service_id: service_id.to_string(),
            port,
            pid: None,
            cache_hit: false,
            delay_hint_seconds,
        }
    }
}

/// Outcome of pre-flight document validation. Warnings are recorded with a
/// `Warning:` prefix and do not make the document invalid.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Drives the whole pipeline for one sandbox root.
pub struct ServiceRunner {
    sandbox_root: PathBuf,
    cache_config: CacheConfig,
    sandbox_manager: SandboxManager,
    supervisor: ProcessSupervisor,
    policy: Box<dyn SecurityPolicy>,
}

impl ServiceRunner {
    pub fn new(sandbox_root: impl Into<PathBuf>) -> Self {
        Self::configured(
            sandbox_root,
            true,
            CacheConfig::default(),
            SupervisorConfig::default(),
        )
    }

    /// Full-control constructor. `enable_fast_start` gates the dependency
    /// cache; with it off every run installs from scratch.
    pub fn configured(
        sandbox_root: impl Into<PathBuf>,
        enable_fast_start: bool,
        mut cache_config: CacheConfig,
        supervisor_config: SupervisorConfig,
    ) -> Self {
        let sandbox_root = sandbox_root.into();
        cache_config.enabled = cache_config.enabled && enable_fast_start;
        Self {
            sandbox_manager: SandboxManager::new(&sandbox_root, cache_config.clone()),
            supervisor: ProcessSupervisor::new(supervisor_config),
            policy: Box::new(TokenBucketPolicy::default()),
            sandbox_root,
            cache_config,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn SecurityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Swap the runtime driver table; embedders use this to stub installs.
    pub fn with_drivers(mut self, drivers: Vec<Arc<dyn RuntimeDriver>>) -> Self {
        self.sandbox_manager =
            SandboxManager::with_drivers(&self.sandbox_root, self.cache_config.clone(), drivers);
        self
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn sandbox_manager(&self) -> &SandboxManager {
        &self.sandbox_manager
    }

    /// Start a service from inline README content.
    pub async fn fast_run(
        &self,
        service_id: &str,
        content: &str,
        port: u16,
        env: Option<&BTreeMap<String, String>>,
        skip_health_check: bool,
    ) -> RunOutcome {
        match self
            .fast_run_inner(service_id, content, port, env, skip_health_check, None)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("fast_run for '{service_id}' failed: {err}");
                RunOutcome::failure(service_id, port, err)
            }
        }
    }

    async fn fast_run_inner(
        &self,
        service_id: &str,
        content: &str,
        port: u16,
        env: Option<&BTreeMap<String, String>>,
        skip_health_check: bool,
        on_log: Option<LogCallback>,
    ) -> Result<RunOutcome> {
        let decision = self.policy.check_can_start_service(service_id, None);
        if !decision.allowed {
            return Err(PactownError::PolicyDenied {
                reason: decision
                    .reason
                    .unwrap_or_else(|| "start rejected by policy".into()),
                delay_seconds: decision.delay_seconds,
            });
        }

        ensure_port_free(port, true).await?;

        // The temp README lives in a runner-owned directory and is removed
        // on every exit path: explicitly after the sandbox reads it, or by
        // the guard when an earlier step fails or the future is dropped.
        let tmp_dir = self.sandbox_root.join(".tmp");
        std::fs::create_dir_all(&tmp_dir).map_err(|e| PactownError::io(&tmp_dir, e))?;
        let temp = tempfile::Builder::new()
            .prefix("readme-")
            .suffix(".md")
            .tempfile_in(&tmp_dir)
            .map_err(|e| PactownError::io(&tmp_dir, e))?;
        std::fs::write(temp.path(), content).map_err(|e| PactownError::io(temp.path(), e))?;

        let service = ServiceConfig {
            name: service_id.to_string(),
            readme: temp.path().display().to_string(),
            port,
            health_check: Some("/health".into()),
            env: env.cloned(),
            target: None,
        };

        let sandbox_result = self
            .sandbox_manager
            .create_sandbox(&service, temp.path(), true, on_log, env)
            .await;
        if let Err(err) = temp.close() {
            log::debug!("temp README already gone: {err}");
        }
        let mut sandbox = sandbox_result?;

        let run_cmd = sandbox.run_command.clone().ok_or_else(|| {
            PactownError::Spawn("document has no run block and no default run command".into())
        })?;

        let handle = self
            .supervisor
            .start(
                service_id,
                &sandbox,
                &run_cmd,
                &env.cloned().unwrap_or_default(),
                service.health_check.as_deref(),
                skip_health_check,
            )
            .await?;
        sandbox.pid = Some(handle.pid);

        Ok(RunOutcome {
            success: true,
            message: if sandbox.cache_hit {
                format!("started on port {port} (dependency cache hit)")
            } else {
                format!("started on port {port}")
            },
            kind: None,
            service_id: service_id.to_string(),
            port,
            pid: Some(handle.pid),
            cache_hit: sandbox.cache_hit,
            delay_hint_seconds: None,
        })
    }

    /// Start a service whose README lives on disk; the CLI path.
    pub async fn run_service(
        &self,
        service: &ServiceConfig,
        install_dependencies: bool,
        skip_health_check: bool,
        on_log: Option<LogCallback>,
    ) -> Result<(Sandbox, ProcessHandle)> {
        let decision = self.policy.check_can_start_service(&service.name, None);
        if !decision.allowed {
            return Err(PactownError::PolicyDenied {
                reason: decision
                    .reason
                    .unwrap_or_else(|| "start rejected by policy".into()),
                delay_seconds: decision.delay_seconds,
            });
        }

        ensure_port_free(service.port, true).await?;

        let readme_path = PathBuf::from(&service.readme);
        let mut sandbox = self
            .sandbox_manager
            .create_sandbox(
                service,
                &readme_path,
                install_dependencies,
                on_log,
                service.env.as_ref(),
            )
            .await?;

        let run_cmd = sandbox.run_command.clone().ok_or_else(|| {
            PactownError::Spawn("document has no run block and no default run command".into())
        })?;
        let env = service.env.clone().unwrap_or_default();
        let handle = self
            .supervisor
            .start(
                &service.name,
                &sandbox,
                &run_cmd,
                &env,
                service.health_check.as_deref(),
                skip_health_check,
            )
            .await?;
        sandbox.pid = Some(handle.pid);
        Ok((sandbox, handle))
    }

    pub async fn stop(&self, service_id: &str) -> Result<bool> {
        self.supervisor.stop(service_id).await
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.sandbox_manager.dep_cache().stats()
    }

    pub fn purge_cache(&self) -> Result<usize> {
        self.sandbox_manager.dep_cache().purge()
    }

    /// Pre-flight checks over inline README content.
    ///
    /// Errors flip `valid`; `Warning:`-prefixed findings do not.
    pub fn validate_content(&self, content: &str) -> ValidationResult {
        let doc = match blocks::parse_document(content) {
            Ok(doc) => doc,
            Err(err) => {
                return ValidationResult {
                    valid: false,
                    errors: vec![err.to_string()],
                };
            }
        };

        let mut errors: Vec<String> = doc
            .warnings
            .iter()
            .map(|warning| format!("Warning: {warning}"))
            .collect();

        let run_blocks: Vec<_> = doc
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Run)
            .collect();
        if run_blocks.len() > 1 {
            errors.push(format!(
                "Warning: found {} run blocks; only the first is honored",
                run_blocks.len()
            ));
        }

        let file_paths = blocks::extract_file_paths(&doc.blocks);
        if run_blocks.is_empty() {
            let deps_langs: Vec<String> = doc
                .blocks
                .iter()
                .filter(|b| b.kind == BlockKind::Deps)
                .filter_map(|b| {
                    if b.lang.is_empty() {
                        b.meta.split_whitespace().next().map(String::from)
                    } else {
                        Some(b.lang.clone())
                    }
                })
                .collect();
            let runtime = detect_runtime(None, &deps_langs, &file_paths);
            let has_default = driver_for(runtime)
                .and_then(|driver| driver.default_run_command(&file_paths))
                .is_some();
            if !has_default {
                errors.push("No run block and no resolvable default run command".into());
            }
        } else if let Some(cmd) = blocks::extract_run_command(&doc.blocks) {
            if shlex::split(&cmd).is_none() {
                errors.push(format!(
                    "Warning: run command is not a valid shell line: {cmd}"
                ));
            }
        }

        let mut seen_paths: Vec<&str> = Vec::new();
        for block in doc.blocks.iter().filter(|b| b.kind == BlockKind::File) {
            match block.get_path() {
                None | Some("") => {
                    errors.push(format!(
                        "File block at line {} is missing a path= entry",
                        block.line
                    ));
                }
                Some(path) => {
                    if seen_paths.contains(&path) {
                        errors.push(format!("Duplicate file path '{path}'"));
                    } else {
                        seen_paths.push(path);
                    }
                }
            }
        }

        for finding in check_language_coherence(&doc.blocks) {
            errors.push(format!("Warning: {finding}"));
        }

        let valid = errors.iter().all(|error| error.starts_with("Warning:"));
        ValidationResult { valid, errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyDecision;
    use crate::runtime::{InstallStep, RuntimeKind};
    use std::path::Path;
    use std::sync::Mutex;

    struct DenyAllPolicy;

    impl SecurityPolicy for DenyAllPolicy {
        fn check_can_start_service(&self, _id: &str, _caller: Option<&str>) -> PolicyDecision {
            PolicyDecision::deny("testing denial", 7.5)
        }
    }

    /// Python-shaped driver that fakes installs instead of shelling out.
    struct FakeInstaller {
        fail: bool,
        calls: Arc<Mutex<usize>>,
    }

    impl RuntimeDriver for FakeInstaller {
        fn kind(&self) -> RuntimeKind {
            RuntimeKind::Python
        }
        fn claims_lang(&self, lang: &str) -> bool {
            matches!(lang, "python" | "py")
        }
        fn claims_file(&self, path: &str) -> bool {
            path.ends_with(".py")
        }
        fn install_steps(
            &self,
            sandbox: &Path,
            _specs: &[String],
            _env: &BTreeMap<String, String>,
        ) -> Result<Vec<InstallStep>> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(PactownError::DependencyInstall {
                    runtime: "python".into(),
                    message: "resolver exploded".into(),
                });
            }
            let bin = sandbox.join(".venv/bin");
            std::fs::create_dir_all(&bin).unwrap();
            std::fs::write(bin.join("pip"), "#!/bin/sh\n").unwrap();
            Ok(Vec::new())
        }
        fn cache_subtrees(&self) -> &'static [&'static str] {
            &[".venv"]
        }
        fn has_installed_marker(&self, root: &Path) -> bool {
            root.join(".venv/bin/pip").exists()
        }
        fn bin_dir(&self, _sandbox: &Path) -> Option<PathBuf> {
            None
        }
        fn default_run_command(&self, files: &[String]) -> Option<String> {
            files
                .iter()
                .find(|f| *f == "main.py")
                .map(|f| format!("python {f}"))
        }
    }

    const PY_README: &str = "```python markpact:file path=main.py\nprint('hi')\n```\n```python markpact:deps\nrequests\n```\n```bash markpact:run\nsleep 30\n```\n";

    fn temp_files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn fast_run_succeeds_and_cleans_the_temp_readme() {
        let tmp = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(0));
        let runner = ServiceRunner::configured(
            tmp.path(),
            true,
            CacheConfig {
                root: Some(tmp.path().join("cache")),
                ..CacheConfig::default()
            },
            SupervisorConfig::default(),
        )
        .with_drivers(vec![Arc::new(FakeInstaller {
            fail: false,
            calls: calls.clone(),
        })]);

        let outcome = runner.fast_run("svc", PY_README, 0, None, true).await;
        assert!(outcome.success, "message: {}", outcome.message);
        assert!(outcome.pid.is_some());
        assert!(!outcome.cache_hit);
        assert_eq!(*calls.lock().unwrap(), 1);

        assert_eq!(temp_files_in(&tmp.path().join(".tmp")), 0);
        assert!(tmp.path().join("svc/main.py").exists());

        runner.stop("svc").await.unwrap();
    }

    #[tokio::test]
    async fn second_fast_run_hits_the_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(0));
        let runner = ServiceRunner::configured(
            tmp.path(),
            true,
            CacheConfig {
                root: Some(tmp.path().join("cache")),
                ..CacheConfig::default()
            },
            SupervisorConfig::default(),
        )
        .with_drivers(vec![Arc::new(FakeInstaller {
            fail: false,
            calls: calls.clone(),
        })]);

        let first = runner.fast_run("svc-a", PY_README, 0, None, true).await;
        assert!(first.success);
        assert!(!first.cache_hit);
        runner.stop("svc-a").await.unwrap();

        let second = runner.fast_run("svc-b", PY_README, 0, None, true).await;
        assert!(second.success);
        assert!(second.cache_hit, "second run must reuse the cached tree");
        assert_eq!(*calls.lock().unwrap(), 1, "install ran exactly once");
        runner.stop("svc-b").await.unwrap();

        let stats = runner.get_cache_stats();
        assert_eq!(stats.entries, 1);
        assert!(stats.hits >= 1);
    }

    #[tokio::test]
    async fn policy_denial_fails_without_touching_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ServiceRunner::new(tmp.path()).with_policy(Box::new(DenyAllPolicy));

        let outcome = runner.fast_run("svc", PY_README, 0, None, true).await;
        assert!(!outcome.success);
        assert_eq!(outcome.kind.as_deref(), Some("policy_denied"));
        assert!(outcome.message.contains("testing denial"));
        assert_eq!(outcome.delay_hint_seconds, Some(7.5));

        assert_eq!(temp_files_in(&tmp.path().join(".tmp")), 0);
        assert!(!tmp.path().join("svc").exists());
    }

    #[tokio::test]
    async fn install_failure_still_cleans_the_temp_readme() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ServiceRunner::configured(
            tmp.path(),
            true,
            CacheConfig {
                root: Some(tmp.path().join("cache")),
                ..CacheConfig::default()
            },
            SupervisorConfig::default(),
        )
        .with_drivers(vec![Arc::new(FakeInstaller {
            fail: true,
            calls: Arc::new(Mutex::new(0)),
        })]);

        let outcome = runner.fast_run("svc", PY_README, 0, None, true).await;
        assert!(!outcome.success);
        assert_eq!(outcome.kind.as_deref(), Some("dependency_install"));
        assert!(outcome.message.contains("resolver exploded"));

        assert_eq!(temp_files_in(&tmp.path().join(".tmp")), 0);
    }

    #[tokio::test]
    async fn env_is_forwarded_to_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ServiceRunner::new(tmp.path());

        let content = "```text markpact:file path=index.html\n<html></html>\n```\n```bash markpact:run\necho flavor=$FLAVOR; sleep 30\n```\n";
        let mut env = BTreeMap::new();
        env.insert("FLAVOR".to_string(), "mint".to_string());

        let outcome = runner.fast_run("svc", content, 0, Some(&env), true).await;
        assert!(outcome.success, "message: {}", outcome.message);

        tokio::time::sleep(std::time::Duration::from_millis(800)).await;
        let tail = runner.supervisor().log_tail("svc");
        assert!(tail.contains(&"flavor=mint".to_string()), "tail: {tail:?}");
        runner.stop("svc").await.unwrap();
    }

    fn validator() -> ServiceRunner {
        ServiceRunner::new(std::env::temp_dir().join("pactown-validate"))
    }

    #[test]
    fn node_package_in_python_block_warns_but_stays_valid() {
        let content = "```python markpact:file path=main.py\nprint(\"hello\")\n```\n```python markpact:deps\nexpress\nrequests\n```\n```bash markpact:run\npython main.py\n```\n";
        let result = validator().validate_content(content);
        assert!(result.valid);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.contains("Found Node.js package 'express' in Python dependency block"))
        );
    }

    #[test]
    fn python_package_in_node_block_warns_but_stays_valid() {
        let content = "```javascript markpact:file path=index.js\nconsole.log(\"hello\")\n```\n```javascript markpact:deps\nfastapi\naxios\n```\n```bash markpact:run\nnode index.js\n```\n";
        let result = validator().validate_content(content);
        assert!(result.valid);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.contains("Found Python package 'fastapi' in Node.js dependency block"))
        );
    }

    #[test]
    fn coherent_documents_validate_cleanly() {
        let python = "```python markpact:file path=main.py\nprint(\"hello\")\n```\n```python markpact:deps\nfastapi\nuvicorn\n```\n```bash markpact:run\npython main.py\n```\n";
        let result = validator().validate_content(python);
        assert!(result.valid);
        assert!(result.errors.is_empty());

        let node = "```javascript markpact:file path=index.js\nconsole.log(\"hello\")\n```\n```javascript markpact:deps\nexpress\npg\n```\n```bash markpact:run\nnode index.js\n```\n";
        let result = validator().validate_content(node);
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn missing_run_block_with_default_entrypoint_is_fine() {
        let content = "```python markpact:file path=main.py\nprint('hi')\n```\n";
        let result = validator().validate_content(content);
        assert!(result.valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn missing_run_block_without_default_is_an_error() {
        let content = "```text markpact:file path=data.csv\na,b\n```\n";
        let result = validator().validate_content(content);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("No run block")));
    }

    #[test]
    fn duplicate_file_paths_are_an_error() {
        let content = "```python markpact:file path=main.py\nprint(1)\n```\n```python markpact:file path=main.py\nprint(2)\n```\n```bash markpact:run\npython main.py\n```\n";
        let result = validator().validate_content(content);
        assert!(!result.valid);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.contains("Duplicate file path 'main.py'"))
        );
    }

    #[test]
    fn file_block_without_path_is_an_error() {
        let content = "```python markpact:file\nprint('hi')\n```\n```bash markpact:run\npython x.py\n```\n";
        let result = validator().validate_content(content);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("missing a path=")));
    }

    #[test]
    fn unclosed_fence_invalidates_the_document() {
        let content = "```python markpact:file path=a.py\nprint('hi')\n";
        let result = validator().validate_content(content);
        assert!(!result.valid);
        assert!(result.errors[0].contains("line 1"));
    }

    #[test]
    fn extra_run_blocks_only_warn() {
        let content = "```python markpact:file path=main.py\nprint('hi')\n```\n```bash markpact:run\npython main.py\n```\n```bash markpact:run\npython main.py --again\n```\n";
        let result = validator().validate_content(content);
        assert!(result.valid);
        assert!(result.errors.iter().any(|e| e.contains("run blocks")));
    }
}
