//! Runtime drivers: the per-runtime capability set behind sandbox installs
//! and service spawns.
//!
//! Each driver is a value in an explicit table; detection walks the table in
//! priority order so voting stays deterministic. Drivers describe installs
//! as ordered command plans; [`run_install`] executes a plan with stdout and
//! stderr streamed line by line into an [`OutputSink`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::errors::{PactownError, Result};

/// Runtime family a sandbox is materialized for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
    Node,
    Generic,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook that install execution uses to stream subprocess output back to
/// the caller.
pub trait OutputSink: Send {
    fn on_stdout(&mut self, chunk: &str);
    fn on_stderr(&mut self, chunk: &str);
}

/// Sink that forwards every line to a shared callback.
pub struct CallbackSink {
    callback: Arc<dyn Fn(&str) + Send + Sync>,
}

impl CallbackSink {
    pub fn new(callback: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        Self { callback }
    }
}

impl OutputSink for CallbackSink {
    fn on_stdout(&mut self, chunk: &str) {
        (self.callback)(chunk);
    }

    fn on_stderr(&mut self, chunk: &str) {
        (self.callback)(chunk);
    }
}

/// Sink that drops everything; used when no log callback was supplied.
pub struct NullSink;

impl OutputSink for NullSink {
    fn on_stdout(&mut self, _chunk: &str) {}
    fn on_stderr(&mut self, _chunk: &str) {}
}

/// One subprocess in a driver's install plan.
pub struct InstallStep {
    pub label: &'static str,
    pub command: Command,
}

/// Per-runtime capability set: detect, prepare, plan installs, and support
/// spawning. The trait stays object-safe so drivers can live in a table.
pub trait RuntimeDriver: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// True when `lang` (from a deps block) belongs to this runtime.
    fn claims_lang(&self, lang: &str) -> bool;

    /// True when a materialized file path belongs to this runtime.
    fn claims_file(&self, path: &str) -> bool;

    /// One-time sandbox scaffolding before manifests are emitted, e.g. a
    /// minimal `package.json` for node runtimes. Idempotent.
    fn prepare(&self, sandbox: &Path) -> Result<()> {
        let _ = sandbox;
        Ok(())
    }

    /// Ordered install commands for `specs`. `env` is merged into each
    /// child's environment. [`run_install`] executes the plan.
    fn install_steps(
        &self,
        sandbox: &Path,
        specs: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Vec<InstallStep>>;

    /// Subtrees (relative to the sandbox root) that hold the installed
    /// dependency state and are worth caching.
    fn cache_subtrees(&self) -> &'static [&'static str];

    /// True when the sandbox already holds a populated dependency tree.
    fn has_installed_marker(&self, root: &Path) -> bool;

    /// Directory prepended to `PATH` when spawning the service, e.g. the
    /// venv bin dir.
    fn bin_dir(&self, sandbox: &Path) -> Option<PathBuf>;

    /// Fallback run command when the README has no `run` block.
    fn default_run_command(&self, files: &[String]) -> Option<String>;
}

/// Driver table in detection priority order.
pub static DRIVERS: Lazy<Vec<Arc<dyn RuntimeDriver>>> = Lazy::new(|| {
    vec![
        Arc::new(PythonDriver) as Arc<dyn RuntimeDriver>,
        Arc::new(NodeDriver) as Arc<dyn RuntimeDriver>,
    ]
});

pub fn driver_for(kind: RuntimeKind) -> Option<Arc<dyn RuntimeDriver>> {
    DRIVERS.iter().find(|driver| driver.kind() == kind).cloned()
}

/// Determine the runtime for a sandbox: explicit hint, then the first deps
/// block language, then file extensions, each resolved against the driver
/// table in priority order.
pub fn detect_runtime(
    explicit: Option<&str>,
    deps_langs: &[String],
    files: &[String],
) -> RuntimeKind {
    detect_runtime_with(&DRIVERS, explicit, deps_langs, files)
}

/// Detection against an explicit driver table; embedders and tests can
/// swap drivers without touching the global registry.
pub fn detect_runtime_with(
    drivers: &[Arc<dyn RuntimeDriver>],
    explicit: Option<&str>,
    deps_langs: &[String],
    files: &[String],
) -> RuntimeKind {
    if let Some(hint) = explicit {
        for driver in drivers {
            if driver.claims_lang(hint) || driver.kind().as_str() == hint {
                return driver.kind();
            }
        }
    }
    for lang in deps_langs {
        for driver in drivers {
            if driver.claims_lang(lang) {
                return driver.kind();
            }
        }
    }
    for driver in drivers {
        if files.iter().any(|path| driver.claims_file(path)) {
            return driver.kind();
        }
    }
    RuntimeKind::Generic
}

pub struct PythonDriver;

impl PythonDriver {
    fn venv_bin(sandbox: &Path) -> PathBuf {
        if cfg!(windows) {
            sandbox.join(".venv").join("Scripts")
        } else {
            sandbox.join(".venv").join("bin")
        }
    }
}

impl RuntimeDriver for PythonDriver {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Python
    }

    fn claims_lang(&self, lang: &str) -> bool {
        matches!(lang.to_ascii_lowercase().as_str(), "python" | "py" | "python3")
    }

    fn claims_file(&self, path: &str) -> bool {
        path.ends_with(".py")
    }

    fn install_steps(
        &self,
        sandbox: &Path,
        specs: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Vec<InstallStep>> {
        let mut steps = Vec::new();
        let venv_bin = Self::venv_bin(sandbox);
        if !venv_bin.exists() {
            let mut cmd = Command::new("python3");
            cmd.args(["-m", "venv", ".venv"]).current_dir(sandbox).envs(env);
            steps.push(InstallStep {
                label: "creating virtualenv",
                command: cmd,
            });
        }
        if !specs.is_empty() {
            let mut cmd = Command::new(venv_bin.join("pip"));
            cmd.arg("install").args(specs).current_dir(sandbox).envs(env);
            steps.push(InstallStep {
                label: "pip install",
                command: cmd,
            });
        }
        Ok(steps)
    }

    fn cache_subtrees(&self) -> &'static [&'static str] {
        &[".venv"]
    }

    fn has_installed_marker(&self, root: &Path) -> bool {
        dir_has_entries(&Self::venv_bin(root))
    }

    fn bin_dir(&self, sandbox: &Path) -> Option<PathBuf> {
        let bin = Self::venv_bin(sandbox);
        bin.exists().then_some(bin)
    }

    fn default_run_command(&self, files: &[String]) -> Option<String> {
        for candidate in ["main.py", "app.py", "server.py"] {
            if files.iter().any(|f| f == candidate) {
                return Some(format!("python {candidate}"));
            }
        }
        None
    }
}

pub struct NodeDriver;

impl RuntimeDriver for NodeDriver {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Node
    }

    fn claims_lang(&self, lang: &str) -> bool {
        matches!(
            lang.to_ascii_lowercase().as_str(),
            "javascript" | "js" | "node" | "nodejs" | "typescript" | "ts"
        )
    }

    fn claims_file(&self, path: &str) -> bool {
        path.ends_with(".js") || path.ends_with(".ts") || path.ends_with(".mjs")
    }

    fn prepare(&self, sandbox: &Path) -> Result<()> {
        let manifest = sandbox.join("package.json");
        if manifest.exists() {
            return Ok(());
        }
        let name = sandbox
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "sandbox".into());
        let body = serde_json::json!({
            "name": name,
            "version": "1.0.0",
            "private": true,
        });
        std::fs::write(&manifest, format!("{}\n", serde_json::to_string_pretty(&body)?))
            .map_err(|e| PactownError::io(&manifest, e))
    }

    fn install_steps(
        &self,
        sandbox: &Path,
        specs: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Vec<InstallStep>> {
        self.prepare(sandbox)?;

        let mut cmd = Command::new("npm");
        let label = if !specs.is_empty() {
            cmd.arg("install").args(specs).arg("--no-audit").arg("--no-fund");
            "npm install"
        } else if sandbox.join("package-lock.json").exists() {
            // A lockfile with no inline specs means a reproducible tree;
            // `npm ci` is both faster and stricter there.
            cmd.arg("ci").arg("--no-audit").arg("--no-fund");
            "npm ci"
        } else {
            cmd.arg("install").arg("--no-audit").arg("--no-fund");
            "npm install"
        };
        cmd.current_dir(sandbox).envs(env);
        Ok(vec![InstallStep {
            label,
            command: cmd,
        }])
    }

    fn cache_subtrees(&self) -> &'static [&'static str] {
        &["node_modules"]
    }

    fn has_installed_marker(&self, root: &Path) -> bool {
        dir_has_entries(&root.join("node_modules"))
    }

    fn bin_dir(&self, sandbox: &Path) -> Option<PathBuf> {
        let bin = sandbox.join("node_modules").join(".bin");
        bin.exists().then_some(bin)
    }

    fn default_run_command(&self, files: &[String]) -> Option<String> {
        for candidate in ["server.js", "index.js", "main.js"] {
            if files.iter().any(|f| f == candidate) {
                return Some(format!("node {candidate}"));
            }
        }
        None
    }
}

fn dir_has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Execute a driver's install plan, streaming merged output into `sink`.
/// A non-zero exit becomes a `DependencyInstall` error carrying the last
/// output lines.
pub async fn run_install(
    driver: &dyn RuntimeDriver,
    sandbox: &Path,
    specs: &[String],
    env: &BTreeMap<String, String>,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    let steps = driver.install_steps(sandbox, specs, env)?;
    run_steps(driver.kind(), steps, sink).await
}

async fn run_steps(
    runtime: RuntimeKind,
    steps: Vec<InstallStep>,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    for mut step in steps {
        let mut tail: Vec<String> = Vec::new();
        let mut tee = TailSink {
            inner: &mut *sink,
            tail: &mut tail,
        };
        let status = stream_command(&mut step.command, &mut tee).await.map_err(|e| {
            PactownError::DependencyInstall {
                runtime: runtime.to_string(),
                message: format!("{}: {e}", step.label),
            }
        })?;
        if !status.success() {
            return Err(PactownError::DependencyInstall {
                runtime: runtime.to_string(),
                message: format!(
                    "{} exited with {:?}: {}",
                    step.label,
                    status.code(),
                    tail.join(" | ")
                ),
            });
        }
    }
    Ok(())
}

/// Spawn one install subprocess and feed the sink stdout and stderr lines
/// as they arrive, then reap the child. The child is spawned kill-on-drop,
/// so a canceled install terminates it.
async fn stream_command(
    command: &mut Command,
    sink: &mut dyn OutputSink,
) -> std::io::Result<std::process::ExitStatus> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr was not captured"))?;
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            line = out_lines.next_line(), if out_open => match line? {
                Some(line) => {
                    if !line.trim().is_empty() {
                        sink.on_stdout(line.trim_end());
                    }
                }
                None => out_open = false,
            },
            line = err_lines.next_line(), if err_open => match line? {
                Some(line) => {
                    if !line.trim().is_empty() {
                        sink.on_stderr(line.trim_end());
                    }
                }
                None => err_open = false,
            },
        }
    }

    child.wait().await
}

struct TailSink<'a> {
    inner: &'a mut dyn OutputSink,
    tail: &'a mut Vec<String>,
}

impl TailSink<'_> {
    fn remember(&mut self, chunk: &str) {
        if self.tail.len() >= 10 {
            self.tail.remove(0);
        }
        self.tail.push(chunk.to_string());
    }
}

impl OutputSink for TailSink<'_> {
    fn on_stdout(&mut self, chunk: &str) {
        self.remember(chunk);
        self.inner.on_stdout(chunk);
    }

    fn on_stderr(&mut self, chunk: &str) {
        self.remember(chunk);
        self.inner.on_stderr(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deps_language_outranks_file_extensions() {
        let runtime = detect_runtime(
            None,
            &["node".to_string()],
            &["main.py".to_string(), "server.js".to_string()],
        );
        assert_eq!(runtime, RuntimeKind::Node);
    }

    #[test]
    fn file_extensions_break_the_tie() {
        assert_eq!(
            detect_runtime(None, &[], &["main.py".to_string()]),
            RuntimeKind::Python
        );
        assert_eq!(
            detect_runtime(None, &[], &["server.js".to_string()]),
            RuntimeKind::Node
        );
        assert_eq!(detect_runtime(None, &[], &["index.html".to_string()]), RuntimeKind::Generic);
    }

    #[test]
    fn explicit_hint_wins() {
        let runtime = detect_runtime(Some("node"), &["python".to_string()], &["a.py".to_string()]);
        assert_eq!(runtime, RuntimeKind::Node);
    }

    #[test]
    fn python_outranks_node_when_both_claim_files() {
        // Driver table order decides: python is registered first.
        let runtime = detect_runtime(None, &[], &["a.py".to_string(), "b.js".to_string()]);
        assert_eq!(runtime, RuntimeKind::Python);
    }

    #[test]
    fn node_prepare_scaffolds_a_package_json_once() {
        let dir = tempfile::tempdir().unwrap();
        let driver = NodeDriver;
        driver.prepare(dir.path()).unwrap();
        let manifest = dir.path().join("package.json");
        assert!(manifest.exists());

        let first = std::fs::read_to_string(&manifest).unwrap();
        driver.prepare(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&manifest).unwrap(), first);

        let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed["private"], serde_json::Value::Bool(true));
    }

    #[test]
    fn python_install_plan_creates_the_venv_first() {
        let dir = tempfile::tempdir().unwrap();
        let steps = PythonDriver
            .install_steps(dir.path(), &["fastapi".into()], &BTreeMap::new())
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].label, "creating virtualenv");
        assert_eq!(steps[1].label, "pip install");

        // An existing venv drops the first step.
        std::fs::create_dir_all(PythonDriver::venv_bin(dir.path())).unwrap();
        let steps = PythonDriver
            .install_steps(dir.path(), &["fastapi".into()], &BTreeMap::new())
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].label, "pip install");
    }

    #[test]
    fn node_plan_prefers_ci_with_a_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}\n").unwrap();

        let steps = NodeDriver
            .install_steps(dir.path(), &[], &BTreeMap::new())
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].label, "npm ci");

        // Inline specs always go through npm install.
        let steps = NodeDriver
            .install_steps(dir.path(), &["express".into()], &BTreeMap::new())
            .unwrap();
        assert_eq!(steps[0].label, "npm install");
    }

    #[tokio::test]
    async fn streaming_captures_lines_and_exit_status() {
        struct Collect(Vec<String>);
        impl OutputSink for Collect {
            fn on_stdout(&mut self, chunk: &str) {
                self.0.push(chunk.to_string());
            }
            fn on_stderr(&mut self, chunk: &str) {
                self.0.push(format!("err:{chunk}"));
            }
        }

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two >&2"]);
        let mut sink = Collect(Vec::new());
        let status = stream_command(&mut cmd, &mut sink).await.expect("spawn sh");
        assert!(status.success());
        assert!(sink.0.contains(&"one".to_string()));
        assert!(sink.0.contains(&"err:two".to_string()));
    }

    #[tokio::test]
    async fn failed_install_surfaces_the_output_tail() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo broken dependency; exit 3"]);
        let steps = vec![InstallStep {
            label: "pip install",
            command: cmd,
        }];

        let mut sink = NullSink;
        let err = run_steps(RuntimeKind::Python, steps, &mut sink)
            .await
            .expect_err("nonzero exit must fail");
        match err {
            PactownError::DependencyInstall { runtime, message } => {
                assert_eq!(runtime, "python");
                assert!(message.contains("broken dependency"));
                assert!(message.contains("3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn markers_require_populated_trees() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeDriver;
        assert!(!node.has_installed_marker(dir.path()));
        std::fs::create_dir_all(dir.path().join("node_modules/express")).unwrap();
        assert!(node.has_installed_marker(dir.path()));

        let py = PythonDriver;
        assert!(!py.has_installed_marker(dir.path()));
        let bin = dir.path().join(".venv/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("pip"), "#!/bin/sh\n").unwrap();
        assert!(py.has_installed_marker(dir.path()));
    }
}
