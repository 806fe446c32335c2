//! Target resolution: mapping blocks and dependency names to a
//! platform/framework pair.
//!
//! The registry is an immutable table initialized on first use; lookups are
//! read-only and inference order is the table's registration order.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::blocks::{Block, BlockKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPlatform {
    Web,
    Desktop,
    Mobile,
    Cli,
    Worker,
}

impl TargetPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Cli => "cli",
            Self::Worker => "worker",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "web" => Some(Self::Web),
            "desktop" => Some(Self::Desktop),
            "mobile" => Some(Self::Mobile),
            "cli" => Some(Self::Cli),
            "worker" => Some(Self::Worker),
            _ => None,
        }
    }
}

/// Registry entry describing one known framework.
#[derive(Clone, Debug)]
pub struct FrameworkMeta {
    pub name: &'static str,
    pub platform: TargetPlatform,
    pub build_cmd: Option<&'static str>,
    pub artifact_patterns: &'static [&'static str],
    /// Dependency names whose presence implies this framework. A trailing
    /// `*` matches any suffix (scoped npm packages).
    pub dep_markers: &'static [&'static str],
}

/// Resolved target for one service.
#[derive(Clone, Debug, Serialize)]
pub struct TargetConfig {
    pub platform: TargetPlatform,
    pub framework: String,
    pub build_cmd: Option<String>,
    pub artifact_patterns: Vec<String>,
    /// Raw `k=v` hints from the `target` block, minus the keys consumed
    /// during resolution.
    pub meta: BTreeMap<String, String>,
}

impl TargetConfig {
    fn generic() -> Self {
        Self {
            platform: TargetPlatform::Web,
            framework: "generic".into(),
            build_cmd: None,
            artifact_patterns: Vec::new(),
            meta: BTreeMap::new(),
        }
    }

    fn from_meta(meta: &FrameworkMeta) -> Self {
        Self {
            platform: meta.platform,
            framework: meta.name.to_string(),
            build_cmd: meta.build_cmd.map(String::from),
            artifact_patterns: meta.artifact_patterns.iter().map(|p| p.to_string()).collect(),
            meta: BTreeMap::new(),
        }
    }
}

/// Known frameworks, in inference priority order. Initialized once and
/// never mutated afterwards.
static FRAMEWORK_REGISTRY: Lazy<Vec<FrameworkMeta>> = Lazy::new(|| {
    vec![
        FrameworkMeta {
            name: "fastapi",
            platform: TargetPlatform::Web,
            build_cmd: None,
            artifact_patterns: &[],
            dep_markers: &["fastapi"],
        },
        FrameworkMeta {
            name: "flask",
            platform: TargetPlatform::Web,
            build_cmd: None,
            artifact_patterns: &[],
            dep_markers: &["flask"],
        },
        FrameworkMeta {
            name: "django",
            platform: TargetPlatform::Web,
            build_cmd: None,
            artifact_patterns: &[],
            dep_markers: &["django"],
        },
        FrameworkMeta {
            name: "express",
            platform: TargetPlatform::Web,
            build_cmd: None,
            artifact_patterns: &[],
            dep_markers: &["express"],
        },
        FrameworkMeta {
            name: "nextjs",
            platform: TargetPlatform::Web,
            build_cmd: Some("npm run build"),
            artifact_patterns: &[".next/**"],
            dep_markers: &["next"],
        },
        FrameworkMeta {
            name: "electron",
            platform: TargetPlatform::Desktop,
            build_cmd: Some("npm run build"),
            artifact_patterns: &["dist/**"],
            dep_markers: &["electron"],
        },
        FrameworkMeta {
            name: "tauri",
            platform: TargetPlatform::Desktop,
            build_cmd: Some("npm run tauri build"),
            artifact_patterns: &["src-tauri/target/release/bundle/**"],
            dep_markers: &["@tauri-apps/*"],
        },
        // react last: `react` shows up as a transitive marker of the more
        // specific frameworks above.
        FrameworkMeta {
            name: "react",
            platform: TargetPlatform::Web,
            build_cmd: Some("npm run build"),
            artifact_patterns: &["build/**"],
            dep_markers: &["react"],
        },
    ]
});

pub fn get_framework_meta(name: &str) -> Option<&'static FrameworkMeta> {
    FRAMEWORK_REGISTRY.iter().find(|meta| meta.name == name)
}

pub fn list_frameworks() -> Vec<&'static str> {
    FRAMEWORK_REGISTRY.iter().map(|meta| meta.name).collect()
}

/// Map a target block plus dependency names to a `TargetConfig`.
///
/// Resolution order: explicit `framework=` hint, then dependency markers,
/// then the `(web, generic)` fallback with a noop build command.
pub fn resolve_target(blocks: &[Block]) -> TargetConfig {
    let hints = target_hints(blocks);

    if let Some(name) = hints.get("framework") {
        if let Some(meta) = get_framework_meta(name) {
            let mut config = TargetConfig::from_meta(meta);
            apply_hints(&mut config, hints);
            return config;
        }
        log::warn!("target block names unregistered framework '{name}'");
        let mut config = TargetConfig::generic();
        config.framework = name.clone();
        apply_hints(&mut config, hints);
        return config;
    }

    let specs = crate::blocks::extract_dep_specs(blocks);
    if let Some(mut config) = infer_target_from_deps(&specs) {
        apply_hints(&mut config, hints);
        return config;
    }

    let mut config = TargetConfig::generic();
    apply_hints(&mut config, hints);
    config
}

/// Scan dependency names for registered markers, in registry order.
pub fn infer_target_from_deps(specs: &[String]) -> Option<TargetConfig> {
    let names: Vec<String> = specs.iter().map(|s| package_name(s)).collect();
    for meta in FRAMEWORK_REGISTRY.iter() {
        for marker in meta.dep_markers {
            if names.iter().any(|name| marker_matches(name, marker)) {
                return Some(TargetConfig::from_meta(meta));
            }
        }
    }
    None
}

fn target_hints(blocks: &[Block]) -> BTreeMap<String, String> {
    blocks
        .iter()
        .filter(|block| block.kind == BlockKind::Target)
        .flat_map(|block| {
            block
                .meta
                .split_whitespace()
                .filter_map(|token| token.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn apply_hints(config: &mut TargetConfig, mut hints: BTreeMap<String, String>) {
    hints.remove("framework");
    if let Some(platform) = hints.remove("platform").and_then(|p| TargetPlatform::from_str(&p)) {
        config.platform = platform;
    }
    if let Some(build) = hints.remove("build") {
        config.build_cmd = Some(build);
    }
    config.meta = hints;
}

/// Build command for the resolved target: an explicit `build=` hint or the
/// framework default.
pub fn extract_build_cmd(blocks: &[Block]) -> Option<String> {
    resolve_target(blocks).build_cmd
}

/// Normalize one dependency specifier to a bare package name: strip version
/// constraints (`==`, `>=`, `~=`, `@1.2.3`) and extras, lowercase.
pub fn package_name(spec: &str) -> String {
    let spec = spec.trim();
    // Scoped npm packages keep their leading @; a version pin after the
    // name starts at a later @.
    let without_version = if let Some(rest) = spec.strip_prefix('@') {
        match rest.find('@') {
            Some(idx) => &spec[..idx + 1],
            None => spec,
        }
    } else {
        spec.split('@').next().unwrap_or(spec)
    };
    let end = without_version
        .find(|c: char| ['=', '<', '>', '~', '!', '[', ' '].contains(&c))
        .unwrap_or(without_version.len());
    without_version[..end].trim().to_ascii_lowercase()
}

/// Language family of a `deps` block, from its info-string language token
/// (new dialect) or the first meta token (old dialect).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepsLanguage {
    Python,
    Node,
}

pub fn deps_language(block: &Block) -> Option<DepsLanguage> {
    let token = if block.lang.is_empty() {
        block.meta.split_whitespace().next().unwrap_or("")
    } else {
        block.lang.as_str()
    };
    match token.to_ascii_lowercase().as_str() {
        "python" | "py" | "python3" => Some(DepsLanguage::Python),
        "javascript" | "js" | "node" | "nodejs" | "typescript" | "ts" => Some(DepsLanguage::Node),
        _ => None,
    }
}

/// Packages that only exist in the npm ecosystem.
const NODE_ONLY_PACKAGES: &[&str] = &[
    "express", "axios", "react", "next", "electron", "electron-builder", "pg", "vue", "svelte",
    "koa", "fastify", "mongoose", "prisma",
];

/// Packages that only exist on PyPI.
const PYTHON_ONLY_PACKAGES: &[&str] = &[
    "fastapi", "flask", "django", "uvicorn", "gunicorn", "requests", "sqlalchemy", "pydantic",
    "numpy", "pandas", "httpx",
];

/// Dependency-language coherence check: report packages registered to the
/// other ecosystem than the block's declared language. Warnings, not fatal.
pub fn check_language_coherence(blocks: &[Block]) -> Vec<String> {
    let mut findings = Vec::new();
    for block in blocks.iter().filter(|b| b.kind == BlockKind::Deps) {
        let Some(lang) = deps_language(block) else {
            continue;
        };
        for spec in block.dep_specs() {
            let name = package_name(&spec);
            match lang {
                DepsLanguage::Python if NODE_ONLY_PACKAGES.contains(&name.as_str()) => {
                    findings.push(format!(
                        "Found Node.js package '{name}' in Python dependency block"
                    ));
                }
                DepsLanguage::Node if PYTHON_ONLY_PACKAGES.contains(&name.as_str()) => {
                    findings.push(format!(
                        "Found Python package '{name}' in Node.js dependency block"
                    ));
                }
                _ => {}
            }
        }
    }
    findings
}

fn marker_matches(name: &str, marker: &str) -> bool {
    match marker.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == marker,
    }
}
