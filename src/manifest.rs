//! Sandbox descriptor emission: `pactown.sandbox.yaml` plus the sibling
//! `Dockerfile` and `docker-compose.yaml`.
//!
//! The YAML manifest is the portable summary external consumers read;
//! environment variables appear by name only, never by value.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PactownError, Result};
use crate::runtime::RuntimeKind;

pub const MANIFEST_FILE: &str = "pactown.sandbox.yaml";
pub const API_VERSION: &str = "pactown.dev/v1alpha1";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SandboxManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    pub spec: ManifestSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestSpec {
    pub runtime: RuntimeSpec,
    pub deps: Vec<String>,
    pub run: RunSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSpec>,
    pub env: EnvSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(rename = "type")]
    pub kind: RuntimeKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub command: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSpec {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvSpec {
    pub keys: Vec<String>,
}

impl SandboxManifest {
    pub fn new(
        service_name: &str,
        runtime: RuntimeKind,
        deps: Vec<String>,
        run_command: String,
        port: u16,
        health_path: Option<String>,
        mut env_keys: Vec<String>,
    ) -> Self {
        env_keys.sort();
        env_keys.dedup();
        Self {
            api_version: API_VERSION.into(),
            kind: "Sandbox".into(),
            metadata: ManifestMetadata {
                name: service_name.into(),
            },
            spec: ManifestSpec {
                runtime: RuntimeSpec { kind: runtime },
                deps,
                run: RunSpec {
                    command: run_command,
                    port,
                },
                health: health_path.map(|path| HealthSpec { path }),
                env: EnvSpec { keys: env_keys },
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Write the manifest triple into the sandbox directory.
pub fn write_sandbox_files(dir: &Path, manifest: &SandboxManifest) -> Result<()> {
    let write = |name: &str, content: String| -> Result<()> {
        let path = dir.join(name);
        std::fs::write(&path, content).map_err(|e| PactownError::io(&path, e))
    };
    write(MANIFEST_FILE, manifest.to_yaml()?)?;
    write("Dockerfile", render_dockerfile(manifest))?;
    write("docker-compose.yaml", render_compose(manifest))?;
    Ok(())
}

/// Runtime-appropriate Dockerfile installing the same dependency set the
/// sandbox uses.
pub fn render_dockerfile(manifest: &SandboxManifest) -> String {
    let port = manifest.spec.run.port;
    let mut out = String::new();

    match manifest.spec.runtime.kind {
        RuntimeKind::Python => {
            out.push_str("FROM python:3.11-slim\n");
            out.push_str("WORKDIR /app\n");
            out.push_str("COPY . .\n");
            if !manifest.spec.deps.is_empty() {
                out.push_str(&format!(
                    "RUN pip install --no-cache-dir {}\n",
                    manifest.spec.deps.join(" ")
                ));
            }
        }
        RuntimeKind::Node => {
            out.push_str("FROM node:20-slim\n");
            out.push_str("WORKDIR /app\n");
            out.push_str("COPY . .\n");
            if manifest.spec.deps.is_empty() {
                out.push_str("RUN npm install --no-audit --no-fund\n");
            } else {
                out.push_str(&format!(
                    "RUN npm install --no-audit --no-fund {}\n",
                    manifest.spec.deps.join(" ")
                ));
            }
        }
        RuntimeKind::Generic => {
            out.push_str("FROM debian:bookworm-slim\n");
            out.push_str("WORKDIR /app\n");
            out.push_str("COPY . .\n");
        }
    }

    out.push_str(&format!("ENV MARKPACT_PORT={port} PORT={port}\n"));
    out.push_str(&format!("EXPOSE {port}\n"));
    if !manifest.spec.run.command.is_empty() {
        out.push_str(&format!("CMD {}\n", manifest.spec.run.command));
    }
    out
}

/// Compose file exposing the service on its configured port. Environment
/// values are passed through from the host, never inlined.
pub fn render_compose(manifest: &SandboxManifest) -> String {
    let name = &manifest.metadata.name;
    let port = manifest.spec.run.port;
    let mut out = String::new();
    out.push_str("services:\n");
    out.push_str(&format!("  {name}:\n"));
    out.push_str("    build: .\n");
    out.push_str("    ports:\n");
    out.push_str(&format!("      - \"{port}:{port}\"\n"));
    out.push_str("    environment:\n");
    out.push_str(&format!("      MARKPACT_PORT: \"{port}\"\n"));
    out.push_str(&format!("      PORT: \"{port}\"\n"));
    for key in &manifest.spec.env.keys {
        out.push_str(&format!("      {key}: ${{{key}}}\n"));
    }
    out.push_str("    restart: unless-stopped\n");
    out
}
