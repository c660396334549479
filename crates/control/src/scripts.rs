use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use storage::Storage;
use surface::ControlSurface;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, error, info};

/// Handles passed to every script invocation.
#[derive(Clone)]
pub struct ScriptContext {
    pub debug: ScriptLogger,
    pub db: Storage,
    /// Live control surface, or a disabled stand-in that refuses every call.
    pub obs: Arc<dyn ControlSurface>,
}

/// Debug logger scoped to one script.
#[derive(Debug, Clone)]
pub struct ScriptLogger {
    script: String,
}

impl ScriptLogger {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn log(&self, message: impl fmt::Display) {
        debug!(target: "scripts", script = %self.script, "{message}");
    }
}

#[async_trait]
pub trait Script: Send + Sync {
    async fn call(&self, params: Vec<Value>, ctx: ScriptContext) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> Script for F
where
    F: Fn(Vec<Value>, ScriptContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, params: Vec<Value>, ctx: ScriptContext) -> Result<Value> {
        (self)(params, ctx).await
    }
}

#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, script: impl Script + 'static) -> &mut Self {
        self.scripts.insert(name.into(), Arc::new(script));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Script>> {
        self.scripts.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registry built from a TOML manifest of external commands:
    ///
    /// ```toml
    /// [scripts.lower_third]
    /// command = "python3"
    /// args = ["control/scripts/lower_third.py"]
    /// ```
    pub fn from_manifest(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script manifest {}", path.display()))?;
        let manifest: ScriptManifest = toml::from_str(&raw)
            .with_context(|| format!("failed to parse script manifest {}", path.display()))?;

        let mut registry = Self::new();
        for (name, spec) in manifest.scripts {
            registry.register(name, CommandScript::new(spec));
        }
        Ok(registry)
    }

    /// Like [`ScriptRegistry::from_manifest`], but a missing or broken
    /// manifest yields an empty registry.
    pub fn load_or_empty(path: &Path) -> Self {
        if !path.exists() {
            debug!(manifest = %path.display(), "no script manifest; no scripts loaded");
            return Self::new();
        }
        match Self::from_manifest(path) {
            Ok(registry) => {
                info!(manifest = %path.display(), scripts = ?registry.names(), "scripts loaded");
                registry
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "scripts disabled");
                Self::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScriptManifest {
    #[serde(default)]
    scripts: BTreeMap<String, CommandSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// External program run once per call.
///
/// The params array is written to stdin as JSON. Stdout is the result: JSON
/// when it parses, otherwise a string; empty output is `null`. A non-zero
/// exit status fails the call with stderr in the error.
#[derive(Debug, Clone)]
pub struct CommandScript {
    spec: CommandSpec,
}

impl CommandScript {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Script for CommandScript {
    async fn call(&self, params: Vec<Value>, ctx: ScriptContext) -> Result<Value> {
        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }

        ctx.debug.log(format_args!("running {}", self.spec.command));
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", self.spec.command))?;

        // Fed from its own task so a child that writes before reading cannot
        // wedge against a full stdout pipe.
        let input = serde_json::to_vec(&params)?;
        let stdin = child.stdin.take();
        let feeder = tokio::spawn(async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&input).await {
                // Scripts that ignore their params may exit before reading stdin.
                Err(err) if err.kind() != ErrorKind::BrokenPipe => Err(err),
                _ => Ok(()),
            }
        });

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("failed to wait for {}", self.spec.command))?;
        feeder
            .await
            .context("script params writer panicked")?
            .context("failed to write script params")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.spec.command,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }
}

#[cfg(test)]
#[path = "tests/scripts_tests.rs"]
mod tests;
