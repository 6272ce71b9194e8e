//! Whitelisted execution of maintenance scripts
//!
//! The set of runnable scripts is fixed at startup in a [`ScriptRegistry`].
//! A request names a script, an action, and parameters; the action and the
//! parameters are handed to the executable as discrete argv entries, so no
//! shell ever sees them. Every attempt, including rejections, is audited.

use crate::audit::AuditLog;
use crate::config::ScriptConfig;
use crate::error::{Classify, ErrorCode};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// PATH handed to scripts; the rest of the environment is cleared
const SCRIPT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown script '{0}'")]
    UnknownScript(String),

    #[error("script '{script}' does not allow action '{action}'")]
    UnknownAction { script: String, action: String },

    #[error("action '{action}' of script '{script}' requires a parameter")]
    MissingParameter { script: String, action: String },

    #[error("parameter {index} contains a NUL byte")]
    InvalidParameter { index: usize },

    #[error("failed to start script '{script}': {source}")]
    SpawnFailed {
        script: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for script '{script}': {source}")]
    Wait {
        script: String,
        #[source]
        source: io::Error,
    },

    #[error("script '{script}' exited with {status}")]
    ScriptFailed {
        script: String,
        status: String,
        output: String,
    },

    #[error("script '{script}' timed out after {timeout:?}")]
    ScriptTimeout { script: String, timeout: Duration },
}

impl DispatchError {
    /// Output captured from a script that ran and failed
    pub fn output(&self) -> Option<&str> {
        match self {
            DispatchError::ScriptFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl Classify for DispatchError {
    fn code(&self) -> ErrorCode {
        match self {
            DispatchError::UnknownScript(_) => ErrorCode::UnknownScript,
            DispatchError::UnknownAction { .. } => ErrorCode::UnknownAction,
            DispatchError::MissingParameter { .. } => ErrorCode::MissingParameter,
            DispatchError::InvalidParameter { .. } => ErrorCode::InvalidInput,
            DispatchError::SpawnFailed { .. } => ErrorCode::SpawnFailed,
            DispatchError::Wait { .. } => ErrorCode::IoError,
            DispatchError::ScriptFailed { .. } => ErrorCode::ScriptFailed,
            DispatchError::ScriptTimeout { .. } => ErrorCode::ScriptTimeout,
        }
    }
}

/// A whitelisted script and the actions it accepts
#[derive(Debug, Clone, Serialize)]
pub struct ScriptDescriptor {
    pub name: String,
    pub executable: PathBuf,
    /// Empty means any action is accepted
    pub allowed_actions: BTreeSet<String>,
    pub actions_requiring_param: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ScriptDescriptor {
    fn from_config(name: &str, config: &ScriptConfig) -> Result<Self, String> {
        if name.is_empty() {
            return Err("script name cannot be empty".to_string());
        }
        if !config.path.is_absolute() {
            return Err(format!(
                "script '{}': path must be absolute, got '{}'",
                name,
                config.path.display()
            ));
        }

        let allowed_actions: BTreeSet<String> = config.actions.iter().cloned().collect();
        let actions_requiring_param: BTreeSet<String> =
            config.requires_param.iter().cloned().collect();

        if allowed_actions.iter().any(|a| a.is_empty()) {
            return Err(format!("script '{}': empty action name", name));
        }
        if !allowed_actions.is_empty() {
            if let Some(stray) = actions_requiring_param
                .iter()
                .find(|a| !allowed_actions.contains(*a))
            {
                return Err(format!(
                    "script '{}': requires_param lists '{}' which is not an allowed action",
                    name, stray
                ));
            }
        }

        Ok(Self {
            name: name.to_string(),
            executable: config.path.clone(),
            allowed_actions,
            actions_requiring_param,
            description: config.description.clone(),
        })
    }

    /// Whether the script declares a closed action set
    pub fn is_closed(&self) -> bool {
        !self.allowed_actions.is_empty()
    }

    pub fn allows(&self, action: &str) -> bool {
        !action.is_empty() && (!self.is_closed() || self.allowed_actions.contains(action))
    }

    pub fn requires_param(&self, action: &str) -> bool {
        self.actions_requiring_param.contains(action)
    }
}

/// Read-only registry of whitelisted scripts, built once at startup
#[derive(Debug, Clone, Default)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, ScriptDescriptor>,
}

impl ScriptRegistry {
    pub fn from_config(scripts: &HashMap<String, ScriptConfig>) -> Result<Self, String> {
        let mut registry = BTreeMap::new();
        let mut errors = Vec::new();

        for (name, config) in scripts {
            match ScriptDescriptor::from_config(name, config) {
                Ok(descriptor) => {
                    if !descriptor.executable.exists() {
                        warn!(
                            script = %name,
                            path = %descriptor.executable.display(),
                            "Script executable does not exist yet"
                        );
                    }
                    registry.insert(name.clone(), descriptor);
                }
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            errors.sort();
            return Err(errors.join("; "));
        }

        Ok(Self { scripts: registry })
    }

    pub fn get(&self, name: &str) -> Option<&ScriptDescriptor> {
        self.scripts.get(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ScriptDescriptor> {
        self.scripts.values()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Captured result of a script that exited successfully
#[derive(Debug, Clone, Serialize)]
pub struct ScriptOutput {
    pub script: String,
    pub action: String,
    pub exit_code: Option<i32>,
    /// Standard output followed by standard error
    pub output: String,
    pub duration_ms: u64,
}

/// Validates and runs whitelisted scripts
pub struct Dispatcher {
    registry: Arc<ScriptRegistry>,
    audit: Arc<AuditLog>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ScriptRegistry>, audit: Arc<AuditLog>, timeout: Duration) -> Self {
        Self {
            registry,
            audit,
            timeout,
        }
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    /// Run `script action params...` on behalf of `actor`
    pub async fn execute(
        &self,
        actor: &str,
        script: &str,
        action: &str,
        params: &[String],
    ) -> Result<ScriptOutput, DispatchError> {
        let description = describe(script, action, params);

        let descriptor = match self.validate(script, action, params) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(script, action, error = %e, "Script request rejected");
                self.audit(actor, &format!("{} -> rejected: {}", description, e));
                return Err(e);
            }
        };

        let result = self.run(descriptor, action, params).await;

        let outcome = match &result {
            Ok(out) => format!("ok (exit {}, {}ms)", exit_label(out.exit_code), out.duration_ms),
            Err(e) => format!("failed: {}", e),
        };
        self.audit(actor, &format!("{} -> {}", description, outcome));

        result
    }

    fn validate(
        &self,
        script: &str,
        action: &str,
        params: &[String],
    ) -> Result<&ScriptDescriptor, DispatchError> {
        let descriptor = self
            .registry
            .get(script)
            .ok_or_else(|| DispatchError::UnknownScript(script.to_string()))?;

        if !descriptor.allows(action) {
            return Err(DispatchError::UnknownAction {
                script: script.to_string(),
                action: action.to_string(),
            });
        }

        if descriptor.requires_param(action) && params.first().map_or(true, |p| p.is_empty()) {
            return Err(DispatchError::MissingParameter {
                script: script.to_string(),
                action: action.to_string(),
            });
        }

        if action.contains('\0') {
            return Err(DispatchError::UnknownAction {
                script: script.to_string(),
                action: action.replace('\0', "\\0"),
            });
        }
        if let Some(index) = params.iter().position(|p| p.contains('\0')) {
            return Err(DispatchError::InvalidParameter { index });
        }

        Ok(descriptor)
    }

    async fn run(
        &self,
        descriptor: &ScriptDescriptor,
        action: &str,
        params: &[String],
    ) -> Result<ScriptOutput, DispatchError> {
        let script = descriptor.name.clone();

        let mut cmd = Command::new(&descriptor.executable);
        cmd.arg(action)
            .args(params)
            .env_clear()
            .env("PATH", SCRIPT_PATH_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            script = %script,
            executable = %descriptor.executable.display(),
            action,
            "Spawning script"
        );

        let started = Instant::now();
        let child = cmd.spawn().map_err(|source| {
            error!(script = %script, error = %source, "Failed to spawn script");
            DispatchError::SpawnFailed {
                script: script.clone(),
                source,
            }
        })?;

        // Dropping the wait future on timeout kills the child (kill_on_drop)
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(DispatchError::Wait { script, source }),
            Err(_) => {
                warn!(
                    script = %script,
                    action,
                    timeout_secs = self.timeout.as_secs(),
                    "Script timed out and was killed"
                );
                return Err(DispatchError::ScriptTimeout {
                    script,
                    timeout: self.timeout,
                });
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            warn!(script = %script, action, status = %output.status, "Script reported failure");
            return Err(DispatchError::ScriptFailed {
                script,
                status: status_label(&output.status),
                output: combined,
            });
        }

        info!(script = %script, action, duration_ms, "Script completed");
        Ok(ScriptOutput {
            script,
            action: action.to_string(),
            exit_code: output.status.code(),
            output: combined,
            duration_ms,
        })
    }

    fn audit(&self, actor: &str, description: &str) {
        if let Err(e) = self.audit.record(actor, description) {
            error!(error = %e, description, "Failed to write audit entry");
        }
    }
}

/// Human-readable, shell-quoted rendering of a request for the audit trail
fn describe(script: &str, action: &str, params: &[String]) -> String {
    let mut words = Vec::with_capacity(params.len() + 2);
    words.push(script);
    words.push(action);
    words.extend(params.iter().map(String::as_str));
    format!("exec {}", shell_words::join(words))
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
}

fn status_label(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}
