//! Provisioning orchestrator
//!
//! Site records, hosts aliases and content directories live in independent
//! resources with no shared transaction. Each request therefore runs as a
//! saga: completed steps push a compensation, and a failure runs the
//! compensations in reverse before the error is returned.

use crate::audit::AuditLog;
use crate::backup::Backup;
use crate::config::{AliasBackendKind, Config};
use crate::db::{Database, LogEntry, Site};
use crate::dispatch::{DispatchError, Dispatcher, ScriptOutput, ScriptRegistry};
use crate::error::{Classify, ErrorCode};
use crate::hosts::{is_local_domain, HostsError, HostsFile};
use crate::sites::{self, NewSite, SiteError, SiteManager};
use crate::vhost::{Regenerated, VhostConfig, VhostError};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const ACTION_CONFIG_REGENERATED: &str = "Config regenerated";

/// Starter page written into empty document roots
const DEFAULT_INDEX_HTML: &str = "<!DOCTYPE html>
<html>
<head><title>{domain}</title></head>
<body><h1>{domain}</h1><p>Site provisioned.</p></body>
</html>
";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Site(#[from] SiteError),

    #[error(transparent)]
    Hosts(#[from] HostsError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Vhost(#[from] VhostError),

    #[error("{0} is not supported by the configured alias backend")]
    Unsupported(&'static str),

    #[error("file task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{source}; rollback incomplete: {}", .failures.join("; "))]
    RollbackIncomplete {
        #[source]
        source: Box<ProvisionError>,
        failures: Vec<String>,
    },
}

impl Classify for ProvisionError {
    fn code(&self) -> ErrorCode {
        match self {
            ProvisionError::Site(e) => e.code(),
            ProvisionError::Hosts(e) => e.code(),
            ProvisionError::Dispatch(e) => e.code(),
            ProvisionError::Vhost(e) => e.code(),
            ProvisionError::Unsupported(_) => ErrorCode::Unsupported,
            ProvisionError::Task(_) => ErrorCode::IoError,
            ProvisionError::RollbackIncomplete { .. } => ErrorCode::RollbackIncomplete,
        }
    }
}

impl ProvisionError {
    /// Script output carried by the error, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            ProvisionError::Dispatch(e) => e.output(),
            ProvisionError::RollbackIncomplete { source, .. } => source.output(),
            _ => None,
        }
    }
}

/// Where alias edits go
pub enum AliasBackend {
    /// Edit the hosts file in-process
    File(HostsFile),
    /// Delegate to a whitelisted script taking `add|remove|list [domain]`
    Script {
        dispatcher: Arc<Dispatcher>,
        script: String,
    },
}

impl AliasBackend {
    async fn add(&self, actor: &str, domain: &str) -> Result<bool, ProvisionError> {
        match self {
            AliasBackend::File(hosts) => {
                let hosts = hosts.clone();
                let domain = domain.to_string();
                let change = tokio::task::spawn_blocking(move || hosts.add_alias(&domain)).await??;
                Ok(change.is_changed())
            }
            AliasBackend::Script { dispatcher, script } => {
                dispatcher
                    .execute(actor, script, "add", &[domain.to_string()])
                    .await?;
                Ok(true)
            }
        }
    }

    async fn remove(&self, actor: &str, domain: &str) -> Result<bool, ProvisionError> {
        match self {
            AliasBackend::File(hosts) => {
                let hosts = hosts.clone();
                let domain = domain.to_string();
                let change =
                    tokio::task::spawn_blocking(move || hosts.remove_alias(&domain)).await??;
                Ok(change.is_changed())
            }
            AliasBackend::Script { dispatcher, script } => {
                dispatcher
                    .execute(actor, script, "remove", &[domain.to_string()])
                    .await?;
                Ok(true)
            }
        }
    }
}

/// Per-request saga state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Validating,
    RecordCreated,
    AliasUpdated,
    DirectoryReady,
    Committed,
    RollingBack,
}

/// What happened to the site's content directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum DirectoryStatus {
    Created,
    AlreadyExisted,
    /// Non-fatal; the directory can be created by hand
    Failed(String),
}

/// Successful result of adding a virtual host
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub site: Site,
    /// Whether an alias line was written by this request
    pub alias_added: bool,
    pub directory: DirectoryStatus,
    pub state: ProvisionState,
}

/// Successful result of removing a virtual host
#[derive(Debug, Clone, Serialize)]
pub struct Deprovisioned {
    pub site: Site,
    pub alias_removed: bool,
    pub state: ProvisionState,
}

enum Compensation {
    DiscardRecord(i64),
    RestoreAlias(String),
}

struct Saga<'a> {
    provisioner: &'a Provisioner,
    actor: &'a str,
    state: ProvisionState,
    compensations: Vec<Compensation>,
}

impl<'a> Saga<'a> {
    fn new(provisioner: &'a Provisioner, actor: &'a str) -> Self {
        Self {
            provisioner,
            actor,
            state: ProvisionState::Validating,
            compensations: Vec::new(),
        }
    }

    fn advance(&mut self, state: ProvisionState) {
        debug!(from = ?self.state, to = ?state, "Provisioning state change");
        self.state = state;
    }

    fn push(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    /// Run compensations newest first and hand back the error to return
    async fn fail(mut self, cause: ProvisionError) -> ProvisionError {
        if self.compensations.is_empty() {
            return cause;
        }

        self.advance(ProvisionState::RollingBack);
        warn!(
            error = %cause,
            steps = self.compensations.len(),
            "Rolling back provisioning request"
        );

        let reason = cause.to_string();
        let mut failures = Vec::new();
        while let Some(compensation) = self.compensations.pop() {
            let result = match &compensation {
                Compensation::DiscardRecord(id) => self
                    .provisioner
                    .sites
                    .discard_site(*id, &reason)
                    .map_err(ProvisionError::from),
                Compensation::RestoreAlias(domain) => self
                    .provisioner
                    .aliases
                    .add(self.actor, domain)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                error!(error = %e, "Compensating action failed");
                failures.push(e.to_string());
            }
        }

        let outcome = if failures.is_empty() {
            "rolled back".to_string()
        } else {
            format!("rollback incomplete ({})", failures.join("; "))
        };
        self.provisioner
            .audit(self.actor, &format!("provisioning failed: {}; {}", reason, outcome));

        if failures.is_empty() {
            cause
        } else {
            ProvisionError::RollbackIncomplete {
                source: Box::new(cause),
                failures,
            }
        }
    }
}

/// Caller-facing entry point tying sites, aliases, directories, config and scripts together
pub struct Provisioner {
    sites: SiteManager,
    aliases: AliasBackend,
    vhost: VhostConfig,
    dispatcher: Arc<Dispatcher>,
    audit: Arc<AuditLog>,
    local_suffix: String,
}

impl Provisioner {
    pub fn new(
        sites: SiteManager,
        aliases: AliasBackend,
        vhost: VhostConfig,
        dispatcher: Arc<Dispatcher>,
        audit: Arc<AuditLog>,
        local_suffix: impl Into<String>,
    ) -> Self {
        Self {
            sites,
            aliases,
            vhost,
            dispatcher,
            audit,
            local_suffix: local_suffix.into(),
        }
    }

    /// Open the database and audit log and wire every component from `config`
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let paths = &config.paths;
        let lock_timeout = config.locks.timeout();

        let db = Arc::new(Database::open(&paths.database)?);
        let audit = Arc::new(AuditLog::open(&paths.audit_log).with_context(|| {
            format!("Failed to open audit log {}", paths.audit_log.display())
        })?);

        let registry = ScriptRegistry::from_config(&config.scripts).map_err(anyhow::Error::msg)?;
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            Arc::clone(&audit),
            config.dispatch.timeout(),
        ));

        let aliases = match config.sites.alias_backend {
            AliasBackendKind::File => AliasBackend::File(HostsFile::new(
                &paths.hosts_file,
                &paths.hosts_backup_dir,
                &config.sites.loopback_address,
                &config.sites.local_suffix,
                lock_timeout,
            )),
            AliasBackendKind::Script => AliasBackend::Script {
                dispatcher: Arc::clone(&dispatcher),
                script: config
                    .sites
                    .alias_script
                    .clone()
                    .context("sites.alias_script is required for the script alias backend")?,
            },
        };

        let sites = SiteManager::new(
            db,
            config.sites.protected_domains.iter().cloned(),
            &paths.sites_root,
        );
        let vhost = VhostConfig::new(
            &paths.vhost_config,
            &paths.vhost_backup_dir,
            &paths.ssl_dir,
            config.vhost.clone(),
            lock_timeout,
        );

        Ok(Self::new(
            sites,
            aliases,
            vhost,
            dispatcher,
            audit,
            config.sites.local_suffix.clone(),
        ))
    }

    pub fn is_local(&self, domain: &str) -> bool {
        is_local_domain(domain, &self.local_suffix)
    }

    /// Create the record, the alias for local domains, and the content directory
    pub async fn add_virtual_host(
        &self,
        actor: &str,
        new: &NewSite,
    ) -> Result<Provisioned, ProvisionError> {
        let mut saga = Saga::new(self, actor);

        sites::validate_new_site(new)?;

        let site = self.sites.add_site(new)?;
        saga.push(Compensation::DiscardRecord(site.id));
        saga.advance(ProvisionState::RecordCreated);

        let mut alias_added = false;
        if self.is_local(&site.domain) {
            match self.aliases.add(actor, &site.domain).await {
                Ok(changed) => alias_added = changed,
                Err(e) => return Err(saga.fail(e).await),
            }
        }
        saga.advance(ProvisionState::AliasUpdated);

        let directory = ensure_document_root(Path::new(&site.document_root), &site.domain);
        if let DirectoryStatus::Failed(reason) = &directory {
            warn!(
                domain = %site.domain,
                path = %site.document_root,
                reason = %reason,
                "Content directory not created"
            );
        }
        saga.advance(ProvisionState::DirectoryReady);

        self.audit(
            actor,
            &format!(
                "add virtual host {} (id {}, alias {}, directory {:?})",
                site.domain,
                site.id,
                if alias_added { "added" } else { "unchanged" },
                directory
            ),
        );
        saga.advance(ProvisionState::Committed);

        info!(id = site.id, domain = %site.domain, alias_added, "Virtual host provisioned");
        Ok(Provisioned {
            site,
            alias_added,
            directory,
            state: saga.state,
        })
    }

    /// Remove the alias and the record. Content directories are left in place.
    pub async fn remove_virtual_host(
        &self,
        actor: &str,
        id: i64,
    ) -> Result<Deprovisioned, ProvisionError> {
        let mut saga = Saga::new(self, actor);

        let site = self.sites.get_site(id)?;
        if self.sites.is_protected(&site.domain) {
            debug!(id, domain = %site.domain, "Refusing to remove protected site");
            return Err(SiteError::ProtectedSite(site.domain).into());
        }

        let mut alias_removed = false;
        if self.is_local(&site.domain) {
            alias_removed = self.aliases.remove(actor, &site.domain).await?;
            if alias_removed {
                saga.push(Compensation::RestoreAlias(site.domain.clone()));
            }
        }
        saga.advance(ProvisionState::AliasUpdated);

        let removed = match self.sites.remove_site(id) {
            Ok(site) => site,
            Err(e) => return Err(saga.fail(e.into()).await),
        };
        saga.advance(ProvisionState::Committed);

        self.audit(
            actor,
            &format!(
                "remove virtual host {} (id {}, alias {}, directory {} kept)",
                removed.domain,
                removed.id,
                if alias_removed { "removed" } else { "unchanged" },
                removed.document_root
            ),
        );

        info!(id, domain = %removed.domain, alias_removed, "Virtual host removed");
        Ok(Deprovisioned {
            site: removed,
            alias_removed,
            state: saga.state,
        })
    }

    pub fn toggle_status(&self, actor: &str, id: i64) -> Result<Site, ProvisionError> {
        let site = self.sites.toggle_status(id)?;
        self.audit(
            actor,
            &format!("toggle virtual host {} (id {}) to {}", site.domain, site.id, site.status),
        );
        Ok(site)
    }

    pub fn list_sites(&self) -> Result<Vec<Site>, ProvisionError> {
        Ok(self.sites.list_sites()?)
    }

    pub fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, ProvisionError> {
        Ok(self.sites.recent_logs(limit)?)
    }

    /// Rebuild the web-server section from the current active sites
    pub async fn regenerate_config(&self, actor: &str) -> Result<Regenerated, ProvisionError> {
        let sites = self.sites.list_sites()?;
        let vhost = self.vhost.clone();
        let result = tokio::task::spawn_blocking(move || vhost.regenerate(&sites)).await??;

        let details = format!(
            "{} active sites written to {} (backup {})",
            result.active_sites,
            self.vhost.path().display(),
            result.backup.display()
        );
        if let Err(e) = self.sites.log_action(None, ACTION_CONFIG_REGENERATED, &details) {
            // The file is already written; report the bookkeeping failure without failing the call
            error!(error = %e, "Failed to log config regeneration");
        }
        self.audit(actor, &format!("regenerate virtual-host config: {}", details));

        Ok(result)
    }

    /// The file as `regenerate_config` would write it, without writing
    pub fn preview_config(&self) -> Result<String, ProvisionError> {
        let sites = self.sites.list_sites()?;
        Ok(self.vhost.preview(&sites)?)
    }

    /// Run a whitelisted maintenance script
    pub async fn execute(
        &self,
        actor: &str,
        script: &str,
        action: &str,
        params: &[String],
    ) -> Result<ScriptOutput, ProvisionError> {
        Ok(self.dispatcher.execute(actor, script, action, params).await?)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Local aliases currently mapped to the loopback address
    pub async fn list_aliases(&self, actor: &str) -> Result<Vec<String>, ProvisionError> {
        match &self.aliases {
            AliasBackend::File(hosts) => Ok(hosts.list_aliases()?),
            AliasBackend::Script { dispatcher, script } => {
                let output = dispatcher.execute(actor, script, "list", &[]).await?;
                let mut aliases: Vec<String> = Vec::new();
                for token in output.output.split_whitespace() {
                    if self.is_local(token) && !aliases.iter().any(|a| a == token) {
                        aliases.push(token.to_string());
                    }
                }
                Ok(aliases)
            }
        }
    }

    pub fn alias_backups(&self) -> Result<Vec<Backup>, ProvisionError> {
        match &self.aliases {
            AliasBackend::File(hosts) => Ok(hosts.list_backups()?),
            AliasBackend::Script { .. } => {
                Err(ProvisionError::Unsupported("listing alias backups"))
            }
        }
    }

    pub async fn restore_aliases(
        &self,
        actor: &str,
        backup: &Path,
    ) -> Result<PathBuf, ProvisionError> {
        let AliasBackend::File(hosts) = &self.aliases else {
            return Err(ProvisionError::Unsupported("restoring alias backups"));
        };

        let file = hosts.clone();
        let requested = backup.to_path_buf();
        let change = tokio::task::spawn_blocking(move || file.restore(&requested)).await??;
        self.audit(
            actor,
            &format!("restore {} from {}", hosts.path().display(), backup.display()),
        );
        match change {
            crate::hosts::AliasChange::Changed { backup } => Ok(backup),
            crate::hosts::AliasChange::Unchanged => Ok(backup.to_path_buf()),
        }
    }

    fn audit(&self, actor: &str, description: &str) {
        if let Err(e) = self.audit.record(actor, description) {
            error!(error = %e, description, "Failed to write audit entry");
        }
    }
}

/// Create the document root and a starter page if the directory is empty
fn ensure_document_root(path: &Path, domain: &str) -> DirectoryStatus {
    let existed = path.is_dir();
    if let Err(e) = std::fs::create_dir_all(path) {
        return DirectoryStatus::Failed(format!("{}: {}", path.display(), e));
    }

    let is_empty = match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => return DirectoryStatus::Failed(format!("{}: {}", path.display(), e)),
    };
    if is_empty {
        let index = path.join("index.html");
        if let Err(e) = std::fs::write(&index, DEFAULT_INDEX_HTML.replace("{domain}", domain)) {
            return DirectoryStatus::Failed(format!("{}: {}", index.display(), e));
        }
    }

    if existed {
        DirectoryStatus::AlreadyExisted
    } else {
        DirectoryStatus::Created
    }
}
