//! Site record management
//!
//! [`SiteManager`] owns the canonical list of virtual hosts. Every mutation
//! writes exactly one log row inside the same transaction as the change.

use crate::db::{self, Database, LogEntry, Site, SiteInsert};
use crate::error::{Classify, ErrorCode};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const ACTION_SITE_ADDED: &str = "Site added";
pub const ACTION_STATUS_CHANGED: &str = "Site status changed";
pub const ACTION_SITE_REMOVED: &str = "Site removed";
pub const ACTION_ADD_ROLLED_BACK: &str = "Site add rolled back";

#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("invalid site: {0}")]
    InvalidInput(String),

    #[error("domain '{0}' already exists")]
    DuplicateDomain(String),

    #[error("site {0} not found")]
    NotFound(i64),

    #[error("site '{0}' is protected and cannot be removed")]
    ProtectedSite(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Classify for SiteError {
    fn code(&self) -> ErrorCode {
        match self {
            SiteError::InvalidInput(_) => ErrorCode::InvalidInput,
            SiteError::DuplicateDomain(_) => ErrorCode::DuplicateDomain,
            SiteError::NotFound(_) => ErrorCode::NotFound,
            SiteError::ProtectedSite(_) => ErrorCode::ProtectedSite,
            SiteError::Database(_) => ErrorCode::StorageError,
        }
    }
}

/// Request to create a site
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSite {
    pub name: String,
    pub domain: String,
    /// Defaults to `<sites_root>/<domain>`
    #[serde(default)]
    pub document_root: Option<String>,
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub ssl_enabled: bool,
}

impl NewSite {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }
}

pub struct SiteManager {
    db: Arc<Database>,
    protected: BTreeSet<String>,
    sites_root: PathBuf,
}

impl SiteManager {
    pub fn new(
        db: Arc<Database>,
        protected: impl IntoIterator<Item = String>,
        sites_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            protected: protected.into_iter().collect(),
            sites_root: sites_root.into(),
        }
    }

    pub fn is_protected(&self, domain: &str) -> bool {
        self.protected.contains(domain)
    }

    /// Document root a new site will get
    pub fn document_root_for(&self, new: &NewSite) -> String {
        match &new.document_root {
            Some(root) if !root.trim().is_empty() => root.trim().to_string(),
            _ => self.sites_root.join(&new.domain).to_string_lossy().into_owned(),
        }
    }

    pub fn add_site(&self, new: &NewSite) -> Result<Site, SiteError> {
        validate_new_site(new)?;
        let name = new.name.trim();
        let document_root = self.document_root_for(new);
        validate_document_root(&document_root)?;
        let database_name = new
            .database_name
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        if let Some(db_name) = database_name {
            validate_database_name(db_name)?;
        }

        let now = now();
        let site = self.db.transaction(|tx| {
            if db::find_site_by_domain(tx, &new.domain)?.is_some() {
                return Err(SiteError::DuplicateDomain(new.domain.clone()));
            }

            let insert = SiteInsert {
                name,
                domain: &new.domain,
                document_root: &document_root,
                database_name,
                ssl_enabled: new.ssl_enabled,
            };
            let site = db::insert_site(tx, &insert, &now).map_err(|e| {
                if db::is_unique_violation(&e) {
                    SiteError::DuplicateDomain(new.domain.clone())
                } else {
                    SiteError::Database(e)
                }
            })?;

            db::insert_log(
                tx,
                Some(site.id),
                ACTION_SITE_ADDED,
                &format!("Added site {} ({})", site.name, site.domain),
                &now,
            )?;
            Ok(site)
        })?;

        info!(id = site.id, domain = %site.domain, "Site added");
        Ok(site)
    }

    /// Flip a site between active and inactive
    pub fn toggle_status(&self, id: i64) -> Result<Site, SiteError> {
        let now = now();
        let site = self.db.transaction(|tx| {
            let site = db::find_site(tx, id)?.ok_or(SiteError::NotFound(id))?;
            let status = site.status.toggled();
            db::update_site_status(tx, id, status, &now)?;
            db::insert_log(
                tx,
                Some(id),
                ACTION_STATUS_CHANGED,
                &format!("Site {} changed from {} to {}", site.domain, site.status, status),
                &now,
            )?;
            db::find_site(tx, id)?.ok_or(SiteError::NotFound(id))
        })?;

        info!(id, domain = %site.domain, status = %site.status, "Site status changed");
        Ok(site)
    }

    /// Delete a site record; protected domains are refused
    pub fn remove_site(&self, id: i64) -> Result<Site, SiteError> {
        let now = now();
        let site = self.db.transaction(|tx| {
            let site = db::find_site(tx, id)?.ok_or(SiteError::NotFound(id))?;
            if self.is_protected(&site.domain) {
                return Err(SiteError::ProtectedSite(site.domain));
            }
            db::delete_site(tx, id)?;
            db::insert_log(
                tx,
                None,
                ACTION_SITE_REMOVED,
                &format!("Removed site {} ({}, id {})", site.name, site.domain, site.id),
                &now,
            )?;
            Ok(site)
        })?;

        info!(id, domain = %site.domain, "Site removed");
        Ok(site)
    }

    /// Undo a just-created record. Only used as a compensating action, so the
    /// protected-domain check does not apply.
    pub(crate) fn discard_site(&self, id: i64, reason: &str) -> Result<(), SiteError> {
        let now = now();
        self.db.transaction(|tx| {
            let site = db::find_site(tx, id)?.ok_or(SiteError::NotFound(id))?;
            db::delete_site(tx, id)?;
            db::insert_log(
                tx,
                None,
                ACTION_ADD_ROLLED_BACK,
                &format!("Rolled back site {} ({}): {}", site.name, site.domain, reason),
                &now,
            )?;
            Ok(())
        })
    }

    pub fn list_sites(&self) -> Result<Vec<Site>, SiteError> {
        Ok(self.db.read(db::list_sites)?)
    }

    pub fn get_site(&self, id: i64) -> Result<Site, SiteError> {
        self.db
            .read(|conn| db::find_site(conn, id))?
            .ok_or(SiteError::NotFound(id))
    }

    pub fn get_site_by_domain(&self, domain: &str) -> Result<Option<Site>, SiteError> {
        Ok(self.db.read(|conn| db::find_site_by_domain(conn, domain))?)
    }

    /// Record an action that is not a site mutation (e.g. config regeneration)
    pub fn log_action(
        &self,
        site_id: Option<i64>,
        action: &str,
        details: &str,
    ) -> Result<i64, SiteError> {
        let now = now();
        Ok(self.db.read(|conn| db::insert_log(conn, site_id, action, details, &now))?)
    }

    pub fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, SiteError> {
        Ok(self.db.read(|conn| db::recent_logs(conn, limit))?)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Check name and domain shape
pub fn validate_new_site(new: &NewSite) -> Result<(), SiteError> {
    if new.name.trim().is_empty() {
        return Err(SiteError::InvalidInput("name cannot be empty".to_string()));
    }
    if new.name.chars().any(char::is_control) {
        return Err(SiteError::InvalidInput("name cannot contain control characters".to_string()));
    }
    validate_domain(&new.domain)
}

/// A domain is dot-separated labels of ASCII letters, digits and hyphens,
/// with at least two labels and no label starting or ending with a hyphen.
pub fn validate_domain(domain: &str) -> Result<(), SiteError> {
    let invalid = |reason: &str| SiteError::InvalidInput(format!("domain '{}' {}", domain, reason));

    if domain.is_empty() {
        return Err(SiteError::InvalidInput("domain cannot be empty".to_string()));
    }
    if domain.len() > 253 {
        return Err(invalid("is longer than 253 characters"));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("needs at least two labels"));
    }
    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("has an empty or oversized label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("has a label starting or ending with '-'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("contains invalid characters"));
        }
    }
    Ok(())
}

/// Document roots are rendered into web-server config, so they must be
/// absolute and free of characters that could end a directive.
fn validate_document_root(root: &str) -> Result<(), SiteError> {
    if !Path::new(root).is_absolute() {
        return Err(SiteError::InvalidInput(format!(
            "document root '{}' must be an absolute path",
            root
        )));
    }
    let config_breaking = |c: char| matches!(c, ';' | '{' | '}' | '"' | '\'' | '#' | '$');
    if root.chars().any(|c| c.is_whitespace() || c.is_control() || config_breaking(c)) {
        return Err(SiteError::InvalidInput(format!(
            "document root '{}' contains characters not allowed in config",
            root
        )));
    }
    if root.split('/').any(|part| part == "..") {
        return Err(SiteError::InvalidInput(format!(
            "document root '{}' cannot contain '..'",
            root
        )));
    }
    Ok(())
}

fn validate_database_name(name: &str) -> Result<(), SiteError> {
    if name.len() <= 64 && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(SiteError::InvalidInput(format!(
            "database name '{}' may only contain letters, digits and '_'",
            name
        )))
    }
}
