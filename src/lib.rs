//! Hostgate - provisioning for a local web-hosting control panel
//!
//! This library keeps several loosely-coupled resources consistent:
//! - Site records and an action log in SQLite
//! - Loopback aliases for `.local` domains in the hosts file
//! - A marker-delimited virtual-host section in the web-server configuration
//! - Document roots on disk
//!
//! Shared files are edited under an exclusive lock with a verified backup taken
//! first. Maintenance scripts run only from a closed whitelist, and every
//! mutation is written to an append-only audit log.

pub mod admin;
pub mod audit;
pub mod backup;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod hosts;
pub mod lock;
pub mod provision;
pub mod sites;
pub mod vhost;
