//! Integration tests for Hostgate
#![cfg(unix)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hostgate::admin::AdminServer;
use hostgate::audit::AuditLog;
use hostgate::config::{AliasBackendKind, Config, ScriptConfig};
use hostgate::db::SiteStatus;
use hostgate::dispatch::{DispatchError, Dispatcher, ScriptRegistry};
use hostgate::error::{Classify, ErrorCode, ErrorKind};
use hostgate::hosts::HostsFile;
use hostgate::lock::LockedFile;
use hostgate::provision::{DirectoryStatus, ProvisionError, ProvisionState, Provisioner};
use hostgate::sites::{NewSite, SiteError, ACTION_ADD_ROLLED_BACK, ACTION_SITE_ADDED};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const HOSTS_SEED: &str = "127.0.0.1 localhost\n::1 localhost\n";
const VHOST_SEED: &str = "# BEGIN hostgate vhosts\n# END hostgate vhosts\n";

/// Config with every managed path inside `root`
fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.paths.database = root.join("data/hostgate.db");
    config.paths.hosts_file = root.join("hosts");
    config.paths.hosts_backup_dir = root.join("backups/hosts");
    config.paths.vhost_config = root.join("vhosts.conf");
    config.paths.vhost_backup_dir = root.join("backups/vhost");
    config.paths.sites_root = root.join("www");
    config.paths.audit_log = root.join("audit.log");
    config.paths.ssl_dir = root.join("ssl");

    std::fs::write(&config.paths.hosts_file, HOSTS_SEED).unwrap();
    std::fs::write(&config.paths.vhost_config, VHOST_SEED).unwrap();
    config
}

/// Write an executable `/bin/sh` script
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn script(path: PathBuf, actions: &[&str], requires: &[&str]) -> ScriptConfig {
    ScriptConfig {
        path,
        actions: actions.iter().map(|a| a.to_string()).collect(),
        requires_param: requires.iter().map(|a| a.to_string()).collect(),
        description: None,
    }
}

fn hosts_lines_for(hosts: &str, domain: &str) -> usize {
    hosts
        .lines()
        .filter(|line| line.split_whitespace().skip(1).any(|t| t == domain))
        .count()
}

fn audit_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn backup_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_add_local_site_scenario() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let provisioned = provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap();

    assert_eq!(provisioned.site.domain, "demo.local");
    assert_eq!(provisioned.site.status, SiteStatus::Active);
    assert!(provisioned.alias_added);
    assert_eq!(provisioned.directory, DirectoryStatus::Created);
    assert_eq!(provisioned.state, ProvisionState::Committed);

    let hosts = std::fs::read_to_string(&config.paths.hosts_file).unwrap();
    assert!(hosts.starts_with(HOSTS_SEED));
    assert_eq!(hosts_lines_for(&hosts, "demo.local"), 1);
    assert!(hosts.lines().any(|l| l == "127.0.0.1 demo.local"));
    assert_eq!(backup_count(&config.paths.hosts_backup_dir), 1);

    let root = tmp.path().join("www/demo.local");
    assert_eq!(provisioned.site.document_root, root.to_string_lossy());
    assert!(root.join("index.html").is_file());

    let logs = provisioner.recent_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, ACTION_SITE_ADDED);
    assert_eq!(logs[0].site_id, Some(provisioned.site.id));

    let audit = audit_lines(&config.paths.audit_log);
    assert_eq!(audit.len(), 1);
    assert!(audit[0].contains("[alice] add virtual host demo.local"));
}

#[tokio::test]
async fn test_non_local_domain_skips_alias() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let provisioned = provisioner
        .add_virtual_host("alice", &NewSite::new("Shop", "shop.example.com"))
        .await
        .unwrap();

    assert!(!provisioned.alias_added);
    let hosts = std::fs::read_to_string(&config.paths.hosts_file).unwrap();
    assert_eq!(hosts, HOSTS_SEED);
    assert_eq!(backup_count(&config.paths.hosts_backup_dir), 0);
}

#[tokio::test]
async fn test_add_then_remove_leaves_no_record_or_alias() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let provisioned = provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap();
    let removed = provisioner
        .remove_virtual_host("alice", provisioned.site.id)
        .await
        .unwrap();

    assert!(removed.alias_removed);
    assert!(provisioner.list_sites().unwrap().is_empty());

    let hosts = std::fs::read_to_string(&config.paths.hosts_file).unwrap();
    assert_eq!(hosts_lines_for(&hosts, "demo.local"), 0);
    assert!(hosts.contains("localhost"));

    // Content directories are never deleted
    assert!(tmp.path().join("www/demo.local/index.html").is_file());
}

#[tokio::test]
async fn test_duplicate_domain_is_conflict() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap();
    let err = provisioner
        .add_virtual_host("bob", &NewSite::new("Other", "demo.local"))
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Site(SiteError::DuplicateDomain(_))));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(provisioner.list_sites().unwrap().len(), 1);
    let hosts = std::fs::read_to_string(&config.paths.hosts_file).unwrap();
    assert_eq!(hosts_lines_for(&hosts, "demo.local"), 1);
}

#[tokio::test]
async fn test_invalid_domain_touches_nothing() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let err = provisioner
        .add_virtual_host("alice", &NewSite::new("Bad", "bad domain.local"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidInput);
    assert!(provisioner.list_sites().unwrap().is_empty());
    assert_eq!(std::fs::read_to_string(&config.paths.hosts_file).unwrap(), HOSTS_SEED);
}

#[tokio::test]
async fn test_protected_site_cannot_be_removed() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let dashboard = provisioner
        .add_virtual_host("alice", &NewSite::new("Dashboard", "dashboard.local"))
        .await
        .unwrap();
    let hosts_before = std::fs::read_to_string(&config.paths.hosts_file).unwrap();

    let err = provisioner
        .remove_virtual_host("alice", dashboard.site.id)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Site(SiteError::ProtectedSite(_))));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(provisioner.list_sites().unwrap().len(), 1);
    assert_eq!(
        std::fs::read_to_string(&config.paths.hosts_file).unwrap(),
        hosts_before
    );
}

#[tokio::test]
async fn test_remove_unknown_site_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let err = provisioner.remove_virtual_host("alice", 42).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_toggle_and_regenerate() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let demo = provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap();
    provisioner
        .add_virtual_host("alice", &NewSite::new("Blog", "blog.local"))
        .await
        .unwrap();

    let toggled = provisioner.toggle_status("alice", demo.site.id).unwrap();
    assert_eq!(toggled.status, SiteStatus::Inactive);

    let result = provisioner.regenerate_config("alice").await.unwrap();
    assert_eq!(result.active_sites, 1);
    assert!(result.changed);

    let conf = std::fs::read_to_string(&config.paths.vhost_config).unwrap();
    assert!(conf.contains("server_name blog.local;"));
    assert!(!conf.contains("server_name demo.local;"));

    let first = conf.clone();
    let again = provisioner.regenerate_config("alice").await.unwrap();
    assert!(!again.changed);
    assert_eq!(std::fs::read_to_string(&config.paths.vhost_config).unwrap(), first);
}

#[test]
fn test_concurrent_alias_adds_keep_both_lines() {
    let tmp = TempDir::new().unwrap();
    let hosts_path = tmp.path().join("hosts");
    let backup_dir = tmp.path().join("backups");
    std::fs::write(&hosts_path, HOSTS_SEED).unwrap();

    let hosts = Arc::new(HostsFile::new(
        &hosts_path,
        &backup_dir,
        "127.0.0.1",
        ".local",
        Duration::from_secs(5),
    ));

    let handles: Vec<_> = ["a.local", "b.local"]
        .into_iter()
        .map(|domain| {
            let hosts = Arc::clone(&hosts);
            std::thread::spawn(move || hosts.add_alias(domain).unwrap())
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap().is_changed());
    }

    let contents = std::fs::read_to_string(&hosts_path).unwrap();
    assert_eq!(hosts_lines_for(&contents, "a.local"), 1);
    assert_eq!(hosts_lines_for(&contents, "b.local"), 1);
    assert_eq!(backup_count(&backup_dir), 2);
}

fn dispatcher(
    tmp: &TempDir,
    scripts: HashMap<String, ScriptConfig>,
    timeout: Duration,
) -> (Dispatcher, PathBuf) {
    let audit_path = tmp.path().join("audit.log");
    let audit = Arc::new(AuditLog::open(&audit_path).unwrap());
    let registry = Arc::new(ScriptRegistry::from_config(&scripts).unwrap());
    (Dispatcher::new(registry, audit, timeout), audit_path)
}

#[tokio::test]
async fn test_script_success_captures_output() {
    let tmp = TempDir::new().unwrap();
    let path = write_script(tmp.path(), "greet.sh", r#"echo "action=$1 param=$2""#);
    let scripts = HashMap::from([("greet".to_string(), script(path, &["hello"], &["hello"]))]);
    let (dispatcher, audit_path) = dispatcher(&tmp, scripts, Duration::from_secs(10));

    let output = dispatcher
        .execute("alice", "greet", "hello", &["world; rm -rf /".to_string()])
        .await
        .unwrap();

    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.output, "action=hello param=world; rm -rf /\n");

    let audit = audit_lines(&audit_path);
    assert_eq!(audit.len(), 1);
    assert!(audit[0].contains("[alice] exec greet hello 'world; rm -rf /' -> ok"));
}

#[tokio::test]
async fn test_script_nonzero_exit_is_process_error() {
    let tmp = TempDir::new().unwrap();
    let path = write_script(tmp.path(), "fail.sh", "echo partial\necho broken >&2\nexit 3");
    let scripts = HashMap::from([("fail".to_string(), script(path, &[], &[]))]);
    let (dispatcher, audit_path) = dispatcher(&tmp, scripts, Duration::from_secs(10));

    let err = dispatcher.execute("alice", "fail", "run", &[]).await.unwrap_err();

    match &err {
        DispatchError::ScriptFailed { status, output, .. } => {
            assert_eq!(status, "exit code 3");
            assert_eq!(output, "partial\nbroken\n");
        }
        other => panic!("expected ScriptFailed, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Process);

    let audit = audit_lines(&audit_path);
    assert_eq!(audit.len(), 1);
    assert!(audit[0].contains("-> failed:"));
}

#[tokio::test]
async fn test_script_timeout_kills_process() {
    let tmp = TempDir::new().unwrap();
    let path = write_script(tmp.path(), "slow.sh", "exec sleep 10");
    let scripts = HashMap::from([("slow".to_string(), script(path, &[], &[]))]);
    let (dispatcher, _) = dispatcher(&tmp, scripts, Duration::from_millis(200));

    let started = std::time::Instant::now();
    let err = dispatcher.execute("alice", "slow", "run", &[]).await.unwrap_err();

    assert!(matches!(err, DispatchError::ScriptTimeout { .. }));
    assert_eq!(err.code(), ErrorCode::ScriptTimeout);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_unknown_script_is_rejected_and_audited() {
    let tmp = TempDir::new().unwrap();
    let (dispatcher, audit_path) = dispatcher(&tmp, HashMap::new(), Duration::from_secs(10));

    let err = dispatcher
        .execute("alice", "unknown-script", "status", &[])
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::UnknownScript(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let audit = audit_lines(&audit_path);
    assert_eq!(audit.len(), 1);
    assert!(audit[0].contains("exec unknown-script status -> rejected"));
}

/// Alias script keeping its aliases in `state`, one domain per line
fn alias_script_config(tmp: &TempDir, add_exit: i32) -> Config {
    let mut config = test_config(tmp.path());
    let state = tmp.path().join("aliases.state");
    let body = format!(
        r#"STATE="{state}"
case "$1" in
  add) echo "$2" >> "$STATE"; exit {add_exit} ;;
  remove) grep -v -x "$2" "$STATE" > "$STATE.tmp"; mv "$STATE.tmp" "$STATE" ;;
  list) cat "$STATE" 2>/dev/null; echo "not-a-local-name" ;;
esac"#,
        state = state.display(),
        add_exit = add_exit,
    );
    let path = write_script(tmp.path(), "aliases.sh", &body);

    config.scripts.insert(
        "aliases".to_string(),
        script(path, &["add", "remove", "list"], &["add", "remove"]),
    );
    config.sites.alias_backend = AliasBackendKind::Script;
    config.sites.alias_script = Some("aliases".to_string());
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn test_script_alias_backend() {
    let tmp = TempDir::new().unwrap();
    let config = alias_script_config(&tmp, 0);
    let provisioner = Provisioner::from_config(&config).unwrap();

    let provisioned = provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap();
    assert!(provisioned.alias_added);

    // The hosts file is left to the script
    assert_eq!(std::fs::read_to_string(&config.paths.hosts_file).unwrap(), HOSTS_SEED);
    assert_eq!(provisioner.list_aliases("alice").await.unwrap(), vec!["demo.local"]);

    provisioner
        .remove_virtual_host("alice", provisioned.site.id)
        .await
        .unwrap();
    assert!(provisioner.list_aliases("alice").await.unwrap().is_empty());

    let err = provisioner.alias_backups().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unsupported);
}

#[tokio::test]
async fn test_alias_failure_rolls_back_record() {
    let tmp = TempDir::new().unwrap();
    let config = alias_script_config(&tmp, 1);
    let provisioner = Provisioner::from_config(&config).unwrap();

    let err = provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ScriptFailed);
    assert!(provisioner.list_sites().unwrap().is_empty());
    assert!(!tmp.path().join("www/demo.local").exists());

    let logs = provisioner.recent_logs(10).unwrap();
    assert_eq!(logs[0].action, ACTION_ADD_ROLLED_BACK);

    let audit = std::fs::read_to_string(&config.paths.audit_log).unwrap();
    assert!(audit.contains("provisioning failed"));
    assert!(audit.contains("rolled back"));
}

#[tokio::test]
async fn test_failed_record_delete_restores_alias() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let provisioned = provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap();

    // Make the record delete fail after the alias is already gone
    let conn = rusqlite::Connection::open(&config.paths.database).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER keep_sites BEFORE DELETE ON sites
         BEGIN SELECT RAISE(ABORT, 'sites are read-only'); END;",
    )
    .unwrap();
    drop(conn);

    let err = provisioner
        .remove_virtual_host("alice", provisioned.site.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Site(_)));
    assert_eq!(err.code(), ErrorCode::StorageError);

    let hosts = std::fs::read_to_string(&config.paths.hosts_file).unwrap();
    assert_eq!(hosts_lines_for(&hosts, "demo.local"), 1);
    assert_eq!(provisioner.list_sites().unwrap().len(), 1);
    assert_eq!(provisioner.list_aliases("alice").await.unwrap(), vec!["demo.local"]);

    let audit = audit_lines(&config.paths.audit_log);
    let last = audit.last().unwrap();
    assert!(last.contains("provisioning failed"));
    assert!(last.ends_with("rolled back"));
}

#[tokio::test]
async fn test_alias_lock_wait_does_not_stall_runtime() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    let hosts_path = config.paths.hosts_file.clone();
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let holder = std::thread::spawn(move || {
        let _lock = LockedFile::acquire(&hosts_path, Duration::from_secs(1)).unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(300));
    });
    locked_rx.recv().unwrap();

    // The timer on the same runtime thread must fire while the add waits for the lock
    let started = std::time::Instant::now();
    let site = NewSite::new("Demo", "demo.local");
    let (provisioned, ticked) = tokio::join!(
        provisioner.add_virtual_host("alice", &site),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            started.elapsed()
        }
    );
    holder.join().unwrap();

    assert!(provisioned.unwrap().alias_added);
    assert!(ticked < Duration::from_millis(250), "timer delayed {:?}", ticked);
}

#[tokio::test]
async fn test_alias_round_trip_keeps_foreign_bytes() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let seed: &[u8] = b"127.0.0.1\tlocalhost\r\n# caf\xe9 entries\r\n::1 localhost\r\n";
    std::fs::write(&config.paths.hosts_file, seed).unwrap();
    let provisioner = Provisioner::from_config(&config).unwrap();

    let provisioned = provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap();
    let added = std::fs::read(&config.paths.hosts_file).unwrap();
    assert_eq!(added, [seed, &b"127.0.0.1 demo.local\r\n"[..]].concat());

    provisioner
        .remove_virtual_host("alice", provisioned.site.id)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&config.paths.hosts_file).unwrap(), seed);
}

#[tokio::test]
async fn test_restore_alias_backup() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Provisioner::from_config(&config).unwrap();

    provisioner
        .add_virtual_host("alice", &NewSite::new("Demo", "demo.local"))
        .await
        .unwrap();

    // The first backup holds the file as it was before demo.local
    let backups = provisioner.alias_backups().unwrap();
    assert_eq!(backups.len(), 1);
    provisioner
        .restore_aliases("alice", &backups[0].path)
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&config.paths.hosts_file).unwrap(), HOSTS_SEED);
    assert_eq!(provisioner.alias_backups().unwrap().len(), 2);

    let err = provisioner
        .restore_aliases("alice", &tmp.path().join("hosts"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BackupNotFound);
}

/// Get a free local port
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP request and return the raw response
async fn http_request(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn test_admin_server_over_tcp() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provisioner = Arc::new(Provisioner::from_config(&config).unwrap());

    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = AdminServer::new(addr, provisioner, shutdown_rx, "secret".to_string());
    let handle = tokio::spawn(server.run());

    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let health = http_request(
        port,
        "GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#""success":true"#));

    let body = r#"{"name":"Demo","domain":"demo.local"}"#;
    let created = http_request(
        port,
        &format!(
            "POST /sites HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer secret\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            body.len(),
            body
        ),
    )
    .await;
    assert!(created.starts_with("HTTP/1.1 201"));

    let denied = http_request(
        port,
        "GET /sites HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(denied.starts_with("HTTP/1.1 401"));
    assert!(denied.contains("x-hostgate-error: UNAUTHORIZED"));

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}
