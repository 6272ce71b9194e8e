//! JSON admin API over the provisioner

use crate::error::{json_error_response, Classify, ErrorCode, ErrorResponse};
use crate::provision::{ProvisionError, Provisioner};
use crate::sites::NewSite;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header naming the operator on whose behalf a request runs
pub const ACTOR_HEADER: &str = "x-actor";
const DEFAULT_ACTOR: &str = "admin";

const MAX_BODY_BYTES: usize = 64 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Wrap `data` in the success envelope
fn success<T: Serialize>(status: StatusCode, data: &T) -> Response<Full<Bytes>> {
    let envelope = serde_json::json!({
        "success": true,
        "data": data,
        "error": null,
    });
    json_response(status, envelope.to_string())
}

fn failure(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_error_response(ErrorResponse::new(code, message))
}

fn provision_failure(err: ProvisionError) -> Response<Full<Bytes>> {
    let mut body = ErrorResponse::new(err.code(), err.to_string());
    if let Some(output) = err.output() {
        body = body.with_output(output);
    }
    json_error_response(body)
}

/// Request body for `POST /exec`
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub script: String,
    pub action: String,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Request body for `POST /aliases/restore`
#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub backup: PathBuf,
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    provisioner: Arc<Provisioner>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        provisioner: Arc<Provisioner>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            provisioner,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let provisioner = Arc::clone(&self.provisioner);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                let served =
                                    serve_admin_connection(stream, provisioner, auth_token).await;
                                if let Err(e) = served {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: tokio::net::TcpStream,
    provisioner: Arc<Provisioner>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let provisioner = Arc::clone(&provisioner);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, provisioner, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

fn actor<B>(req: &Request<B>) -> String {
    req.headers()
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != name {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

/// Collect at most `MAX_BODY_BYTES` of the body and decode it
async fn read_json<B, T>(body: B) -> Result<T, Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<BoxError>,
    T: for<'de> Deserialize<'de>,
{
    let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return Err(failure(
                ErrorCode::InvalidInput,
                format!("request body exceeds {} bytes", MAX_BODY_BYTES),
            ))
        }
        Err(e) => {
            return Err(failure(
                ErrorCode::InvalidInput,
                format!("failed to read body: {}", e),
            ))
        }
    };

    serde_json::from_slice(&bytes)
        .map_err(|e| failure(ErrorCode::InvalidInput, format!("invalid JSON body: {}", e)))
}

/// Route one request. Generic over the body so tests can drive it without a socket.
pub async fn handle_admin_request<B>(
    req: Request<B>,
    provisioner: Arc<Provisioner>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(success(StatusCode::OK, &"ok")),
        (&Method::GET, "/version") => {
            return Ok(success(
                StatusCode::OK,
                &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
            ))
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(failure(ErrorCode::Unauthorized, "unauthorized"));
    }

    let actor = actor(&req);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["sites"]) => match provisioner.list_sites() {
            Ok(sites) => success(StatusCode::OK, &sites),
            Err(e) => provision_failure(e),
        },

        (&Method::POST, ["sites"]) => {
            let new: NewSite = match read_json(req.into_body()).await {
                Ok(new) => new,
                Err(resp) => return Ok(resp),
            };
            match provisioner.add_virtual_host(&actor, &new).await {
                Ok(provisioned) => success(StatusCode::CREATED, &provisioned),
                Err(e) => provision_failure(e),
            }
        }

        (&Method::POST, ["sites", id, "toggle"]) => match id.parse::<i64>() {
            Ok(id) => match provisioner.toggle_status(&actor, id) {
                Ok(site) => success(StatusCode::OK, &site),
                Err(e) => provision_failure(e),
            },
            Err(_) => failure(ErrorCode::InvalidInput, format!("invalid site id '{}'", id)),
        },

        (&Method::DELETE, ["sites", id]) => match id.parse::<i64>() {
            Ok(id) => match provisioner.remove_virtual_host(&actor, id).await {
                Ok(removed) => success(StatusCode::OK, &removed),
                Err(e) => provision_failure(e),
            },
            Err(_) => failure(ErrorCode::InvalidInput, format!("invalid site id '{}'", id)),
        },

        (&Method::POST, ["config", "regenerate"]) => {
            match provisioner.regenerate_config(&actor).await {
                Ok(result) => success(StatusCode::OK, &result),
                Err(e) => provision_failure(e),
            }
        }

        (&Method::GET, ["config", "preview"]) => match provisioner.preview_config() {
            Ok(content) => success(StatusCode::OK, &serde_json::json!({ "content": content })),
            Err(e) => provision_failure(e),
        },

        (&Method::GET, ["aliases"]) => match provisioner.list_aliases(&actor).await {
            Ok(aliases) => success(StatusCode::OK, &aliases),
            Err(e) => provision_failure(e),
        },

        (&Method::GET, ["aliases", "backups"]) => match provisioner.alias_backups() {
            Ok(backups) => success(StatusCode::OK, &backups),
            Err(e) => provision_failure(e),
        },

        (&Method::POST, ["aliases", "restore"]) => {
            let request: RestoreRequest = match read_json(req.into_body()).await {
                Ok(request) => request,
                Err(resp) => return Ok(resp),
            };
            match provisioner.restore_aliases(&actor, &request.backup).await {
                Ok(previous) => success(
                    StatusCode::OK,
                    &serde_json::json!({ "restored": request.backup, "previous_backup": previous }),
                ),
                Err(e) => provision_failure(e),
            }
        }

        (&Method::GET, ["scripts"]) => {
            let scripts: Vec<_> = provisioner.dispatcher().registry().descriptors().collect();
            success(StatusCode::OK, &scripts)
        }

        (&Method::POST, ["exec"]) => {
            let request: ExecRequest = match read_json(req.into_body()).await {
                Ok(request) => request,
                Err(resp) => return Ok(resp),
            };
            match provisioner
                .execute(&actor, &request.script, &request.action, &request.params)
                .await
            {
                Ok(output) => success(StatusCode::OK, &output),
                Err(e) => provision_failure(e),
            }
        }

        (&Method::GET, ["logs"]) => {
            let limit = match query_param(query.as_deref(), "limit") {
                None => DEFAULT_LOG_LIMIT,
                Some(raw) => match raw.parse::<usize>() {
                    Ok(n) => n.clamp(1, MAX_LOG_LIMIT),
                    Err(_) => {
                        return Ok(failure(
                            ErrorCode::InvalidInput,
                            format!("invalid limit '{}'", raw),
                        ))
                    }
                },
            };
            match provisioner.recent_logs(limit) {
                Ok(logs) => success(StatusCode::OK, &logs),
                Err(e) => provision_failure(e),
            }
        }

        _ => failure(ErrorCode::NotFound, format!("no route for {} {}", method, path)),
    };

    Ok(response)
}
