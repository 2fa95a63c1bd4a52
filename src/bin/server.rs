//! Job execution API server
//!
//! Exposes the supervisor's five operations over HTTP with mutual-TLS client
//! authentication. The common name of the verified client certificate is the
//! job-ownership principal: every ID-bearing request is rejected unless the
//! caller started that job.
//!
//! ## Endpoints
//!
//! POST /api/v1/jobs - Start a job
//! POST /api/v1/jobs/{id}/stop - Stop a job
//! GET  /api/v1/jobs/{id}/status - Get job status
//! GET  /api/v1/jobs/{id}/stdout - Stream captured stdout from the beginning
//! GET  /api/v1/jobs/{id}/stderr - Stream captured stderr from the beginning

use std::any::Any;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use actix_tls::accept::rustls_0_23::TlsStream;
use actix_web::dev::Extensions;
use actix_web::rt::net::TcpStream;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use chrono::{DateTime, Utc};
use clap::Parser;
use log::{info, warn};
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use serde::{Deserialize, Serialize};
use x509_parser::prelude::*;

use overseer::{JobState, JobStatus, OverseerError, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "overseer-server")]
#[command(version, about = "Remote job execution server with cgroup v2 resource limits")]
struct ServerArgs {
    /// Listening address and port
    #[arg(long, default_value = "127.0.0.1:9999")]
    listen: String,

    /// Path to the server private key
    #[arg(long, default_value = "certs/server.key")]
    key: PathBuf,

    /// Path to the server certificate
    #[arg(long, default_value = "certs/server.crt")]
    cert: PathBuf,

    /// Path to the certificate of the Certificate Authority clients are
    /// verified against
    #[arg(long, default_value = "certs/ca.crt")]
    ca: PathBuf,

    /// Serve plain HTTP without client authentication (development only)
    #[arg(long)]
    insecure_http: bool,
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Must run before anything else: a re-executed child diverts into cgroup
    // setup here and never reaches the server code below
    overseer::reexec_guard();

    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let args = ServerArgs::parse();

    if !overseer::utils::is_root() {
        warn!("not running as root; applying cgroup limits will likely fail");
    }
    if !overseer::utils::has_cgroup_v2() {
        warn!("no cgroup2 hierarchy found; job launches will be rejected");
    }

    let state = web::Data::new(AppState::new(args.insecure_http));

    info!("listening on {}", args.listen);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api/v1")
                    .route("/jobs", web::post().to(start_job))
                    .route("/jobs/{id}/stop", web::post().to(stop_job))
                    .route("/jobs/{id}/status", web::get().to(job_status))
                    .route("/jobs/{id}/stdout", web::get().to(job_stdout))
                    .route("/jobs/{id}/stderr", web::get().to(job_stderr)),
            )
    });

    if args.insecure_http {
        warn!("serving plain HTTP; every caller acts as '{ANONYMOUS}'");
        server.bind(&args.listen)?.run().await
    } else {
        // Pin the process-level crypto provider; the workspace links more
        // than one rustls backend
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let tls = load_tls_config(&args.cert, &args.key, &args.ca)?;
        server
            .on_connect(extract_client_identity)
            .bind_rustls_0_23(&args.listen, tls)?
            .run()
            .await
    }
}

// ============ API Types ============

#[derive(Debug, Serialize, Deserialize)]
pub struct StartJobRequest {
    /// Program to run
    pub command: String,
    /// Program arguments
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub id: String,
    pub owner: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub exit_code: Option<i32>,
}

impl From<JobStatus> for StatusResponse {
    fn from(status: JobStatus) -> Self {
        let name = match status.state {
            JobState::Started => "STARTED",
            JobState::Done => "DONE",
            JobState::Stopped => "STOPPED",
        };
        Self {
            status: name.to_string(),
            exit_code: status.exit_code,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

// ============ Application State ============

const ANONYMOUS: &str = "anonymous";

/// Common name extracted from the verified client certificate at connection
/// time
#[derive(Debug, Clone)]
struct Identity(String);

#[derive(Debug, Clone)]
struct JobOwner {
    identity: String,
    started_at: DateTime<Utc>,
}

pub struct AppState {
    supervisor: Supervisor,
    owners: Mutex<HashMap<String, JobOwner>>,
    allow_anonymous: bool,
}

impl AppState {
    fn new(allow_anonymous: bool) -> Self {
        Self {
            supervisor: Supervisor::new(),
            owners: Mutex::new(HashMap::new()),
            allow_anonymous,
        }
    }
}

// ============ Authentication & authorization ============

fn caller_identity(req: &HttpRequest, state: &AppState) -> Option<String> {
    if let Some(identity) = req.conn_data::<Identity>() {
        return Some(identity.0.clone());
    }
    if state.allow_anonymous {
        return Some(ANONYMOUS.to_string());
    }
    None
}

/// The interceptor rule: an ID-bearing request is allowed only when the
/// authenticated identity matches the recorded owner. Unknown IDs are
/// indistinguishable from foreign ones.
fn job_access(state: &AppState, req: &HttpRequest, id: &str) -> Result<(), HttpResponse> {
    let Some(identity) = caller_identity(req, state) else {
        return Err(unauthenticated());
    };

    let owners = state.owners.lock().unwrap();
    match owners.get(id) {
        Some(owner) if owner.identity == identity => Ok(()),
        _ => Err(HttpResponse::Forbidden().json(ErrorBody::new("permission denied"))),
    }
}

fn unauthenticated() -> HttpResponse {
    HttpResponse::Unauthorized().json(ErrorBody::new(
        "could not get the Common Name from the certificate",
    ))
}

fn error_response(err: &OverseerError) -> HttpResponse {
    match err {
        OverseerError::UnknownJobId => {
            HttpResponse::NotFound().json(ErrorBody::new(err.to_string()))
        }
        OverseerError::JobFinished => {
            HttpResponse::Conflict().json(ErrorBody::new(err.to_string()))
        }
        _ => HttpResponse::InternalServerError().json(ErrorBody::new(err.to_string())),
    }
}

// ============ Handlers ============

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "overseer",
    }))
}

async fn start_job(
    req: HttpRequest,
    body: web::Json<StartJobRequest>,
    state: web::Data<AppState>,
) -> impl Responder {
    let Some(identity) = caller_identity(&req, &state) else {
        return unauthenticated();
    };

    if body.command.is_empty() {
        return HttpResponse::BadRequest().json(ErrorBody::new("empty job command provided"));
    }

    // start_job blocks on the trampoline's signalling pipe
    let supervisor = state.supervisor.clone();
    let StartJobRequest { command, arguments } = body.into_inner();
    let started = web::block(move || supervisor.start_job(&command, &arguments)).await;

    let result = match started {
        Ok(result) => result,
        Err(e) => {
            return HttpResponse::InternalServerError().json(ErrorBody::new(e.to_string()));
        }
    };

    match result {
        Ok(id) => {
            let owner = JobOwner {
                identity,
                started_at: Utc::now(),
            };
            let response = StartJobResponse {
                id: id.clone(),
                owner: owner.identity.clone(),
                started_at: owner.started_at,
            };
            state.owners.lock().unwrap().insert(id, owner);
            HttpResponse::Created().json(response)
        }
        Err(e) => error_response(&e),
    }
}

async fn stop_job(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> impl Responder {
    let id = path.into_inner();
    if let Err(denied) = job_access(&state, &req, &id) {
        return denied;
    }

    match state.supervisor.stop_job(&id) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "id": id, "status": "STOPPED" })),
        Err(e) => error_response(&e),
    }
}

async fn job_status(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> impl Responder {
    let id = path.into_inner();
    if let Err(denied) = job_access(&state, &req, &id) {
        return denied;
    }

    match state.supervisor.job_status(&id) {
        Ok(status) => HttpResponse::Ok().json(StatusResponse::from(status)),
        Err(e) => error_response(&e),
    }
}

async fn job_stdout(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> impl Responder {
    stream_output(req, path, state, OutputChannel::Stdout)
}

async fn job_stderr(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> impl Responder {
    stream_output(req, path, state, OutputChannel::Stderr)
}

enum OutputChannel {
    Stdout,
    Stderr,
}

fn stream_output(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
    channel: OutputChannel,
) -> HttpResponse {
    let id = path.into_inner();
    if let Err(denied) = job_access(&state, &req, &id) {
        return denied;
    }

    let reader = match channel {
        OutputChannel::Stdout => state.supervisor.job_stdout(&id),
        OutputChannel::Stderr => state.supervisor.job_stderr(&id),
    };

    match reader {
        Ok(reader) => HttpResponse::Ok()
            .content_type("application/octet-stream")
            .streaming(reader_stream(reader)),
        Err(e) => error_response(&e),
    }
}

/// Bridge a blocking buffer reader into an async byte stream.
///
/// A plain thread drains the reader (blocking until the job writes more or
/// its buffers close) and feeds a bounded channel the response body pulls
/// from.
fn reader_stream(
    mut reader: overseer::Reader,
) -> tokio_stream::wrappers::ReceiverStream<Result<web::Bytes, io::Error>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<web::Bytes, io::Error>>(32);

    std::thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if tx
                        .blocking_send(Ok(web::Bytes::copy_from_slice(&chunk[..n])))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    tokio_stream::wrappers::ReceiverStream::new(rx)
}

// ============ TLS ============

/// Mutual-TLS server configuration: TLS 1.3 only, client certificates
/// required and verified against the configured CA.
fn load_tls_config(cert: &Path, key: &Path, ca: &Path) -> io::Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| io::Error::other("no private key found"))?;

    let mut roots = rustls::RootCertStore::empty();
    for ca_cert in rustls_pemfile::certs(&mut BufReader::new(File::open(ca)?)) {
        roots
            .add(ca_cert?)
            .map_err(|e| io::Error::other(format!("could not parse CA certificate: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| io::Error::other(format!("client verifier: {e}")))?;

    rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::other(format!("server certificate: {e}")))
}

/// Pull the client's common name out of the TLS session when the connection
/// is accepted and attach it to the request extensions
fn extract_client_identity(connection: &dyn Any, ext: &mut Extensions) {
    if let Some(tls) = connection.downcast_ref::<TlsStream<TcpStream>>() {
        let (_, session) = tls.get_ref();
        if let Some(certs) = session.peer_certificates() {
            if let Some(cn) = certs.first().and_then(leaf_common_name) {
                ext.insert(Identity(cn));
            }
        }
    }
}

fn leaf_common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    cn
}
