//! HTTP control API over the job queue.

use crate::schemas::{compile_schema, schema_json, violations};
use crate::json_error;
use anyhow::{Context, Result};
use bench_core::JobSpec;
use bench_runner::{JobQueue, QueueError};
use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::{json, Value};
use std::io::Read;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const API_KEY_HEADER: &str = "x-ipfs-benchmarks-api-key";
const POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self { status: 200, body },
            Err(e) => Self::error(500, "serialization_error", e.to_string(), json!({})),
        }
    }

    fn error(status: u16, code: &str, message: String, details: Value) -> Self {
        Self {
            status,
            body: json_error(code, message, details),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct AddBody {
    commit: Option<String>,
    clinic: Option<bench_core::ClinicRequest>,
    benchmarks: Option<Vec<String>>,
}

pub struct Api {
    queue: JobQueue,
    api_key: String,
    remote: bool,
    add_schema: JSONSchema,
    docs: Value,
}

impl Api {
    /// `remote` marks every job enqueued through the API as a remote run.
    pub fn new(queue: JobQueue, api_key: impl Into<String>, remote: bool) -> Result<Self> {
        Ok(Self {
            queue,
            api_key: api_key.into(),
            remote,
            add_schema: compile_schema("add_body.jsonschema")?,
            docs: api_docs(schema_json("add_body.jsonschema")?),
        })
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn route(&self, method: &str, url: &str, api_key: Option<&str>, body: &str) -> ApiResponse {
        let path = url.split('?').next().unwrap_or(url);
        let path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        match (method, path) {
            ("GET", "/") => ApiResponse::ok(&self.queue.status()),
            ("GET", "/history") => ApiResponse::ok(&json!({ "jobs": self.queue.history() })),
            ("GET", "/docs") => ApiResponse::ok(&self.docs),
            ("POST", "/") => self.protected(api_key, || self.add(body)),
            ("POST", "/drain") => self.protected(api_key, || ApiResponse::ok(&self.queue.drain())),
            ("POST", "/restart") => self.protected(api_key, || self.enqueue(JobSpec::restart())),
            (_, "/") | (_, "/drain") | (_, "/restart") | (_, "/history") | (_, "/docs") => {
                ApiResponse::error(
                    405,
                    "method_not_allowed",
                    format!("{} is not allowed on {}", method, path),
                    json!({}),
                )
            }
            _ => ApiResponse::error(404, "not_found", format!("no route for {}", path), json!({})),
        }
    }

    fn protected(&self, api_key: Option<&str>, handler: impl FnOnce() -> ApiResponse) -> ApiResponse {
        match api_key {
            Some(key) if key == self.api_key => handler(),
            Some(_) => ApiResponse::error(401, "unauthorized", "API key mismatch".to_string(), json!({})),
            None => ApiResponse::error(
                401,
                "unauthorized",
                format!("missing {} header", API_KEY_HEADER),
                json!({}),
            ),
        }
    }

    fn add(&self, body: &str) -> ApiResponse {
        let value: Value = if body.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(body) {
                Ok(value) => value,
                Err(e) => {
                    return ApiResponse::error(400, "invalid_body", format!("body is not JSON: {}", e), json!({}))
                }
            }
        };
        let problems = violations(&self.add_schema, &value);
        if !problems.is_empty() {
            return ApiResponse::error(
                400,
                "invalid_body",
                "request body does not match add_body_v1".to_string(),
                json!({ "violations": problems }),
            );
        }
        let body: AddBody = match serde_json::from_value(value) {
            Ok(body) => body,
            Err(e) => return ApiResponse::error(400, "invalid_body", e.to_string(), json!({})),
        };
        let spec = JobSpec {
            commit: body.commit,
            clinic: body.clinic,
            benchmarks: body.benchmarks,
            ..JobSpec::benchmark().with_remote(self.remote)
        };
        self.enqueue(spec)
    }

    fn enqueue(&self, spec: JobSpec) -> ApiResponse {
        match self.queue.enqueue(spec) {
            Ok(job) => ApiResponse::ok(&job),
            Err(QueueError::InvalidSpec(message)) => {
                ApiResponse::error(400, "invalid_job", message, json!({}))
            }
            Err(e) => ApiResponse::error(500, "queue_error", e.to_string(), json!({})),
        }
    }
}

/// Route listing served at `GET /docs`.
fn api_docs(add_body: Value) -> Value {
    let route = |method: &str, path: &str, protected: bool, summary: &str| {
        json!({
            "method": method,
            "path": path,
            "protected": protected,
            "summary": summary
        })
    };
    let mut add = route("POST", "/", true, "queue a benchmark run");
    add["body"] = add_body;
    json!({
        "name": "ipfs-benchmarks",
        "version": env!("CARGO_PKG_VERSION"),
        "api_key_header": API_KEY_HEADER,
        "routes": [
            route("GET", "/", false, "active job and pending queue"),
            route("GET", "/history", false, "finished jobs, newest first"),
            route("GET", "/docs", false, "this route listing"),
            add,
            route("POST", "/drain", true, "drop every pending job"),
            route("POST", "/restart", true, "queue a restart of the runner"),
        ]
    })
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    thread: JoinHandle<()>,
}

impl ServerHandle {
    pub fn join(self) {
        if self.thread.join().is_err() {
            warn!("API server thread panicked");
        }
    }
}

/// Binds `0.0.0.0:port` and serves until the queue halts for restart.
pub fn spawn(api: Api, port: u16) -> Result<ServerHandle> {
    spawn_on(api, &format!("0.0.0.0:{}", port))
}

fn spawn_on(api: Api, bind: &str) -> Result<ServerHandle> {
    let server = tiny_http::Server::http(bind)
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("cannot bind API server on {}", bind))?;
    let addr = server
        .server_addr()
        .to_ip()
        .context("API server is not listening on an IP socket")?;
    info!(%addr, "API server listening");
    let thread = thread::Builder::new()
        .name("bench-api".to_string())
        .spawn(move || {
            while !api.queue.is_halted() {
                match server.recv_timeout(POLL) {
                    Ok(Some(request)) => handle(&api, request),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "API receive failed"),
                }
            }
            info!("API server stopped");
        })
        .context("cannot start API server thread")?;
    Ok(ServerHandle { addr, thread })
}

fn handle(api: &Api, mut request: tiny_http::Request) {
    let method = request.method().as_str().to_string();
    let url = request.url().to_string();
    let api_key = request
        .headers()
        .iter()
        .find(|h| h.field.equiv(API_KEY_HEADER))
        .map(|h| h.value.as_str().to_string());
    let mut body = String::new();
    let response = match request.as_reader().read_to_string(&mut body) {
        Ok(_) => api.route(&method, &url, api_key.as_deref(), &body),
        Err(e) => ApiResponse::error(400, "invalid_body", e.to_string(), json!({})),
    };
    debug!(%method, %url, status = response.status, "API request");
    let payload = serde_json::to_string(&response.body).unwrap_or_else(|_| "{}".to_string());
    let mut reply = tiny_http::Response::from_string(payload).with_status_code(response.status);
    if let Ok(header) =
        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
    {
        reply = reply.with_header(header);
    }
    if let Err(e) = request.respond(reply) {
        warn!(error = %e, "could not send API response");
    }
}
