//! CGI bridge to the external `git-http-backend` executable.
//!
//! The backend is an opaque byte-stream transducer: request metadata goes
//! in through environment variables, the request body through stdin, and
//! the response comes back as a CGI head (`Header: value` lines up to a
//! blank line, with `Status` as a pseudo-header) followed by a raw body.
//!
//! The [`CgiRunner`] trait is the seam the orchestrator depends on, so
//! tests can substitute a deterministic fake for the real executable.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, instrument, warn};

/// Value reported to the backend as the hosting server.
const SERVER_SOFTWARE: &str = "gitbridge";

/// Request paths containing this substring get `REMOTE_USER=anonymous`, a
/// compatibility shim some backend builds require to permit pushes once
/// this gateway has already authorized the request.
const RECEIVE_PACK_MARKER: &str = "git-receive-pack";

// ---------------------------------------------------------------------------
// Context + trait
// ---------------------------------------------------------------------------

/// Everything the CGI contract needs from a request, resolved up front so
/// the runner never touches the settings store or the HTTP request itself.
#[derive(Debug, Clone)]
pub struct CgiContext {
    /// Path of the CGI executable to spawn.
    pub backend_path: PathBuf,
    /// Shard directory the backend resolves `PATH_INFO` against.
    pub project_root: PathBuf,
    pub method: String,
    /// Query string with the leading `?` stripped; empty when absent.
    pub query_string: String,
    /// Declared content type; empty when absent.
    pub content_type: String,
    /// Declared content length; 0 when absent.
    pub content_length: u64,
    /// `/<repository>.git/...`, forwarded verbatim.
    pub path_info: String,
    /// Full raw request path, used only for the receive-pack detection.
    pub raw_path: String,
    pub remote_addr: String,
    pub server_protocol: String,
}

/// Capability that turns a request into a relayed CGI response.
#[async_trait::async_trait]
pub trait CgiRunner: Send + Sync {
    async fn execute(&self, ctx: CgiContext, body: Body) -> Result<Response>;
}

// ---------------------------------------------------------------------------
// Real backend
// ---------------------------------------------------------------------------

/// Spawns the configured `git-http-backend` executable per request.
///
/// Concurrent subprocess count is bounded by a semaphore; requests beyond
/// the bound queue on `acquire` instead of forking without limit.
pub struct GitHttpBackend {
    semaphore: Arc<Semaphore>,
}

impl GitHttpBackend {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }
}

#[async_trait::async_trait]
impl CgiRunner for GitHttpBackend {
    #[instrument(skip(self, ctx, body), fields(path_info = %ctx.path_info))]
    async fn execute(&self, ctx: CgiContext, body: Body) -> Result<Response> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .context("subprocess admission semaphore closed")?;

        let working_dir = ctx
            .backend_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut command = Command::new(&ctx.backend_path);
        command
            .current_dir(&working_dir)
            .env("GIT_PROJECT_ROOT", &ctx.project_root)
            .env("GIT_HTTP_EXPORT_ALL", "1")
            .env("REQUEST_METHOD", &ctx.method)
            .env("QUERY_STRING", &ctx.query_string)
            .env("CONTENT_TYPE", &ctx.content_type)
            .env("CONTENT_LENGTH", ctx.content_length.to_string())
            .env("PATH_INFO", &ctx.path_info)
            .env("REMOTE_ADDR", &ctx.remote_addr)
            .env("SERVER_PROTOCOL", &ctx.server_protocol)
            .env("SERVER_SOFTWARE", SERVER_SOFTWARE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A client disconnect drops the response stream and ultimately
            // this child; without this the subprocess would leak.
            .kill_on_drop(true);

        if ctx
            .raw_path
            .to_ascii_lowercase()
            .contains(RECEIVE_PACK_MARKER)
        {
            command.env("REMOTE_USER", "anonymous");
        }

        let mut child = command.spawn().with_context(|| {
            format!(
                "failed to spawn CGI backend: {}",
                ctx.backend_path.display()
            )
        })?;

        // Copy the request body to stdin in its own task so a slow client
        // and a talkative backend cannot deadlock on full pipe buffers.
        // Dropping the handle closes the pipe either way.
        let stdin = child.stdin.take().context("CGI backend stdin unavailable")?;
        let stdin_task = if ctx.content_length > 0 {
            let mut stdin = stdin;
            let mut stream = body.into_data_stream();
            Some(tokio::spawn(async move {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            if let Err(err) = stdin.write_all(&bytes).await {
                                debug!(error = %err, "CGI backend closed stdin early");
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "request body ended early");
                            break;
                        }
                    }
                }
            }))
        } else {
            drop(stdin);
            None
        };

        // Drain stderr concurrently; it is only logged after exit.
        let mut stderr = child
            .stderr
            .take()
            .context("CGI backend stderr unavailable")?;
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        });

        let stdout = child
            .stdout
            .take()
            .context("CGI backend stdout unavailable")?;
        let mut reader = BufReader::new(stdout);
        let head = read_cgi_head(&mut reader)
            .await
            .context("failed to parse CGI response head")?;

        // Reap the child and surface stderr once it exits; the response is
        // already streaming and must not be altered.
        let path_info = ctx.path_info.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Some(task) = stdin_task {
                let _ = task.await;
            }
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(%status, %path_info, "CGI backend exited with non-zero status");
                }
                Err(err) => error!(error = %err, "failed to wait on CGI backend"),
                _ => {}
            }
            let stderr_text = stderr_task.await.unwrap_or_default();
            if !stderr_text.trim().is_empty() {
                error!(%path_info, stderr = %stderr_text.trim(), "CGI backend error output");
            }
        });

        // Everything after the blank line streams through untouched.
        let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// CGI head parsing
// ---------------------------------------------------------------------------

pub(crate) struct CgiResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Read `Header: value` lines up to the first blank line.
///
/// A `Status` pseudo-header (case-insensitive) sets the HTTP status from
/// its leading token; every other header is copied verbatim with last
/// write winning on duplicates.  Lines without a colon are skipped.
pub(crate) async fn read_cgi_head<R>(reader: &mut R) -> Result<CgiResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .context("failed to read CGI header line")?;
        if read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }

        let (name, value) = match trimmed.split_once(':') {
            Some((name, value)) if !name.is_empty() => (name.trim(), value.trim()),
            _ => continue,
        };

        if name.eq_ignore_ascii_case("Status") {
            if let Some(code) = value
                .split_whitespace()
                .next()
                .and_then(|token| token.parse::<u16>().ok())
            {
                match StatusCode::from_u16(code) {
                    Ok(parsed) => status = parsed,
                    Err(_) => warn!(code, "CGI Status header outside valid range"),
                }
            }
        } else {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(header_name), Ok(header_value)) => {
                    headers.insert(header_name, header_value);
                }
                _ => warn!(header = %name, "dropping malformed CGI response header"),
            }
        }
    }

    Ok(CgiResponseHead { status, headers })
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
