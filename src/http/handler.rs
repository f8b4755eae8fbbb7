//! Main axum router and HTTP request handlers for the Git gateway.
//!
//! Routes (the repository path may span any number of segments):
//! - `GET  /<repo>/info/refs?service=<svc>` - Ref advertisement
//! - `POST /<repo>/git-upload-pack`         - Fetch negotiation / pack transfer
//! - `POST /<repo>/git-receive-pack`        - Push
//!
//! Everything else is a 404.

use std::future::IntoFuture;
use std::io;
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error, info, instrument, warn};

use crate::git::paths::clean_request_path;
use crate::git::{pktline, GatewayError, Invocation, Service, ServiceRequest};
use crate::AppState;

/// In-memory buffer between the service's stdout and the response body.
const BODY_BUFFER: usize = 64 * 1024;

/// Request header carrying the client's wire protocol preference.
const GIT_PROTOCOL_HEADER: &str = "git-protocol";

const NO_CACHE: [(header::HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-cache, max-age=0, must-revalidate"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT"),
];

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with shared state.
///
/// Repository paths are nested arbitrarily deep, so dispatch happens on the
/// path suffix rather than through route patterns.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new().fallback(handle_git).with_state(state)
}

/// Serve until the shutdown token fires, then give in-flight responses the
/// configured grace period before cancelling the termination token.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("HTTP listener has no address")?;
    info!(%addr, "HTTP server listening");

    let shutdown = state.shutdown.clone();
    let terminate = state.terminate.clone();
    let grace = state.config.shutdown.grace_period();

    let server = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        res = &mut server => res.context("HTTP server error")?,
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(?grace, "HTTP responses still streaming after grace period; terminating");
            terminate.cancel();
        }
    }

    info!("HTTP server stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum GitRoute<'a> {
    InfoRefs { repo: &'a str },
    Rpc { service: Service, repo: &'a str },
}

impl<'a> GitRoute<'a> {
    /// `info/refs` is checked first so a repository literally named
    /// `git-upload-pack` still advertises.
    fn match_path(path: &'a str) -> Option<Self> {
        if let Some(repo) = path.strip_suffix("/info/refs") {
            return Some(GitRoute::InfoRefs { repo });
        }
        [Service::UploadPack, Service::ReceivePack]
            .into_iter()
            .find_map(|service| {
                path.strip_suffix(service.as_str())
                    .and_then(|rest| rest.strip_suffix('/'))
                    .map(|repo| GitRoute::Rpc { service, repo })
            })
    }
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(%method, path = %uri.path()))]
async fn handle_git(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let path = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|_| AppError::BadRequest("invalid request path".to_string()))?;
    let route = GitRoute::match_path(&path).ok_or(AppError::NotFound(None))?;
    let protocol = protocol_version(&headers);

    match route {
        GitRoute::InfoRefs { repo } => {
            if method != Method::GET {
                return Err(AppError::MethodNotAllowed(Method::GET));
            }
            let service = Query::<InfoRefsQuery>::try_from_uri(&uri)
                .ok()
                .and_then(|Query(q)| q.service)
                .unwrap_or_default();
            let service: Service = service.parse()?;

            let request = locate(&state, service, repo, protocol).await?;
            debug!(repo = %request.repo_path.display(), %service, "advertising refs");

            let body = stream_service(&state, request, Invocation::AdvertiseRefs, tokio::io::empty());
            Ok(git_response(service.advertisement_content_type(), body))
        }
        GitRoute::Rpc { service, repo } => {
            if method != Method::POST {
                return Err(AppError::MethodNotAllowed(Method::POST));
            }

            let request = locate(&state, service, repo, protocol).await?;
            debug!(repo = %request.repo_path.display(), %service, "stateless rpc");

            let stdin = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
            let body = stream_service(&state, request, Invocation::StatelessRpc, stdin);
            Ok(git_response(service.result_content_type(), body))
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Clean and confine the repository part of the URL and require it on disk.
async fn locate(
    state: &AppState,
    service: Service,
    repo: &str,
    protocol: Option<String>,
) -> Result<ServiceRequest, GatewayError> {
    let repo = clean_request_path(repo);
    let repo_path = state.repo_root.locate(&repo).await?;
    Ok(ServiceRequest {
        service,
        repo_path,
        protocol_version: None,
    }
    .with_protocol_version(protocol))
}

fn protocol_version(headers: &HeaderMap) -> Option<String> {
    headers
        .get(GIT_PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned())
}

fn git_response(content_type: &'static str, body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        NO_CACHE,
        body,
    )
        .into_response()
}

/// Run the service in the background and expose its stdout as a streaming
/// body.
///
/// Headers are already committed by the time the service runs, so failures
/// past this point can only be logged. Dropping the body (client gone) fails
/// the executor's next write, which ends the exchange and kills the child.
fn stream_service<I>(
    state: &Arc<AppState>,
    request: ServiceRequest,
    invocation: Invocation,
    stdin: I,
) -> Body
where
    I: AsyncRead + Send + Unpin + 'static,
{
    let (mut writer, reader) = tokio::io::duplex(BODY_BUFFER);
    let state = Arc::clone(state);

    tokio::spawn(async move {
        if invocation == Invocation::AdvertiseRefs {
            let preamble = pktline::service_announcement(request.service);
            if let Err(e) = write_preamble(&mut writer, &preamble).await {
                debug!(error = %e, "failed to write service announcement");
            }
        }

        let cancel = state.terminate.child_token();
        if let Err(e) = state
            .executor
            .serve(
                &cancel,
                &request,
                invocation,
                stdin,
                &mut writer,
                tokio::io::stderr(),
            )
            .await
        {
            warn!(
                error = %e,
                service = %request.service,
                repo = %request.repo_path.display(),
                "git service failed after response headers were sent"
            );
        }
    });

    Body::from_stream(ReaderStream::new(reader))
}

async fn write_preamble(writer: &mut tokio::io::DuplexStream, preamble: &[u8]) -> io::Result<()> {
    writer.write_all(preamble).await?;
    writer.flush().await
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Only failures detected before the response is committed end up here.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    /// `None` for paths that are not a Git endpoint at all.
    NotFound(Option<String>),
    /// Carries the one method the endpoint accepts.
    MethodNotAllowed(Method),
    /// The service could not be started or failed before streaming.
    Internal(GatewayError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => {
                debug!(%msg, "bad request");
                (StatusCode::BAD_REQUEST, msg).into_response()
            }
            AppError::NotFound(msg) => {
                let msg = msg.unwrap_or_else(|| "not found".to_string());
                debug!(%msg, "not found");
                (StatusCode::NOT_FOUND, msg).into_response()
            }
            AppError::MethodNotAllowed(allowed) => {
                let allow = HeaderValue::from_str(allowed.as_str())
                    .unwrap_or(HeaderValue::from_static("GET"));
                (
                    StatusCode::METHOD_NOT_ALLOWED,
                    [(header::ALLOW, allow)],
                    "method not allowed",
                )
                    .into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Parse(_)
            | GatewayError::UnsupportedService(_)
            | GatewayError::MissingRepoPath
            | GatewayError::PathTraversal => AppError::BadRequest(err.to_string()),
            GatewayError::RepositoryNotFound(_) => AppError::NotFound(Some(err.to_string())),
            GatewayError::Execution(_) | GatewayError::AuthenticationFailure => {
                AppError::Internal(err)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::net::SocketAddr;
    use std::path::PathBuf;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::config::parse_config;
    use crate::git::ExecError;

    struct TestServer {
        addr: SocketAddr,
        repo: PathBuf,
        _root: tempfile::TempDir,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }
    }

    /// Serve a root holding `team/project.git`, with `binary` standing in
    /// for both Git services.
    async fn spawn_server(binary: &str) -> TestServer {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("team/project.git");
        std::fs::create_dir_all(&repo).unwrap();

        let yaml = format!(
            "repo_root: {}\nhttp:\n  listen: 127.0.0.1:0\ngit:\n  upload_pack_path: {binary}\n  receive_pack_path: {binary}\n",
            root.path().display()
        );
        let state = Arc::new(AppState::new(parse_config(&yaml).unwrap()).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, create_router(state)).await });

        TestServer {
            addr,
            repo,
            _root: root,
        }
    }

    /// Send a request line verbatim, bypassing client-side URL normalization.
    async fn raw_status(addr: SocketAddr, request_line: &str) -> u16 {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("{request_line}\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        resp.split_whitespace().nth(1).unwrap().parse().unwrap()
    }

    #[test]
    fn routes_by_suffix() {
        assert_eq!(
            GitRoute::match_path("/a/b.git/info/refs"),
            Some(GitRoute::InfoRefs { repo: "/a/b.git" })
        );
        assert_eq!(
            GitRoute::match_path("/a/b.git/git-receive-pack"),
            Some(GitRoute::Rpc {
                service: Service::ReceivePack,
                repo: "/a/b.git"
            })
        );
        assert_eq!(
            GitRoute::match_path("/git-upload-pack/info/refs"),
            Some(GitRoute::InfoRefs {
                repo: "/git-upload-pack"
            })
        );
        assert_eq!(GitRoute::match_path("/a/b.git/xgit-upload-pack"), None);
        assert_eq!(GitRoute::match_path("/a/b.git/HEAD"), None);
        assert_eq!(GitRoute::match_path("/"), None);
    }

    #[test]
    fn gateway_errors_map_to_status_codes() {
        let status = |e: GatewayError| AppError::from(e).into_response().status();
        assert_eq!(status(GatewayError::PathTraversal), StatusCode::BAD_REQUEST);
        assert_eq!(status(GatewayError::MissingRepoPath), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(GatewayError::unsupported_service("git-upload-archive")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(GatewayError::RepositoryNotFound("/x.git".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(GatewayError::Execution(ExecError::Cancelled)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn info_refs_sends_announcement_then_advertisement() {
        let server = spawn_server("echo").await;
        let resp = reqwest::get(server.url("/team/project.git/info/refs?service=git-upload-pack"))
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let headers = resp.headers();
        assert_eq!(
            headers["content-type"],
            "application/x-git-upload-pack-advertisement"
        );
        assert_eq!(headers["cache-control"], "no-cache, max-age=0, must-revalidate");
        assert_eq!(headers["pragma"], "no-cache");
        assert_eq!(headers["expires"], "Fri, 01 Jan 1980 00:00:00 GMT");

        let body = resp.bytes().await.unwrap();
        let expected = format!(
            "001e# service=git-upload-pack\n0000--stateless-rpc --advertise-refs {}\n",
            server.repo.display()
        );
        assert_eq!(String::from_utf8_lossy(&body), expected);
    }

    #[tokio::test]
    async fn announcement_is_sent_even_if_service_cannot_start() {
        let server = spawn_server("/nonexistent/git-service").await;
        let resp = reqwest::get(server.url("/team/project.git/info/refs?service=git-receive-pack"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"],
            "application/x-git-receive-pack-advertisement"
        );
        let body = resp.bytes().await.unwrap();
        assert_eq!(&body[..], b"001f# service=git-receive-pack\n0000");
    }

    #[tokio::test]
    async fn rpc_post_runs_stateless_service() {
        let server = spawn_server("echo").await;
        let resp = reqwest::Client::new()
            .post(server.url("/team/project.git/git-upload-pack"))
            .header("content-type", "application/x-git-upload-pack-request")
            .body("0032want 0000000000000000000000000000000000000000\n0000")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"],
            "application/x-git-upload-pack-result"
        );
        assert_eq!(resp.headers()["pragma"], "no-cache");
        let body = resp.bytes().await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&body),
            format!("--stateless-rpc {}\n", server.repo.display())
        );
    }

    #[tokio::test]
    async fn missing_repository_is_404() {
        let server = spawn_server("echo").await;
        let resp = reqwest::get(server.url("/team/missing.git/info/refs?service=git-upload-pack"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let resp = reqwest::Client::new()
            .post(server.url("/nope.git/git-receive-pack"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsupported_or_missing_service_is_400() {
        let server = spawn_server("echo").await;
        for query in ["?service=git-upload-archive", "?service=", ""] {
            let resp = reqwest::get(server.url(&format!("/team/project.git/info/refs{query}")))
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST, "query {query:?}");
        }
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let server = spawn_server("echo").await;
        let resp = reqwest::Client::new()
            .post(server.url("/team/project.git/info/refs?service=git-upload-pack"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()["allow"], "GET");

        let resp = reqwest::get(server.url("/team/project.git/git-upload-pack"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()["allow"], "POST");
    }

    #[tokio::test]
    async fn unknown_paths_are_404() {
        let server = spawn_server("echo").await;
        for path in ["/", "/team/project.git", "/team/project.git/HEAD"] {
            let resp = reqwest::get(server.url(path)).await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "path {path:?}");
        }
    }

    #[tokio::test]
    async fn repository_root_is_not_servable() {
        let server = spawn_server("echo").await;
        let resp = reqwest::get(server.url("/info/refs?service=git-upload-pack"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_any_lookup() {
        let server = spawn_server("echo").await;
        let status = raw_status(
            server.addr,
            "GET /../../etc/info/refs?service=git-upload-pack HTTP/1.1",
        )
        .await;
        assert_eq!(status, 400);

        let status = raw_status(server.addr, "POST /team/../../x.git/git-upload-pack HTTP/1.1").await;
        assert_eq!(status, 400);

        let status = raw_status(
            server.addr,
            "GET /%2e%2e/%2E%2E/etc/info/refs?service=git-upload-pack HTTP/1.1",
        )
        .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn request_path_is_percent_decoded() {
        let server = spawn_server("echo").await;
        let spaced = server.repo.with_file_name("my project.git");
        std::fs::create_dir_all(&spaced).unwrap();

        let resp = reqwest::get(server.url("/team/my%20project.git/info/refs?service=git-upload-pack"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body = resp.text().await.unwrap();
        assert!(body.ends_with(&format!("{}\n", spaced.display())), "{body}");

        let status = raw_status(
            server.addr,
            "GET /team/%FF.git/info/refs?service=git-upload-pack HTTP/1.1",
        )
        .await;
        assert_eq!(status, 400);
    }
}
