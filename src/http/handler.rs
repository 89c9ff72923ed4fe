//! Main axum router and the git ingress handler.
//!
//! Routes:
//! - `*    /{owner}/{repo}/{*rest}` - smart and dumb git HTTP endpoints
//! - `GET  /healthz`                - Health check
//! - `GET  /metrics`                - Prometheus metrics

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use serde::Deserialize;
use tracing::{debug, error, instrument, warn};

use super::routes::{self, RouteKind};
use super::{dumb, rpc};
use crate::auth::access::{AccessMode, DenyReason, Principal};
use crate::auth::credentials;
use crate::db::User;
use crate::error::{GatewayError, ACCESS_DENIED_MESSAGE};
use crate::git::{GitService, HookContext, HookEnv, RepoRef};
use crate::metrics::{Endpoint, Protocol, ProtocolLabels, RequestLabels};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .route("/{owner}/{repo}/{*rest}", any(handle_git))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct GitQuery {
    service: Option<String>,
}

impl GitQuery {
    /// `git-upload-pack` / `git-receive-pack`; anything else is `None`.
    fn service(&self) -> Option<GitService> {
        self.service
            .as_deref()
            .and_then(|s| s.strip_prefix("git-"))
            .and_then(GitService::from_http_service)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Every request below `/{owner}/{repo}/`. Adds CORS headers when configured
/// and answers preflights without touching the repository.
async fn handle_git(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, rest)): Path<(String, String, String)>,
    Query(query): Query<GitQuery>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let allow_origin = state.config.http.access_control_allow_origin.clone();

    let mut response = if !allow_origin.is_empty() && method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        serve_git(state, &owner, &repo, &rest, &query, &method, &headers, body)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    };

    if !allow_origin.is_empty() {
        let headers = response.headers_mut();
        if let Ok(origin) = HeaderValue::from_str(&allow_origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization, User-Agent"),
        );
    }
    response
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip(state, query, headers, body))]
async fn serve_git(
    state: Arc<AppState>,
    owner: &str,
    repo: &str,
    rest: &str,
    query: &GitQuery,
    method: &Method,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let kind = routes::match_route(rest).ok_or(AppError::NotFound)?;
    if state.config.repository.disable_http_git {
        return Err(AppError::Forbidden(
            "Interacting with repositories by HTTP protocol is disabled",
        ));
    }
    if *method != kind.method() {
        return Err(AppError::NotFound);
    }
    count_request(&state, kind);

    let repo_ref = RepoRef::parse(&format!("{owner}/{repo}"))?;
    let service = query.service();
    let mode = if is_pull(kind, service) {
        AccessMode::Read
    } else {
        AccessMode::Write
    };

    let resolved = match state.resolve_repo(&repo_ref).await {
        Ok(pair) => Some(pair),
        Err(GatewayError::ResourceNotFound(detail)) => {
            debug!(%detail, "repository not found");
            None
        }
        Err(e) => return Err(e.into()),
    };

    // Anonymous pulls of public repositories skip credentials entirely.
    let anonymous = matches!(
        &resolved,
        Some((_, r)) if mode == AccessMode::Read
            && !r.is_private
            && !state.config.auth.require_signin_view
    );
    let principal = if anonymous {
        Principal::Anonymous
    } else {
        Principal::User(authenticate(&state, headers).await?)
    };

    let Some((owner_row, repo_row)) = resolved else {
        count_denied(&state);
        return Err(GatewayError::ResourceNotFound(format!("{}/{}", repo_ref.owner, repo_ref.name)).into());
    };
    if !anonymous {
        let decision = state.access().decide(&principal, &repo_row, mode).await?;
        if !decision.is_allowed() {
            count_denied(&state);
        }
        decision.into_result()?;
    }

    let repo_path = state.repo_path(&owner_row, &repo_row, repo_ref.is_wiki);
    if !repo_path.is_dir() {
        warn!(path = %repo_path.display(), "repository row has no directory on disk");
        return Err(AppError::NotFound);
    }

    let git_protocol = headers
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match kind {
        RouteKind::Rpc(service) => {
            let hook_env = service.is_write().then(|| {
                HookEnv::compose(&HookContext {
                    principal: &principal,
                    owner: &owner_row,
                    repo: &repo_row,
                    repo_path: &repo_path,
                    is_wiki: repo_ref.is_wiki,
                    custom_hooks_dir: &state.config.repository.custom_hooks_dir,
                    config_path: &state.config_path,
                })
            });
            rpc::serve_rpc(
                Arc::clone(&state),
                service,
                repo_path,
                headers,
                body,
                hook_env,
                git_protocol,
            )
            .await
        }
        RouteKind::InfoRefs => rpc::info_refs(&state, service, &repo_path, git_protocol.as_deref()).await,
        _ => dumb::send_file(kind, &repo_path, rest).await,
    }
}

/// Read-only unless the request is, or advertises for, receive-pack.
fn is_pull(kind: RouteKind, service: Option<GitService>) -> bool {
    match kind {
        RouteKind::Rpc(service) => !service.is_write(),
        RouteKind::InfoRefs => service != Some(GitService::ReceivePack),
        _ => true,
    }
}

/// Resolve HTTP Basic credentials. Every failure, including a 2FA account
/// using its password, becomes the same challenge.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let Some((username, password)) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(credentials::parse_basic)
    else {
        return Err(AppError::Unauthorized);
    };

    match credentials::resolve_basic(&state.db, &username, &password).await {
        Ok(user) => Ok(user),
        Err(e @ (GatewayError::AuthenticationFailed(_) | GatewayError::AuthorizationDenied(_))) => {
            warn!(error = %e, "HTTP credentials rejected");
            state
                .metrics
                .metrics
                .auth_failures
                .get_or_create(&ProtocolLabels {
                    protocol: Protocol::Http,
                })
                .inc();
            Err(AppError::Unauthorized)
        }
        Err(e) => Err(e.into()),
    }
}

fn count_request(state: &AppState, kind: RouteKind) {
    let endpoint = match kind {
        RouteKind::Rpc(GitService::ReceivePack) => Endpoint::ReceivePack,
        RouteKind::Rpc(_) => Endpoint::UploadPack,
        RouteKind::InfoRefs => Endpoint::InfoRefs,
        _ => Endpoint::Static,
    };
    state
        .metrics
        .metrics
        .http_git_requests
        .get_or_create(&RequestLabels { endpoint })
        .inc();
}

fn count_denied(state: &AppState) {
    state
        .metrics
        .metrics
        .access_denied
        .get_or_create(&ProtocolLabels {
            protocol: Protocol::Http,
        })
        .inc();
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// 401 with a Basic challenge.
    Unauthorized,
    Forbidden(&'static str),
    BadRequest(&'static str),
    NotFound,
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\".\"")],
            )
                .into_response(),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::NotFound => StatusCode::NOT_FOUND.into_response(),
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        debug!(error = %err, "request failed");
        match err {
            GatewayError::TransportReject(_)
            | GatewayError::AuthenticationFailed(_)
            | GatewayError::AuthorizationDenied(DenyReason::TwoFactorRestricted) => AppError::Unauthorized,
            GatewayError::AuthorizationDenied(_) | GatewayError::ResourceNotFound(_) => {
                AppError::Forbidden(ACCESS_DENIED_MESSAGE)
            }
            GatewayError::ProtocolMalformed(_) => AppError::BadRequest(err.public_message()),
            GatewayError::SubprocessFailure(_) | GatewayError::Storage(_) => {
                AppError::Internal(anyhow::Error::new(err))
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use base64::Engine as _;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::git::process::git_available;

    struct Fixture {
        _dir: TempDir,
        state: Arc<AppState>,
    }

    /// alice owns `pub` (public), `priv` (private) and `mirror` (public
    /// mirror); bob has no grants.
    async fn fixture(tweak: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.repository.root = dir.path().join("repos");
        tweak(&mut config);
        let state = AppState::for_tests(config).await;

        let alice = state.db.users().create("alice", "", "alice-pw").await.unwrap();
        state.db.users().create("bob", "", "bob-pw").await.unwrap();
        state.db.repos().create(alice.id, "pub", false, false).await.unwrap();
        state.db.repos().create(alice.id, "priv", true, false).await.unwrap();
        state.db.repos().create(alice.id, "mirror", false, true).await.unwrap();
        for name in ["pub", "priv", "mirror"] {
            std::fs::create_dir_all(dir.path().join(format!("repos/alice/{name}.git"))).unwrap();
        }

        Fixture {
            _dir: dir,
            state: Arc::new(state),
        }
    }

    fn basic(user: &str, pass: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
        )
    }

    async fn send(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let resp = create_router(Arc::clone(state)).oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn get_as(uri: &str, user: &str, pass: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, basic(user, pass))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn push_without_credentials_is_challenged() {
        let f = fixture(|_| {}).await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/alice/priv.git/git-receive-pack")
            .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&f.state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(headers[header::WWW_AUTHENTICATE], "Basic realm=\".\"");
    }

    #[tokio::test]
    async fn missing_and_private_repos_look_the_same() {
        let f = fixture(|_| {}).await;
        let uri = |r: &str| format!("/alice/{r}.git/info/refs?service=git-upload-pack");

        let anon_missing = send(&f.state, get(&uri("nope"))).await;
        let anon_private = send(&f.state, get(&uri("priv"))).await;
        assert_eq!(anon_missing.0, StatusCode::UNAUTHORIZED);
        assert_eq!(anon_missing, anon_private);

        let bob_missing = send(&f.state, get_as(&uri("nope"), "bob", "bob-pw")).await;
        let bob_private = send(&f.state, get_as(&uri("priv"), "bob", "bob-pw")).await;
        assert_eq!(bob_missing.0, StatusCode::FORBIDDEN);
        assert_eq!(bob_missing.2, ACCESS_DENIED_MESSAGE.as_bytes());
        assert_eq!(bob_missing.2, bob_private.2);
    }

    #[tokio::test]
    async fn bad_credentials_and_two_factor_are_challenged() {
        let f = fixture(|_| {}).await;
        let uri = "/alice/priv.git/info/refs?service=git-upload-pack";
        let (status, headers, _) = send(&f.state, get_as(uri, "alice", "wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(headers.contains_key(header::WWW_AUTHENTICATE));

        let alice = f.state.db.users().get_by_name("alice").await.unwrap();
        f.state.db.users().set_two_factor(alice.id, true).await.unwrap();
        let (status, _, _) = send(&f.state, get_as(uri, "alice", "alice-pw")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mirror_rejects_push_from_owner() {
        let f = fixture(|_| {}).await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/alice/mirror.git/git-receive-pack")
            .header(header::AUTHORIZATION, basic("alice", "alice-pw"))
            .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&f.state, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, ACCESS_DENIED_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn wrong_content_type_is_rejected() {
        let f = fixture(|_| {}).await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/alice/pub.git/git-upload-pack")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&f.state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn routing_and_feature_flag() {
        let f = fixture(|_| {}).await;
        assert_eq!(send(&f.state, get("/alice/pub.git/config")).await.0, StatusCode::NOT_FOUND);
        assert_eq!(
            send(&f.state, get("/alice/pub.git/git-upload-pack")).await.0,
            StatusCode::NOT_FOUND
        );

        let f = fixture(|c| c.repository.disable_http_git = true).await;
        let (status, _, _) = send(&f.state, get("/alice/pub.git/info/refs?service=git-upload-pack")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn forced_sign_in_challenges_public_reads() {
        let f = fixture(|c| c.auth.require_signin_view = true).await;
        let (status, _, _) = send(&f.state, get("/alice/pub.git/HEAD")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn collaborator_reads_private_static_files() {
        let f = fixture(|_| {}).await;
        let alice = f.state.db.users().get_by_name("alice").await.unwrap();
        let bob = f.state.db.users().get_by_name("bob").await.unwrap();
        let repo = f
            .state
            .db
            .repos()
            .get_by_owner_and_name(alice.id, "priv")
            .await
            .unwrap();
        f.state
            .db
            .repos()
            .set_collaborator(repo.id, bob.id, AccessMode::Read)
            .await
            .unwrap();
        let root = &f.state.config.repository.root;
        std::fs::write(root.join("alice/priv.git/HEAD"), "ref: refs/heads/main\n").unwrap();

        let (status, headers, body) = send(&f.state, get_as("/alice/priv.git/HEAD", "bob", "bob-pw")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache, max-age=0, must-revalidate");
        assert_eq!(body, b"ref: refs/heads/main\n");
    }

    #[tokio::test]
    async fn cors_preflight_short_circuits() {
        let f = fixture(|c| c.http.access_control_allow_origin = "https://example.com".into()).await;
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/alice/priv.git/info/refs")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&f.state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://example.com");
    }

    #[tokio::test]
    async fn anonymous_ref_advertisement_on_public_repo() {
        if !git_available() {
            return;
        }
        let f = fixture(|_| {}).await;
        let path = f.state.config.repository.root.join("alice/pub.git");
        std::fs::remove_dir_all(&path).unwrap();
        f.state.git.init_bare(&path).await.unwrap();

        let (status, headers, body) =
            send(&f.state, get("/alice/pub.git/info/refs?service=git-upload-pack")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!headers.contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "application/x-git-upload-pack-advertisement"
        );
        assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let f = fixture(|_| {}).await;
        send(&f.state, get("/alice/pub.git/HEAD")).await;
        let (status, _, body) = send(&f.state, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("gitgate_http_git_requests_total{endpoint=\"Static\"} 1"));
    }
}
