//! Smart-protocol endpoints: ref advertisement and stateless RPC.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use flate2::write::GzDecoder;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_stream::{Stream, StreamExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, warn};

use super::dumb;
use super::handler::AppError;
use super::routes::RouteKind;
use crate::error::GatewayError;
use crate::git::{pktline, process::bounded, GitService, HookEnv};
use crate::metrics::{Endpoint, RequestLabels};
use crate::push;
use crate::AppState;

// ---------------------------------------------------------------------------
// Ref advertisement
// ---------------------------------------------------------------------------

/// `GET info/refs`. Without a usable `service` the dumb `info/refs` file is
/// regenerated and served instead.
#[instrument(skip(state), fields(repo = %repo_path.display()))]
pub async fn info_refs(
    state: &AppState,
    service: Option<GitService>,
    repo_path: &Path,
    git_protocol: Option<&str>,
) -> Result<Response, AppError> {
    let Some(service) = service else {
        state.git.update_server_info(repo_path).await?;
        return dumb::send_file(RouteKind::InfoRefs, repo_path, "info/refs").await;
    };

    let refs = state.git.advertise_refs(service, repo_path, git_protocol).await?;
    let prefix = pktline::service_header(service.subcommand())?;
    let mut body = BytesMut::with_capacity(prefix.len() + refs.len());
    body.extend_from_slice(&prefix);
    body.extend_from_slice(&refs);

    let mut response = (StatusCode::OK, body.freeze()).into_response();
    let headers = response.headers_mut();
    dumb::set_no_cache(headers);
    if let Ok(ct) = HeaderValue::from_str(&format!(
        "application/x-git-{}-advertisement",
        service.subcommand()
    )) {
        headers.insert(header::CONTENT_TYPE, ct);
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Stateless RPC
// ---------------------------------------------------------------------------

/// `POST git-upload-pack` / `POST git-receive-pack`.
///
/// The request body is fed to git's stdin and git's stdout is streamed back
/// as it is produced. A waiter task owns the child: it reaps it, runs the
/// push reaction for a successful receive-pack, and kills git if the client
/// goes away before the response is finished.
pub async fn serve_rpc(
    state: Arc<AppState>,
    service: GitService,
    repo_path: PathBuf,
    headers: &HeaderMap,
    body: Body,
    hook_env: Option<HookEnv>,
    git_protocol: Option<String>,
) -> Result<Response, AppError> {
    let expected = format!("application/x-git-{}-request", service.subcommand());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != expected {
        return Err(GatewayError::ProtocolMalformed(format!(
            "content-type '{content_type}' is not '{expected}'"
        ))
        .into());
    }
    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"));

    let mut envs = hook_env.as_ref().map(HookEnv::to_env).unwrap_or_default();
    if let Some(proto) = git_protocol {
        envs.push(("GIT_PROTOCOL".to_string(), proto));
    }

    let mut child = state.git.spawn_stateless_rpc(service, &repo_path, &envs)?;
    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(GatewayError::SubprocessFailure(format!("{service} stdio was not piped")).into());
    };

    tokio::spawn(async move {
        if let Err(e) = feed_body(body, &mut stdin, gzip).await {
            debug!(error = %e, "stopped feeding request body");
        }
        // `stdin` drops here, giving git its EOF.
    });

    let cancel = CancellationToken::new();
    tokio::spawn(wait_rpc(
        Arc::clone(&state),
        service,
        child,
        stderr,
        hook_env,
        cancel.clone(),
    ));

    let stream = ResponseStream {
        inner: ReaderStream::new(stdout),
        guard: Some(cancel.drop_guard()),
    };
    let mut response = (StatusCode::OK, Body::from_stream(stream)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(RouteKind::Rpc(service).content_type()),
    );
    dumb::set_no_cache(headers);
    Ok(response)
}

/// Copy the request body into `sink`, gunzipping on the way when asked.
pub async fn feed_body<W: AsyncWrite + Unpin>(body: Body, sink: &mut W, gzip: bool) -> std::io::Result<()> {
    let mut chunks = body.into_data_stream();
    let mut decoder = gzip.then(|| GzDecoder::new(Vec::new()));

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(std::io::Error::other)?;
        match decoder.as_mut() {
            Some(decoder) => {
                decoder.write_all(&chunk)?;
                let plain = std::mem::take(decoder.get_mut());
                sink.write_all(&plain).await?;
            }
            None => sink.write_all(&chunk).await?,
        }
    }
    if let Some(mut decoder) = decoder {
        decoder.try_finish()?;
        let plain = std::mem::take(decoder.get_mut());
        sink.write_all(&plain).await?;
    }
    sink.flush().await
}

#[instrument(skip_all, fields(%service))]
async fn wait_rpc(
    state: Arc<AppState>,
    service: GitService,
    mut child: Child,
    mut stderr: ChildStderr,
    hook_env: Option<HookEnv>,
    cancel: CancellationToken,
) {
    let metrics = &state.metrics.metrics;
    let started = Instant::now();
    metrics.active_subprocesses.inc();

    let mut diagnostics = Vec::new();
    let finished = tokio::select! {
        res = bounded(state.git.timeout(), async {
            let (_, status) = tokio::join!(stderr.read_to_end(&mut diagnostics), child.wait());
            status
        }) => res.ok(),
        () = cancel.cancelled() => None,
    };
    let status = match finished {
        Some(status) => status,
        None => {
            warn!("terminating git before it finished");
            let _ = child.start_kill();
            child.wait().await
        }
    };

    metrics.active_subprocesses.dec();
    let endpoint = match service {
        GitService::ReceivePack => Endpoint::ReceivePack,
        _ => Endpoint::UploadPack,
    };
    metrics
        .rpc_duration_seconds
        .get_or_create(&RequestLabels { endpoint })
        .observe(started.elapsed().as_secs_f64());

    let success = matches!(&status, Ok(s) if s.success());
    if !success {
        error!(
            status = ?status,
            stderr = %String::from_utf8_lossy(&diagnostics).trim(),
            "stateless rpc failed"
        );
    }

    let Some(env) = hook_env else {
        return;
    };
    if success {
        let effects = state.push_effects();
        match push::react(&state.db, &effects, &env).await {
            Ok(applied) => {
                metrics.push_tasks_applied.inc_by(applied as u64);
                info!(push_id = %env.push_id, applied, "push reaction complete");
            }
            Err(e) => error!(push_id = %env.push_id, error = %e, "push reaction failed"),
        }
    } else if let Err(e) = push::discard(&state.db, &env.push_id).await {
        error!(push_id = %env.push_id, error = %e, "failed to discard update tasks");
    }
}

/// git's stdout as a body stream. Dropping it before EOF (client gone)
/// cancels the waiter, which kills git.
struct ResponseStream {
    inner: ReaderStream<ChildStdout>,
    guard: Option<DropGuard>,
}

impl Stream for ResponseStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(Pin::new(&mut self.inner).poll_next(cx));
        if item.is_none() {
            if let Some(guard) = self.guard.take() {
                guard.disarm();
            }
        }
        Poll::Ready(item)
    }
}
