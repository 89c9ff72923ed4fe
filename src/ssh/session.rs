//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Public-key auth only records which stored key matched. Every exec request
//! then re-runs this executable as `gitgate serv key-<id>`, the same entry
//! point a system sshd forced command uses, and pipes the channel to it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::credentials;
use crate::git;
use crate::metrics::{Protocol, ProtocolLabels};
use crate::AppState;

/// Environment variable carrying the client's command to the dispatcher.
pub const SSH_ORIGINAL_COMMAND: &str = "SSH_ORIGINAL_COMMAND";

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct ChannelIo {
    /// Feeds the channel's stdin writer task. Dropping it closes the child's
    /// stdin once queued data is written.
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    cancel: CancellationToken,
}

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    /// Id of the stored key that passed public-key auth.
    key_id: Option<i64>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
    channels: HashMap<ChannelId, ChannelIo>,
}

impl SshSession {
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            key_id: None,
            git_protocol: None,
            channels: HashMap::new(),
        }
    }

    /// Spawn the dispatcher for one channel and start bridging it.
    fn start_dispatcher(&mut self, channel_id: ChannelId, command: &str, session: &mut Session) {
        let Some(key_id) = self.key_id else {
            warn!(peer = ?self.peer_addr, "exec request before authentication");
            finish_channel(session, channel_id, 1);
            return;
        };

        let mut cmd = match dispatcher_command(&self.state, key_id, command, self.git_protocol.as_deref()) {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(error = %e, "failed to build dispatcher command");
                reject(session, channel_id);
                return;
            }
        };
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to spawn dispatcher");
                reject(session, channel_id);
                return;
            }
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            error!("dispatcher stdio was not piped");
            reject(session, channel_id);
            return;
        };

        // The session loop only queues client data; a child that stops
        // reading its stdin must not stall the connection.
        let stdin = child.stdin.take().map(|pipe| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(feed_stdin(pipe, rx));
            tx
        });

        let cancel = CancellationToken::new();
        self.channels.insert(
            channel_id,
            ChannelIo {
                stdin,
                cancel: cancel.clone(),
            },
        );

        let handle = session.handle();
        let metrics = self.state.metrics.clone();
        metrics.metrics.active_subprocesses.inc();

        tokio::spawn(async move {
            let bridged = async {
                tokio::join!(
                    pump(stdout, &handle, channel_id, None),
                    pump(stderr, &handle, channel_id, Some(1)),
                );
                child.wait().await
            };

            let exit_code = tokio::select! {
                status = bridged => match status {
                    Ok(status) => status.code().unwrap_or(1) as u32,
                    Err(e) => {
                        error!(error = %e, "failed to wait for dispatcher");
                        1
                    }
                },
                () = cancel.cancelled() => {
                    debug!(channel = ?channel_id, "client went away; killing dispatcher");
                    let _ = child.kill().await;
                    metrics.metrics.active_subprocesses.dec();
                    return;
                }
            };
            metrics.metrics.active_subprocesses.dec();

            // RFC 4254: exit-status, then EOF, then close.
            let _ = handle.exit_status_request(channel_id, exit_code).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        for io in self.channels.values() {
            io.cancel.cancel();
        }
    }
}

/// `gitgate serv key-<id> --config <path>` with the command in the
/// environment.
pub fn dispatcher_command(
    state: &AppState,
    key_id: i64,
    command: &str,
    git_protocol: Option<&str>,
) -> Result<Command> {
    let mut cmd = Command::new(state.config.app_path()?);
    cmd.arg("serv")
        .arg(format!("key-{key_id}"))
        .arg("--config")
        .arg(&state.config_path)
        .env(SSH_ORIGINAL_COMMAND, command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(proto) = git_protocol {
        cmd.env("GIT_PROTOCOL", proto);
    }
    Ok(cmd)
}

/// Write queued client data to the child until the queue closes, then drop
/// the pipe so the child sees EOF.
async fn feed_stdin<W: AsyncWrite + Unpin>(mut pipe: W, mut queue: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(buf) = queue.recv().await {
        if let Err(e) = pipe.write_all(&buf).await {
            debug!(error = %e, "dispatcher stdin closed");
            return;
        }
    }
    let _ = pipe.shutdown().await;
}

/// Copy a child pipe to the channel until EOF, as extended data when `ext`
/// is set.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, handle: &Handle, channel_id: ChannelId, ext: Option<u32>) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "dispatcher pipe read failed");
                break;
            }
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match ext {
            Some(code) => handle.extended_data(channel_id, code, data).await,
            None => handle.data(channel_id, data).await,
        };
        if sent.is_err() {
            break;
        }
    }
}

fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

fn reject(session: &mut Session, channel_id: ChannelId) {
    session.extended_data(channel_id, 1, CryptoVec::from_slice(b"gitgate: Internal error\n"));
    finish_channel(session, channel_id, 1);
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        match credentials::lookup_ssh_key(&self.state.db, key).await {
            Ok(Some(stored)) => {
                info!(peer = ?self.peer_addr, %user, key_id = stored.id, "SSH key accepted");
                self.key_id = Some(stored.id);
                Ok(Auth::Accept)
            }
            Ok(None) => {
                debug!(peer = ?self.peer_addr, %user, "unknown SSH key");
                self.state
                    .metrics
                    .metrics
                    .auth_failures
                    .get_or_create(&ProtocolLabels {
                        protocol: Protocol::Ssh,
                    })
                    .inc();
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
            Err(e) => {
                error!(error = %e, "SSH key lookup failed");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Only `GIT_PROTOCOL` is kept; git uses it to ask for protocol v2.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        } else {
            debug!(name = %variable_name, "ignoring SSH env request");
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data);
        let command = git::clean_command(&raw);
        info!(peer = ?self.peer_addr, key_id = ?self.key_id, %command, "SSH exec request");
        self.state.metrics.metrics.ssh_exec_requests.inc();

        session.channel_success(channel_id);
        self.start_dispatcher(channel_id, command, session);
        Ok(())
    }

    /// No shells: the dispatcher prints its greeting and exits.
    async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        session.channel_success(channel_id);
        self.start_dispatcher(channel_id, "", session);
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(io) = self.channels.get_mut(&channel_id) {
            if let Some(stdin) = io.stdin.as_ref() {
                if stdin.send(data.to_vec()).is_err() {
                    debug!(channel = ?channel_id, "dispatcher stdin writer gone");
                    io.stdin = None;
                }
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender lets the writer drain and then close stdin.
        if let Some(io) = self.channels.get_mut(&channel_id) {
            io.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(io) = self.channels.remove(&channel_id) {
            io.cancel.cancel();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
