//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::{cipher, MethodSet, Preferred};
use russh_keys::key::KeyPair;
use tracing::{info, warn};

use super::session::SshSession;
use crate::AppState;

const HOST_KEY_FILE: &str = "gitgate_ed25519";

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        self.state.metrics.metrics.ssh_sessions.inc();
        SshSession::new(Arc::clone(&self.state), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the Ed25519 host key from `dir`, generating and persisting one on
/// first start.
pub fn load_or_generate_host_key(dir: &Path) -> Result<KeyPair> {
    let path = dir.join(HOST_KEY_FILE);
    if path.is_file() {
        let key = russh_keys::load_secret_key(&path, None)
            .with_context(|| format!("failed to load SSH host key {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create host key dir {}", dir.display()))?;
    let key = KeyPair::generate_ed25519();
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode SSH host key")?;
    std::fs::write(&path, pem)
        .with_context(|| format!("failed to write SSH host key {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to chmod {}", path.display()))?;
    }
    warn!(path = %path.display(), "generated new SSH host key");
    Ok(key)
}

// ---------------------------------------------------------------------------
// Algorithms
// ---------------------------------------------------------------------------

fn cipher_by_name(name: &str) -> Option<cipher::Name> {
    match name {
        "chacha20-poly1305@openssh.com" => Some(cipher::CHACHA20_POLY1305),
        "aes256-gcm@openssh.com" => Some(cipher::AES_256_GCM),
        "aes256-ctr" => Some(cipher::AES_256_CTR),
        "aes192-ctr" => Some(cipher::AES_192_CTR),
        "aes128-ctr" => Some(cipher::AES_128_CTR),
        _ => None,
    }
}

/// Algorithm preferences with the configured cipher list. Unknown names are
/// skipped; an empty result keeps the library defaults.
pub fn preferred_algorithms(ciphers: &[String]) -> Preferred {
    let selected: Vec<cipher::Name> = ciphers
        .iter()
        .filter_map(|name| {
            let found = cipher_by_name(name);
            if found.is_none() {
                warn!(cipher = %name, "ignoring unsupported SSH cipher");
            }
            found
        })
        .collect();

    if selected.is_empty() {
        return Preferred::DEFAULT;
    }
    Preferred {
        cipher: Cow::Owned(selected),
        ..Preferred::DEFAULT
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  This function runs until the server is shut down
/// or an unrecoverable error occurs.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let ssh = &state.config.ssh;
    let host_key = load_or_generate_host_key(&ssh.host_key_dir)?;

    let config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        preferred: preferred_algorithms(&ssh.ciphers),
        inactivity_timeout: Some(Duration::from_secs(ssh.inactivity_timeout_secs)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 6,
        ..Default::default()
    });

    let host = ssh.listen_host.clone();
    let port = ssh.listen_port;
    info!(%host, port, "starting SSH server");

    let mut ssh_server = SshServer::new(Arc::clone(&state));
    ssh_server
        .run_on_address(config, (host.as_str(), port))
        .await
        .context("SSH server exited with error")?;

    Ok(())
}
