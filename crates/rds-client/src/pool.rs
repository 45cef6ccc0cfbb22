//! Bounded pool of SSH sessions to the appliance.
//!
//! ssh2 is a blocking transport, so every operation that touches a session
//! runs under `tokio::task::spawn_blocking`. The pool hands out at most
//! `max_sessions` concurrent sessions through a FIFO semaphore, keeps
//! completed sessions for reuse, and discards a session on any transport
//! error; replacements are opened lazily by the next caller.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use ssh2::Session;
use tracing::{debug, warn};

use crate::error::Error;

/// Connection settings for the appliance management interface.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Management address of the appliance.
    pub address: String,
    /// SSH port.
    pub port: u16,
    /// User to authenticate as.
    pub username: String,
    /// Path to the private key used for authentication.
    pub private_key: PathBuf,
    /// Path to the pinned host public key, OpenSSH single-line format.
    pub host_key: Option<PathBuf>,
    /// Skip host key verification. Test deployments only.
    pub insecure_skip_host_key: bool,
    /// Sessions opened eagerly by [`SessionPool::connect`].
    pub min_sessions: usize,
    /// Upper bound on concurrent sessions.
    pub max_sessions: usize,
    /// How long a caller waits for a free session slot.
    pub acquire_timeout: Duration,
    /// TCP connect and per-operation SSH timeout.
    pub connect_timeout: Duration,
}

impl SshConfig {
    /// Settings with the defaults used by the driver.
    pub fn new(address: impl Into<String>, username: impl Into<String>, private_key: PathBuf) -> Self {
        SshConfig {
            address: address.into(),
            port: 22,
            username: username.into(),
            private_key,
            host_key: None,
            insecure_skip_host_key: false,
            min_sessions: 1,
            max_sessions: 4,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub(crate) struct SessionPool {
    config: SshConfig,
    idle: Mutex<Vec<Session>>,
    slots: tokio::sync::Semaphore,
    connected: AtomicBool,
}

impl SessionPool {
    pub(crate) fn new(config: SshConfig) -> Self {
        let max = config.max_sessions.max(1);
        SessionPool {
            config,
            idle: Mutex::new(Vec::new()),
            slots: tokio::sync::Semaphore::new(max),
            connected: AtomicBool::new(false),
        }
    }

    /// Eagerly opens `min_sessions` sessions so the first command does not
    /// pay the handshake cost.
    pub(crate) async fn connect(&self) -> Result<(), Error> {
        for _ in 0..self.config.min_sessions.min(self.config.max_sessions) {
            let config = self.config.clone();
            let session = tokio::task::spawn_blocking(move || dial(&config))
                .await
                .map_err(|e| Error::Internal(format!("session dial task failed: {}", e)))??;
            self.push_idle(session);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes all idle sessions. In-flight sessions are discarded by their
    /// borrowers on completion since the pool is marked disconnected.
    pub(crate) async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let sessions: Vec<Session> = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.drain(..).collect()
        };
        if sessions.is_empty() {
            return;
        }
        let _ = tokio::task::spawn_blocking(move || {
            for session in sessions {
                let _ = session.disconnect(None, "client shutting down", None);
            }
        })
        .await;
    }

    /// Runs one command on a pooled session and returns the combined output.
    pub(crate) async fn exec(&self, command: &str) -> Result<String, Error> {
        let permit = tokio::time::timeout(self.config.acquire_timeout, self.slots.acquire())
            .await
            .map_err(|_| {
                Error::Unavailable(format!(
                    "timed out after {:?} waiting for an appliance session",
                    self.config.acquire_timeout
                ))
            })?
            .map_err(|_| Error::Internal("session pool is shut down".into()))?;

        let session = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.pop()
        };

        let config = self.config.clone();
        let command = command.to_owned();
        let result = tokio::task::spawn_blocking(move || {
            let session = match session {
                Some(s) => s,
                None => dial(&config)?,
            };
            match run_command(&session, &command) {
                Ok(output) => Ok((session, output)),
                // The session state is unknown after a transport error;
                // drop it instead of returning it to the pool.
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("command task failed: {}", e)))?;

        drop(permit);

        match result {
            Ok((session, output)) => {
                self.connected.store(true, Ordering::SeqCst);
                self.push_idle(session);
                Ok(output)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    fn push_idle(&self, session: Session) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.config.max_sessions {
            idle.push(session);
        }
        // A full idle list means the session is surplus; dropping it closes
        // the underlying stream.
    }
}

fn dial(config: &SshConfig) -> Result<Session, Error> {
    let addr = (config.address.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| Error::Unavailable(format!("cannot resolve {}: {}", config.address, e)))?
        .next()
        .ok_or_else(|| {
            Error::Unavailable(format!("no address resolved for {}", config.address))
        })?;

    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)
        .map_err(|e| Error::Unavailable(format!("connect to appliance failed: {}", e)))?;

    let mut session =
        Session::new().map_err(|e| Error::Internal(format!("ssh session init failed: {}", e)))?;
    session.set_tcp_stream(stream);
    session.set_timeout(config.connect_timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| Error::Unavailable(format!("ssh handshake failed: {}", e)))?;

    verify_host_key(&session, config)?;

    session
        .userauth_pubkey_file(&config.username, None, &config.private_key, None)
        .map_err(|e| Error::Internal(format!("ssh authentication failed: {}", e)))?;
    if !session.authenticated() {
        return Err(Error::Internal("ssh authentication was not accepted".into()));
    }

    debug!(address = %config.address, "opened appliance session");
    Ok(session)
}

// Compares the presented host key against the pinned public key file.
// Fail-closed: a missing pin is as fatal as a mismatch unless verification
// is explicitly disabled.
fn verify_host_key(session: &Session, config: &SshConfig) -> Result<(), Error> {
    if config.insecure_skip_host_key {
        warn!("host key verification disabled; do not use outside test deployments");
        return Ok(());
    }

    let pin_path = config.host_key.as_ref().ok_or_else(|| {
        Error::HostKeyMismatch("no host key pinned and verification is enabled".into())
    })?;
    let pinned = std::fs::read_to_string(pin_path)
        .map_err(|e| Error::Internal(format!("cannot read pinned host key: {}", e)))?;
    let pinned = parse_openssh_public_key(&pinned)?;

    let (presented, _) = session.host_key().ok_or_else(|| {
        Error::HostKeyMismatch("appliance presented no host key".into())
    })?;

    if presented != pinned.as_slice() {
        let fingerprint = session
            .host_key_hash(ssh2::HashType::Sha256)
            .map(|h| format!("SHA256:{}", base64::encode(h)))
            .unwrap_or_else(|| "unknown".into());
        return Err(Error::HostKeyMismatch(format!(
            "presented key {} does not match the pinned key",
            fingerprint
        )));
    }
    Ok(())
}

// Accepts the single-line OpenSSH format: `<type> <base64> [comment]`.
fn parse_openssh_public_key(contents: &str) -> Result<Vec<u8>, Error> {
    let line = contents
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| Error::Internal("pinned host key file is empty".into()))?;
    let blob = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::Internal("pinned host key is not in OpenSSH format".into()))?;
    base64::decode(blob)
        .map_err(|e| Error::Internal(format!("pinned host key is not valid base64: {}", e)))
}

fn run_command(session: &Session, command: &str) -> Result<String, Error> {
    let mut channel = session
        .channel_session()
        .map_err(|e| Error::Unavailable(format!("opening ssh channel failed: {}", e)))?;
    channel
        .exec(command)
        .map_err(|e| Error::Unavailable(format!("sending command failed: {}", e)))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| Error::Unavailable(format!("reading command output failed: {}", e)))?;
    let mut stderr = String::new();
    let _ = channel.stderr().read_to_string(&mut stderr);

    let _ = channel.wait_close();

    if stderr.trim().is_empty() {
        Ok(stdout)
    } else if stdout.trim().is_empty() {
        Ok(stderr)
    } else {
        Ok(format!("{}\n{}", stdout, stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openssh_key_parsing() {
        let blob = base64::encode(b"key-material");
        let line = format!("ssh-ed25519 {} admin@rds\n", blob);
        assert_eq!(
            parse_openssh_public_key(&line).unwrap(),
            b"key-material".to_vec()
        );

        assert!(parse_openssh_public_key("").is_err());
        assert!(parse_openssh_public_key("# comment only\n").is_err());
        assert!(parse_openssh_public_key("ssh-ed25519").is_err());
        assert!(parse_openssh_public_key("ssh-ed25519 not-base-64!!").is_err());
    }

    #[tokio::test]
    async fn exec_times_out_when_no_slot_frees_up() {
        let mut config = SshConfig::new("192.0.2.1", "admin", PathBuf::from("/dev/null"));
        config.max_sessions = 1;
        config.acquire_timeout = Duration::from_millis(50);
        let pool = SessionPool::new(config);

        // Hold the only permit so exec cannot acquire one.
        let permit = pool.slots.acquire().await.unwrap();
        let err = pool.exec("/disk print detail").await.unwrap_err();
        assert!(err.is_retryable(), "slot wait timeout must be retryable");
        drop(permit);
    }

    #[tokio::test]
    async fn dial_failure_is_unavailable() {
        // TEST-NET address with an immediate connect timeout.
        let mut config = SshConfig::new("192.0.2.1", "admin", PathBuf::from("/dev/null"));
        config.connect_timeout = Duration::from_millis(50);
        config.acquire_timeout = Duration::from_millis(500);
        let pool = SessionPool::new(config);

        let err = pool.exec("/disk print detail").await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "got {:?}", err);
        assert!(!pool.is_connected());
    }
}
