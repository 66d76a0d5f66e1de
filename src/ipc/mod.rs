//! Local callback channel between the wrapped process and the harness.
//!
//! One newline-terminated JSON object per connection, one JSON object back.
//! The socket lives in the run's scratch directory and exists only while
//! [`IpcServer::listen`] is running its block.

pub mod actions;

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

pub use actions::{IpcAction, IpcRegistry};

pub const SOCKET_NAME: &str = "atmos-ipc";
pub const CLIENT_SCRIPT_NAME: &str = "atmos-ipc-client";

pub const SOCK_ENV: &str = "ATMOS_IPC_SOCK";
pub const CLIENT_ENV: &str = "ATMOS_IPC_CLIENT";
/// Client command handed out when IPC is switched off; a shell no-op.
pub const DISABLED_CLIENT: &str = ":";

const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IPC server is already listening")]
    AlreadyListening,
    #[error("failed to bind IPC socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start IPC accept loop: {0}")]
    Spawn(#[source] io::Error),
}

pub struct IpcServer {
    sock_dir: PathBuf,
    registry: Arc<IpcRegistry>,
    listening: AtomicBool,
}

impl IpcServer {
    pub fn new(sock_dir: impl Into<PathBuf>, registry: Arc<IpcRegistry>) -> Self {
        Self {
            sock_dir: sock_dir.into(),
            registry,
            listening: AtomicBool::new(false),
        }
    }

    pub fn sock_dir(&self) -> &Path {
        &self.sock_dir
    }

    /// Serve requests while `block` runs, handing it the bound socket path.
    ///
    /// The accept loop is stopped and the socket file removed when the block
    /// returns, including when it panics.
    pub fn listen<T>(&self, block: impl FnOnce(&Path) -> T) -> Result<T, IpcError> {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IpcError::AlreadyListening);
        }

        let started = bind_socket(&self.sock_dir)
            .and_then(|(listener, path)| AcceptLoop::start(listener, path, self.registry.clone()));
        let accept_loop = match started {
            Ok(accept_loop) => accept_loop,
            Err(e) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let guard = ListenGuard {
            server: self,
            accept_loop,
        };
        info!(socket = %guard.accept_loop.path.display(), "ipc server listening");
        Ok(block(&guard.accept_loop.path))
    }

    /// Write the helper executable the wrapped process uses to send one
    /// request. `socket_path` is baked in as the fallback when
    /// `ATMOS_IPC_SOCK` is not set.
    pub fn generate_client_script(&self, socket_path: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.sock_dir)?;
        let script = self.sock_dir.join(CLIENT_SCRIPT_NAME);
        fs::write(&script, client_script(socket_path))?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;
        debug!(path = %script.display(), "generated ipc client script");
        Ok(script)
    }
}

struct ListenGuard<'a> {
    server: &'a IpcServer,
    accept_loop: AcceptLoop,
}

impl Drop for ListenGuard<'_> {
    fn drop(&mut self) {
        self.accept_loop.stop();
        self.server.listening.store(false, Ordering::SeqCst);
    }
}

struct AcceptLoop {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AcceptLoop {
    fn start(
        listener: UnixListener,
        path: PathBuf,
        registry: Arc<IpcRegistry>,
    ) -> Result<Self, IpcError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let spawned = thread::Builder::new()
            .name("atmos-ipc".to_string())
            .spawn(move || accept_connections(listener, &registry, &stop_flag));

        match spawned {
            Ok(handle) => Ok(Self {
                path,
                stop,
                thread: Some(handle),
            }),
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(IpcError::Spawn(e))
            }
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // accept() only returns on a connection, so knock once.
        let woke = UnixStream::connect(&self.path).is_ok();
        if let Some(handle) = self.thread.take() {
            if woke {
                if handle.join().is_err() {
                    warn!("ipc accept thread panicked");
                }
            } else {
                warn!(socket = %self.path.display(), "could not wake ipc accept thread; detaching it");
            }
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(socket = %self.path.display(), "removed ipc socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = %self.path.display(), error = %e, "failed to remove ipc socket"),
        }
    }
}

fn accept_connections(listener: UnixListener, registry: &IpcRegistry, stop: &AtomicBool) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_connection(stream, registry) {
                    debug!(error = %e, "ipc connection ended with error");
                }
            }
            Err(e) => debug!(error = %e, "ipc accept failed"),
        }
    }
}

fn handle_connection(stream: UnixStream, registry: &IpcRegistry) -> io::Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Ok(());
    }

    let response = match String::from_utf8(line) {
        Ok(line) => registry.respond(&line),
        Err(e) => actions::error_reply(format!("IPC message is not valid UTF-8: {e}")),
    };
    let mut payload = serde_json::to_string(&response).map_err(io::Error::other)?;
    payload.push('\n');

    let mut writer = stream;
    writer.write_all(payload.as_bytes())?;
    writer.flush()
}

/// Bind `<dir>/atmos-ipc`, falling back once to a unique name in the system
/// temp directory when the preferred path is too long for a socket address.
fn bind_socket(dir: &Path) -> Result<(UnixListener, PathBuf), IpcError> {
    let preferred = dir.join(SOCKET_NAME);
    match bind_at(&preferred) {
        Ok(listener) => Ok((listener, preferred)),
        Err(e) if is_path_too_long(&e) => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            let fallback = std::env::temp_dir().join(format!("{SOCKET_NAME}-{}", &id[..12]));
            warn!(
                preferred = %preferred.display(),
                fallback = %fallback.display(),
                "ipc socket path too long, using temp directory"
            );
            match bind_at(&fallback) {
                Ok(listener) => Ok((listener, fallback)),
                Err(source) => Err(IpcError::Bind {
                    path: fallback,
                    source,
                }),
            }
        }
        Err(source) => Err(IpcError::Bind {
            path: preferred,
            source,
        }),
    }
}

fn bind_at(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // A socket left behind by a killed run would make bind fail.
    match fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "removed stale ipc socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

fn is_path_too_long(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::InvalidInput || e.raw_os_error() == Some(libc::ENAMETOOLONG)
}

fn client_script(socket_path: &Path) -> String {
    let default_socket = shell_quote(&socket_path.to_string_lossy());
    format!(
        r#"#!/bin/sh
# Send one JSON request line to the atmos IPC socket and print the reply.
# Usage: {CLIENT_SCRIPT_NAME} '{{"action": "ping"}}'   (or pipe the line on stdin)
if [ $# -gt 0 ]; then
  line="$1"
else
  IFS= read -r line
fi
sock=${{{SOCK_ENV}:-}}
[ -n "$sock" ] || sock={default_socket}
command -v python3 >/dev/null 2>&1 || {{
  echo '{{"error":"python3 not found"}}'
  exit 1
}}
exec python3 -c '
import socket, sys
path, line = sys.argv[1], sys.argv[2]
sock = socket.socket(socket.AF_UNIX, socket.SOCK_STREAM)
sock.connect(path)
sock.sendall((line.strip() + "\n").encode("utf-8"))
reply = b""
while not reply.endswith(b"\n"):
    data = sock.recv(4096)
    if not data:
        break
    reply += data
sock.close()
sys.stdout.write(reply.decode("utf-8"))
' "$sock" "$line"
"#
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
