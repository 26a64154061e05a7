use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::BusStream;

/// Connect to a listening endpoint (blocking).
pub fn connect(endpoint: &Endpoint) -> Result<BusStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
                TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    source: e,
                }
            })?;
            debug!(?path, "connected to unix domain socket");
            Ok(BusStream::from_unix(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(TransportError::Unsupported(endpoint.to_string())),
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: e,
            })?;
            debug!(%addr, "connected to tcp bridge");
            Ok(BusStream::from_tcp(stream))
        }
    }
}

/// Accepts bus connections on an endpoint.
///
/// Unix sockets are created with restrictive permissions, stale sockets are
/// replaced, and the socket file is removed on drop if it is still ours.
pub struct BusListener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

enum ListenerInner {
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
        created_inode: Option<(u64, u64)>,
    },
    Tcp(TcpListener),
}

impl BusListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on an endpoint.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => Self::bind_unix(path, Self::DEFAULT_SOCKET_MODE),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Unsupported(endpoint.to_string())),
            Endpoint::Tcp(addr) => {
                let listener =
                    TcpListener::bind(addr.as_str()).map_err(|e| TransportError::Bind {
                        endpoint: endpoint.to_string(),
                        source: e,
                    })?;
                // Report the real port when binding to port 0.
                let bound = listener
                    .local_addr()
                    .map(|a| Endpoint::Tcp(a.to_string()))
                    .unwrap_or_else(|_| endpoint.clone());
                info!(endpoint = %bound, "listening on tcp");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    endpoint: bound,
                })
            }
        }
    }

    #[cfg(unix)]
    fn bind_unix(path: &Path, mode: u32) -> Result<Self> {
        let path = path.to_path_buf();
        let endpoint = Endpoint::Unix(path.clone());
        let bind_err = |source| TransportError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove a stale socket, but never anything that is not a socket.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            inner: ListenerInner::Unix {
                listener,
                path,
                created_inode: Some((created.dev(), created.ino())),
            },
            endpoint,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<BusStream> {
        match &self.inner {
            #[cfg(unix)]
            ListenerInner::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!("accepted unix connection");
                Ok(BusStream::from_unix(stream))
            }
            ListenerInner::Tcp(listener) => {
                let (stream, addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!(%addr, "accepted tcp connection");
                Ok(BusStream::from_tcp(stream))
            }
        }
    }

    /// The endpoint this listener is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ListenerInner::Unix {
            path,
            created_inode: Some((expected_dev, expected_ino)),
            ..
        } = &self.inner
        {
            if let Ok(metadata) = std::fs::symlink_metadata(path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == *expected_dev
                    && metadata.ino() == *expected_ino
                {
                    debug!(?path, "cleaning up socket file");
                    let _ = std::fs::remove_file(path);
                } else {
                    debug!(?path, "socket path identity changed; skipping cleanup");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("busmux-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn unix_bind_accept_connect() {
        let dir = temp_dir("uds");
        let sock_path = dir.join("bus.sock");
        let endpoint = Endpoint::Unix(sock_path.clone());

        let listener = BusListener::bind(&endpoint).unwrap();
        assert!(sock_path.exists());

        let client_endpoint = endpoint.clone();
        let handle = std::thread::spawn(move || {
            let mut client = connect(&client_endpoint).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        handle.join().unwrap();

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be cleaned up on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tcp_bind_reports_real_port() {
        let listener = BusListener::bind(&Endpoint::Tcp("127.0.0.1:0".to_string())).unwrap();
        let endpoint = listener.endpoint().clone();
        assert!(!endpoint.to_string().ends_with(":0"));

        let handle = std::thread::spawn(move || {
            let mut client = connect(&endpoint).unwrap();
            client.write_all(b"tcp").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"tcp");
        assert_eq!(server.transport_name(), "tcp");
        handle.join().unwrap();
    }

    #[test]
    fn path_too_long_rejected() {
        let long_path = PathBuf::from("/tmp/".to_string() + &"a".repeat(200) + ".sock");
        let result = BusListener::bind(&Endpoint::Unix(long_path));
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn default_permissions_hardened() {
        let dir = temp_dir("perms");
        let sock_path = dir.join("perm.sock");

        let listener = BusListener::bind(&Endpoint::Unix(sock_path.clone())).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_rejects_existing_regular_file() {
        let dir = temp_dir("regular");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = BusListener::bind(&Endpoint::Unix(sock_path.clone()));
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let endpoint = Endpoint::Unix(PathBuf::from("/tmp/busmux-definitely-missing.sock"));
        let err = connect(&endpoint).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
