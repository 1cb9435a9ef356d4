// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Private local endpoints between the host and the worker.
//!
//! On Unix an endpoint is a Unix domain socket in the temporary directory; on Windows it is a
//! named pipe. Either way, an endpoint is identified by an [`EndpointAddress`] and accepts
//! exactly one connection.

use crate::errors::EndpointError;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::io::{AsyncRead, AsyncWrite};

/// The address of a local endpoint: a socket path or a pipe name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointAddress(String);

impl EndpointAddress {
    /// Creates an address from a string, such as one passed on the command line.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Returns the address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out unique endpoint addresses.
///
/// Addresses have the form `nodetest.<pid>-<counter>.sock`, so endpoints from different host
/// processes and from successive runs within one process never collide.
#[derive(Debug)]
pub struct EndpointAllocator {
    dir: Utf8PathBuf,
    pid: u32,
    counter: AtomicU64,
}

impl EndpointAllocator {
    /// Creates an allocator that places Unix sockets in `dir`.
    ///
    /// On Windows, `dir` is ignored: pipes live in the `\\.\pipe\` namespace.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pid: std::process::id(),
            counter: AtomicU64::new(0),
        }
    }

    /// Creates an allocator that places Unix sockets in the system temporary directory.
    pub fn in_temp_dir() -> Result<Self, EndpointError> {
        let dir = std::env::temp_dir();
        let dir = Utf8PathBuf::try_from(dir)
            .map_err(|error| EndpointError::TempDirNotUtf8(error.into_path_buf()))?;
        Ok(Self::new(dir))
    }

    /// Returns the next unused address.
    pub fn allocate(&self) -> EndpointAddress {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("nodetest.{}-{counter}.sock", self.pid);
        imp::address_for(&self.dir, &name)
    }
}

/// One end of an established connection, split into independently owned halves.
pub struct Connection {
    /// The read half.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,

    /// The write half.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Connection {
    /// Creates a connection from a pair of halves.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// A bound endpoint waiting for the worker to connect.
///
/// Dropping the listener removes the endpoint from the filesystem.
#[derive(Debug)]
pub struct EndpointListener {
    address: EndpointAddress,
    inner: imp::Listener,
}

impl EndpointListener {
    /// Binds a listener at `address`.
    pub fn bind(address: EndpointAddress) -> Result<Self, EndpointError> {
        let inner = imp::Listener::bind(&address).map_err(|error| EndpointError::Bind {
            address: address.to_string(),
            error,
        })?;
        Ok(Self { address, inner })
    }

    /// Returns the address this listener is bound to.
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Waits for a connection.
    ///
    /// This future is cancel-safe.
    pub async fn accept(&mut self) -> Result<Connection, EndpointError> {
        self.inner
            .accept()
            .await
            .map_err(|error| EndpointError::Accept {
                address: self.address.to_string(),
                error,
            })
    }
}

/// Connects to a listening endpoint.
pub async fn connect(address: &EndpointAddress) -> Result<Connection, EndpointError> {
    imp::connect(address)
        .await
        .map_err(|error| EndpointError::Connect {
            address: address.to_string(),
            error,
        })
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::io;
    use tokio::net::{UnixListener, UnixStream};

    pub(super) fn address_for(dir: &Utf8Path, name: &str) -> EndpointAddress {
        EndpointAddress(dir.join(name).into_string())
    }

    #[derive(Debug)]
    pub(super) struct Listener {
        path: Utf8PathBuf,
        listener: UnixListener,
    }

    impl Listener {
        pub(super) fn bind(address: &EndpointAddress) -> io::Result<Self> {
            let path = Utf8PathBuf::from(address.as_str());
            let listener = UnixListener::bind(&path)?;
            Ok(Self { path, listener })
        }

        pub(super) async fn accept(&mut self) -> io::Result<Connection> {
            let (stream, _) = self.listener.accept().await?;
            let (reader, writer) = stream.into_split();
            Ok(Connection::new(reader, writer))
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            // The socket may already be gone if the directory was cleaned up.
            _ = std::fs::remove_file(&self.path);
        }
    }

    pub(super) async fn connect(address: &EndpointAddress) -> io::Result<Connection> {
        let stream = UnixStream::connect(address.as_str()).await?;
        let (reader, writer) = stream.into_split();
        Ok(Connection::new(reader, writer))
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::io;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    pub(super) fn address_for(_dir: &Utf8Path, name: &str) -> EndpointAddress {
        EndpointAddress(format!(r"\\.\pipe\{name}"))
    }

    #[derive(Debug)]
    pub(super) struct Listener {
        server: Option<NamedPipeServer>,
    }

    impl Listener {
        pub(super) fn bind(address: &EndpointAddress) -> io::Result<Self> {
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(address.as_str())?;
            Ok(Self {
                server: Some(server),
            })
        }

        pub(super) async fn accept(&mut self) -> io::Result<Connection> {
            if let Some(server) = &self.server {
                server.connect().await?;
            }
            match self.server.take() {
                Some(server) => {
                    let (reader, writer) = tokio::io::split(server);
                    Ok(Connection::new(reader, writer))
                }
                None => Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "endpoint already accepted a connection",
                )),
            }
        }
    }

    pub(super) async fn connect(address: &EndpointAddress) -> io::Result<Connection> {
        let client = ClientOptions::new().open(address.as_str())?;
        let (reader, writer) = tokio::io::split(client);
        Ok(Connection::new(reader, writer))
    }
}
