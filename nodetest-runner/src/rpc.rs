// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A minimal JSON-RPC 2.0 connection over a [`Connection`].
//!
//! Each connection runs two background tasks: a reader that routes responses to the requests
//! waiting for them and forwards everything else, in order, to [`RpcConnection::recv`]; and a
//! writer that frames and sends outgoing messages in the order they were queued.

mod framing;

use crate::{
    endpoint::Connection,
    errors::{RemoteError, RpcError},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    sync::{mpsc, oneshot},
};
use tracing::{debug, trace};

/// The error code for a method the receiver doesn't know about.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// The error code for an internal error while handling a request.
pub const INTERNAL_ERROR: i64 = -32603;

/// A request or notification received from the other end.
#[derive(Debug)]
pub struct IncomingMessage {
    id: Option<u64>,
    method: String,
    body: Value,
}

impl IncomingMessage {
    /// Returns the request id, or `None` for notifications.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Returns the method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Decodes the message into one of the typed message enums.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let Self { method, body, .. } = self;
        serde_json::from_value(body).map_err(|error| RpcError::Decode {
            context: format!("`{method}` message"),
            error,
        })
    }
}

/// One end of a JSON-RPC connection.
#[derive(Debug)]
pub struct RpcConnection {
    sender: RpcSender,
    incoming: mpsc::UnboundedReceiver<Result<IncomingMessage, RpcError>>,
}

impl RpcConnection {
    /// Starts serving a connection. Must be called within a tokio runtime.
    pub fn new(connection: Connection) -> Self {
        let Connection { reader, writer } = connection;
        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(
            BufReader::new(reader),
            pending.clone(),
            incoming_tx,
        ));
        tokio::spawn(write_loop(BufWriter::new(writer), command_rx));

        Self {
            sender: RpcSender {
                commands: command_tx,
                pending,
            },
            incoming: incoming_rx,
        }
    }

    /// Returns a handle for sending messages.
    pub fn sender(&self) -> &RpcSender {
        &self.sender
    }

    /// Waits for the next request or notification.
    ///
    /// Returns `None` once the other end has closed the connection and every message received
    /// before that has been returned. This future is cancel-safe.
    pub async fn recv(&mut self) -> Option<Result<IncomingMessage, RpcError>> {
        self.incoming.recv().await
    }

    /// Returns the next request or notification if one has already been received.
    pub fn try_recv(&mut self) -> Option<Result<IncomingMessage, RpcError>> {
        self.incoming.try_recv().ok()
    }
}

/// A cloneable handle for sending messages over an [`RpcConnection`].
#[derive(Clone, Debug)]
pub struct RpcSender {
    commands: mpsc::UnboundedSender<WriterCommand>,
    pending: Arc<Mutex<PendingRequests>>,
}

impl RpcSender {
    /// Sends a request and waits for its response.
    ///
    /// Messages received before the response are available from [`RpcConnection::recv`] by the
    /// time this returns.
    pub async fn request<T: DeserializeOwned>(
        &self,
        request: &impl Serialize,
    ) -> Result<T, RpcError> {
        let mut message = to_object(request)?;
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.lock_pending();
            if pending.closed {
                return Err(RpcError::Disconnected);
            }
            let id = pending.next_id;
            pending.next_id += 1;
            pending.waiting.insert(id, tx);
            id
        };

        message.insert("id".to_owned(), id.into());
        if let Err(error) = self.send(message) {
            self.lock_pending().waiting.remove(&id);
            return Err(error);
        }

        let result = rx.await.map_err(|_| RpcError::Disconnected)??;
        serde_json::from_value(result).map_err(|error| RpcError::Decode {
            context: format!("response to request {id}"),
            error,
        })
    }

    /// Sends a notification.
    pub fn notify(&self, notification: &impl Serialize) -> Result<(), RpcError> {
        self.send(to_object(notification)?)
    }

    /// Answers a request received through [`RpcConnection::recv`].
    pub fn respond(
        &self,
        id: u64,
        result: Result<impl Serialize, RemoteError>,
    ) -> Result<(), RpcError> {
        let mut message = Map::new();
        message.insert("id".to_owned(), id.into());
        match result {
            Ok(value) => {
                let value = serde_json::to_value(value).map_err(RpcError::Encode)?;
                message.insert("result".to_owned(), value);
            }
            Err(RemoteError { code, message: text }) => {
                let mut error = Map::new();
                error.insert("code".to_owned(), code.into());
                error.insert("message".to_owned(), text.into());
                message.insert("error".to_owned(), Value::Object(error));
            }
        }
        self.send(message)
    }

    /// Waits until every message queued so far has been written out.
    pub async fn flush(&self) -> Result<(), RpcError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(WriterCommand::Flush(tx))
            .map_err(|_| RpcError::Disconnected)?;
        rx.await.map_err(|_| RpcError::Disconnected)??;
        Ok(())
    }

    /// Flushes queued messages and closes the write side of the connection.
    pub async fn close(&self) -> Result<(), RpcError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(WriterCommand::Close(tx))
            .map_err(|_| RpcError::Disconnected)?;
        rx.await.map_err(|_| RpcError::Disconnected)??;
        Ok(())
    }

    fn send(&self, mut message: Map<String, Value>) -> Result<(), RpcError> {
        message.insert("jsonrpc".to_owned(), "2.0".into());
        let body = serde_json::to_vec(&message).map_err(RpcError::Encode)?;
        trace!(message = %String::from_utf8_lossy(&body), "sending");
        self.commands
            .send(WriterCommand::Message(body))
            .map_err(|_| RpcError::Disconnected)
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingRequests> {
        lock(&self.pending)
    }
}

#[derive(Debug, Default)]
struct PendingRequests {
    next_id: u64,
    waiting: HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>,
    closed: bool,
}

#[derive(Debug)]
enum WriterCommand {
    Message(Vec<u8>),
    Flush(oneshot::Sender<io::Result<()>>),
    Close(oneshot::Sender<io::Result<()>>),
}

enum Classified {
    Incoming(IncomingMessage),
    Response {
        id: u64,
        result: Result<Value, RemoteError>,
    },
}

fn lock(pending: &Mutex<PendingRequests>) -> MutexGuard<'_, PendingRequests> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_object(message: &impl Serialize) -> Result<Map<String, Value>, RpcError> {
    match serde_json::to_value(message).map_err(RpcError::Encode)? {
        Value::Object(map) => Ok(map),
        other => Err(RpcError::Encode(serde::ser::Error::custom(format!(
            "message must serialize to an object, found {other}"
        )))),
    }
}

fn classify(body: &[u8]) -> Result<Classified, RpcError> {
    let mut message: Map<String, Value> =
        serde_json::from_slice(body).map_err(|error| RpcError::Decode {
            context: "message".to_owned(),
            error,
        })?;
    let id = message.get("id").and_then(Value::as_u64);

    if let Some(method) = message.get("method").and_then(Value::as_str) {
        return Ok(Classified::Incoming(IncomingMessage {
            id,
            method: method.to_owned(),
            body: Value::Object(message),
        }));
    }

    let id = id.ok_or_else(|| RpcError::Framing("message has neither method nor id".to_owned()))?;
    let result = match message.remove("error") {
        Some(error) => Err(RemoteError {
            code: error
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(INTERNAL_ERROR),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        }),
        // A missing result is the same as a null one.
        None => Ok(message.remove("result").unwrap_or(Value::Null)),
    };
    Ok(Classified::Response { id, result })
}

async fn read_loop<R>(
    mut reader: R,
    pending: Arc<Mutex<PendingRequests>>,
    incoming: mpsc::UnboundedSender<Result<IncomingMessage, RpcError>>,
) where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let body = match framing::read_message(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(error) => {
                debug!("connection read failed: {error}");
                _ = incoming.send(Err(error));
                break;
            }
        };

        match classify(&body) {
            Ok(Classified::Incoming(message)) => {
                trace!(method = message.method(), id = ?message.id(), "received");
                // If nobody is listening for messages any more, keep routing responses.
                _ = incoming.send(Ok(message));
            }
            Ok(Classified::Response { id, result }) => {
                let waiter = lock(&pending).waiting.remove(&id);
                match waiter {
                    Some(waiter) => {
                        _ = waiter.send(result.map_err(RpcError::Remote));
                    }
                    None => debug!("received response to unknown request {id}"),
                }
            }
            Err(error) => {
                _ = incoming.send(Err(error));
            }
        }
    }

    // Dropping the waiters fails every outstanding request with `Disconnected`.
    let mut pending = lock(&pending);
    pending.closed = true;
    pending.waiting.clear();
}

async fn write_loop<W>(mut writer: W, mut commands: mpsc::UnboundedReceiver<WriterCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Message(body) => {
                if let Err(error) = framing::write_message(&mut writer, &body).await {
                    debug!("connection write failed: {error}");
                    return;
                }
                // Batch writes while more messages are queued.
                if commands.is_empty() {
                    if let Err(error) = writer.flush().await {
                        debug!("connection flush failed: {error}");
                        return;
                    }
                }
            }
            WriterCommand::Flush(ack) => {
                _ = ack.send(writer.flush().await);
            }
            WriterCommand::Close(ack) => {
                let result = match writer.flush().await {
                    Ok(()) => writer.shutdown().await,
                    Err(error) => Err(error),
                };
                _ = ack.send(result);
                return;
            }
        }
    }

    _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodetest_protocol::{
        HostNotification, StartParams, StartResult, TestIdParams, TestIdentity, WorkerNotification,
        WorkerRequest,
    };
    use pretty_assertions::assert_eq;

    fn pair() -> (RpcConnection, RpcConnection) {
        let (a, b) = tokio::io::duplex(64);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            RpcConnection::new(Connection::new(a_read, a_write)),
            RpcConnection::new(Connection::new(b_read, b_write)),
        )
    }

    #[tokio::test]
    async fn request_response() {
        let (host, mut worker) = pair();

        let server = tokio::spawn(async move {
            let message = worker.recv().await.expect("message").expect("valid");
            let id = message.id().expect("request has an id");
            let request: WorkerRequest = message.decode().expect("decodes");
            assert_eq!(request, WorkerRequest::Version);
            worker
                .sender()
                .respond(id, Ok("v22.3.0"))
                .expect("sent response");
            worker.sender().flush().await.expect("flushed");
            worker
        });

        let version: String = host
            .sender()
            .request(&WorkerRequest::Version)
            .await
            .expect("got response");
        assert_eq!(version, "v22.3.0");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn notifications_arrive_before_response() {
        let (mut host, mut worker) = pair();

        let server = tokio::spawn(async move {
            let message = worker.recv().await.expect("message").expect("valid");
            let id = message.id().expect("request has an id");
            assert!(matches!(
                message.decode::<WorkerRequest>().expect("decodes"),
                WorkerRequest::Start(_)
            ));
            for name in ["a", "b", "c"] {
                worker
                    .sender()
                    .notify(&HostNotification::Started(TestIdParams {
                        id: TestIdentity::for_file(name),
                    }))
                    .expect("notified");
            }
            worker
                .sender()
                .respond(id, Ok(StartResult::done()))
                .expect("responded");

            // The kill notification comes last.
            let message = worker.recv().await.expect("message").expect("valid");
            assert_eq!(message.id(), None);
            assert_eq!(
                message.decode::<WorkerNotification>().expect("decodes"),
                WorkerNotification::Kill
            );
        });

        let result: StartResult = host
            .sender()
            .request(&WorkerRequest::Start(StartParams::default()))
            .await
            .expect("got response");
        assert_eq!(result, StartResult::done());

        let mut seen = Vec::new();
        while let Some(message) = host.try_recv() {
            match message.unwrap().decode::<HostNotification>().unwrap() {
                HostNotification::Started(params) => {
                    seen.push(params.id.file_id().unwrap().to_owned())
                }
                other => panic!("unexpected notification {other:?}"),
            }
        }
        assert_eq!(seen, ["a", "b", "c"]);

        host.sender()
            .notify(&WorkerNotification::Kill)
            .expect("notified");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn remote_errors() {
        let (host, mut worker) = pair();

        tokio::spawn(async move {
            let message = worker.recv().await.expect("message").expect("valid");
            let id = message.id().expect("request has an id");
            worker
                .sender()
                .respond(
                    id,
                    Err::<(), _>(RemoteError {
                        code: METHOD_NOT_FOUND,
                        message: "unknown method".to_owned(),
                    }),
                )
                .expect("responded");
            worker.sender().flush().await.expect("flushed");
            // Keep the connection open until the response has been read.
            worker.recv().await;
        });

        let error = host
            .sender()
            .request::<Value>(&serde_json::json!({ "method": "bogus" }))
            .await
            .expect_err("request fails");
        match error {
            RpcError::Remote(remote) => assert_eq!(remote.code, METHOD_NOT_FOUND),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_fails_outstanding_requests() {
        let (mut host, worker) = pair();

        let request = {
            let sender = host.sender().clone();
            tokio::spawn(async move { sender.request::<String>(&WorkerRequest::Version).await })
        };
        tokio::task::yield_now().await;
        worker.sender().close().await.expect("closed");
        drop(worker);

        let error = request.await.unwrap().expect_err("request fails");
        assert!(matches!(error, RpcError::Disconnected), "{error:?}");
        assert!(host.recv().await.is_none());
        assert!(matches!(
            host.sender().request::<String>(&WorkerRequest::Version).await,
            Err(RpcError::Disconnected)
        ));
    }
}
