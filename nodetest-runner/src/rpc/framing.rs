// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Content-Length` message framing, as used by the language server and debug adapter
//! protocols.

use crate::errors::RpcError;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one framed message body.
///
/// Returns `Ok(None)` on a clean end of stream between messages.
pub(super) async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>, RpcError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = None;
    let mut saw_header = false;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            if saw_header {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            return Ok(None);
        }

        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            if saw_header {
                break;
            }
            // Stray separators between messages are harmless.
            continue;
        }
        saw_header = true;

        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| RpcError::Framing(format!("invalid header line `{header}`")))?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            let len = value
                .parse::<usize>()
                .map_err(|_| RpcError::Framing(format!("invalid Content-Length `{value}`")))?;
            content_length = Some(len);
        }
    }

    let len = content_length
        .ok_or_else(|| RpcError::Framing("missing Content-Length header".to_owned()))?;
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes one framed message body. The caller is responsible for flushing.
pub(super) async fn write_message<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn back_to_back_messages() {
        let mut buf = Vec::new();
        write_message(&mut buf, br#"{"a":1}"#).await.unwrap();
        write_message(&mut buf, "{\"b\":\"\u{e9}\"}".as_bytes())
            .await
            .unwrap();

        let mut reader = BufReader::new(buf.as_slice());
        assert_eq!(
            read_message(&mut reader).await.unwrap().as_deref(),
            Some(br#"{"a":1}"#.as_slice())
        );
        assert_eq!(
            read_message(&mut reader).await.unwrap().as_deref(),
            Some("{\"b\":\"\u{e9}\"}".as_bytes())
        );
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn split_reads() {
        let (client, server) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            let mut client = client;
            let mut framed = Vec::new();
            write_message(&mut framed, br#"{"method":"version","id":0}"#)
                .await
                .unwrap();
            // Trickle the message in tiny pieces.
            for chunk in framed.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = BufReader::new(server);
        let body = read_message(&mut reader).await.unwrap().expect("message");
        assert_eq!(body, br#"{"method":"version","id":0}"#);
        writer.await.unwrap();
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn extra_headers_are_ignored() {
        let input = b"Content-Type: application/json\r\ncontent-length: 2\r\n\r\n{}";
        let mut reader = BufReader::new(input.as_slice());
        assert_eq!(
            read_message(&mut reader).await.unwrap().as_deref(),
            Some(b"{}".as_slice())
        );
    }

    #[tokio::test]
    async fn malformed_headers() {
        let mut reader = BufReader::new(b"garbage\r\n\r\n".as_slice());
        assert!(matches!(
            read_message(&mut reader).await,
            Err(RpcError::Framing(_))
        ));

        let mut reader = BufReader::new(b"X-Other: 1\r\n\r\n".as_slice());
        assert!(matches!(
            read_message(&mut reader).await,
            Err(RpcError::Framing(_))
        ));

        let mut reader = BufReader::new(b"Content-Length: 10\r\n\r\n{}".as_slice());
        assert!(matches!(
            read_message(&mut reader).await,
            Err(RpcError::Io(_))
        ));
    }
}
