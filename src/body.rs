// Client request body buffering and upstream replay
use crate::error::Result;
use crate::http::RequestHead;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Bodies up to this size are buffered in full so the request can be
/// replayed across NTLM rounds.
const MAX_BUFFERED: usize = 100 * 1024;

const TRANSFER_BUFFER: usize = 8 * 1024;

/// Wraps the client input, still positioned at the start of the body, as a
/// push-style body for upstream replay.
///
/// Repeatability: a declared length within the buffer cap is read in full
/// up front; an unknown length is buffered until the client stream has
/// nothing more immediately available; anything larger streams through
/// exactly once.
pub struct StreamingRequestBody<R> {
    reader: R,
    prefix: Vec<u8>,
    content_length: i64,
    repeatable: bool,
}

impl<R> StreamingRequestBody<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn new(head: &RequestHead, leftover: Vec<u8>, mut reader: R) -> Result<Self> {
        let content_length = head.content_length();
        let mut prefix = leftover;
        let repeatable;

        if content_length > MAX_BUFFERED as i64 {
            repeatable = false;
        } else if content_length >= 0 {
            let declared = content_length as usize;
            prefix.truncate(declared);
            let mut chunk = vec![0u8; TRANSFER_BUFFER];
            while prefix.len() < declared {
                let want = (declared - prefix.len()).min(TRANSFER_BUFFER);
                let n = reader.read(&mut chunk[..want]).await?;
                if n == 0 {
                    break;
                }
                prefix.extend_from_slice(&chunk[..n]);
            }
            repeatable = true;
        } else {
            // Unknown length: buffer whatever the client has already sent,
            // without blocking on a stream that may stay open.
            let mut chunk = vec![0u8; TRANSFER_BUFFER];
            loop {
                if prefix.len() > MAX_BUFFERED {
                    break;
                }
                match timeout(Duration::ZERO, reader.read(&mut chunk)).await {
                    Err(_) => break,
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => prefix.extend_from_slice(&chunk[..n]),
                    Ok(Err(e)) => return Err(e.into()),
                }
            }
            repeatable = prefix.len() <= MAX_BUFFERED;
        }

        Ok(StreamingRequestBody {
            reader,
            prefix,
            content_length,
            repeatable,
        })
    }

    pub fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    /// Bytes held in the pre-read buffer.
    pub fn buffered_len(&self) -> usize {
        self.prefix.len()
    }

    /// Declared content length, `-1` when unknown. Surfaced unchanged even
    /// for bodies too large to buffer.
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    /// Writes the buffered prefix and then, for non-repeatable bodies,
    /// streams the remainder off the client socket. Returns bytes written.
    pub async fn write_to<W>(&mut self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        if !self.prefix.is_empty() {
            out.write_all(&self.prefix).await?;
            written += self.prefix.len() as u64;
        }

        if !self.repeatable {
            let mut remaining = if self.content_length < 0 {
                u64::MAX
            } else {
                (self.content_length as u64).saturating_sub(self.prefix.len() as u64)
            };
            let mut chunk = vec![0u8; TRANSFER_BUFFER];
            while remaining > 0 {
                let want = remaining.min(TRANSFER_BUFFER as u64) as usize;
                let n = self.reader.read(&mut chunk[..want]).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&chunk[..n]).await?;
                written += n as u64;
                remaining -= n as u64;
            }
        }

        out.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Header, RequestHead};
    use std::io::Cursor;
    use tokio::io::AsyncWriteExt;

    fn head_with_length(len: i64) -> RequestHead {
        let mut head = RequestHead::new("POST", "http://example.com/", "HTTP/1.1");
        if len >= 0 {
            head.headers.push(Header::new("Content-Length", len.to_string()));
        }
        head
    }

    #[tokio::test]
    async fn declared_small_body_is_buffered_and_repeatable() {
        let head = head_with_length(10);
        let mut body =
            StreamingRequestBody::new(&head, b"hello".to_vec(), Cursor::new(b"world".to_vec()))
                .await
                .unwrap();
        assert!(body.is_repeatable());
        assert_eq!(body.content_length(), 10);

        let mut first = Vec::new();
        assert_eq!(body.write_to(&mut first).await.unwrap(), 10);
        let mut second = Vec::new();
        assert_eq!(body.write_to(&mut second).await.unwrap(), 10);
        assert_eq!(first, b"helloworld");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn oversized_body_streams_once_without_buffering() {
        let payload = vec![0x42u8; 250_000];
        let head = head_with_length(payload.len() as i64);
        let mut body = StreamingRequestBody::new(
            &head,
            payload[..1000].to_vec(),
            Cursor::new(payload[1000..].to_vec()),
        )
        .await
        .unwrap();
        assert!(!body.is_repeatable());
        assert_eq!(body.content_length(), 250_000);

        let mut out = Vec::new();
        assert_eq!(body.write_to(&mut out).await.unwrap(), 250_000);
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn unknown_length_with_quiet_stream_is_repeatable() {
        let head = head_with_length(-1);
        let (client, server) = tokio::io::duplex(4096);
        drop(client);
        let mut body = StreamingRequestBody::new(&head, b"abc".to_vec(), server)
            .await
            .unwrap();
        assert!(body.is_repeatable());

        let mut out = Vec::new();
        assert_eq!(body.write_to(&mut out).await.unwrap(), 3);
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn unknown_length_with_more_data_pending_is_not_repeatable() {
        let head = head_with_length(-1);
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let payload = vec![0x7au8; 150 * 1024];
        client.write_all(&payload).await.unwrap();
        drop(client);

        let mut body = StreamingRequestBody::new(&head, Vec::new(), server)
            .await
            .unwrap();
        assert!(!body.is_repeatable());

        let mut out = Vec::new();
        assert_eq!(body.write_to(&mut out).await.unwrap(), payload.len() as u64);
        assert_eq!(out, payload);
    }
}
