use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::protocol::{self, Message, ProtocolError, Tag};

/// Outbound half of an scp exchange, normally the remote process's stdin.
#[derive(Debug)]
pub struct SendStream<W = BoxedWrite> {
    stream: W,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        Self { stream }
    }

    pub async fn send_message(&mut self, message: &Message) -> anyhow::Result<()> {
        self.stream.write_all(&message.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a `C` header immediately followed by its body, see [`Self::send_body`].
    #[instrument(level = "trace", skip(self, header, reader))]
    pub async fn send_file<R: AsyncBufRead + Unpin>(
        &mut self,
        header: &Message,
        size: u64,
        reader: &mut R,
    ) -> anyhow::Result<u64> {
        self.stream.write_all(&header.encode()).await?;
        self.send_body(size, reader).await
    }

    /// Sends exactly `size` bytes from `reader` followed by the `0x00` terminator.
    ///
    /// Bytes are copied straight out of the reader's own buffer. A reader that
    /// runs dry early fails the call before the terminator is written.
    #[instrument(level = "trace", skip(self, reader))]
    pub async fn send_body<R: AsyncBufRead + Unpin>(
        &mut self,
        size: u64,
        reader: &mut R,
    ) -> anyhow::Result<u64> {
        let mut limited = reader.take(size);
        let bytes_copied = tokio::io::copy_buf(&mut limited, &mut self.stream).await?;
        if bytes_copied != size {
            anyhow::bail!(
                "source shrank while sending: expected {} bytes, read {}",
                size,
                bytes_copied
            );
        }
        self.stream.write_all(&[Tag::Ok.as_byte()]).await?;
        self.stream.flush().await?;
        Ok(bytes_copied)
    }

    /// Signals end of input to the remote side
    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Remote stdin as handed out by an [`ExecChannel`](crate::ExecChannel)
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
/// Remote stdout as handed out by an [`ExecChannel`](crate::ExecChannel)
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

/// Inbound half of an scp exchange.
///
/// Control messages and file bodies share a single buffered reader so bytes
/// read ahead while parsing a header are never lost.
#[derive(Debug)]
pub struct RecvStream<R = BoxedRead> {
    reader: tokio::io::BufReader<R>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        Self {
            reader: tokio::io::BufReader::new(stream),
        }
    }

    pub async fn recv_message(&mut self) -> anyhow::Result<Message> {
        protocol::read_message(&mut self.reader).await
    }

    /// Reader over the next `size` body bytes and nothing beyond them.
    ///
    /// Whatever the caller leaves unread has to go through [`drain_body`]
    /// before the next message is read.
    pub fn body(&mut self, size: u64) -> tokio::io::Take<&mut tokio::io::BufReader<R>> {
        (&mut self.reader).take(size)
    }
}

/// Discards the rest of a body and fails if the stream ended before `size`
/// bytes were seen in total.
pub async fn drain_body<R: AsyncRead + Unpin>(
    body: &mut tokio::io::Take<R>,
    size: u64,
) -> anyhow::Result<()> {
    tokio::io::copy(body, &mut tokio::io::sink()).await?;
    let missing = body.limit();
    if missing != 0 {
        return Err(ProtocolError::ShortBody {
            expected: size,
            actual: size - missing,
        }
        .into());
    }
    Ok(())
}
