//! [`AsyncWrite`] adapter over an SSH channel, so the executor can copy a
//! child's stdout/stderr straight into `data` / `extended_data` messages.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::AsyncWrite;

/// Extended data type code for stderr (RFC 4254 section 5.2).
pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

type PendingSend = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Writes to one channel of a running SSH session.
///
/// Each `poll_write` queues one message on the session and reports the
/// bytes as written; the send itself completes on the next write or flush.
/// A closed channel surfaces as [`io::ErrorKind::BrokenPipe`].
pub struct ChannelWriter {
    handle: Handle,
    channel: ChannelId,
    /// `None` for regular data, `Some(code)` for extended data.
    ext: Option<u32>,
    pending: Option<PendingSend>,
}

impl ChannelWriter {
    /// Channel stdout.
    pub fn data(handle: Handle, channel: ChannelId) -> Self {
        Self {
            handle,
            channel,
            ext: None,
            pending: None,
        }
    }

    /// Channel stderr.
    pub fn stderr(handle: Handle, channel: ChannelId) -> Self {
        Self {
            handle,
            channel,
            ext: Some(SSH_EXTENDED_DATA_STDERR),
            pending: None,
        }
    }

    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(fut) = self.pending.as_mut() {
            let res = std::task::ready!(fut.as_mut().poll(cx));
            self.pending = None;
            res?;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_pending(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let handle = this.handle.clone();
        let channel = this.channel;
        let ext = this.ext;
        let data = CryptoVec::from_slice(buf);
        this.pending = Some(Box::pin(async move {
            let sent = match ext {
                None => handle.data(channel, data).await,
                Some(code) => handle.extended_data(channel, code, data).await,
            };
            sent.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "SSH channel closed"))
        }));

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_pending(cx)
    }

    /// Only drains queued data. EOF is sent once, after the exit status.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_pending(cx)
    }
}
