use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::io::StreamReader;

pub(crate) type BoxByteStream = BoxStream<'static, io::Result<Bytes>>;

/// A streaming response body: either a blob on disk, an upstream byte
/// stream, or an upstream stream teeing into the cache. Never buffered.
pub struct Body {
    kind: BodyKind,
}

enum BodyKind {
    Empty,
    File(tokio::fs::File),
    Stream(StreamReader<BoxByteStream, Bytes>),
}

impl Body {
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
        }
    }

    pub(crate) fn from_file(file: tokio::fs::File) -> Self {
        Self {
            kind: BodyKind::File(file),
        }
    }

    pub(crate) fn from_stream(stream: BoxByteStream) -> Self {
        Self {
            kind: BodyKind::Stream(StreamReader::new(stream)),
        }
    }

    /// Drains the body into memory. Mostly useful in tests and for the
    /// collaborators that re-serialize small JSON bodies.
    pub async fn into_bytes(mut self) -> io::Result<Bytes> {
        let mut collected = Vec::new();
        self.read_to_end(&mut collected).await?;
        Ok(Bytes::from(collected))
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().kind {
            BodyKind::Empty => Poll::Ready(Ok(())),
            BodyKind::File(file) => Pin::new(file).poll_read(cx, buf),
            BodyKind::Stream(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BodyKind::Empty => f.write_str("Body::Empty"),
            BodyKind::File(_) => f.write_str("Body::File"),
            BodyKind::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}
