//! File share exchange over one stream.
//!
//! The requester writes a single line naming the file. The responder answers
//! with the raw file bytes in fixed-size chunks and closes the stream; end of
//! stream marks end of file. There is no length prefix or checksum. When the
//! file cannot be opened the responder writes [`OPEN_ERROR`] as one line and
//! resets the stream instead of closing it, so a requester never mistakes the
//! error text (or a cut-off copy) for a complete file.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::host::StreamHandler;
use crate::stream::Stream;

/// Chunk size the responder reads and writes by default.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Directory the requester stores files in by default.
pub const DEFAULT_RECEIVE_DIR: &str = "received_files";
/// Line sent for any failure to open the requested file.
pub const OPEN_ERROR: &str = "error opening file";
/// Longest accepted request line, newline included.
pub const MAX_REQUEST_LINE: u64 = 4096;

const RECEIVE_BUFFER: usize = 16 * 1024;
const PART_SUFFIX: &str = ".part";

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error("cannot open {name:?}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("remote: {0}")]
    RemoteOpen(String),
    #[error("no usable file name in {0:?}")]
    InvalidName(String),
    #[error("transfer aborted after {received} bytes: {source}")]
    Aborted {
        received: u64,
        #[source]
        source: io::Error,
    },
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Bytes and chunks moved by one copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub bytes: u64,
    pub chunks: u64,
}

/// A file stored by [`FileRequester::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Read the request line: one filename, trimmed of surrounding whitespace.
/// Reads byte by byte so nothing after the newline is consumed.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, TransferError> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if raw.len() as u64 >= MAX_REQUEST_LINE {
            return Err(TransferError::BadRequest("request line too long"));
        }
        if reader.read(&mut byte).await? == 0 {
            return Err(TransferError::BadRequest("stream ended before request line"));
        }
        raw.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    let line = String::from_utf8(raw).map_err(|_| TransferError::BadRequest("not utf-8"))?;
    let name = line.trim();
    if name.is_empty() {
        return Err(TransferError::BadRequest("empty file name"));
    }
    Ok(name.to_string())
}

/// Map a requested name onto `root`. Absolute names and `..` are refused.
pub fn resolve_request(root: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    let contained = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return None;
    }
    Some(root.join(rel))
}

/// Read from `src` until `buf` is full or end of input.
async fn fill_chunk<R: AsyncRead + Unpin>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Copy `src` to `dst` in chunks of `chunk_size`, flushing after each one.
/// Every chunk is full except possibly the last.
pub async fn copy_in_chunks<R, W>(
    src: &mut R,
    dst: &mut W,
    chunk_size: usize,
) -> io::Result<CopyStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut stats = CopyStats::default();
    loop {
        let n = fill_chunk(src, &mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        stats.bytes += n as u64;
        stats.chunks += 1;
        if n < buf.len() {
            break;
        }
    }
    Ok(stats)
}

/// Server side: answers each file request from files under `root`.
#[derive(Debug, Clone)]
pub struct FileResponder {
    root: PathBuf,
    chunk_size: usize,
}

impl FileResponder {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Open a regular file under the root, following symlinks only while the
    /// target stays under the root.
    async fn open(&self, name: &str) -> io::Result<File> {
        let outside = || io::Error::new(io::ErrorKind::PermissionDenied, "outside the serve root");
        let path = resolve_request(&self.root, name).ok_or_else(outside)?;
        let root = tokio::fs::canonicalize(&self.root).await?;
        let real = tokio::fs::canonicalize(&path).await?;
        if !real.starts_with(&root) {
            return Err(outside());
        }
        // Checked before opening: a FIFO would block the open.
        if !tokio::fs::metadata(&real).await?.is_file() {
            return Err(io::Error::new(io::ErrorKind::Other, "not a regular file"));
        }
        File::open(&real).await
    }

    /// Serve one request on `stream`. The stream is closed on success and reset
    /// on any failure.
    pub async fn serve(&self, mut stream: Stream) -> Result<CopyStats, TransferError> {
        let name = match read_request(&mut stream).await {
            Ok(name) => name,
            Err(e) => {
                stream.reset().await;
                return Err(e);
            }
        };
        debug!(file = %name, "file requested");

        let mut file = match self.open(&name).await {
            Ok(file) => file,
            Err(source) => {
                send_error_line(&mut stream).await;
                stream.reset().await;
                return Err(TransferError::Open { name, source });
            }
        };

        match copy_in_chunks(&mut file, &mut stream, self.chunk_size).await {
            Ok(stats) => {
                stream.close().await?;
                info!(file = %name, bytes = stats.bytes, chunks = stats.chunks, "file sent");
                Ok(stats)
            }
            Err(e) => {
                send_error_line(&mut stream).await;
                stream.reset().await;
                Err(TransferError::Io(e))
            }
        }
    }
}

async fn send_error_line(stream: &mut Stream) {
    let line = format!("{}\n", OPEN_ERROR);
    if stream.write_all(line.as_bytes()).await.is_ok() {
        let _ = stream.flush().await;
    }
}

#[async_trait]
impl StreamHandler for FileResponder {
    async fn handle(&self, stream: Stream) {
        let peer = stream.remote_peer();
        if let Err(e) = self.serve(stream).await {
            warn!(peer = %peer, error = %e, "file request failed");
        }
    }
}

/// Client side: requests one file and stores it in `receive_dir`.
#[derive(Debug, Clone)]
pub struct FileRequester {
    receive_dir: PathBuf,
}

impl FileRequester {
    pub fn new(receive_dir: impl Into<PathBuf>) -> Self {
        Self {
            receive_dir: receive_dir.into(),
        }
    }

    pub fn receive_dir(&self) -> &Path {
        &self.receive_dir
    }

    /// Where a request for `filename` is stored: its last path component
    /// inside the receive directory.
    pub fn output_path(&self, filename: &str) -> Result<PathBuf, TransferError> {
        let name = Path::new(filename.trim())
            .file_name()
            .ok_or_else(|| TransferError::InvalidName(filename.to_string()))?;
        Ok(self.receive_dir.join(name))
    }

    /// Request `filename` and write everything received until end of stream.
    /// Nothing is left on disk unless the whole transfer succeeded.
    pub async fn fetch<S>(&self, stream: &mut S, filename: &str) -> Result<ReceivedFile, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let path = self.output_path(filename)?;
        let request = format!("{}\n", filename.trim());
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        tokio::fs::create_dir_all(&self.receive_dir).await?;
        let mut part = path.clone().into_os_string();
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);

        match receive_to(stream, &part, &path).await {
            Ok(bytes) => {
                info!(path = %path.display(), bytes, "file received");
                Ok(ReceivedFile { path, bytes })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

async fn receive_to<S>(stream: &mut S, part: &Path, path: &Path) -> Result<u64, TransferError>
where
    S: AsyncRead + Unpin,
{
    let mut out = File::create(part).await?;
    let mut buf = vec![0u8; RECEIVE_BUFFER];
    let mut head = Vec::new();
    let mut received: u64 = 0;
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(source) => return Err(classify_abort(source, &head, received)),
        };
        if head.len() <= OPEN_ERROR.len() {
            head.extend_from_slice(&buf[..n.min(OPEN_ERROR.len() + 2)]);
        }
        out.write_all(&buf[..n]).await?;
        received += n as u64;
    }
    out.flush().await?;
    out.sync_all().await?;
    drop(out);
    tokio::fs::rename(part, path).await?;
    Ok(received)
}

/// A reset after exactly the error line means the remote could not open the file.
fn classify_abort(source: io::Error, head: &[u8], received: u64) -> TransferError {
    let only_error_line = received == head.len() as u64
        && std::str::from_utf8(head).map(str::trim_end) == Ok(OPEN_ERROR);
    if only_error_line {
        TransferError::RemoteOpen(OPEN_ERROR.to_string())
    } else {
        TransferError::Aborted { received, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink that remembers the size of every write.
    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<usize>,
        data: Vec<u8>,
    }

    impl AsyncWrite for RecordingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            this.writes.push(buf.len());
            this.data.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn copy_splits_3000_bytes_into_1024_chunks() {
        let content = pattern(3000);
        let mut src = &content[..];
        let mut sink = RecordingSink::default();
        let stats = copy_in_chunks(&mut src, &mut sink, 1024).await.unwrap();
        assert_eq!(stats, CopyStats { bytes: 3000, chunks: 3 });
        assert_eq!(sink.writes, vec![1024, 1024, 952]);
        assert_eq!(sink.data, content);
    }

    #[tokio::test]
    async fn copy_fills_chunks_from_trickling_source() {
        let content = pattern(2500);
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let feed = content.clone();
        let writer = tokio::spawn(async move {
            for piece in feed.chunks(100) {
                tx.write_all(piece).await.unwrap();
            }
        });
        let mut sink = RecordingSink::default();
        let stats = copy_in_chunks(&mut rx, &mut sink, 1000).await.unwrap();
        writer.await.unwrap();
        assert_eq!(stats.chunks, 3);
        assert_eq!(sink.writes, vec![1000, 1000, 500]);
        assert_eq!(sink.data, content);
    }

    #[tokio::test]
    async fn copy_empty_source_sends_nothing() {
        let mut src: &[u8] = &[];
        let mut sink = RecordingSink::default();
        let stats = copy_in_chunks(&mut src, &mut sink, 1024).await.unwrap();
        assert_eq!(stats, CopyStats::default());
        assert!(sink.writes.is_empty());
    }

    #[tokio::test]
    async fn copy_exact_multiple_has_no_empty_tail() {
        let content = pattern(2048);
        let mut src = &content[..];
        let mut sink = RecordingSink::default();
        let stats = copy_in_chunks(&mut src, &mut sink, 1024).await.unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(sink.writes, vec![1024, 1024]);
    }

    #[tokio::test]
    async fn request_line_is_trimmed() {
        let mut input: &[u8] = b"  notes.txt \r\nignored";
        assert_eq!(read_request(&mut input).await.unwrap(), "notes.txt");
    }

    #[tokio::test]
    async fn request_line_leaves_the_rest_unread() {
        let mut input: &[u8] = b"a.txt\nfollowing bytes";
        assert_eq!(read_request(&mut input).await.unwrap(), "a.txt");
        assert_eq!(input, b"following bytes");
    }

    #[tokio::test]
    async fn responder_refuses_links_out_of_root() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        std::fs::write(root.path().join("inside.txt"), b"inside").unwrap();
        std::fs::create_dir(root.path().join("sub")).unwrap();
        let responder = FileResponder::new(root.path(), 1024);

        assert!(responder.open("inside.txt").await.is_ok());
        assert!(responder.open("sub").await.is_err());
        assert!(responder.open("missing.txt").await.is_err());
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink;
            symlink(outside.path().join("secret.txt"), root.path().join("link.txt")).unwrap();
            symlink(root.path().join("inside.txt"), root.path().join("alias.txt")).unwrap();
            symlink(outside.path(), root.path().join("escape")).unwrap();
            let err = responder.open("link.txt").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
            assert!(responder.open("escape/secret.txt").await.is_err());
            assert!(responder.open("alias.txt").await.is_ok());
        }
    }

    #[tokio::test]
    async fn request_line_errors() {
        let mut input: &[u8] = b"no newline";
        assert!(matches!(
            read_request(&mut input).await,
            Err(TransferError::BadRequest(_))
        ));
        let mut input: &[u8] = b"   \n";
        assert!(matches!(
            read_request(&mut input).await,
            Err(TransferError::BadRequest("empty file name"))
        ));
        let long = vec![b'a'; MAX_REQUEST_LINE as usize + 10];
        let mut input = &long[..];
        assert!(matches!(
            read_request(&mut input).await,
            Err(TransferError::BadRequest("request line too long"))
        ));
    }

    #[test]
    fn resolve_stays_under_root() {
        let root = Path::new("/srv/files");
        assert_eq!(
            resolve_request(root, "a/b.txt"),
            Some(PathBuf::from("/srv/files/a/b.txt"))
        );
        assert_eq!(
            resolve_request(root, "./b.txt"),
            Some(PathBuf::from("/srv/files/./b.txt"))
        );
        assert_eq!(resolve_request(root, "../etc/passwd"), None);
        assert_eq!(resolve_request(root, "a/../../x"), None);
        assert_eq!(resolve_request(root, "/etc/passwd"), None);
    }

    #[test]
    fn output_path_uses_last_component() {
        let requester = FileRequester::new("/tmp/in");
        assert_eq!(
            requester.output_path("dir/photo.png").unwrap(),
            PathBuf::from("/tmp/in/photo.png")
        );
        assert!(matches!(
            requester.output_path(".."),
            Err(TransferError::InvalidName(_))
        ));
    }

    #[test]
    fn abort_classification() {
        let line = format!("{}\n", OPEN_ERROR);
        let reset = || io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            classify_abort(reset(), line.as_bytes(), line.len() as u64),
            TransferError::RemoteOpen(_)
        ));
        assert!(matches!(
            classify_abort(reset(), b"partial", 7),
            TransferError::Aborted { received: 7, .. }
        ));
        assert!(matches!(
            classify_abort(reset(), line.as_bytes(), 5000),
            TransferError::Aborted { .. }
        ));
    }

    #[tokio::test]
    async fn fetch_writes_until_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let requester = FileRequester::new(dir.path().join("in"));
        let content = pattern(5000);
        let (mut client, mut server) = tokio::io::duplex(1024);
        let served = content.clone();
        let responder = tokio::spawn(async move {
            let name = read_request(&mut server).await.unwrap();
            let mut src = &served[..];
            copy_in_chunks(&mut src, &mut server, 700).await.unwrap();
            server.shutdown().await.unwrap();
            name
        });
        let got = requester.fetch(&mut client, "sub/data.bin").await.unwrap();
        assert_eq!(responder.await.unwrap(), "sub/data.bin");
        assert_eq!(got.bytes, 5000);
        assert_eq!(got.path, dir.path().join("in").join("data.bin"));
        assert_eq!(std::fs::read(&got.path).unwrap(), content);
        assert!(!dir.path().join("in").join("data.bin.part").exists());
    }

    #[tokio::test]
    async fn fetch_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), b"previous longer content").unwrap();
        let requester = FileRequester::new(dir.path());
        let (mut client, mut server) = tokio::io::duplex(1024);
        let responder = tokio::spawn(async move {
            read_request(&mut server).await.unwrap();
            server.write_all(b"new").await.unwrap();
            server.shutdown().await.unwrap();
        });
        let got = requester.fetch(&mut client, "old.txt").await.unwrap();
        responder.await.unwrap();
        assert_eq!(std::fs::read(&got.path).unwrap(), b"new");
    }
}
