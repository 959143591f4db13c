use futures::io::AsyncRead;
use futures::ready;
use pin_project_lite::pin_project;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// Tee reader: every byte handed to the consumer is also fed to a digest.
    ///
    /// Wrap a content stream in this before giving it to a writer, let the
    /// writer drain it, then call [`finalize()`](Self::finalize) to get the
    /// digest of exactly what was read. Nothing is buffered beyond whatever
    /// the consumer asked for in each `poll_read`.
    ///
    /// ```
    /// use futures::io::{AsyncReadExt, Cursor};
    /// use shelf_asyncutils::HashingReader;
    ///
    /// # futures::executor::block_on(async {
    /// let mut reader = HashingReader::sha256(Cursor::new(b"helloworld".to_vec()));
    /// let mut sink = Vec::new();
    /// reader.read_to_end(&mut sink).await.unwrap();
    /// assert_eq!(reader.bytes_read(), 10);
    /// let digest: [u8; 32] = reader.finalize().into();
    /// # let _ = digest;
    /// # });
    /// ```
    pub struct HashingReader<R, D = Sha256> {
        #[pin]
        inner: R,
        digest: D,
        bytes_read: u64,
    }
}

impl<R: AsyncRead> HashingReader<R, Sha256> {
    pub fn sha256(inner: R) -> Self {
        Self::new(inner, Sha256::new())
    }
}

impl<R: AsyncRead, D: Digest> HashingReader<R, D> {
    pub fn new(inner: R, digest: D) -> Self {
        Self { inner, digest, bytes_read: 0 }
    }

    /// Number of bytes that have passed through the reader so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Consume the reader, returning the digest of everything read.
    ///
    /// Bytes still sitting in the inner reader are *not* included.
    pub fn finalize(self) -> sha2::digest::Output<D> {
        self.digest.finalize()
    }
}

impl<R: AsyncRead, D: Digest> AsyncRead for HashingReader<R, D> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let read = ready!(this.inner.poll_read(cx, buf))?;
        this.digest.update(&buf[..read]);
        *this.bytes_read += read as u64;
        Poll::Ready(Ok(read))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::{AsyncReadExt, Cursor};
    use rstest::rstest;

    #[rstest]
    #[case(b"".as_slice(), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")]
    #[case(b"helloworld".as_slice(), "936a185caaa266bb9cbe981e9e05cb78cd732b0b3280eb944412bb6f8f8f07af")]
    #[tokio::test]
    async fn test_digest_matches_content(#[case] content: &[u8], #[case] expected: &str) {
        let mut reader = HashingReader::sha256(Cursor::new(content.to_vec()));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink, content);
        assert_eq!(reader.bytes_read(), content.len() as u64);
        assert_eq!(hex::encode(reader.finalize()), expected);
    }

    #[tokio::test]
    async fn test_small_reads_hash_everything_once() {
        let content = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let mut reader = HashingReader::sha256(Cursor::new(content.clone()));
        let mut chunk = [0u8; 7];
        let mut sink = Vec::new();
        loop {
            let read = reader.read(&mut chunk).await.unwrap();
            if read == 0 {
                break;
            }
            sink.extend_from_slice(&chunk[..read]);
        }
        assert_eq!(sink, content);
        assert_eq!(reader.finalize(), Sha256::digest(&content));
    }

    #[tokio::test]
    async fn test_partial_read_only_hashes_consumed_bytes() {
        let mut reader = HashingReader::sha256(Cursor::new(b"helloworld".to_vec()));
        let mut head = [0u8; 5];
        reader.read_exact(&mut head).await.unwrap();
        assert_eq!(reader.bytes_read(), 5);
        assert_eq!(reader.finalize(), Sha256::digest(b"hello"));
    }
}
