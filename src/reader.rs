//! Everything related to reading byte ranges out of the tailed file.
//!
//! The line-boundary locator scans backward from end-of-file in fixed-size
//! chunks, so finding the last few lines of a large log touches only its tail.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::TailError;

/// Bytes read per backward step when locating line boundaries.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

const LINE_TERMINATOR: u8 = b'\n';

/// An immutable byte range read from the source file.
///
/// The payload is reference counted, so cloning a chunk for every observer
/// does not copy the bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    start: u64,
    data: Bytes,
}

impl Chunk {
    pub fn new(start: u64, data: impl Into<Bytes>) -> Self {
        Chunk {
            start,
            data: data.into(),
        }
    }

    /// Offset of the first byte of the chunk.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Offset one past the last byte of the chunk.
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// The `[start, end)` range covered in the source file.
    pub fn range(&self) -> Range<u64> {
        self.start..self.end()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Returns the offset where the last `n` lines of `reader` begin.
///
/// Equivalent to [`locate_with_chunk_size`] with [`DEFAULT_CHUNK_SIZE`].
pub async fn locate<R>(reader: &mut R, n: usize) -> Result<u64, TailError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    locate_with_chunk_size(reader, n, DEFAULT_CHUNK_SIZE).await
}

/// Returns the offset where the last `n` lines of `reader` begin, reading
/// backward `chunk_size` bytes at a time.
///
/// A final line without a trailing terminator still counts as a line. If the
/// file holds `n` lines or fewer the whole file is the tail and `0` is
/// returned. `n == 0` yields the file length, an empty tail.
pub async fn locate_with_chunk_size<R>(
    reader: &mut R,
    n: usize,
    chunk_size: usize,
) -> Result<u64, TailError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let len = reader.seek(SeekFrom::End(0)).await?;
    if n == 0 || len == 0 {
        return Ok(if n == 0 { len } else { 0 });
    }

    // Never buffer more than the file holds.
    let step = (chunk_size.max(1) as u64).min(len);
    let mut buf = vec![0u8; step as usize];
    let mut end = len;
    let mut seen = 0;
    let mut at_eof = true;

    while end > 0 {
        // Negative positions clamp to the start of the file.
        let start = end.saturating_sub(step);
        let window = &mut buf[..(end - start) as usize];

        reader.seek(SeekFrom::Start(start)).await?;
        reader.read_exact(window).await?;

        let mut scan = window.len();
        if at_eof {
            // The terminator closing the final line does not start a new one.
            at_eof = false;
            if window[scan - 1] == LINE_TERMINATOR {
                scan -= 1;
            }
        }

        for i in (0..scan).rev() {
            if window[i] == LINE_TERMINATOR {
                seen += 1;
                if seen == n {
                    return Ok(start + i as u64 + 1);
                }
            }
        }

        end = start;
    }

    Ok(0)
}

/// Reads everything from `offset` to the current end of `reader`.
///
/// The end is captured once, immediately before the read, so the result is
/// exactly `[offset, len)` for the length observed at call time.
pub async fn snapshot<R>(reader: &mut R, offset: u64) -> Result<Bytes, TailError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let len = reader.seek(SeekFrom::End(0)).await?;
    if offset > len {
        return Err(TailError::Seek { offset, len });
    }

    read_range(reader, offset, len).await
}

/// Reads exactly `[start, end)` from `reader`.
pub async fn snapshot_range<R>(reader: &mut R, start: u64, end: u64) -> Result<Bytes, TailError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let len = reader.seek(SeekFrom::End(0)).await?;
    if start > end {
        return Err(TailError::Seek {
            offset: start,
            len: end,
        });
    }
    if end > len {
        return Err(TailError::Seek { offset: end, len });
    }

    read_range(reader, start, end).await
}

/// Opens `path` and returns its last `n` lines.
///
/// This is what an initial page render embeds before live updates begin.
pub async fn tail_lines(path: impl AsRef<Path>, n: usize) -> Result<Bytes, TailError> {
    tail_lines_with_chunk_size(path, n, DEFAULT_CHUNK_SIZE).await
}

pub(crate) async fn tail_lines_with_chunk_size(
    path: impl AsRef<Path>,
    n: usize,
    chunk_size: usize,
) -> Result<Bytes, TailError> {
    let mut file = File::open(path.as_ref()).await?;
    let offset = locate_with_chunk_size(&mut file, n, chunk_size).await?;
    snapshot(&mut file, offset).await
}

pub(crate) async fn read_range<R>(reader: &mut R, start: u64, end: u64) -> Result<Bytes, TailError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let mut data = vec![0u8; (end - start) as usize];
    if !data.is_empty() {
        reader.seek(SeekFrom::Start(start)).await?;
        // Fails with `UnexpectedEof` if the file shrank since `end` was taken.
        reader.read_exact(&mut data).await?;
    }

    Ok(Bytes::from(data))
}
