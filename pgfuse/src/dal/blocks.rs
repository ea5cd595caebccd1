//! Block-granular file content access.
//!
//! File content lives in the `data` relation as fixed-size blocks, stored
//! zero-padded to the full block size. A read assembles the touched blocks
//! and zero-fills holes (sparse files); a write splices into each touched
//! block, creating missing blocks as it goes; truncation prunes or extends
//! the block chain and masks stale tail bytes.

use crate::dal::meta::read_meta;
use crate::error::FsResult;
use sqlx::postgres::PgConnection;
use sqlx::Row;
use tracing::trace;

/// Byte range of a request mapped onto the block grid.
#[derive(Debug, Clone, Copy)]
struct BlockSpan {
    block_size: u64,
    offset: u64,
    len: u64,
}

/// The part of one block a request touches.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    /// Start of the slice within the request buffer.
    buf_start: usize,
    /// Start of the slice within the block.
    block_offset: usize,
    /// Slice length in bytes.
    len: usize,
}

impl BlockSpan {
    /// A span of `len > 0` bytes starting at `offset`.
    fn new(block_size: usize, offset: u64, len: usize) -> Self {
        debug_assert!(len > 0);
        Self {
            block_size: block_size as u64,
            offset,
            len: len as u64,
        }
    }

    fn first_block(&self) -> u64 {
        self.offset / self.block_size
    }

    fn last_block(&self) -> u64 {
        (self.offset + self.len - 1) / self.block_size
    }

    fn segment(&self, block_no: u64) -> Segment {
        let block_start = block_no * self.block_size;
        let start = self.offset.max(block_start);
        let end = (self.offset + self.len).min(block_start + self.block_size);
        Segment {
            buf_start: (start - self.offset) as usize,
            block_offset: (start - block_start) as usize,
            len: (end - start) as usize,
        }
    }
}

/// Number of blocks a file of `size` bytes occupies.
fn block_count(size: u64, block_size: u64) -> u64 {
    size.div_ceil(block_size)
}

/// Copy the touched part of one fetched block into the output buffer.
///
/// Blocks shorter than the block size are legal; whatever the block does
/// not cover stays zero.
fn fill_segment(out: &mut [u8], segment: Segment, block: &[u8]) {
    let available = block.len().saturating_sub(segment.block_offset);
    let n = segment.len.min(available);
    if n > 0 {
        out[segment.buf_start..segment.buf_start + n]
            .copy_from_slice(&block[segment.block_offset..segment.block_offset + n]);
    }
}

/// Splice a chunk of the request buffer into a block image.
///
/// The block is brought to full block size first so the stored image stays
/// zero-padded.
fn splice_segment(block: &mut Vec<u8>, block_size: usize, segment: Segment, buf: &[u8]) {
    block.resize(block_size, 0);
    block[segment.block_offset..segment.block_offset + segment.len]
        .copy_from_slice(&buf[segment.buf_start..segment.buf_start + segment.len]);
}

async fn fetch_block(
    conn: &mut PgConnection,
    id: i64,
    block_no: u64,
) -> FsResult<Option<Vec<u8>>> {
    let row = sqlx::query("SELECT data FROM data WHERE dir_id = $1 AND block_no = $2")
        .bind(id)
        .bind(block_no as i64)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.get("data")))
}

async fn store_block(
    conn: &mut PgConnection,
    id: i64,
    block_no: u64,
    block: &[u8],
    existed: bool,
) -> FsResult<()> {
    if existed {
        sqlx::query("UPDATE data SET data = $3 WHERE dir_id = $1 AND block_no = $2")
            .bind(id)
            .bind(block_no as i64)
            .bind(block)
            .execute(&mut *conn)
            .await?;
    } else {
        sqlx::query("INSERT INTO data (dir_id, block_no, data) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(block_no as i64)
            .bind(block)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Read up to `size` bytes of file content starting at `offset`.
///
/// The request is clamped to the inode's recorded size, which also masks
/// stale bytes in blocks past the logical end. Blocks missing inside the
/// span read as zeros (sparse semantics).
pub async fn read_buf(
    conn: &mut PgConnection,
    block_size: usize,
    id: i64,
    offset: u64,
    size: usize,
) -> FsResult<Vec<u8>> {
    let meta = read_meta(conn, id, "").await?;
    let file_size = meta.size as u64;

    if offset >= file_size || size == 0 {
        return Ok(Vec::new());
    }
    let len = (size as u64).min(file_size - offset) as usize;

    let span = BlockSpan::new(block_size, offset, len);
    let rows = sqlx::query(
        "SELECT block_no, data FROM data \
         WHERE dir_id = $1 AND block_no BETWEEN $2 AND $3 ORDER BY block_no",
    )
    .bind(id)
    .bind(span.first_block() as i64)
    .bind(span.last_block() as i64)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = vec![0u8; len];
    for row in &rows {
        let block_no = row.get::<i64, _>("block_no") as u64;
        let block: Vec<u8> = row.get("data");
        fill_segment(&mut out, span.segment(block_no), &block);
    }

    trace!(id, offset, requested = size, returned = len, "read blocks");
    Ok(out)
}

/// Write `buf` at `offset`, returning the number of bytes written.
///
/// Every touched block is loaded (or starts as a zero block), spliced and
/// stored back. Blocks created past the current extent leave the gap
/// sparse; the caller maintains the inode's size.
pub async fn write_buf(
    conn: &mut PgConnection,
    block_size: usize,
    id: i64,
    buf: &[u8],
    offset: u64,
) -> FsResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }

    let span = BlockSpan::new(block_size, offset, buf.len());
    let mut written = 0usize;

    for block_no in span.first_block()..=span.last_block() {
        let segment = span.segment(block_no);
        let existing = fetch_block(conn, id, block_no).await?;
        let existed = existing.is_some();
        let mut block = existing.unwrap_or_default();
        splice_segment(&mut block, block_size, segment, buf);
        store_block(conn, id, block_no, &block, existed).await?;
        written += segment.len;
    }

    trace!(id, offset, size = buf.len(), written, "wrote blocks");
    Ok(written)
}

/// Set the block chain of an inode to cover exactly `new_size` bytes.
///
/// Shrinking deletes blocks past the new extent and zeros the tail of the
/// last retained block, so a later grow cannot resurrect stale bytes.
/// Growing appends zero blocks. Block 0 always survives: every
/// non-directory inode keeps its first block from creation to deletion.
/// The caller maintains the inode's size.
pub async fn truncate(
    conn: &mut PgConnection,
    block_size: usize,
    id: i64,
    new_size: u64,
) -> FsResult<()> {
    let meta = read_meta(conn, id, "").await?;
    let old_size = meta.size as u64;
    let bs = block_size as u64;

    let old_blocks = block_count(old_size, bs).max(1);
    let new_blocks = block_count(new_size, bs).max(1);

    if new_size < old_size {
        sqlx::query("DELETE FROM data WHERE dir_id = $1 AND block_no >= $2")
            .bind(id)
            .bind(new_blocks as i64)
            .execute(&mut *conn)
            .await?;

        // Zero the cut-off tail of the last retained block.
        let keep = (new_size - (new_blocks - 1) * bs) as usize;
        if keep < block_size {
            if let Some(mut block) = fetch_block(conn, id, new_blocks - 1).await? {
                block.resize(block_size, 0);
                block[keep..].fill(0);
                store_block(conn, id, new_blocks - 1, &block, true).await?;
            }
        }
    } else if new_blocks > old_blocks {
        sqlx::query(
            "INSERT INTO data (dir_id, block_no, data) \
             SELECT $1, n, $4 FROM generate_series($2::bigint, $3::bigint) AS n",
        )
        .bind(id)
        .bind(old_blocks as i64)
        .bind((new_blocks - 1) as i64)
        .bind(vec![0u8; block_size])
        .execute(&mut *conn)
        .await?;
    }

    trace!(id, old_size, new_size, "truncated blocks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 4096;

    #[test]
    fn span_within_one_block() {
        let span = BlockSpan::new(BS, 100, 50);
        assert_eq!(span.first_block(), 0);
        assert_eq!(span.last_block(), 0);
        assert_eq!(
            span.segment(0),
            Segment {
                buf_start: 0,
                block_offset: 100,
                len: 50
            }
        );
    }

    #[test]
    fn span_unaligned_across_two_boundaries() {
        // Mid-block start, crosses blocks 0->1 and 1->2.
        let span = BlockSpan::new(BS, 3000, 2 * BS);
        assert_eq!(span.first_block(), 0);
        assert_eq!(span.last_block(), 2);

        assert_eq!(
            span.segment(0),
            Segment {
                buf_start: 0,
                block_offset: 3000,
                len: BS - 3000
            }
        );
        assert_eq!(
            span.segment(1),
            Segment {
                buf_start: BS - 3000,
                block_offset: 0,
                len: BS
            }
        );
        assert_eq!(
            span.segment(2),
            Segment {
                buf_start: 2 * BS - 3000,
                block_offset: 0,
                len: 3000
            }
        );
    }

    #[test]
    fn span_exactly_one_aligned_block() {
        let span = BlockSpan::new(BS, BS as u64, BS);
        assert_eq!(span.first_block(), 1);
        assert_eq!(span.last_block(), 1);
        assert_eq!(
            span.segment(1),
            Segment {
                buf_start: 0,
                block_offset: 0,
                len: BS
            }
        );
    }

    #[test]
    fn span_last_byte_of_block() {
        let span = BlockSpan::new(BS, BS as u64 - 1, 1);
        assert_eq!(span.first_block(), 0);
        assert_eq!(span.last_block(), 0);
        assert_eq!(
            span.segment(0),
            Segment {
                buf_start: 0,
                block_offset: BS - 1,
                len: 1
            }
        );
    }

    #[test]
    fn block_counts() {
        let bs = BS as u64;
        assert_eq!(block_count(0, bs), 0);
        assert_eq!(block_count(1, bs), 1);
        assert_eq!(block_count(bs - 1, bs), 1);
        assert_eq!(block_count(bs, bs), 1);
        assert_eq!(block_count(bs + 1, bs), 2);
        assert_eq!(block_count(2049, bs), 1);
    }

    #[test]
    fn fill_segment_masks_short_blocks() {
        let mut out = vec![0u8; 10];
        let segment = Segment {
            buf_start: 2,
            block_offset: 4,
            len: 8,
        };
        // Block holds only 6 bytes: 2 reachable from offset 4.
        fill_segment(&mut out, segment, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(out, vec![0, 0, 5, 6, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn splice_zero_pads_to_block_size() {
        let mut block = Vec::new();
        let segment = Segment {
            buf_start: 1,
            block_offset: 2,
            len: 3,
        };
        splice_segment(&mut block, 8, segment, &[9, 10, 11, 12]);
        assert_eq!(block, vec![0, 0, 10, 11, 12, 0, 0, 0]);
    }

    #[test]
    fn splice_overwrites_existing_bytes() {
        let mut block = vec![7u8; 8];
        let segment = Segment {
            buf_start: 0,
            block_offset: 6,
            len: 2,
        };
        splice_segment(&mut block, 8, segment, &[1, 2]);
        assert_eq!(block, vec![7, 7, 7, 7, 7, 7, 1, 2]);
    }
}
