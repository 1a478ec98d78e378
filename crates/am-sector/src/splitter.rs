use bytes::Bytes;

use am_types::{AmError, BlobKey, RequestId, TxId, WriteMode};

use crate::map::{Progress, SectorAction, SectorLockMap};
use crate::update::SectorUpdate;

/// A client write against one blob.
#[derive(Clone, Debug)]
pub struct BlobWrite {
    pub key: BlobKey,
    pub tx: Option<TxId>,
    pub offset: u64,
    pub data: Bytes,
    pub mode: WriteMode,
}

/// Result of feeding one write into a lock map.
#[derive(Debug, Default)]
pub struct SplitOutcome {
    /// Every sector offset the write touches.
    pub offsets: Vec<u64>,
    /// Offsets that need a read before they can be written.
    pub need_get: Vec<u64>,
    pub progress: Progress,
}

/// Aligns client writes to storage-object boundaries.
#[derive(Clone, Copy, Debug)]
pub struct WriteSplitter {
    object_size: u32,
}

impl WriteSplitter {
    pub fn new(object_size: u32) -> Self {
        Self { object_size }
    }

    pub fn object_size(&self) -> u32 {
        self.object_size
    }

    /// Reject a write whose last sector would end past `u64::MAX`.
    pub fn check(&self, write: &BlobWrite) -> Result<(), AmError> {
        let size = u64::from(self.object_size);
        let end = write.offset.checked_add(write.data.len() as u64);
        let last_start = end.map(|end| {
            let last = end.saturating_sub(1).max(write.offset);
            last - last % size
        });
        match last_start.and_then(|start| start.checked_add(size)) {
            Some(_) => Ok(()),
            None => Err(AmError::InvalidArgument(format!(
                "write of {} bytes at offset {} overflows the blob address space",
                write.data.len(),
                write.offset
            ))),
        }
    }

    /// One update per sector the write touches. Writes that fail
    /// [`check`](Self::check) are clipped at the end of the address space.
    ///
    /// A piece covering its whole sector is complete. In truncate mode every
    /// piece that starts on a sector boundary is complete as well, since
    /// whatever followed it is discarded; only a first piece starting inside
    /// a sector still needs the bytes before it. The last piece of a
    /// truncating write carries the truncate flag, and an empty truncating
    /// write becomes one empty piece so the blob still shrinks.
    pub fn split(&self, write: &BlobWrite) -> Vec<SectorUpdate> {
        let size = u64::from(self.object_size);
        let truncating = write.mode == WriteMode::Truncate;
        let end = write.offset.saturating_add(write.data.len() as u64);

        if write.data.is_empty() {
            if !truncating {
                return Vec::new();
            }
            let object_start = write.offset - write.offset % size;
            let sub = (write.offset - object_start) as u32;
            return vec![SectorUpdate::write(object_start, sub, Bytes::new(), sub == 0)
                .with_tx(write.tx)
                .with_truncate(true)];
        }

        let mut pieces = Vec::new();
        let mut cursor = write.offset;
        while cursor < end {
            let object_start = cursor - cursor % size;
            let object_end = object_start.saturating_add(size);
            let piece_end = end.min(object_end);
            let sub = (cursor - object_start) as u32;
            let data = write
                .data
                .slice((cursor - write.offset) as usize..(piece_end - write.offset) as usize);
            let whole = sub == 0 && piece_end == object_end;
            let complete = whole || (truncating && sub == 0);
            pieces.push(
                SectorUpdate::write(object_start, sub, data, complete)
                    .with_tx(write.tx)
                    .with_truncate(truncating && piece_end == end),
            );
            cursor = piece_end;
        }
        pieces
    }

    /// Split `write` and queue it on `map` under `request`.
    pub fn feed(&self, map: &mut SectorLockMap, request: RequestId, write: &BlobWrite) -> SplitOutcome {
        let pieces = self.split(write);
        let offsets = pieces.iter().map(SectorUpdate::offset).collect();
        let progress = map.queue_write(request, pieces);
        let need_get = progress
            .actions
            .iter()
            .filter_map(|action| match action {
                SectorAction::Read { offsets, .. } => Some(offsets.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect();
        SplitOutcome {
            offsets,
            need_get,
            progress,
        }
    }
}
