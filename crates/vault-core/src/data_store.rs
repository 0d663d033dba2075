//! Paged file contents: (inode id, page index) → page bytes.
//!
//! A regular file's bytes are split into fixed-size pages. The data key is
//! 12 bytes — 8-byte big-endian inode id followed by a 4-byte big-endian page
//! index — so all pages of one inode form a contiguous key range in page
//! order. Pages with trailing zero bytes are stored truncated; reads
//! reconstruct the zeros, which also gives holes for free. A separate table
//! tracks each inode's logical length, since the last stored page says
//! nothing about how far the file extends.

use tracing::trace;
use vault_store::{StoreTxn, Table};

use crate::error::{FileOpError, OpResult};
use crate::inode::{id_to_key, pretty_id};

/// Key of one data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataKey {
    pub fid: u64,
    pub page: i32,
}

impl DataKey {
    pub fn new(fid: u64, page: i32) -> OpResult<Self> {
        if fid == 0 {
            return Err(FileOpError::Io("fid must be a positive id".to_string()));
        }
        if page < 0 {
            return Err(FileOpError::Io("page index must be non-negative".to_string()));
        }
        Ok(Self { fid, page })
    }

    pub fn encode(&self) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&self.fid.to_be_bytes());
        key[8..].copy_from_slice(&self.page.to_be_bytes());
        key
    }

    pub fn decode(raw: &[u8]) -> OpResult<Self> {
        if raw.len() != 12 {
            return Err(FileOpError::Io(format!(
                "data key has length {}",
                raw.len()
            )));
        }
        let fid = u64::from_be_bytes(raw[..8].try_into().expect("checked length"));
        let page = i32::from_be_bytes(raw[8..].try_into().expect("checked length"));
        Self::new(fid, page)
    }
}

pub struct DataStore {
    page_size: i32,
}

impl DataStore {
    pub fn new(page_size: i32) -> Self {
        Self { page_size }
    }

    pub fn page_size(&self) -> i32 {
        self.page_size
    }

    fn page_size_u64(&self) -> u64 {
        self.page_size as u64
    }

    fn page_index(&self, position: u64) -> OpResult<i32> {
        let index = position / self.page_size_u64();
        i32::try_from(index)
            .map_err(|_| FileOpError::Io(format!("position {position} exceeds maximum file size")))
    }

    fn read_fid_length(&self, txn: &mut StoreTxn<'_>, fid: u64) -> OpResult<u64> {
        match txn.get(Table::DataLength, &id_to_key(fid))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| FileOpError::Io("malformed length record".to_string()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn write_fid_length(&self, txn: &mut StoreTxn<'_>, fid: u64, length: u64) -> OpResult<()> {
        txn.put(Table::DataLength, &id_to_key(fid), &length.to_be_bytes())?;
        Ok(())
    }

    /// Logical length of the inode's data; 0 when no length record exists.
    pub fn length(&self, txn: &mut StoreTxn<'_>, fid: u64) -> OpResult<u64> {
        self.read_fid_length(txn, fid)
    }

    /// Cardinality of the page table across all inodes.
    pub fn total_pages_used(&self, txn: &mut StoreTxn<'_>) -> OpResult<u64> {
        Ok(txn.count(Table::Data)?)
    }

    /// Number of inodes with data (length records).
    pub fn size(&self, txn: &mut StoreTxn<'_>) -> OpResult<u64> {
        Ok(txn.count(Table::DataLength)?)
    }

    fn read_page(&self, txn: &mut StoreTxn<'_>, fid: u64, page: i32) -> OpResult<Vec<u8>> {
        let key = DataKey::new(fid, page)?.encode();
        Ok(txn.get(Table::Data, &key)?.unwrap_or_default())
    }

    fn write_page(&self, txn: &mut StoreTxn<'_>, fid: u64, page: i32, data: &[u8]) -> OpResult<()> {
        let key = DataKey::new(fid, page)?.encode();
        let suffix_nulls = data.iter().rev().take_while(|&&b| b == 0).count();
        let stored = &data[..data.len() - suffix_nulls];
        trace!(
            inode = %pretty_id(fid),
            page,
            len = data.len(),
            stored = stored.len(),
            "write page"
        );
        txn.put(Table::Data, &key, stored)?;
        Ok(())
    }

    /// Random-access read. Clamps to the logical length; zero-fills holes and
    /// elided page tails within the read window.
    pub fn read_data(
        &self,
        txn: &mut StoreTxn<'_>,
        fid: u64,
        count: u64,
        offset: u64,
    ) -> OpResult<Vec<u8>> {
        let stored_length = self.read_fid_length(txn, fid)?;
        let requested_last = offset
            .checked_add(count)
            .ok_or_else(|| FileOpError::Io("read range overflows".to_string()))?;

        let effective_count = if requested_last > stored_length {
            stored_length.saturating_sub(offset)
        } else {
            count
        };

        let page_size = self.page_size_u64();
        let last_position = offset + effective_count;
        let mut position = offset;
        let mut page = self.page_index(offset)?;
        let mut out = Vec::with_capacity(effective_count as usize);

        while position < last_position {
            let page_data = self.read_page(txn, fid, page)?;

            let total_remaining = (last_position - position) as usize;
            let page_read_start = (position % page_size) as usize;
            let page_read_len = usize::min(page_size as usize - page_read_start, total_remaining);
            let page_read_end = page_read_start + page_read_len;

            let effective_end = usize::min(page_read_end, page_data.len());
            let copy_len = effective_end.saturating_sub(page_read_start);
            if copy_len > 0 {
                out.extend_from_slice(&page_data[page_read_start..effective_end]);
            }
            // zeros elided at store time, or a hole
            out.resize(out.len() + (page_read_len - copy_len), 0);

            position += page_read_len as u64;
            page += 1;
        }

        Ok(out)
    }

    /// Random-access write. Grows the logical length when the write extends
    /// past it; partial pages are read-modify-written.
    pub fn write_data(
        &self,
        txn: &mut StoreTxn<'_>,
        fid: u64,
        buf: &[u8],
        offset: u64,
    ) -> OpResult<usize> {
        let count = buf.len() as u64;
        let last_position = offset
            .checked_add(count)
            .ok_or_else(|| FileOpError::Io("write range overflows".to_string()))?;

        let page_size = self.page_size_u64();
        let mut position = offset;
        let mut page = self.page_index(offset)?;
        let mut consumed = 0usize;

        while consumed < buf.len() {
            let page_write_start = (position % page_size) as usize;
            let page_write_end =
                usize::min(page_write_start + (buf.len() - consumed), page_size as usize);
            let page_write_len = page_write_end - page_write_start;
            let slice = &buf[consumed..consumed + page_write_len];

            if page_write_start != 0 || page_write_end != page_size as usize {
                // partial page: overlay onto the existing bytes
                let existing = self.read_page(txn, fid, page)?;
                let mut merged = vec![0u8; usize::max(page_write_end, existing.len())];
                merged[..existing.len()].copy_from_slice(&existing);
                merged[page_write_start..page_write_end].copy_from_slice(slice);
                self.write_page(txn, fid, page, &merged)?;
            } else {
                self.write_page(txn, fid, page, slice)?;
            }

            position += page_write_len as u64;
            consumed += page_write_len;
            page += 1;
        }

        self.update_length_if_needed(txn, fid, last_position)?;
        Ok(buf.len())
    }

    fn update_length_if_needed(
        &self,
        txn: &mut StoreTxn<'_>,
        fid: u64,
        new_length: u64,
    ) -> OpResult<()> {
        let stored_length = self.read_fid_length(txn, fid)?;
        if new_length > stored_length {
            self.write_fid_length(txn, fid, new_length)?;
            trace!(
                inode = %pretty_id(fid),
                length = new_length,
                old = stored_length,
                "grew file length"
            );
        }
        Ok(())
    }

    /// Shrink the inode's data to `length`. A no-op when `length` is not
    /// smaller than the current length; growth happens on the next write.
    pub fn truncate(&self, txn: &mut StoreTxn<'_>, fid: u64, length: u64) -> OpResult<()> {
        let existing_length = self.read_fid_length(txn, fid)?;
        if existing_length <= length {
            return Ok(());
        }

        let page_size = self.page_size_u64();
        let new_last_page = self.page_index(length)?;

        // cut the new last page down to its remaining bytes; when the new
        // length lands exactly on a page boundary that page holds nothing
        // and is dropped with the rest
        let new_last_page_end = (length % page_size) as usize;
        let first_dead_page = if new_last_page_end > 0 {
            let page_data = self.read_page(txn, fid, new_last_page)?;
            if page_data.len() > new_last_page_end {
                self.write_page(txn, fid, new_last_page, &page_data[..new_last_page_end])?;
            }
            new_last_page + 1
        } else {
            new_last_page
        };

        let existing_total_pages = self.page_index(existing_length)?;
        for page in first_dead_page..=existing_total_pages {
            txn.delete(Table::Data, &DataKey::new(fid, page)?.encode())?;
        }

        trace!(inode = %pretty_id(fid), length, "truncated");
        self.write_fid_length(txn, fid, length)?;
        Ok(())
    }

    /// Remove every page and the length record for `fid`.
    pub fn delete_entry(&self, txn: &mut StoreTxn<'_>, fid: u64) -> OpResult<()> {
        let total_length = self.read_fid_length(txn, fid)?;
        let total_pages = self.page_index(total_length)?;

        for page in 0..=total_pages {
            txn.delete(Table::Data, &DataKey::new(fid, page)?.encode())?;
        }
        txn.delete(Table::DataLength, &id_to_key(fid))?;

        trace!(inode = %pretty_id(fid), pages = total_pages + 1, "removed data pages");
        Ok(())
    }
}
