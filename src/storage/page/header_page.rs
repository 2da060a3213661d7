use byteorder::{ByteOrder, LittleEndian};

use crate::common::config::PAGE_SIZE;
use crate::common::types::{Page, PageId};
use crate::storage::page::{PageError, PageKind};

/// Page 0: a directory of `(index name, root page id)` records, consulted
/// and updated by every index whenever its root changes.
pub struct HeaderPage;

const RECORD_COUNT_OFFSET: usize = 4;
const RECORDS_OFFSET: usize = 8;

const NAME_LEN: usize = 32;
const RECORD_SIZE: usize = NAME_LEN + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

impl HeaderPage {
    pub fn init(page: &mut Page) {
        page.data.fill(0);
        page.data[super::PAGE_KIND_OFFSET] = PageKind::Header as u8;
        Self::set_record_count(page, 0);
    }

    pub fn is_header_page(page: &Page) -> bool {
        PageKind::from_u8(page.data[super::PAGE_KIND_OFFSET]) == PageKind::Header
    }

    pub fn record_count(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[RECORD_COUNT_OFFSET..])
    }

    fn set_record_count(page: &mut Page, count: u32) {
        LittleEndian::write_u32(&mut page.data[RECORD_COUNT_OFFSET..], count);
    }

    fn record_pos(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn name_at(page: &Page, index: usize) -> &[u8] {
        let pos = Self::record_pos(index);
        let name = &page.data[pos..pos + NAME_LEN];
        let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        &name[..end]
    }

    fn find(page: &Page, name: &str) -> Option<usize> {
        (0..Self::record_count(page) as usize).find(|&i| Self::name_at(page, i) == name.as_bytes())
    }

    /// Register a new index. Fails if the name is already present.
    pub fn insert_record(page: &mut Page, name: &str, root_page_id: PageId) -> Result<(), PageError> {
        if name.len() > NAME_LEN {
            return Err(PageError::NameTooLong(name.to_string()));
        }
        if Self::find(page, name).is_some() {
            return Err(PageError::DuplicateRecord(name.to_string()));
        }
        let count = Self::record_count(page) as usize;
        if count >= MAX_RECORDS {
            return Err(PageError::DirectoryFull);
        }

        let pos = Self::record_pos(count);
        page.data[pos..pos + name.len()].copy_from_slice(name.as_bytes());
        page.data[pos + name.len()..pos + NAME_LEN].fill(0);
        LittleEndian::write_u32(&mut page.data[pos + NAME_LEN..], root_page_id);
        Self::set_record_count(page, count as u32 + 1);
        Ok(())
    }

    /// Update the root page id of an existing index.
    pub fn update_record(page: &mut Page, name: &str, root_page_id: PageId) -> Result<(), PageError> {
        let index = Self::find(page, name).ok_or(PageError::TupleNotFound)?;
        let pos = Self::record_pos(index);
        LittleEndian::write_u32(&mut page.data[pos + NAME_LEN..], root_page_id);
        Ok(())
    }

    pub fn get_root_page_id(page: &Page, name: &str) -> Option<PageId> {
        let index = Self::find(page, name)?;
        let pos = Self::record_pos(index);
        Some(LittleEndian::read_u32(&page.data[pos + NAME_LEN..]))
    }
}
