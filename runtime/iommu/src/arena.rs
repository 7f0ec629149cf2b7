//! Mapping arena - index-linked storage for translation records
//!
//! Records live in a `Vec` and are chained into a singly linked list sorted
//! by IOVA. Links are `u32` indices; [`NIL`] marks the end of the list (and
//! an empty list's head). Freed indices go on a free list and are reused by
//! the next insert, so the vector only grows to the high-water mark.

use alloc::vec::Vec;

use crate::{page, IommuMapping};

/// Sentinel link: no record
const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Record {
    mapping: IommuMapping,
    next: u32,
}

/// Arena of mapping records
#[derive(Debug)]
pub(crate) struct MappingArena {
    records: Vec<Option<Record>>,
    free: Vec<u32>,
    head: u32,
    len: usize,
}

impl MappingArena {
    pub(crate) const fn new() -> Self {
        Self {
            records: Vec::new(),
            free: Vec::new(),
            head: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn record(&self, link: u32) -> Option<&Record> {
        if link == NIL {
            return None;
        }
        self.records.get(link as usize).and_then(Option::as_ref)
    }

    fn set_next(&mut self, link: u32, next: u32) {
        if let Some(record) = self.records.get_mut(link as usize).and_then(Option::as_mut) {
            record.next = next;
        }
    }

    fn allocate(&mut self, record: Record) -> u32 {
        match self.free.pop() {
            Some(index) => {
                self.records[index as usize] = Some(record);
                index
            }
            None => {
                self.records.push(Some(record));
                (self.records.len() - 1) as u32
            }
        }
    }

    /// Walk the list in IOVA order
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            arena: self,
            cursor: self.head,
        }
    }

    /// First record intersecting `[iova, iova + length)`
    pub(crate) fn find_overlap(&self, iova: u64, length: u64) -> Option<&IommuMapping> {
        let last = page::range_last(iova, length)?;
        self.iter()
            .take_while(|m| m.iova <= last)
            .find(|m| m.overlaps(iova, length))
    }

    /// Record whose range contains `iova`
    pub(crate) fn find_containing(&self, iova: u64) -> Option<&IommuMapping> {
        self.iter()
            .take_while(|m| m.iova <= iova)
            .find(|m| m.contains(iova))
    }

    /// Link a record in IOVA order
    ///
    /// The caller has already checked that it overlaps nothing.
    pub(crate) fn insert(&mut self, mapping: IommuMapping) {
        let mut prev = NIL;
        let mut cursor = self.head;
        while let Some(record) = self.record(cursor) {
            if record.mapping.iova > mapping.iova {
                break;
            }
            prev = cursor;
            cursor = record.next;
        }

        let index = self.allocate(Record {
            mapping,
            next: cursor,
        });
        if prev == NIL {
            self.head = index;
        } else {
            self.set_next(prev, index);
        }
        self.len += 1;
    }

    /// Unlink the record that starts at `iova` and spans exactly `length`
    ///
    /// A record starting at `iova` with a different length is left alone:
    /// partial unmaps are not supported.
    pub(crate) fn remove_exact(&mut self, iova: u64, length: u64) -> Option<IommuMapping> {
        let mut prev = NIL;
        let mut cursor = self.head;
        while let Some(record) = self.record(cursor).copied() {
            if record.mapping.iova > iova {
                return None;
            }
            if record.mapping.iova == iova {
                if record.mapping.length != length {
                    return None;
                }

                if prev == NIL {
                    self.head = record.next;
                } else {
                    self.set_next(prev, record.next);
                }
                self.records[cursor as usize] = None;
                self.free.push(cursor);
                self.len -= 1;
                return Some(record.mapping);
            }
            prev = cursor;
            cursor = record.next;
        }
        None
    }

    /// Drop every record, returning how many there were
    pub(crate) fn clear(&mut self) -> usize {
        let cleared = self.len;
        self.records.clear();
        self.free.clear();
        self.head = NIL;
        self.len = 0;
        cleared
    }
}

/// In-order iterator over arena records
pub(crate) struct Iter<'a> {
    arena: &'a MappingArena,
    cursor: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a IommuMapping;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.arena.record(self.cursor)?;
        self.cursor = record.next;
        Some(&record.mapping)
    }
}
