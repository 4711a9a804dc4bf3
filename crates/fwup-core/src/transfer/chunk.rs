//! Lazy, address-ordered chunking of a firmware payload.

use crate::error::{Error, Result};

/// One bounded slice of the payload, sent in a single transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Sequence index, starting at 0.
    pub index: usize,
    /// Absolute device address (payload offset for unaddressed protocols).
    pub address: u64,
    /// Offset of `data` within the payload.
    pub offset: usize,
    /// Hardware page the chunk lives in (0 without a page size).
    pub page: u64,
    pub data: &'a [u8],
}

impl Chunk<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of the chunk inside its page.
    pub fn page_offset(&self, page_size: Option<u64>) -> u64 {
        match page_size {
            Some(size) if size > 0 => self.address % size,
            _ => self.address,
        }
    }
}

/// How a payload is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub start_address: Option<u64>,
    pub max_size: usize,
    pub page_size: Option<u64>,
}

impl ChunkLayout {
    pub fn new(start_address: Option<u64>, max_size: usize) -> Self {
        Self {
            start_address,
            max_size,
            page_size: None,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = (page_size > 0).then_some(page_size);
        self
    }

    fn base(&self) -> u64 {
        self.start_address.unwrap_or(0)
    }

    fn chunk_len(&self, offset: usize, remaining: usize) -> usize {
        let mut len = remaining.min(self.max_size);
        if let Some(page) = self.page_size {
            let address = self.base() + offset as u64;
            let to_boundary = page - address % page;
            len = len.min(usize::try_from(to_boundary).unwrap_or(usize::MAX));
        }
        len
    }
}

/// Finite, non-restartable chunk sequence over a borrowed payload.
///
/// Deliberately not `Clone`: walking the payload again requires a new
/// `Chunks` built from the same buffer.
#[derive(Debug)]
pub struct Chunks<'a> {
    data: &'a [u8],
    layout: ChunkLayout,
    offset: usize,
    index: usize,
    total: usize,
}

impl<'a> Chunks<'a> {
    pub fn new(data: &'a [u8], layout: ChunkLayout) -> Result<Self> {
        if layout.max_size == 0 {
            return Err(Error::InvalidData("chunk size must be non-zero".into()));
        }
        let end = layout.base().checked_add(data.len() as u64);
        if end.is_none() {
            return Err(Error::InvalidData(format!(
                "payload of {} bytes overflows address space at 0x{:X}",
                data.len(),
                layout.base()
            )));
        }

        let mut total = 0;
        let mut offset = 0;
        while offset < data.len() {
            offset += layout.chunk_len(offset, data.len() - offset);
            total += 1;
        }

        Ok(Self {
            data,
            layout,
            offset: 0,
            index: 0,
            total,
        })
    }

    /// Total number of chunks the sequence yields.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn total_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        if self.offset >= self.data.len() {
            return None;
        }
        let len = self
            .layout
            .chunk_len(self.offset, self.data.len() - self.offset);
        let address = self.layout.base() + self.offset as u64;
        let page = match self.layout.page_size {
            Some(size) => address / size,
            None => 0,
        };

        let chunk = Chunk {
            index: self.index,
            address,
            offset: self.offset,
            page,
            data: &self.data[self.offset..self.offset + len],
        };
        self.offset += len;
        self.index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks<'_> {}
