#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

pub const FLASH_SECTOR_SIZE: usize = 4096;
pub const WORD_SIZE: usize = 4;

pub const PAGE_HEADER_SIZE: usize = 8;
pub const ELEMENT_SIZE: usize = 8;
pub const ELEMENTS_PER_PAGE: usize = (FLASH_SECTOR_SIZE - PAGE_HEADER_SIZE) / ELEMENT_SIZE;
pub const VALID_MARKER: u32 = 0x1ACCE551;

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(pages: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn erases(&mut self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn page_is_erased(&self, page: usize) -> bool {
        self.buf[page * FLASH_SECTOR_SIZE..(page + 1) * FLASH_SECTOR_SIZE]
            .iter()
            .all(|&b| b == 0xFF)
    }
}

/// On-flash element image: value word, then `parity << 16 | slot`.
pub fn raw_element(slot: u16, value: u32) -> [u8; ELEMENT_SIZE] {
    let parity = (value as u16) ^ ((value >> 16) as u16) ^ slot;
    let tag = (u32::from(parity) << 16) | u32::from(slot);

    let mut buf = [0u8; ELEMENT_SIZE];
    buf[..4].copy_from_slice(&value.to_le_bytes());
    buf[4..].copy_from_slice(&tag.to_le_bytes());
    buf
}

/// Forges a committed page header directly in the backing buffer, bypassing the
/// operation log. Used to craft pre-crash flash images.
pub fn write_valid_header(flash: &mut Flash, page: usize) {
    let base = page * FLASH_SECTOR_SIZE;
    flash.buf[base..base + 4].copy_from_slice(&VALID_MARKER.to_le_bytes());
    flash.buf[base + 4..base + 8].copy_from_slice(&VALID_MARKER.to_le_bytes());
}

/// Forges one element at the given index of a page, bypassing the operation log.
pub fn write_raw_element(flash: &mut Flash, page: usize, index: usize, slot: u16, value: u32) {
    assert!(index < ELEMENTS_PER_PAGE);
    let addr = page * FLASH_SECTOR_SIZE + PAGE_HEADER_SIZE + index * ELEMENT_SIZE;
    flash.buf[addr..addr + ELEMENT_SIZE].copy_from_slice(&raw_element(slot, value));
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT on read 0x{offset:04X}");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        assert!(!bytes.is_empty());

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash writes can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

/// Shared handle to a [`Flash`] so a test can corrupt the backing buffer while the store
/// still holds its flash instance.
pub struct Shared<'a>(pub &'a std::cell::RefCell<Flash>);

impl ErrorType for Shared<'_> {
    type Error = FlashError;
}

impl ReadNorFlash for Shared<'_> {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.0.borrow_mut().read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.0.borrow().buf.len()
    }
}

impl NorFlash for Shared<'_> {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.0.borrow_mut().erase(from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.0.borrow_mut().write(offset, bytes)
    }
}
