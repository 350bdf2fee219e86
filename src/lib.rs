#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod internal;
pub mod platform;
mod raw;

extern crate alloc;

use crate::error::Error;
use crate::internal::{AppendOutcome, WriteTarget};
use crate::platform::Platform;
use crate::raw::{
    ELEMENTS_PER_PAGE, FLASH_SECTOR_SIZE, PAGE_COUNT, PAGE_HEADER_SIZE, Page, SLOT_COUNT,
};

/// Default number of header reads per page during [`Eeprom::init`] before a page is
/// declared invalid.
pub const DEFAULT_HEADER_READ_RETRIES: u8 = 3;

/// Usage snapshot of the store, see [`Eeprom::statistics`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EepromStatistics {
    /// Index of the committed page, if any
    pub active_page: Option<u8>,
    /// Element usage of the active page
    pub entries: EntryStatistics,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EntryStatistics {
    /// Programmed elements, including superseded records of overwritten slots
    pub written: u16,
    /// Distinct slots that currently hold a value
    pub live: u16,
    /// Remaining free element locations
    pub empty: u16,
}

/// The store itself: three flash sectors used as append-only log pages in a fixed
/// rotation, plus the volatile slot map rebuilt from the active page at init.
///
/// All operations are synchronous and blocking; an erase can take milliseconds. The
/// in-memory map is mutated non-atomically with respect to the flash, so callers must
/// serialize access and must not re-enter from interrupt context while a write or
/// transfer is in progress.
pub struct Eeprom<T: Platform> {
    pub(crate) hal: T,
    pub(crate) base_address: u32,
    /// Flash address of the newest element per slot, on the active page only
    pub(crate) entry_table: [Option<u32>; SLOT_COUNT],
    /// Address of the next empty element location, or the active page's end when full
    pub(crate) next_free_addr: u32,
    pub(crate) header_read_retries: u8,
}

impl<T: Platform> Eeprom<T> {
    /// Binds the store to three flash sectors starting at `partition_offset`.
    ///
    /// This performs no flash access beyond a capacity query; call [`init`](Self::init)
    /// to run recovery before reading or writing.
    pub fn new(partition_offset: u32, hal: T) -> Result<Eeprom<T>, Error> {
        if !(partition_offset as usize).is_multiple_of(FLASH_SECTOR_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }

        if partition_offset as usize + PAGE_COUNT * FLASH_SECTOR_SIZE > hal.capacity() {
            return Err(Error::InvalidPartitionSize);
        }

        Ok(Self {
            hal,
            base_address: partition_offset,
            entry_table: [None; SLOT_COUNT],
            next_free_addr: 0,
            header_read_retries: DEFAULT_HEADER_READ_RETRIES,
        })
    }

    /// Restores the pages to a known good state in case of a power loss and rebuilds the
    /// slot map from the active page. If the active page turns out to be full, the
    /// interrupted transfer is completed before returning.
    ///
    /// Call once at startup. [`Error::InvalidHeader`] means no committed state exists
    /// (factory-fresh flash, or corruption beyond repair) and the caller must
    /// [`format`](Self::format) before further use.
    pub fn init(&mut self) -> Result<(), Error> {
        self.recover()
    }

    /// Erases all three pages and establishes page 0 as the sole valid page with an
    /// empty slot map. All stored values are lost.
    pub fn format(&mut self) -> Result<(), Error> {
        #[cfg(feature = "debug-logs")]
        println!("eeprom: format");

        for page in Page::ALL {
            self.verify_erase_page(page)?;
        }

        self.entry_table = [None; SLOT_COUNT];
        self.next_free_addr = self.page_base(Page::Page0) + PAGE_HEADER_SIZE as u32;

        self.set_page_valid(Page::Page0)
    }

    /// Returns the last stored value for `slot`, or [`Error::NoData`] if the slot has
    /// never been written.
    pub fn read_word(&mut self, slot: u16) -> Result<u32, Error> {
        self.read_slot(slot)
    }

    /// Writes or updates the value for `slot`, appending a new element to the active
    /// page. When the append lands on the page's last free location, the live data is
    /// transferred to the next page in rotation before returning.
    pub fn write_word(&mut self, slot: u16, value: u32) -> Result<(), Error> {
        let outcome = self.append(slot, value, WriteTarget::ActivePage)?;

        if outcome == AppendOutcome::PageNowFull {
            self.transfer_page().map_err(|e| e.into_transfer())?;
        }

        Ok(())
    }

    /// Returns usage statistics for the active page.
    pub fn statistics(&mut self) -> Result<EepromStatistics, Error> {
        let Some(page) = self.find_page()? else {
            return Ok(EepromStatistics {
                active_page: None,
                entries: EntryStatistics::default(),
            });
        };

        let written = self.count_written_elements(page)?;
        let live = self.entry_table.iter().filter(|e| e.is_some()).count() as u16;

        Ok(EepromStatistics {
            active_page: Some(page.index()),
            entries: EntryStatistics {
                written,
                live,
                empty: ELEMENTS_PER_PAGE as u16 - written,
            },
        })
    }

    /// Overrides the number of header read attempts used by [`init`](Self::init) when
    /// classifying pages (default [`DEFAULT_HEADER_READ_RETRIES`]). Values below 1 are
    /// treated as 1.
    pub fn set_header_read_retries(&mut self, retries: u8) {
        self.header_read_retries = retries;
    }
}
