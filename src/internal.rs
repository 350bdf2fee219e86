use crate::Eeprom;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    ELEMENT_SIZE, Element, FLASH_SECTOR_SIZE, PAGE_HEADER_SIZE, Page, PageState, SLOT_COUNT,
    VALID_MARKER, program_dword, read_element, read_flash_word, verify_erased,
};
#[cfg(feature = "defmt")]
use defmt::trace;

/// Which page an append targets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum WriteTarget {
    ActivePage,
    /// Used by the transfer engine while the destination page's header is still erased.
    NextPage,
}

/// Result of a successful append. Page-full is not an error: the element was written, and
/// the caller decides whether to start a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AppendOutcome {
    Written,
    /// The element just written occupies the page's last slot.
    PageNowFull,
}

impl<T: Platform> Eeprom<T> {
    pub(crate) fn page_base(&self, page: Page) -> u32 {
        self.base_address + u32::from(page.index()) * FLASH_SECTOR_SIZE as u32
    }

    fn first_element_addr(&self, page: Page) -> u32 {
        self.page_base(page) + PAGE_HEADER_SIZE as u32
    }

    fn last_element_addr(&self, page: Page) -> u32 {
        self.page_base(page) + (FLASH_SECTOR_SIZE - ELEMENT_SIZE) as u32
    }

    /// Classifies a page from its header. Valid if either header word carries the marker.
    pub(crate) fn page_state(&mut self, page: Page) -> Result<PageState, Error> {
        let base = self.page_base(page);
        let header_low = read_flash_word(&mut self.hal, base)?;
        let header_high = read_flash_word(&mut self.hal, base + 4)?;

        if header_low == VALID_MARKER || header_high == VALID_MARKER {
            Ok(PageState::Valid)
        } else {
            Ok(PageState::Invalid)
        }
    }

    /// Classifies a page for recovery, re-reading up to the configured retry count and
    /// accepting the first Valid answer. Marginal cells near the erase/program threshold
    /// can read back non-canonical bits; the retry is an empirical mitigation, not a
    /// guarantee.
    fn classify_page(&mut self, page: Page) -> Result<PageState, Error> {
        let mut state = PageState::Invalid;
        for _ in 0..self.header_read_retries.max(1) {
            state = self.page_state(page)?;
            if state == PageState::Valid {
                break;
            }
        }

        #[cfg(feature = "defmt")]
        trace!("classify_page: {}: {}", page.index(), state);

        Ok(state)
    }

    /// The active page, i.e. the first page whose header is committed.
    pub(crate) fn find_page(&mut self) -> Result<Option<Page>, Error> {
        for page in Page::ALL {
            if self.page_state(page)? == PageState::Valid {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    /// Restores the pages to a known good state after a possible power loss and rebuilds
    /// the in-memory map. The joint header classification is matched exhaustively so every
    /// reachable (and unreachable) combination has an explicit outcome.
    pub(crate) fn recover(&mut self) -> Result<(), Error> {
        let states = (
            self.classify_page(Page::Page0)?,
            self.classify_page(Page::Page1)?,
            self.classify_page(Page::Page2)?,
        );

        #[cfg(feature = "debug-logs")]
        println!("internal: recover: {states:?}");

        use PageState::{Invalid, Valid};
        let (active, stale) = match states {
            // Steady state: one committed page. The others are wiped in case a crashed
            // transfer left a partial copy behind.
            (Valid, Invalid, Invalid) => (Page::Page0, [Page::Page1, Page::Page2]),
            (Invalid, Valid, Invalid) => (Page::Page1, [Page::Page0, Page::Page2]),
            (Invalid, Invalid, Valid) => (Page::Page2, [Page::Page0, Page::Page1]),

            // Torn transfer: the new header was committed but the old page was not erased
            // yet. The survivor is the rotation successor of the pair; the predecessor is
            // retired, and the third page is wiped first.
            (Valid, Valid, Invalid) => (Page::Page1, [Page::Page2, Page::Page0]),
            (Invalid, Valid, Valid) => (Page::Page2, [Page::Page0, Page::Page1]),
            (Valid, Invalid, Valid) => (Page::Page0, [Page::Page1, Page::Page2]),

            // No committed state at all, or an inconsistent triple. Only a format can
            // re-establish the single-valid-page invariant.
            (Invalid, Invalid, Invalid) | (Valid, Valid, Valid) => {
                return Err(Error::InvalidHeader);
            }
        };

        for page in stale {
            self.verify_erase_page(page)?;
        }
        self.create_map(active)?;

        // A full active page means a transfer was started (its target just got re-erased
        // above) but never committed; run it again from scratch.
        self.resume_transfer()
    }

    /// Rebuilds the slot map and append cursor by scanning the page's element region from
    /// the end down to the first element.
    pub(crate) fn create_map(&mut self, page: Page) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("create_map: page {}", page.index());

        #[cfg(feature = "debug-logs")]
        println!("internal: create_map: page {}", page.index());

        // Assume the page is full until an empty trailing element proves otherwise.
        self.next_free_addr = self.page_base(page) + FLASH_SECTOR_SIZE as u32;
        self.entry_table = [None; SLOT_COUNT];

        let first = self.first_element_addr(page);
        let mut addr = self.last_element_addr(page);
        let mut seen_dirty = false;

        while addr >= first {
            let element = read_element(&mut self.hal, addr)?;

            if element.is_empty() {
                // Still inside the erased tail of the log
                if !seen_dirty {
                    self.next_free_addr = addr;
                }
            } else {
                seen_dirty = true;

                if !element.check_parity() {
                    return Err(Error::Parity);
                }

                let slot = element.slot() as usize;
                if slot >= SLOT_COUNT {
                    return Err(Error::InvalidAddress);
                }

                // Scanning backwards, the first occurrence is the newest record
                if self.entry_table[slot].is_none() {
                    self.entry_table[slot] = Some(addr);
                }
            }

            addr -= ELEMENT_SIZE as u32;
        }

        Ok(())
    }

    /// Appends one element at the cursor, verifying the location and the programmed data.
    pub(crate) fn append(
        &mut self,
        slot: u16,
        value: u32,
        target: WriteTarget,
    ) -> Result<AppendOutcome, Error> {
        if slot as usize >= SLOT_COUNT {
            return Err(Error::InvalidAddress);
        }

        let active = self.find_page()?.ok_or(Error::NoPageFound)?;
        let page = match target {
            WriteTarget::ActivePage => active,
            WriteTarget::NextPage => active.next(),
        };

        let entry_addr = self.next_free_addr;
        let first = self.first_element_addr(page);
        let last = self.last_element_addr(page);

        if entry_addr < first || entry_addr > last {
            return Err(Error::InvalidEntry);
        }

        #[cfg(feature = "defmt")]
        trace!("append: slot {} @{:#08x}", slot, entry_addr);

        // Advance the cursor before touching the flash, matching the append-only
        // discipline: a failed program leaves the location dirty and it must not be
        // retried in place.
        self.next_free_addr = entry_addr + ELEMENT_SIZE as u32;

        if !read_element(&mut self.hal, entry_addr)?.is_empty() {
            return Err(Error::ElementNotEmpty);
        }

        let element = Element::new(slot, value);
        program_dword(&mut self.hal, entry_addr, element.value, element.tag)
            .map_err(|_| Error::FlashWrite)?;

        if read_element(&mut self.hal, entry_addr)? != element {
            return Err(Error::WriteCheckFailed);
        }

        self.entry_table[slot as usize] = Some(entry_addr);

        if entry_addr == last {
            Ok(AppendOutcome::PageNowFull)
        } else {
            Ok(AppendOutcome::Written)
        }
    }

    /// Returns the most recent value for a slot, cross-checking the cached address, the
    /// element parity and the stored slot id.
    pub(crate) fn read_slot(&mut self, slot: u16) -> Result<u32, Error> {
        if slot as usize >= SLOT_COUNT {
            return Err(Error::InvalidAddress);
        }

        let page = self.find_page()?.ok_or(Error::NoPageFound)?;
        let entry_addr = self.entry_table[slot as usize].ok_or(Error::NoData)?;

        if entry_addr < self.first_element_addr(page) || entry_addr > self.last_element_addr(page)
        {
            return Err(Error::InvalidEntry);
        }

        let element = read_element(&mut self.hal, entry_addr)?;

        if !element.check_parity() {
            return Err(Error::Parity);
        }
        if element.slot() != slot {
            return Err(Error::AddrMismatch);
        }

        Ok(element.value)
    }

    /// Moves all live slots from the full active page into the next page in rotation and
    /// retires the old page.
    ///
    /// The destination header stays erased until every element is copied, so a crash
    /// anywhere before the commit leaves the old page as the only valid one and recovery
    /// simply restarts the transfer. A crash between commit and the final erase leaves two
    /// valid pages, which recovery resolves in favor of the new one.
    pub(crate) fn transfer_page(&mut self) -> Result<(), Error> {
        let old_page = self.find_page()?.ok_or(Error::NoPageFound)?;
        let new_page = old_page.next();

        #[cfg(feature = "defmt")]
        trace!("transfer_page: {} -> {}", old_page.index(), new_page.index());

        #[cfg(feature = "debug-logs")]
        println!("internal: transfer_page: {old_page} -> {new_page}");

        self.verify_erase_page(new_page)?;
        self.next_free_addr = self.first_element_addr(new_page);

        self.copy_live_slots()?;

        self.set_page_valid(new_page)?;

        self.erase_page(old_page)?;
        self.verify_erase_page(old_page)
    }

    /// Finishes a transfer that recovery detected as started but not committed: the map
    /// shows the active page full and the target page has just been re-erased. No-op when
    /// the active page still has room.
    pub(crate) fn resume_transfer(&mut self) -> Result<(), Error> {
        let Some(old_page) = self.find_page()? else {
            return Ok(());
        };
        if self.next_free_addr != self.page_base(old_page) + FLASH_SECTOR_SIZE as u32 {
            return Ok(());
        }

        #[cfg(feature = "debug-logs")]
        println!("internal: resume_transfer: {old_page} is full");

        let new_page = old_page.next();
        self.next_free_addr = self.first_element_addr(new_page);

        self.copy_live_slots()?;

        self.set_page_valid(new_page)?;

        self.erase_page(old_page)?;
        self.verify_erase_page(old_page)
    }

    /// Copies the newest record of every slot into the transfer target. Reads still
    /// resolve against the old page: the target's header is not committed yet, and each
    /// slot's cache entry is only rewritten once its copy lands.
    fn copy_live_slots(&mut self) -> Result<(), Error> {
        for slot in 0..SLOT_COUNT as u16 {
            let value = match self.read_slot(slot) {
                Ok(value) => value,
                Err(Error::NoData) => continue,
                Err(e) => return Err(e.into_transfer()),
            };

            if let Err(e) = self.append(slot, value, WriteTarget::NextPage) {
                return Err(e.into_transfer());
            }
        }
        Ok(())
    }

    /// Commits a page by programming the marker into both header words, then reads the
    /// state back.
    pub(crate) fn set_page_valid(&mut self, page: Page) -> Result<(), Error> {
        let base = self.page_base(page);

        program_dword(&mut self.hal, base, VALID_MARKER, VALID_MARKER)
            .map_err(|_| Error::PageHeader)?;

        if self.page_state(page)? != PageState::Valid {
            return Err(Error::PageHeader);
        }
        Ok(())
    }

    pub(crate) fn erase_page(&mut self, page: Page) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_page: {}", page.index());

        let base = self.page_base(page);
        self.hal
            .erase(base, base + FLASH_SECTOR_SIZE as u32)
            .map_err(|_| Error::FlashErase)
    }

    /// Ensures a page reads fully erased, erasing it (once) if it does not. A page that
    /// still holds programmed bits after that is reported as an erase failure.
    pub(crate) fn verify_erase_page(&mut self, page: Page) -> Result<(), Error> {
        let base = self.page_base(page);

        if verify_erased(&mut self.hal, base, FLASH_SECTOR_SIZE)? {
            return Ok(());
        }

        self.erase_page(page)?;

        if verify_erased(&mut self.hal, base, FLASH_SECTOR_SIZE)? {
            Ok(())
        } else {
            Err(Error::FlashErase)
        }
    }

    /// Number of programmed elements on a page.
    pub(crate) fn count_written_elements(&mut self, page: Page) -> Result<u16, Error> {
        let mut written = 0u16;
        let mut addr = self.first_element_addr(page);
        let last = self.last_element_addr(page);

        while addr <= last {
            if !read_element(&mut self.hal, addr)?.is_empty() {
                written += 1;
            }
            addr += ELEMENT_SIZE as u32;
        }

        Ok(written)
    }
}
