use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

/// Flash access used by the store. Any `embedded-storage` NOR flash qualifies, with one
/// additional contract the trait system cannot express: a write of 8 bytes to an 8-byte
/// aligned offset must be programmed as a single atomic unit. The whole crash-safety
/// argument of the store rests on an element (and a page header) being either fully
/// programmed or fully erased after a power loss, never half-written.
///
/// Flash controllers with a double-word program command satisfy this directly. A backend
/// that cannot guarantee it (e.g. a file) must layer its own torn-write detection below
/// this trait.
///
/// See README.md for an example implementation.
pub trait Platform: ReadNorFlash + NorFlash {}

impl<T: ReadNorFlash + NorFlash> Platform for T {}
