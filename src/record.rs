// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Application Record: metadata about the currently flashed application.
//!
//! The record lives at a fixed flash address ([`crate::APP_RECORD_BASE`])
//! known to three parties: this bootloader, the host-side flashing tool, and
//! the application's linker script. The flashing tool writes it as the last
//! step of a successful firmware transfer; the bootloader only ever reads
//! it. Because the address and the byte layout are shared across all three,
//! they form a hard ABI -- the layout is defined here as an explicit
//! little-endian wire format and parsed with `zerocopy`, not read through
//! whatever struct layout the compiler happens to pick.
//!
//! The `invalid` flag is the whole boot decision:
//!
//! - `0` -- the application is valid and runnable.
//! - `1` -- the application is written but not yet confirmed. The handoff
//!   countdown still runs for this state, but enumeration keeps using the
//!   bootloader's own descriptors.
//! - anything else -- no application. Blank flash erases to `0xFF`, so a
//!   never-programmed or interrupted transfer lands here automatically.
//!
//! While the flag is outside `{0, 1}`, the four address fields are garbage
//! (typically erase fill) and must not be dereferenced.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U32};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::descriptors::AppDescriptors;

/// Classification of the raw `invalid` flag.
///
/// Produced by [`AppRecord::validity`]; `None` there means "no application."
/// An unrecognized flag value is not an error, it is the well-defined empty
/// state, and the bootloader stays resident indefinitely when it sees one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum AppValidity {
    /// `invalid == 0`: flashed and confirmed. Enumerate with the
    /// application's descriptors and count down toward handoff.
    Runnable = 0,
    /// `invalid == 1`: flashed but not confirmed. Counts down toward handoff
    /// like [`AppValidity::Runnable`], but enumeration stays on the boot
    /// descriptor set.
    Unconfirmed = 1,
}

/// On-flash layout of the Application Record. 20 bytes, little-endian, no
/// padding.
///
/// | offset | size | field                                |
/// |--------|------|--------------------------------------|
/// | 0      | 1    | `invalid` flag                       |
/// | 1      | 3    | reserved (erase fill)                |
/// | 4      | 4    | device descriptor address            |
/// | 8      | 4    | configuration descriptor address     |
/// | 12     | 4    | string descriptor table address      |
/// | 16     | 4    | application entry point              |
///
/// The addresses point into application flash and are opaque to this crate;
/// the USB engine dereferences the descriptor ones during enumeration, and
/// the state machine jumps to the entry point at handoff.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
pub struct AppRecord {
    /// Validity flag, see [`AppValidity`].
    pub invalid: u8,
    /// Pad out to a word boundary. The flashing tool leaves erase fill here.
    pub reserved: [u8; 3],
    /// Flash address of the application's USB device descriptor.
    pub device_descriptor: U32<LittleEndian>,
    /// Flash address of the application's USB configuration descriptor.
    pub configuration_descriptor: U32<LittleEndian>,
    /// Flash address of the application's USB string descriptor table.
    pub string_descriptor: U32<LittleEndian>,
    /// Address of the application's reset entry point.
    pub entry_point: U32<LittleEndian>,
}

impl AppRecord {
    /// Size of the record on flash, in bytes.
    pub const SIZE: usize = core::mem::size_of::<AppRecord>();

    /// Reinterprets `bytes` as an Application Record.
    ///
    /// Returns `None` unless `bytes` is exactly [`AppRecord::SIZE`] long.
    /// This cannot otherwise fail: every bit pattern is a structurally valid
    /// record, and garbage ones classify as "no application" through
    /// [`AppRecord::validity`].
    pub fn parse(bytes: &[u8]) -> Option<&AppRecord> {
        Some(LayoutVerified::<_, AppRecord>::new_unaligned(bytes)?.into_ref())
    }

    /// Reads the record from its fixed flash address.
    ///
    /// The read is volatile: the flashing protocol rewrites the record when
    /// a transfer completes, so two reads in the same boot cycle may
    /// disagree, and the idle loop depends on seeing that happen.
    ///
    /// # Safety
    ///
    /// Only meaningful on the target part, where [`crate::APP_RECORD_BASE`]
    /// is mapped flash. Any bit pattern found there is fine.
    pub unsafe fn read_from_flash() -> AppRecord {
        core::ptr::read_volatile(crate::APP_RECORD_BASE as usize as *const AppRecord)
    }

    /// Classifies the `invalid` flag. `None` means no application is
    /// present, and none of the address fields may be trusted.
    pub fn validity(&self) -> Option<AppValidity> {
        AppValidity::from_u8(self.invalid)
    }

    /// The application's descriptor addresses, for handing to the USB
    /// engine. Garbage unless [`AppRecord::validity`] returned `Some`.
    pub fn descriptors(&self) -> AppDescriptors {
        AppDescriptors {
            device: self.device_descriptor.get(),
            configuration: self.configuration_descriptor.get(),
            strings: self.string_descriptor.get(),
        }
    }
}
