// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB bootloader core: boot-mode decision and application handoff.
//!
//! This crate is the resident heart of a USB field-update bootloader for a
//! small microcontroller: the part that runs first after reset, decides
//! whether a flashed application exists, presents the right USB identity to
//! the host, idles while the host gets a chance to reprogram the part, and
//! finally jumps into the application -- permanently, for the rest of the
//! power cycle.
//!
//! It is deliberately _not_ a USB stack. Enumeration, the control-transfer
//! state machine, and the flash-programming protocol all live on the other
//! side of two small traits ([`machine::UsbEngine`] and [`machine::Board`]).
//! What lives here is the safety-critical decision logic:
//!
//! - [`record`] -- the Application Record, a 20-byte metadata block at a
//!   fixed flash address shared with the flashing tool. Its byte layout is a
//!   compatibility contract, so it is defined as an explicit wire format and
//!   parsed with `zerocopy` rather than read through ordinary typed access.
//! - [`descriptors`] -- the compiled-in boot-mode descriptor set, and the
//!   once-per-boot selection between it and the descriptors named by the
//!   Application Record.
//! - [`machine`] -- the boot/handoff state machine itself: one cooperative
//!   loop that services USB events through whichever endpoint handler set is
//!   currently bound, counts down toward handoff while a runnable
//!   application is present, and ends in a jump that never returns.
//!
//! The fail-safe property the whole design hangs on: if no application is
//! ever marked valid, the countdown never moves, and the device sits on the
//! bus in bootloader mode forever. A blank or half-programmed part can
//! always be reflashed; nothing in this crate can brick it.
//!
//! There is no heap, no OS, and no interrupt-driven concurrency here. Every
//! piece of state is bound exactly once per boot and then only read, except
//! the countdown, which is touched only by the single control-flow thread.
//!
//! The crate is `no_std` on target. Tests build for the host, where the
//! non-returning jump is modeled as a [`machine::Handoff`] outcome value
//! instead of being taken.

#![cfg_attr(not(test), no_std)]

pub mod descriptors;
pub mod machine;
pub mod record;

// Per-chip placement constants. The Application Record address is agreed
// upon with the flashing tool and the application linker script; changing it
// breaks every previously flashed application.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-18f2550")] {
        /// Flash address of the Application Record.
        pub const APP_RECORD_BASE: u32 = 0x2000;
        /// Status LED, RA4 on the 28-pin boards.
        pub const INDICATOR_PIN: u8 = 4;
    } else if #[cfg(feature = "target-18f4550")] {
        /// Flash address of the Application Record.
        pub const APP_RECORD_BASE: u32 = 0x2000;
        /// Status LED, RD7 on the 40-pin boards.
        pub const INDICATOR_PIN: u8 = 7;
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

pub use descriptors::{ActiveDescriptors, AppDescriptors, BootDescriptorSet, DescriptorSource, BOOT_DESCRIPTORS};
pub use machine::{
    Board, Bootloader, Control, EndpointHandlers, Handoff, HandlerMode, UsbEngine, UsbEvent,
    APP_HANDLER_CONFIGURATION, HANDOFF_DELAY, SETTLE_TICKS,
};
pub use record::{AppRecord, AppValidity};
