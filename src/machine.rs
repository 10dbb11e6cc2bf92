// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot/handoff state machine.
//!
//! This is the part of the bootloader where a wrong decision permanently
//! loses the ability to reprogram the device, so the shape of the code is
//! kept as plain as possible: one constructor that performs every
//! once-per-boot binding, and one `step` function that advances the idle
//! loop by exactly one serviced USB event.
//!
//! Binding happens in two phases, and the asymmetry is deliberate:
//!
//! - _Descriptors_ may point at the application's identity immediately, if
//!   the Application Record says the application is runnable. Descriptors
//!   are only data; letting the host read them can't execute anything.
//! - _Endpoint handlers_ -- the code that runs on bus events -- stay the
//!   bootloader's own regardless of the record, because the device always
//!   enumerates in configuration 0 first. Only once the USB engine reports
//!   that the host has negotiated a configuration value of
//!   [`APP_HANDLER_CONFIGURATION`] or higher do events start routing to the
//!   application's handler set.
//!
//! While the loop runs, a countdown ticks toward handoff -- but only on
//! iterations where the record says an application is present (`invalid` of
//! 0 or 1). A blank or corrupt record never decrements it, so a device with
//! nothing to boot just sits on the bus in bootloader mode, reflashable
//! forever. That is the fail-safe, and the continued presence of the
//! bootloader identity on the bus is the only error signal this design has.
//!
//! Handoff itself is modeled as a value: [`step`](Bootloader::step) returns
//! [`Control::Handoff`] and [`run`](Bootloader::run) returns the [`Handoff`]
//! carrying the entry address, so the decision logic is testable on a host.
//! The actual non-returning jump is the one `unsafe` operation in the crate,
//! [`Handoff::enter`], and only a target build has any business calling it.

use crate::descriptors::{ActiveDescriptors, BOOT_DESCRIPTORS};
use crate::record::{AppRecord, AppValidity};

/// Idle-loop iterations to wait before handing off to a runnable
/// application. At one serviced USB event per iteration this gives the host
/// a comfortable window to start a reflash instead.
pub const HANDOFF_DELAY: u32 = 600_000;

/// Busy-wait count a [`Board`] should burn in [`Board::settle`] before the
/// record is first read, so a freshly powered part has stable flash and
/// supply rails behind it.
pub const SETTLE_TICKS: u32 = 0x8_0000;

/// Negotiated USB configuration value at which endpoint events stop routing
/// to the bootloader's handlers and start routing to the application's. The
/// boot descriptor set claims configuration 1; application images claim 2
/// and up, so seeing this value means the host has chosen the application.
pub const APP_HANDLER_CONFIGURATION: u8 = 2;

/// One pending USB hardware condition, as reported by the engine. The loop
/// services exactly one of these per iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UsbEvent {
    /// Bus reset; routed to `ep_init`.
    Reset,
    /// SETUP packet received on the control endpoint.
    Setup,
    /// IN transaction completed on the given endpoint.
    In(u8),
    /// OUT transaction completed on the given endpoint.
    Out(u8),
}

/// One set of endpoint event handlers. The USB engine's events land on
/// whichever implementation is currently bound -- the bootloader's own set,
/// or the application's.
///
/// The switch between the two sets is a [`HandlerMode`] tag checked at
/// dispatch, not a table of rewritable function-pointer slots, so there is
/// no moment where a half-rewritten table could be invoked.
pub trait EndpointHandlers {
    /// Endpoint setup after bus reset.
    fn ep_init(&mut self);
    /// SETUP packet on the control endpoint.
    fn ep_setup(&mut self);
    /// IN completion on endpoint `ep`.
    fn ep_in(&mut self, ep: u8);
    /// OUT completion on endpoint `ep`.
    fn ep_out(&mut self, ep: u8);
}

/// Which handler set endpoint events currently route to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandlerMode {
    Boot,
    Application,
}

/// The hardware this core runs on, reduced to the three things it actually
/// needs from a board.
pub trait Board {
    /// Volatile read of the Application Record from its fixed address. The
    /// flashing protocol rewrites the record when a transfer completes, and
    /// the idle loop re-reads it every iteration to notice.
    fn app_record(&self) -> AppRecord;

    /// Power-up settle delay, run once before the record is first read.
    /// Implementations typically busy-wait [`SETTLE_TICKS`].
    fn settle(&mut self) {}

    /// Status indicator (an LED on the reference boards). Raised when the
    /// bootloader takes control, lowered just before handoff.
    fn set_indicator(&mut self, _on: bool) {}
}

/// The out-of-scope USB protocol engine, as seen from this core.
pub trait UsbEngine {
    /// Parks until a USB hardware condition is pending and returns it. This
    /// is the loop's only suspension point; implementations may enter a
    /// low-power idle state. There is no timeout -- forward progress depends
    /// on bus activity.
    fn wait_for_event(&mut self) -> UsbEvent;

    /// The configuration value negotiated during enumeration, 0 if the host
    /// hasn't configured us yet.
    fn configuration(&self) -> u8;
}

/// Outcome of one idle-loop iteration.
#[derive(Debug, PartialEq, Eq)]
pub enum Control {
    /// Stay in the loop.
    Continue,
    /// Countdown expired; transfer control to the application.
    Handoff(Handoff),
}

/// The terminal transfer of control, as a value.
///
/// Everything up to the jump itself is decided once this exists: the
/// bootloader's frame is considered abandoned and no further USB operation
/// may be issued, since ownership of the bus hardware passes to the
/// application.
#[derive(Debug, PartialEq, Eq)]
pub struct Handoff {
    entry_point: u32,
}

impl Handoff {
    /// Address execution is being transferred to, from the Application
    /// Record's entry field.
    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    /// Jumps into the application. Never returns; the only way back to the
    /// bootloader is a hardware reset.
    ///
    /// # Safety
    ///
    /// The entry point must be the reset vector of a real application image
    /// on the target part. Calling this in a hosted build is nonsense.
    pub unsafe fn enter(self) -> ! {
        let entry: extern "C" fn() -> ! =
            core::mem::transmute(self.entry_point as usize);
        entry()
    }
}

/// The boot/handoff state machine. Owns everything mutable in the design:
/// the handler mode, the descriptor selection, the countdown, and the two
/// handler sets themselves.
///
/// `B` is the bootloader's handler set (the flash-protocol endpoints), `A`
/// the application's. Construction performs every once-per-boot binding;
/// after that the only entry points are [`step`](Self::step) and the
/// [`run`](Self::run) wrapper around it.
pub struct Bootloader<B, A> {
    boot_handlers: B,
    app_handlers: A,
    mode: HandlerMode,
    descriptors: ActiveDescriptors,
    countdown: u32,
}

impl<B: EndpointHandlers, A: EndpointHandlers> Bootloader<B, A> {
    /// Performs the once-per-boot bindings with the default
    /// [`HANDOFF_DELAY`].
    pub fn new(board: &mut impl Board, boot_handlers: B, app_handlers: A) -> Self {
        Self::with_countdown(board, boot_handlers, app_handlers, HANDOFF_DELAY)
    }

    /// Performs the once-per-boot bindings, synchronously, before the USB
    /// engine may be initialized:
    ///
    /// - reads the Application Record's validity flag once and binds the
    ///   descriptor selection: the application's descriptors iff the flag is
    ///   exactly 0, the compiled-in boot set otherwise;
    /// - binds endpoint events to the boot handler set unconditionally (the
    ///   device starts in configuration 0, where the application's handlers
    ///   are not yet safe to run);
    /// - arms the handoff countdown.
    ///
    /// After this returns, no USB event can reach an unbound handler slot.
    pub fn with_countdown(
        board: &mut impl Board,
        boot_handlers: B,
        app_handlers: A,
        countdown: u32,
    ) -> Self {
        board.settle();
        board.set_indicator(true);

        let record = board.app_record();
        let descriptors = match record.validity() {
            // Note the asymmetry with the countdown gate in `step`: only a
            // flag of exactly 0 selects the application's identity, but
            // both 0 and 1 count down toward handoff. An unconfirmed image
            // never puts its descriptors on the bus.
            Some(AppValidity::Runnable) => ActiveDescriptors::Application(record.descriptors()),
            _ => ActiveDescriptors::Boot(&BOOT_DESCRIPTORS),
        };

        Bootloader {
            boot_handlers,
            app_handlers,
            mode: HandlerMode::Boot,
            descriptors,
            countdown,
        }
    }

    /// The descriptor selection the USB engine should serve during
    /// enumeration. Fixed for the life of this value.
    pub fn descriptors(&self) -> &ActiveDescriptors {
        &self.descriptors
    }

    /// Which handler set events currently route to.
    pub fn handler_mode(&self) -> HandlerMode {
        self.mode
    }

    /// Iterations left before handoff.
    pub fn countdown(&self) -> u32 {
        self.countdown
    }

    /// Advances the idle loop by one serviced event.
    ///
    /// `configuration` is the engine's negotiated-configuration side
    /// channel, sampled alongside the event. In order:
    ///
    /// 1. if `configuration` has reached [`APP_HANDLER_CONFIGURATION`],
    ///    rebind endpoint events to the application's handler set (one-way;
    ///    a later lower value does not switch back);
    /// 2. dispatch `event` through the currently bound handler set;
    /// 3. re-read the Application Record; if its flag is 0 or 1, tick the
    ///    countdown, otherwise leave it alone. Iterations spent without a
    ///    runnable application are simply lost -- the countdown holds its
    ///    value rather than resetting.
    ///
    /// Returns [`Control::Handoff`] on the iteration that drives the
    /// countdown to zero, with the entry point read from the record this
    /// same iteration. The caller must not call `step` again after that.
    pub fn step(
        &mut self,
        board: &mut impl Board,
        configuration: u8,
        event: UsbEvent,
    ) -> Control {
        if configuration >= APP_HANDLER_CONFIGURATION && self.mode == HandlerMode::Boot {
            self.mode = HandlerMode::Application;
        }

        self.dispatch(event);

        let record = board.app_record();
        if record.validity().is_some() && self.countdown > 0 {
            self.countdown -= 1;
            if self.countdown == 0 {
                board.set_indicator(false);
                return Control::Handoff(Handoff {
                    entry_point: record.entry_point.get(),
                });
            }
        }
        Control::Continue
    }

    /// Drives [`step`](Self::step) until handoff.
    ///
    /// Never returns unless an application becomes runnable and the
    /// countdown expires; with a blank part and a silent host this loops
    /// forever, which is the intended fail-safe. Consumes the machine, so
    /// the terminal state really is terminal.
    pub fn run(mut self, board: &mut impl Board, engine: &mut impl UsbEngine) -> Handoff {
        loop {
            let event = engine.wait_for_event();
            let configuration = engine.configuration();
            if let Control::Handoff(handoff) = self.step(board, configuration, event) {
                return handoff;
            }
        }
    }

    fn dispatch(&mut self, event: UsbEvent) {
        match self.mode {
            HandlerMode::Boot => Self::deliver(&mut self.boot_handlers, event),
            HandlerMode::Application => Self::deliver(&mut self.app_handlers, event),
        }
    }

    fn deliver(handlers: &mut impl EndpointHandlers, event: UsbEvent) {
        match event {
            UsbEvent::Reset => handlers.ep_init(),
            UsbEvent::Setup => handlers.ep_setup(),
            UsbEvent::In(ep) => handlers.ep_in(ep),
            UsbEvent::Out(ep) => handlers.ep_out(ep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::DescriptorSource;
    use zerocopy::U32;

    /// Handler set that just counts deliveries.
    #[derive(Default)]
    struct CountingHandlers {
        init: u32,
        setup: u32,
        ins: u32,
        outs: u32,
    }

    impl CountingHandlers {
        fn total(&self) -> u32 {
            self.init + self.setup + self.ins + self.outs
        }
    }

    impl EndpointHandlers for CountingHandlers {
        fn ep_init(&mut self) {
            self.init += 1;
        }
        fn ep_setup(&mut self) {
            self.setup += 1;
        }
        fn ep_in(&mut self, _ep: u8) {
            self.ins += 1;
        }
        fn ep_out(&mut self, _ep: u8) {
            self.outs += 1;
        }
    }

    struct TestBoard {
        record: AppRecord,
        settled: bool,
        indicator: bool,
    }

    impl TestBoard {
        fn with_invalid(invalid: u8) -> Self {
            TestBoard {
                record: record(invalid),
                settled: false,
                indicator: false,
            }
        }
    }

    impl Board for TestBoard {
        fn app_record(&self) -> AppRecord {
            self.record
        }
        fn settle(&mut self) {
            self.settled = true;
        }
        fn set_indicator(&mut self, on: bool) {
            self.indicator = on;
        }
    }

    fn record(invalid: u8) -> AppRecord {
        AppRecord {
            invalid,
            reserved: [0xFF; 3],
            device_descriptor: U32::new(0x2100),
            configuration_descriptor: U32::new(0x2112),
            string_descriptor: U32::new(0x2140),
            entry_point: U32::new(0x2200),
        }
    }

    fn boot_machine(
        board: &mut TestBoard,
        countdown: u32,
    ) -> Bootloader<CountingHandlers, CountingHandlers> {
        Bootloader::with_countdown(
            board,
            CountingHandlers::default(),
            CountingHandlers::default(),
            countdown,
        )
    }

    /// Mix of events, roughly what bus traffic looks like.
    fn event_for(i: u32) -> UsbEvent {
        match i % 4 {
            0 => UsbEvent::Setup,
            1 => UsbEvent::In(0),
            2 => UsbEvent::Out(1),
            _ => UsbEvent::In(2),
        }
    }

    #[test]
    fn blank_part_stays_in_boot_mode_forever() {
        // Scenario: erased flash, invalid reads 0xFF. A million serviced
        // events later we must still be a bootloader with an untouched
        // countdown.
        let mut board = TestBoard::with_invalid(0xFF);
        let mut boot = boot_machine(&mut board, HANDOFF_DELAY);

        assert_eq!(boot.descriptors().source(), DescriptorSource::Boot);
        for i in 0..1_000_000 {
            assert_eq!(boot.step(&mut board, 1, event_for(i)), Control::Continue);
        }
        assert_eq!(boot.countdown(), HANDOFF_DELAY);
        assert_eq!(boot.descriptors().source(), DescriptorSource::Boot);
        assert_eq!(boot.handler_mode(), HandlerMode::Boot);
        assert!(board.indicator, "indicator stays up while resident");
    }

    #[test]
    fn runnable_app_hands_off_after_exactly_the_countdown() {
        let mut board = TestBoard::with_invalid(0);
        let mut boot = boot_machine(&mut board, 600_000);

        for i in 0..599_999 {
            assert_eq!(boot.step(&mut board, 1, event_for(i)), Control::Continue);
            assert_eq!(boot.countdown(), 600_000 - 1 - i);
        }
        match boot.step(&mut board, 1, UsbEvent::In(0)) {
            Control::Handoff(handoff) => assert_eq!(handoff.entry_point(), 0x2200),
            other => panic!("expected handoff, got {:?}", other),
        }
        assert!(!board.indicator, "indicator dropped before the jump");
    }

    #[test]
    fn runnable_app_selects_application_descriptors() {
        let mut board = TestBoard::with_invalid(0);
        let boot = boot_machine(&mut board, HANDOFF_DELAY);

        let app = boot.descriptors().application().unwrap();
        assert_eq!(app.device, 0x2100);
        assert_eq!(app.configuration, 0x2112);
        assert_eq!(app.strings, 0x2140);
        assert!(boot.descriptors().boot().is_none());
    }

    #[test]
    fn unconfirmed_app_counts_down_but_keeps_boot_identity() {
        // invalid == 1: the countdown runs exactly as for a runnable app,
        // but enumeration stays on the boot descriptor set.
        let mut board = TestBoard::with_invalid(1);
        let mut boot = boot_machine(&mut board, 5);

        assert_eq!(boot.descriptors().source(), DescriptorSource::Boot);
        for _ in 0..4 {
            assert_eq!(boot.step(&mut board, 1, UsbEvent::Setup), Control::Continue);
        }
        match boot.step(&mut board, 1, UsbEvent::Setup) {
            Control::Handoff(handoff) => assert_eq!(handoff.entry_point(), 0x2200),
            other => panic!("expected handoff, got {:?}", other),
        }
    }

    #[test]
    fn descriptor_selection_never_changes_mid_cycle() {
        let mut board = TestBoard::with_invalid(0xFF);
        let mut boot = boot_machine(&mut board, HANDOFF_DELAY);
        assert_eq!(boot.descriptors().source(), DescriptorSource::Boot);

        // The flash completes mid-session. The countdown notices; the
        // descriptor selection must not.
        board.record = record(0);
        for i in 0..100 {
            boot.step(&mut board, 1, event_for(i));
        }
        assert_eq!(boot.descriptors().source(), DescriptorSource::Boot);
        assert_eq!(boot.countdown(), HANDOFF_DELAY - 100);
    }

    #[test]
    fn flash_completing_mid_loop_starts_counting_from_there() {
        // Scenario: device powered up blank, host flashes it while we idle.
        // Iterations spent blank are not retroactively credited.
        let mut board = TestBoard::with_invalid(0xFF);
        let mut boot = boot_machine(&mut board, 10);

        for i in 0..50 {
            assert_eq!(boot.step(&mut board, 1, event_for(i)), Control::Continue);
        }
        assert_eq!(boot.countdown(), 10);

        board.record = record(0);
        for i in 0..9 {
            assert_eq!(boot.step(&mut board, 1, event_for(i)), Control::Continue);
        }
        match boot.step(&mut board, 1, UsbEvent::Out(1)) {
            Control::Handoff(handoff) => assert_eq!(handoff.entry_point(), 0x2200),
            other => panic!("expected handoff, got {:?}", other),
        }
    }

    #[test]
    fn countdown_is_monotonic_and_gated_on_validity() {
        let mut board = TestBoard::with_invalid(2); // garbage, not blank
        let mut boot = boot_machine(&mut board, HANDOFF_DELAY);

        let mut last = boot.countdown();
        for i in 0..200 {
            // Flip the record in and out of validity as we go.
            board.record = record(match i % 4 {
                0 => 0,
                1 => 0xFF,
                2 => 1,
                _ => 0x5A,
            });
            let runnable = board.record.validity().is_some();
            boot.step(&mut board, 1, event_for(i));
            let now = boot.countdown();
            if runnable {
                assert_eq!(now, last - 1, "decrements by exactly 1 when runnable");
            } else {
                assert_eq!(now, last, "holds when not runnable");
            }
            last = now;
        }
    }

    #[test]
    fn handlers_start_in_boot_mode_regardless_of_validity() {
        for invalid in [0x00, 0x01, 0xFF] {
            let mut board = TestBoard::with_invalid(invalid);
            let boot = boot_machine(&mut board, HANDOFF_DELAY);
            assert_eq!(boot.handler_mode(), HandlerMode::Boot);
            assert!(board.settled, "settle delay runs before the record read");
        }
    }

    #[test]
    fn events_route_to_boot_handlers_until_configured_past_one() {
        let mut board = TestBoard::with_invalid(0);
        let mut boot = boot_machine(&mut board, HANDOFF_DELAY);

        // Configurations 0 and 1 keep the boot handler set bound.
        boot.step(&mut board, 0, UsbEvent::Reset);
        boot.step(&mut board, 0, UsbEvent::Setup);
        boot.step(&mut board, 1, UsbEvent::In(0));
        boot.step(&mut board, 1, UsbEvent::Out(1));
        assert_eq!(boot.handler_mode(), HandlerMode::Boot);
        assert_eq!(boot.boot_handlers.init, 1);
        assert_eq!(boot.boot_handlers.setup, 1);
        assert_eq!(boot.boot_handlers.ins, 1);
        assert_eq!(boot.boot_handlers.outs, 1);
        assert_eq!(boot.app_handlers.total(), 0);

        // Host selects the application's configuration: the very event that
        // arrives with it already routes to the application set.
        boot.step(&mut board, 2, UsbEvent::In(1));
        assert_eq!(boot.handler_mode(), HandlerMode::Application);
        assert_eq!(boot.app_handlers.ins, 1);
        assert_eq!(boot.boot_handlers.total(), 4, "boot set sees nothing more");

        // The rebind is one-way; a stale lower reading doesn't undo it.
        boot.step(&mut board, 0, UsbEvent::Setup);
        assert_eq!(boot.handler_mode(), HandlerMode::Application);
        assert_eq!(boot.app_handlers.setup, 1);
    }

    /// Engine that scripts bus traffic for `run`.
    struct ScriptedEngine {
        served: u32,
        configuration: u8,
    }

    impl UsbEngine for ScriptedEngine {
        fn wait_for_event(&mut self) -> UsbEvent {
            let event = event_for(self.served);
            self.served += 1;
            event
        }
        fn configuration(&self) -> u8 {
            self.configuration
        }
    }

    #[test]
    fn run_terminates_in_a_single_handoff() {
        let mut board = TestBoard::with_invalid(0);
        let boot = boot_machine(&mut board, 1_000);
        let mut engine = ScriptedEngine {
            served: 0,
            configuration: 1,
        };

        // `run` consumes the machine, so no event can be serviced by the
        // boot handlers past this point; the handoff is structurally final.
        let handoff = boot.run(&mut board, &mut engine);
        assert_eq!(handoff.entry_point(), 0x2200);
        assert_eq!(engine.served, 1_000, "one serviced event per iteration");
        assert!(!board.indicator);
    }

    #[test]
    fn armed_with_zero_never_fires() {
        // Degenerate arming. The decrement is gated on a positive counter,
        // so a zero countdown simply never reaches the trigger.
        let mut board = TestBoard::with_invalid(0);
        let mut boot = boot_machine(&mut board, 0);
        for i in 0..1_000 {
            assert_eq!(boot.step(&mut board, 1, event_for(i)), Control::Continue);
        }
        assert_eq!(boot.countdown(), 0);
    }
}
