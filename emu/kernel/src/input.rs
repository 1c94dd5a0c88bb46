//! The host→guest input event queue.
//!
//! A host front-end (window, test driver) produces key and touch events
//! from any thread through an [`InputSender`]; the emulator thread is the
//! sole consumer, draining one event per `GetEvent` syscall and writing it
//! into the guest's event structure.

use crossbeam_channel::{unbounded, Receiver, Sender};
use muon_core::GuestAddr;
use muon_mm::{MemError, MemoryManager};

// Guest event-type codes.
const EVENT_TOUCH_BEGIN: u32 = 1;
const EVENT_TOUCH_MOVE: u32 = 2;
const EVENT_TOUCH_END: u32 = 8;
const EVENT_KEY: u32 = 16;
const EVENT_KEY_UP: u32 = 0x10_0000;

/// Size of the guest event structure: 28-byte header plus eight 12-byte
/// multipress slots.
pub(crate) const GUEST_EVENT_SIZE: u32 = 28 + 8 * 12;

/// Phase of a touch gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPhase {
    /// Pen down.
    Begin,
    /// Pen moved while down.
    Move,
    /// Pen up.
    End,
}

/// One input event from the host front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    /// Key(s) pressed. `code1` is the optional simultaneous second key.
    KeyDown {
        /// Primary keycode.
        code0: u16,
        /// Second simultaneous keycode, zero if none.
        code1: u16,
    },
    /// Key released.
    KeyUp {
        /// Released keycode.
        code0: u16,
    },
    /// Touch-panel event in screen pixels.
    Touch {
        /// Gesture phase.
        phase: TouchPhase,
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
    },
}

impl UiEvent {
    fn type_code(&self) -> u32 {
        match self {
            Self::KeyDown { .. } => EVENT_KEY,
            Self::KeyUp { .. } => EVENT_KEY_UP,
            Self::Touch { phase, .. } => match phase {
                TouchPhase::Begin => EVENT_TOUCH_BEGIN,
                TouchPhase::Move => EVENT_TOUCH_MOVE,
                TouchPhase::End => EVENT_TOUCH_END,
            },
        }
    }

    /// The two half-words at offset 8: keycodes or touch coordinates.
    fn payload(&self) -> (u16, u16) {
        match *self {
            Self::KeyDown { code0, code1 } => (code0, code1),
            Self::KeyUp { code0 } => (code0, 0),
            Self::Touch { x, y, .. } => (x, y),
        }
    }

    /// Serialises this event into the guest event structure at `at`.
    ///
    /// The whole structure is cleared first, matching the guest-side
    /// `ClearEvent` convention.
    pub(crate) fn write_guest(&self, mem: &mut MemoryManager, at: GuestAddr) -> Result<(), MemError> {
        mem.write_bytes(at, &[0u8; GUEST_EVENT_SIZE as usize])?;
        mem.write_u32(at + 4, self.type_code())?;
        let (a, b) = self.payload();
        mem.write_u16(at + 8, a)?;
        mem.write_u16(at + 10, b)?;
        Ok(())
    }
}

/// Producer half of the input queue. Clone freely; send from any thread.
pub type InputSender = Sender<UiEvent>;

/// The queue itself, owned by the kernel.
#[derive(Debug)]
pub struct InputQueue {
    tx: Sender<UiEvent>,
    rx: Receiver<UiEvent>,
}

impl InputQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// A producer handle for a host front-end.
    pub fn sender(&self) -> InputSender {
        self.tx.clone()
    }

    /// Dequeues the oldest pending event, if any. Emulator thread only.
    pub fn try_pop(&self) -> Option<UiEvent> {
        self.rx.try_recv().ok()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}
