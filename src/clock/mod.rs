pub mod slot_clock;
pub mod source;

pub use slot_clock::{ClockEvent, SlotClock};
pub use source::{ClockSource, ManualClock, SystemClock};
