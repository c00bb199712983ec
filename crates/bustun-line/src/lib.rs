//! Physical line drivers for the bus link: an in-process loopback bus
//! with a virtual clock, and a driver for an external clocked transceiver
//! hanging off a serial device.

pub mod loopback;
pub mod serial;

pub use loopback::{LoopbackBus, LoopbackPort};
pub use serial::SerialLine;
