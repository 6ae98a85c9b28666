//! The binary wire protocol spoken across the process boundary.
//!
//! - [`codec`]: primitive encode/decode in big-endian order.
//! - [`FrameReader`] / [`FrameWriter`]: blocking, length-prefixed framing over
//!   `std::io` streams, including the object reference encoding.
//! - [`ProtocolObserver`]: receives protocol anomalies the reader tolerates.
pub mod codec;
mod error;
mod frame;
mod observer;

pub use error::*;
pub use frame::*;
pub use observer::*;
