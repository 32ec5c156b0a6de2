//! The reliability/ordering/clustering engine, flow control, and the
//! huge-transfer FEC overlay that ride on top of one authenticated
//! connection.

pub mod error;
pub mod flow_control;
pub mod huge;
pub mod reliable;
pub mod transport;
pub mod unreliable;

pub use error::Error;
pub use huge::AbortReason;
pub use transport::{Delivery, Transport};
