//! Port allocation and the rotation scheduler.

pub mod ports;
pub mod scheduler;

pub use ports::{BindProbe, PortPool, PortProbe};
pub use scheduler::{PortRotationScheduler, TickReport};
