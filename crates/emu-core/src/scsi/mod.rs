//! SCSI bus and controllers.

pub mod bus;
/// NCR 5380 initiator.
pub mod ncr5380;

pub use bus::{ScsiBus, ScsiPort, SharedScsiBus};
pub use ncr5380::{Handshake, Ncr5380, Ncr5380Config};
