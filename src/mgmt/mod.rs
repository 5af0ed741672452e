//! Management-protocol plumbing: NMP header handling, the pending-request
//! map and the default [`NmpTransceiver`].

pub mod nmp;
mod pending;
mod transceiver;

pub use transceiver::NmpTransceiver;
