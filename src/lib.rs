//! Datagram transfer engine for a satellite modem link.
//!
//! The engine queues outgoing datagrams (emergency before normal, FIFO within a class) and
//!  pushes them through a single-flight modem transport, polls for incoming datagrams and
//!  delivers them to registered listeners with acknowledgement-driven redelivery, and drives
//!  the session state machine that decides when the modem idles, transfers or listens.
//!
//! [`engine::SatelliteEngine`] wires everything together from explicit collaborators.

pub mod config;
pub mod datagram;
pub mod engine;
pub mod listener;
pub mod modem;
pub mod result_code;
pub mod session;
pub mod transfer;
pub mod util;
pub mod test_util;
