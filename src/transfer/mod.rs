//! Moving datagrams over the single-flight transport: the dispatcher sends, the receiver
//!  polls and delivers, the controller keeps them from using the transport at the same time.

pub mod controller;
pub mod demo_mode;
pub mod dispatcher;
pub mod receiver;
pub mod transfer_events;
pub mod transfer_state;
