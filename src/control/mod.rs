//! Control-protocol framing shared by [`udp`] (admin commands) and
//! [`channel`] (child→daemon RPC), §6.

pub mod channel;
pub mod udp;
