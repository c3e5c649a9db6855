//! Narrow interfaces onto the daemon's notification side-channels: QMQP
//! email ([`email`]) and line-oriented log forwarding ([`line_sink`]),
//! neither of which is implemented beyond its interface (§1, §A.5).

pub mod email;
pub mod line_sink;
