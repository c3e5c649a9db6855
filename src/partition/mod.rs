//! Partitions: the binding of one database connection + plan library +
//! workplace (§4.2 overview, §4.4, §4.5).

pub mod cron;
pub mod workshop;
