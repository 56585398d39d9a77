//! The tunnel fabric: live connections, the pool, liveness, and the
//! worker spawn slots.

pub mod connection;
pub mod pinger;
pub mod pool;
pub mod spawner;
