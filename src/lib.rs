//! Library surface of the logd server: the frame model and the serving
//! tiers, re-used by the binary and by integration tests.

pub mod frame;
pub mod server;
