//! Green guardian agent process: HTTP surface and signal handling shared by the binary and its tests

pub mod api;
pub mod shutdown;
