//! SocketCAN FD channel adapter (Linux only)

mod adapter;

pub use adapter::SocketCanChannel;
