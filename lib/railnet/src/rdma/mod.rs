//! The RDMA multi-rail engine: devices, per-thread endpoints, the three
//! communicator flavours and the request/completion machinery beneath the
//! library vtable in [`crate::net`].

pub mod comm;
pub mod device;
pub mod endpoint;
pub mod request;
pub mod wire;

pub use self::comm::{ConnHandle, ListenComm, RecvComm, SendComm};
pub use self::device::{Device, DeviceProperties, MrHandle};
pub use self::endpoint::Endpoint;
