#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

//! `railnet` is a multi-rail RDMA transport engine for GPU collective
//! runtimes. It turns the host library's post-send / post-receive / flush /
//! test calls into message and RDMA-write transfers over one or more
//! physical NICs ("rails") per logical device, preserving per-peer message
//! order, coalescing small messages onto an eager fast path and striping
//! large messages across rails.
//!
//! The engine is driven entirely by cooperative polling from the library's
//! own calls; there are no background threads. All fabric access goes
//! through the provider seam in [`fabric`]; the in-tree implementor is the
//! in-process loopback provider used for tests and single-host bring-up.

pub mod config;
pub mod error;
pub mod fabric;
pub mod freelist;
pub mod idpool;
pub mod msgbuff;
pub mod net;
pub mod rdma;
pub mod retryq;
pub mod scheduler;
pub mod topology;

pub use crate::error::{NetCode, RailError, RailResult};
pub use crate::net::Plugin;
