//! The kernel-bypass provider seam. The engine is written entirely against
//! these traits; the in-tree implementor is the in-process loopback fabric
//! in [`loopback`], hardware providers implement the same surface out of
//! tree.
//!
//! Posting verbs return `Err(RailError::Again)` when the fabric cannot
//! accept more work; the engine recovers that through its pending-retry
//! queue and never treats it as failure.

pub mod loopback;

use crate::error::{FabricFault, RailResult};
use std::fmt;
use std::sync::Arc;

/// Length of an opaque fabric endpoint name.
pub const EP_NAME_LEN: usize = 64;

/// Opaque endpoint name, exchanged out-of-band inside connect handles and
/// handshake messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpName(pub [u8; EP_NAME_LEN]);

impl EpName {
    #[inline]
    pub fn zeroed() -> EpName {
        EpName([0u8; EP_NAME_LEN])
    }
}

impl fmt::Debug for EpName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Names are short printable prefixes padded with zeros.
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(EP_NAME_LEN);
        match std::str::from_utf8(&self.0[..end]) {
            Ok(text) => write!(f, "EpName({})", text),
            Err(_) => write!(f, "EpName({:02x?}..)", &self.0[..8]),
        }
    }
}

/// One discovered NIC. `group` clusters NICs that sit close to the same
/// accelerator; the topology layer folds a group into one logical device.
#[derive(Debug, Clone)]
pub struct NicInfo {
    pub name: String,
    pub pci_path: String,
    pub guid: u64,
    pub group: u32,
    pub speed_mbps: u32,
    pub port: u16,
}

/// Address-vector handle for a peer endpoint, valid on the endpoint whose
/// `av_insert` produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub u64);

/// One rail-local memory registration: the provider's handle plus the
/// remote key peers use to address the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrDesc {
    pub key: u64,
    pub handle: u64,
}

/// Class of memory behind a registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Host,
    /// Accelerator memory (GPU-direct). Providers without hmem support
    /// reject it.
    Device,
}

/// Completion kinds, tagged so engine dispatch is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompKind {
    /// A locally posted message send finished.
    Send,
    /// A posted receive was filled. Eager payloads arrive with the
    /// immediate word set; handshake and control messages without.
    Recv { imm: Option<u32> },
    /// A remote peer's RDMA write landed in local memory. Does not consume
    /// a posted receive; identified solely by the immediate word.
    RemoteWrite { imm: u32 },
    /// A locally posted RDMA write finished at the peer.
    Write,
    /// A locally posted RDMA read finished.
    Read,
}

/// One completion-queue entry. `ctx` is the poster's context word, zero for
/// remote-write arrivals.
#[derive(Debug, Clone, Copy)]
pub struct CqEntry {
    pub ctx: u64,
    pub kind: CompKind,
    pub len: usize,
}

impl Default for CqEntry {
    fn default() -> CqEntry {
        CqEntry {
            ctx: 0,
            kind: CompKind::Send,
            len: 0,
        }
    }
}

/// Outcome of draining a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqPoll {
    /// `n` entries were written to the caller's buffer.
    Entries(usize),
    Empty,
    /// An error entry is pending; drain it with `read_err`.
    ErrAvail,
}

/// Completion error entry.
#[derive(Debug, Clone, Copy)]
pub struct CqError {
    pub ctx: u64,
    pub fault: FabricFault,
}

/// Fabric/NIC discovery and domain construction.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn nics(&self) -> RailResult<Vec<NicInfo>>;

    fn open(&self, nic: &NicInfo) -> RailResult<Arc<dyn Domain>>;

    /// Whether the fabric can target accelerator memory (GPU-direct).
    fn hmem_support(&self) -> bool {
        false
    }
}

/// Per-NIC resource domain: memory registration plus endpoint construction.
pub trait Domain: Send + Sync {
    /// Create a transport endpoint and its bound completion queue.
    fn create_ep(&self) -> RailResult<(Box<dyn Ep>, Box<dyn Cq>)>;

    /// Register `[addr, addr+len)`. When `key` is given the provider must
    /// use it as the remote key; otherwise it assigns one.
    fn register(
        &self,
        addr: usize,
        len: usize,
        mem: MemType,
        key: Option<u64>,
    ) -> RailResult<MrDesc>;

    fn deregister(&self, desc: &MrDesc) -> RailResult<()>;
}

/// One transport endpoint (one rail).
///
/// # Safety
///
/// The posting verbs take raw buffers; the caller must keep every posted
/// buffer valid (and registered, where a descriptor is passed) until the
/// corresponding completion has been drained from the queue.
pub trait Ep: Send + Sync {
    fn name(&self) -> EpName;

    /// Resolve a peer endpoint name into an address usable on this rail.
    fn av_insert(&self, name: &EpName) -> RailResult<PeerAddr>;

    unsafe fn post_send(
        &self,
        buf: *const u8,
        len: usize,
        desc: Option<&MrDesc>,
        imm: Option<u32>,
        peer: PeerAddr,
        ctx: u64,
    ) -> RailResult<()>;

    unsafe fn post_recv(
        &self,
        buf: *mut u8,
        len: usize,
        desc: Option<&MrDesc>,
        ctx: u64,
    ) -> RailResult<()>;

    unsafe fn post_write_imm(
        &self,
        src: *const u8,
        len: usize,
        desc: Option<&MrDesc>,
        peer: PeerAddr,
        remote_addr: u64,
        rkey: u64,
        imm: u32,
        ctx: u64,
    ) -> RailResult<()>;

    unsafe fn post_read(
        &self,
        dst: *mut u8,
        len: usize,
        desc: Option<&MrDesc>,
        peer: PeerAddr,
        remote_addr: u64,
        rkey: u64,
        ctx: u64,
    ) -> RailResult<()>;
}

/// Completion queue bound to one endpoint.
pub trait Cq: Send + Sync {
    fn read(&self, entries: &mut [CqEntry]) -> RailResult<CqPoll>;

    fn read_err(&self) -> RailResult<Option<CqError>>;
}
