//! Engine tunables, read once from `RAILNET_*` environment variables.
//! Malformed values fall back to their defaults; the warnings are collected
//! so `Plugin::init` can log them once a logger exists.

use lazy_static::lazy_static;
use lumen::param::{env_bool, env_or, env_string};

/// Number of bits in a communicator id.
pub const NUM_COMM_ID_BITS: u32 = 18;
/// Number of bits in a message sequence number.
pub const NUM_SEQ_BITS: u32 = 10;
/// Number of bits in the segment-count field of the immediate word.
pub const NUM_SEG_BITS: u32 = 4;

/// Maximum communicators alive per device.
pub const MAX_COMMS: usize = 1 << NUM_COMM_ID_BITS;
/// Wrapping message sequence space.
pub const SEQ_SPACE: u16 = 1 << NUM_SEQ_BITS;
/// Slots in the per-comm message buffer ring. The ratio to `SEQ_SPACE`
/// bounds the number of simultaneously unfinished messages per peer pair.
pub const MSGBUFF_SIZE: usize = 256;

/// Rails a logical device may aggregate; also the wire-format array bound.
pub const MAX_NUM_RAILS: usize = 4;
/// Inflight request ceiling per send/recv communicator.
pub const MAX_REQUESTS: usize = 128;
/// Grouped receives accepted by a single irecv call.
pub const MAX_RECVS: usize = 1;
/// A receive request owns up to three subrequests.
pub const RECV_REQ_POOL_CAP: usize = 4 * MAX_REQUESTS;

/// Alignment of striped transfer chunks and of bounce buffer slots.
pub const XFER_ALIGNMENT: usize = 128;
/// Size of the per-recv-comm flush slot.
pub const FLUSH_SLOT_SIZE: usize = 4;
/// Serialized connect handles must fit the library's opaque handle buffer.
pub const MAX_HANDLE_SIZE: usize = 128;

/// Which wire protocol the plugin runs. Only the RDMA engine is built into
/// this crate; the send/recv variant lives behind the same vtable elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Rdma,
    SendRecv,
}

pub struct Params {
    /// Largest payload sent inline on the eager path.
    pub eager_max_size: usize,
    /// Message size above which the scheduler stripes across all rails.
    pub round_robin_threshold: usize,
    /// Bounce-buffer low watermark per rail.
    pub min_posted_bounce_buffers: usize,
    /// Bounce-buffer target per rail.
    pub max_posted_bounce_buffers: usize,
    /// Byte width of memory-registration keys; 0 lets the provider choose.
    pub mr_key_size: usize,
    /// Completion entries drained per queue read.
    pub cq_read_count: usize,
    /// Replicate each NIC this many times as single-rail devices.
    pub nic_dup_conns: usize,
    /// Latency in microseconds reported through device properties.
    pub net_latency: f32,
    pub topo_file_write: bool,
    pub topo_file_template: Option<String>,
    pub cuda_flush_enable: bool,
    pub gdr_flush_disable: bool,
    pub protocol: Protocol,
    /// Deferred warnings about malformed variables.
    pub warnings: Vec<String>,
}

impl Params {
    pub fn from_env() -> Params {
        let mut warnings = Vec::new();

        let round_robin_threshold =
            env_or("RAILNET_ROUND_ROBIN_THRESHOLD", 256 * 1024, &mut warnings);
        let mut eager_max_size = env_or("RAILNET_EAGER_MAX_SIZE", 8 * 1024, &mut warnings);
        if eager_max_size > round_robin_threshold {
            warnings.push(format!(
                "eager max size {} exceeds round robin threshold {}, clamping",
                eager_max_size, round_robin_threshold
            ));
            eager_max_size = round_robin_threshold;
        }

        let min_posted = env_or("RAILNET_MIN_POSTED_BOUNCE_BUFFERS", 64, &mut warnings);
        let mut max_posted = env_or("RAILNET_MAX_POSTED_BOUNCE_BUFFERS", 128, &mut warnings);
        if max_posted < min_posted {
            warnings.push(format!(
                "max posted bounce buffers {} below min {}, raising",
                max_posted, min_posted
            ));
            max_posted = min_posted;
        }

        let protocol = match env_string("RAILNET_PROTOCOL").as_deref() {
            None | Some("RDMA") | Some("rdma") => Protocol::Rdma,
            Some("SENDRECV") | Some("sendrecv") => Protocol::SendRecv,
            Some(other) => {
                warnings.push(format!("unknown protocol {:?}, using RDMA", other));
                Protocol::Rdma
            }
        };

        Params {
            eager_max_size,
            round_robin_threshold,
            min_posted_bounce_buffers: min_posted,
            max_posted_bounce_buffers: max_posted,
            mr_key_size: env_or("RAILNET_MR_KEY_SIZE", 2, &mut warnings),
            cq_read_count: env_or("RAILNET_CQ_READ_COUNT", 4, &mut warnings),
            nic_dup_conns: env_or("RAILNET_NIC_DUP_CONNS", 0, &mut warnings),
            net_latency: env_or("RAILNET_NET_LATENCY", 0.0f32, &mut warnings),
            topo_file_write: env_bool("RAILNET_TOPO_FILE_WRITE", false, &mut warnings),
            topo_file_template: env_string("RAILNET_TOPO_FILE_TEMPLATE"),
            cuda_flush_enable: env_bool("RAILNET_CUDA_FLUSH_ENABLE", false, &mut warnings),
            gdr_flush_disable: env_bool("RAILNET_GDR_FLUSH_DISABLE", false, &mut warnings),
            protocol,
            warnings,
        }
    }
}

lazy_static! {
    /// Process-wide parameters. Resolved on first touch; the environment is
    /// not re-read afterwards.
    pub static ref PARAMS: Params = Params::from_env();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        // Fresh Params rather than the global: the test environment is clean.
        let params = Params::from_env();
        assert_eq!(params.round_robin_threshold, 256 * 1024);
        assert_eq!(params.eager_max_size, 8 * 1024);
        assert!(params.min_posted_bounce_buffers <= params.max_posted_bounce_buffers);
        assert_eq!(params.protocol, Protocol::Rdma);
    }

    #[test]
    fn test_imm_bit_layout() {
        // The immediate word must hold all three fields in 32 bits.
        assert!(NUM_COMM_ID_BITS + NUM_SEQ_BITS + NUM_SEG_BITS <= 32);
        assert_eq!(SEQ_SPACE as usize % MSGBUFF_SIZE, 0);
    }
}
