//! Request state machine. Every unit of in-flight work (application sends
//! and receives, their subrequests, handshake messages, flushes and posted
//! bounce receives) is one `Request`: a tagged kind plus running
//! size/completion counters behind the request's own lock. Completion
//! dispatch steps requests forward; nothing suspends.

use crate::config::MAX_NUM_RAILS;
use crate::error::RailError;
use crate::rdma::device::MrHandle;
use crate::scheduler::Schedule;
use std::sync::{Arc, Mutex, MutexGuard};

pub type ReqToken = u16;

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqPhase {
    Created,
    Pending,
    Completed,
    Error,
}

/// A parked reference to a bounce buffer held out of the posting pump:
/// a control message waiting for its send, or an eager payload waiting for
/// its receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BounceRef {
    pub rail_id: u16,
    /// Token of the bounce request in the endpoint's bounce request pool.
    pub req_token: ReqToken,
    /// Received payload length.
    pub len: u32,
}

/// Element type parked in a communicator's message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgElem {
    Req(ReqToken),
    Buf(BounceRef),
}

/// Sender-side state of one application send.
#[derive(Debug)]
pub struct SendData {
    pub buf: usize,
    pub len: usize,
    pub mr: Arc<MrHandle>,
    pub remote_buff: u64,
    pub remote_len: usize,
    pub remote_keys: [u64; MAX_NUM_RAILS],
    pub schedule: Schedule,
    pub eager: bool,
    pub have_ctrl: bool,
    pub imm: u32,
    /// Next schedule segment to dispatch; a partial post resumes here.
    pub xfer_cursor: usize,
}

/// Receiver-side state of one application receive.
#[derive(Debug)]
pub struct RecvData {
    pub buf: usize,
    pub len: usize,
    pub mr: Arc<MrHandle>,
    pub ctrl_req: ReqToken,
    pub segms_req: ReqToken,
    pub eager_copy_req: Option<ReqToken>,
}

/// Subrequest: delivers the control message advertising the receive buffer.
#[derive(Debug)]
pub struct SendCtrlData {
    pub parent: ReqToken,
    /// Control freelist entry carrying the encoded message.
    pub entry_token: u32,
}

/// Subrequest: counts the arrival of the RDMA-write segments of a receive.
#[derive(Debug)]
pub struct RecvSegmsData {
    pub parent: ReqToken,
}

/// Subrequest: local read draining an eager payload from its bounce buffer
/// into the destination.
#[derive(Debug)]
pub struct EagerCopyData {
    pub parent: ReqToken,
    pub bounce: BounceRef,
    /// Destination buffer and registration, copied from the parent so the
    /// post never has to take two request locks.
    pub dst: usize,
    pub mr: Arc<MrHandle>,
}

/// Synthetic read forcing ordering of prior writes before GPU consumption.
#[derive(Debug)]
pub struct FlushData {
    /// First non-empty flushed buffer; one word of it is read back.
    pub src: usize,
    pub mr: Arc<MrHandle>,
}

/// Handshake send; owns the encoded message until the send completes.
#[derive(Debug)]
pub struct ConnSendData {
    pub msg: Box<[u8]>,
}

/// A posted bounce receive.
#[derive(Debug)]
pub struct BounceData {
    pub rail_id: u16,
    /// Bounce freelist entry backing the posted buffer.
    pub entry_token: u32,
    /// Length of the received message, set at completion.
    pub recv_len: u32,
}

#[derive(Debug)]
pub enum ReqKind {
    /// Unoccupied pool slot.
    Idle,
    Send(SendData),
    Recv(RecvData),
    SendCtrl(SendCtrlData),
    RecvSegms(RecvSegmsData),
    EagerCopy(EagerCopyData),
    Flush(FlushData),
    SendConn(ConnSendData),
    SendConnResp(ConnSendData),
    /// Staged arrival slot for the connect message (listen comm).
    RecvConn,
    /// Staged arrival slot for the connect response (send comm).
    RecvConnResp,
    Bounce(BounceData),
}

impl ReqKind {
    pub fn name(&self) -> &'static str {
        match self {
            ReqKind::Idle => "IDLE",
            ReqKind::Send(_) => "SEND",
            ReqKind::Recv(_) => "RECV",
            ReqKind::SendCtrl(_) => "SEND_CTRL",
            ReqKind::RecvSegms(_) => "RECV_SEGMS",
            ReqKind::EagerCopy(_) => "EAGER_COPY",
            ReqKind::Flush(_) => "FLUSH",
            ReqKind::SendConn(_) => "SEND_CONN",
            ReqKind::SendConnResp(_) => "SEND_CONN_RESP",
            ReqKind::RecvConn => "RECV_CONN",
            ReqKind::RecvConnResp => "RECV_CONN_RESP",
            ReqKind::Bounce(_) => "BOUNCE",
        }
    }
}

#[derive(Debug)]
pub struct ReqState {
    pub phase: ReqPhase,
    pub kind: ReqKind,
    pub msg_seq: u16,
    pub dev_id: usize,
    /// Bytes accounted so far across completions.
    pub size: usize,
    pub ncompls: usize,
    /// Completions required before the request is done. Zero means "not
    /// yet known" (segment counts arrive with the first immediate word).
    pub total_compls: usize,
    pub fault: Option<RailError>,
}

impl ReqState {
    fn fresh() -> ReqState {
        ReqState {
            phase: ReqPhase::Created,
            kind: ReqKind::Idle,
            msg_seq: 0,
            dev_id: 0,
            size: 0,
            ncompls: 0,
            total_compls: 0,
            fault: None,
        }
    }

    /// Account one completion of `len` bytes. Returns true when this was
    /// the final one and the request transitioned to `Completed`.
    pub fn increment(&mut self, len: usize) -> bool {
        self.ncompls += 1;
        self.size += len;
        debug_assert!(
            self.total_compls == 0 || self.ncompls <= self.total_compls,
            "completion overrun on {}",
            self.kind.name()
        );

        if self.phase != ReqPhase::Error
            && self.total_compls != 0
            && self.ncompls == self.total_compls
        {
            self.phase = ReqPhase::Completed;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn set_error(&mut self, err: RailError) {
        self.phase = ReqPhase::Error;
        self.fault = Some(err);
    }
}

pub struct Request {
    state: Mutex<ReqState>,
}

impl Request {
    pub fn new() -> Request {
        Request {
            state: Mutex::new(ReqState::fresh()),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<ReqState> {
        self.state.lock().unwrap()
    }

    /// Zero the request back to its just-allocated shape.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = ReqState::fresh();
    }
}

struct PoolInner {
    slots: Vec<Arc<Request>>,
    free: Vec<ReqToken>,
}

/// Recycling pool of requests. Requests are addressed by token so fabric
/// context words, message-buffer slots and parent/child links never carry
/// pointers.
pub struct ReqPool {
    inner: Mutex<PoolInner>,
    growth: usize,
    cap: usize,
}

impl ReqPool {
    pub fn new(initial: usize, growth: usize, cap: usize) -> ReqPool {
        assert!(growth > 0 && cap > 0 && cap <= ReqToken::MAX as usize);

        let pool = ReqPool {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            growth,
            cap,
        };

        if initial > 0 {
            let mut inner = pool.inner.lock().unwrap();
            Self::grow(&mut inner, initial.min(cap));
        }
        pool
    }

    fn grow(inner: &mut PoolInner, count: usize) {
        let base = inner.slots.len();
        for idx in (0..count).rev() {
            inner.free.push((base + idx) as ReqToken);
        }
        for _ in 0..count {
            inner.slots.push(Arc::new(Request::new()));
        }
    }

    /// Allocate a fresh request. `None` when the cap is reached.
    pub fn alloc(&self) -> Option<(ReqToken, Arc<Request>)> {
        let mut inner = self.inner.lock().unwrap();

        if inner.free.is_empty() {
            if inner.slots.len() >= self.cap {
                return None;
            }
            let want = self.growth.min(self.cap - inner.slots.len());
            Self::grow(&mut inner, want);
        }

        let token = inner.free.pop().expect("grown pool has free slots");
        let req = inner.slots[token as usize].clone();
        req.reset();
        Some((token, req))
    }

    pub fn get(&self, token: ReqToken) -> Arc<Request> {
        let inner = self.inner.lock().unwrap();
        inner.slots[token as usize].clone()
    }

    pub fn free(&self, token: ReqToken) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(!inner.free.contains(&token), "double free of request");
        inner.slots[token as usize].reset();
        inner.free.push(token);
    }

    pub fn outstanding(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.len() - inner.free.len()
    }
}

// Fabric context words. Bit 63 tags endpoint-owned bounce requests, bit 62
// communicator-owned requests; remote-write arrivals carry no context and
// are routed by their immediate word instead.
const CTX_COMM: u64 = 1 << 62;
const CTX_BOUNCE: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxTarget {
    Comm { comm_id: u32, token: ReqToken },
    Bounce { rail_id: u16, token: ReqToken },
}

#[inline]
pub fn comm_ctx(comm_id: u32, token: ReqToken) -> u64 {
    CTX_COMM | ((comm_id as u64) << 16) | token as u64
}

#[inline]
pub fn bounce_ctx(rail_id: u16, token: ReqToken) -> u64 {
    CTX_BOUNCE | ((rail_id as u64) << 16) | token as u64
}

#[inline]
pub fn decode_ctx(ctx: u64) -> Option<CtxTarget> {
    if ctx & CTX_BOUNCE != 0 {
        Some(CtxTarget::Bounce {
            rail_id: ((ctx >> 16) & 0xffff) as u16,
            token: (ctx & 0xffff) as ReqToken,
        })
    } else if ctx & CTX_COMM != 0 {
        Some(CtxTarget::Comm {
            comm_id: ((ctx >> 16) & 0xffff_ffff) as u32,
            token: (ctx & 0xffff) as ReqToken,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_completes_at_total() {
        let req = Request::new();
        {
            let mut state = req.lock();
            state.total_compls = 2;
            state.phase = ReqPhase::Pending;

            assert!(!state.increment(100));
            assert_eq!(state.phase, ReqPhase::Pending);
            assert!(state.increment(28));
            assert_eq!(state.phase, ReqPhase::Completed);
            assert_eq!(state.size, 128);
        }
    }

    #[test]
    fn test_increment_unknown_total_never_completes() {
        let req = Request::new();
        let mut state = req.lock();
        state.phase = ReqPhase::Pending;

        assert!(!state.increment(10));
        assert_eq!(state.phase, ReqPhase::Pending);
    }

    #[test]
    fn test_error_is_sticky() {
        let req = Request::new();
        let mut state = req.lock();
        state.total_compls = 1;
        state.set_error(RailError::Protocol("boom"));

        assert!(!state.increment(4));
        assert_eq!(state.phase, ReqPhase::Error);
    }

    #[test]
    fn test_pool_alloc_free_recycle() {
        let pool = ReqPool::new(2, 2, 6);

        let (t0, _r0) = pool.alloc().unwrap();
        let (t1, _r1) = pool.alloc().unwrap();
        assert_ne!(t0, t1);
        assert_eq!(pool.outstanding(), 2);

        pool.free(t0);
        let (t2, _r2) = pool.alloc().unwrap();
        assert_eq!(t2, t0);
    }

    #[test]
    fn test_pool_cap() {
        let pool = ReqPool::new(0, 4, 3);

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.alloc().unwrap());
        }
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn test_pool_reset_on_alloc() {
        let pool = ReqPool::new(1, 1, 1);
        let (token, req) = pool.alloc().unwrap();
        req.lock().msg_seq = 99;
        pool.free(token);

        let (_, req) = pool.alloc().unwrap();
        assert_eq!(req.lock().msg_seq, 0);
    }

    #[test]
    fn test_ctx_roundtrip() {
        let ctx = comm_ctx(0x3ffff, 0xfffe);
        assert_eq!(
            decode_ctx(ctx),
            Some(CtxTarget::Comm {
                comm_id: 0x3ffff,
                token: 0xfffe
            })
        );

        let ctx = bounce_ctx(3, 917);
        assert_eq!(
            decode_ctx(ctx),
            Some(CtxTarget::Bounce {
                rail_id: 3,
                token: 917
            })
        );

        assert_eq!(decode_ctx(0), None);
    }
}
