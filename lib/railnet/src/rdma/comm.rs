//! The three communicator flavours and the operations the library drives
//! through them. A listen communicator stages one inbound handshake; send
//! and receive communicators carry the eager/rendezvous data paths, each
//! owning its request pool and message buffer. All calls are non-blocking:
//! "not ready" is `Ok(None)` and the library retries.

use crate::config::{MAX_NUM_RAILS, MAX_REQUESTS, PARAMS, RECV_REQ_POOL_CAP, SEQ_SPACE};
use crate::error::{FabricFault, RailError, RailResult};
use crate::fabric::{CompKind, EpName, MemType, PeerAddr, EP_NAME_LEN};
use crate::freelist::Freelist;
use crate::msgbuff::{BuffOutcome, ElemKind, MsgBuff, Retrieve, SlotStatus};
use crate::rdma::device::{Device, MrHandle};
use crate::rdma::endpoint::{park_or_retrieve, CommSlot, Endpoint};
use crate::rdma::request::{
    comm_ctx, BounceRef, ConnSendData, EagerCopyData, FlushData, MsgElem, RecvData, RecvSegmsData,
    ReqKind, ReqPhase, ReqPool, ReqToken, Request, SendCtrlData, SendData,
};
use crate::rdma::wire::{
    pack_imm, ConnMsg, CtrlMsg, CONN_MSG_SIZE, CTRL_MSG_SIZE, MSG_TYPE_CONN, MSG_TYPE_CONN_RESP,
};
use byteorder::{ByteOrder, LittleEndian};
use lumen::logging::{self, Logger};
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const FLUSH_PAGE: usize = 4096;

// ---------------------------------------------------------------------------
// Connect handle
// ---------------------------------------------------------------------------

/// Staging state embedded in a connect handle so non-blocking `connect` can
/// resume across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleStage {
    Fresh,
    /// Carries the caller-side communicator id created on the first call.
    Connecting(u32),
    Done,
}

/// The opaque handle exchanged out-of-band by the host library: the
/// listener's leader-rail endpoint name, the communicator id it assigned,
/// and the caller's staging state.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub ep_name: EpName,
    pub comm_id: u32,
    pub(crate) stage: HandleStage,
}

impl ConnHandle {
    pub const ENCODED_SIZE: usize = EP_NAME_LEN + 4 + 1 + 4;

    /// Serialize into the library's fixed opaque buffer.
    pub fn encode(&self, buf: &mut [u8]) -> RailResult<()> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(RailError::Invalid("handle buffer too small"));
        }

        buf[..EP_NAME_LEN].copy_from_slice(&self.ep_name.0);
        LittleEndian::write_u32(&mut buf[EP_NAME_LEN..], self.comm_id);
        let (tag, id) = match self.stage {
            HandleStage::Fresh => (0u8, 0u32),
            HandleStage::Connecting(id) => (1, id),
            HandleStage::Done => (2, 0),
        };
        buf[EP_NAME_LEN + 4] = tag;
        LittleEndian::write_u32(&mut buf[EP_NAME_LEN + 5..], id);
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> RailResult<ConnHandle> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(RailError::Invalid("handle buffer too small"));
        }

        let mut ep_name = EpName::zeroed();
        ep_name.0.copy_from_slice(&buf[..EP_NAME_LEN]);
        let comm_id = LittleEndian::read_u32(&buf[EP_NAME_LEN..]);
        let id = LittleEndian::read_u32(&buf[EP_NAME_LEN + 5..]);
        let stage = match buf[EP_NAME_LEN + 4] {
            0 => HandleStage::Fresh,
            1 => HandleStage::Connecting(id),
            2 => HandleStage::Done,
            _ => return Err(RailError::Invalid("corrupt handle stage")),
        };

        Ok(ConnHandle {
            ep_name,
            comm_id,
            stage,
        })
    }
}

// ---------------------------------------------------------------------------
// Listen communicator
// ---------------------------------------------------------------------------

pub(crate) struct PeerConnInfo {
    pub sender_comm_id: u32,
    pub num_rails: u16,
    pub ep_names: [EpName; MAX_NUM_RAILS],
}

enum AcceptStage {
    WaitConn,
    SendResp {
        comm: Arc<RecvComm>,
        resp_token: ReqToken,
    },
    Done,
}

pub struct ListenComm {
    pub id: u32,
    pub(crate) ep: Arc<Endpoint>,
    /// Embedded receive-connect request, completed by dispatch when the
    /// connect message lands.
    pub(crate) conn_req: Arc<Request>,
    pub(crate) peer: Mutex<Option<PeerConnInfo>>,
    stage: Mutex<AcceptStage>,
    log: Logger,
}

impl ListenComm {
    /// Dispatch handler: the connect message arrived on a bounce buffer.
    pub(crate) fn handle_conn(&self, msg: &ConnMsg) -> RailResult<()> {
        debug_assert_eq!(msg.msg_type, MSG_TYPE_CONN);

        let mut peer = self.peer.lock().unwrap();
        if peer.is_some() {
            return Err(RailError::Protocol("duplicate connect message"));
        }
        *peer = Some(PeerConnInfo {
            sender_comm_id: msg.local_comm_id,
            num_rails: msg.num_rails,
            ep_names: msg.ep_names,
        });
        drop(peer);

        let mut state = self.conn_req.lock();
        state.increment(CONN_MSG_SIZE);

        logging::debug!(self.log, "connect message received";
                        "context" => "handshake",
                        "peer_comm_id" => msg.local_comm_id,
                        "peer_rails" => msg.num_rails);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Send communicator
// ---------------------------------------------------------------------------

pub struct SendComm {
    pub id: u32,
    pub(crate) ep: Arc<Endpoint>,
    pub(crate) reqs: ReqPool,
    pub(crate) msgbuff: MsgBuff<MsgElem>,
    peer_id: AtomicU32,
    connected: AtomicBool,
    peer_addrs: RwLock<Vec<Option<PeerAddr>>>,
    inflight: AtomicUsize,
    next_seq: AtomicUsize,
    conn_req: Mutex<Option<ReqToken>>,
    conn_resp_req: Mutex<Option<ReqToken>>,
    log: Logger,
}

impl SendComm {
    /// The endpoint this communicator is bound to.
    #[inline]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.ep
    }

    #[inline]
    pub(crate) fn peer_addr(&self, rail_id: usize) -> RailResult<PeerAddr> {
        self.peer_addrs.read().unwrap()[rail_id]
            .ok_or(RailError::Invalid("rail not connected yet"))
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn post_conn_send(&self, ep: &Endpoint, token: ReqToken) -> RailResult<()> {
        let peer = self.peer_addr(0)?;
        ep.post_handshake(self.id, &self.reqs, token, peer)
    }

    /// Dispatch handler: the connect response landed. Copies the peer's
    /// rail addressing, initializes the remaining rails, and publishes
    /// `connected` behind a full fence so a sender observing it sees the
    /// finalized rails.
    pub(crate) fn handle_conn_resp(&self, ep: &Endpoint, msg: &ConnMsg) -> RailResult<()> {
        debug_assert_eq!(msg.msg_type, MSG_TYPE_CONN_RESP);

        let resp_token = match *self.conn_resp_req.lock().unwrap() {
            Some(token) => token,
            None => return Err(RailError::Protocol("unexpected connect response")),
        };

        if msg.num_rails as usize != ep.num_rails() {
            let req = self.reqs.get(resp_token);
            req.lock()
                .set_error(RailError::Protocol("rail count mismatch in connect response"));
            return Ok(());
        }

        self.peer_id.store(msg.local_comm_id, Ordering::SeqCst);
        {
            let mut addrs = self.peer_addrs.write().unwrap();
            for rail_id in 0..msg.num_rails as usize {
                let addr = ep.rail(rail_id).ep.av_insert(&msg.ep_names[rail_id])?;
                addrs[rail_id] = Some(addr);
            }
        }

        fence(Ordering::SeqCst);
        self.connected.store(true, Ordering::Release);

        let req = self.reqs.get(resp_token);
        req.lock().increment(CONN_MSG_SIZE);

        logging::debug!(self.log, "connected";
                        "context" => "handshake",
                        "peer_comm_id" => msg.local_comm_id);
        Ok(())
    }

    /// Dispatch handler: a rendezvous control message arrived. Either park
    /// it for a future `isend`, or feed the waiting send request and kick
    /// its RDMA writes.
    pub(crate) fn handle_ctrl(
        &self,
        ep: &Endpoint,
        msg: &CtrlMsg,
        bref: BounceRef,
    ) -> RailResult<()> {
        let seq = msg.msg_seq_num;

        let token = match park_or_retrieve(&self.msgbuff, seq, bref)? {
            None => return Ok(()), // parked until isend; no repost yet
            Some(token) => token,
        };

        let req = self.reqs.get(token);
        let (eager, oversize) = {
            let mut state = req.lock();
            let data = match &mut state.kind {
                ReqKind::Send(data) => data,
                _ => return Err(RailError::Protocol("control message for non-send request")),
            };

            let eager = data.eager;
            let mut oversize = false;
            if !eager {
                data.remote_buff = msg.buff_addr;
                data.remote_len = msg.buff_len as usize;
                data.remote_keys = msg.buff_mr_key;
                data.have_ctrl = true;
                if data.len > data.remote_len {
                    let err = RailError::MessageSize {
                        size: data.len,
                        limit: data.remote_len,
                    };
                    state.set_error(err);
                    oversize = true;
                }
            }
            (eager, oversize)
        };

        if oversize {
            return ep.repost_bounce(bref);
        }

        if !eager {
            match ep.post_send_req(self, token) {
                Ok(()) => {}
                Err(RailError::Again) => ep.enqueue_pending(comm_ctx(self.id, token)),
                Err(err) => return Err(err),
            }
        }

        // The control arrival itself counts toward the send's completions.
        req.lock().increment(0);

        ep.repost_bounce(bref)
    }

    /// Completion dispatch for requests owned by this communicator.
    pub(crate) fn on_completion(
        &self,
        _ep: &Endpoint,
        kind: CompKind,
        token: ReqToken,
        len: usize,
    ) -> RailResult<()> {
        let req = self.reqs.get(token);
        let mut state = req.lock();

        match (kind, &state.kind) {
            (CompKind::Send, ReqKind::SendConn(_)) => {
                state.increment(len);
                Ok(())
            }
            (CompKind::Send, ReqKind::Send(_)) | (CompKind::Write, ReqKind::Send(_)) => {
                state.increment(len);
                Ok(())
            }
            _ => Err(RailError::Protocol("unexpected completion on send communicator")),
        }
    }

    pub(crate) fn on_error(&self, token: ReqToken, fault: FabricFault) -> RailResult<()> {
        let req = self.reqs.get(token);
        req.lock().set_error(RailError::Fabric(fault));
        Ok(())
    }

    /// Post a send of `len` bytes from `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and registered under `mr` until `test`
    /// reports the returned request complete.
    pub unsafe fn isend(
        self: &Arc<Self>,
        buf: *const u8,
        len: usize,
        mr: &Arc<MrHandle>,
    ) -> RailResult<Option<ReqHandle>> {
        if self.inflight.load(Ordering::SeqCst) >= MAX_REQUESTS {
            return Err(RailError::Resource("send inflight ceiling"));
        }

        let ep = &self.ep;
        if !self.is_connected() {
            ep.progress()?;
            if !self.is_connected() {
                return Ok(None);
            }
        }

        if !ep.pending_empty() {
            ep.progress()?;
            if !ep.pending_empty() {
                return Ok(None);
            }
        }

        let seq = self.next_seq.load(Ordering::SeqCst) as u16;

        // Whichever side got here first: a parked control message means the
        // receiver advertised its buffer before we sent.
        let parked_ctrl = match self.msgbuff.retrieve(seq) {
            Retrieve::NotStarted => None,
            Retrieve::Found {
                elem: MsgElem::Buf(bref),
                kind: ElemKind::Buf,
                status: SlotStatus::InProgress,
            } => Some(bref),
            Retrieve::Found { .. } => {
                return Err(RailError::Protocol("send sequence already occupied"));
            }
        };

        let have_ctrl = parked_ctrl.is_some();
        let eager = (!have_ctrl && len <= PARAMS.eager_max_size) || len == 0;
        let schedule = self.ep.dev.scheduler.plan(len);
        let num_segments = schedule.num_segments();
        let peer_id = self.peer_id.load(Ordering::SeqCst);

        let (token, req) = self
            .reqs
            .alloc()
            .ok_or(RailError::Resource("send request pool exhausted"))?;

        {
            let mut state = req.lock();
            state.msg_seq = seq;
            state.dev_id = self.ep.dev.id;
            state.total_compls = if have_ctrl { 0 } else { 1 } + num_segments;
            state.kind = ReqKind::Send(SendData {
                buf: buf as usize,
                len,
                mr: mr.clone(),
                remote_buff: 0,
                remote_len: 0,
                remote_keys: [0; MAX_NUM_RAILS],
                schedule,
                eager,
                have_ctrl,
                imm: pack_imm(peer_id, seq, num_segments),
                xfer_cursor: 0,
            });

            if let Some(bref) = parked_ctrl {
                let ctrl = CtrlMsg::decode(&ep.bounce_bytes(&bref))?;
                debug_assert_eq!(ctrl.msg_seq_num, seq);
                if let ReqKind::Send(data) = &mut state.kind {
                    data.remote_buff = ctrl.buff_addr;
                    data.remote_len = ctrl.buff_len as usize;
                    data.remote_keys = ctrl.buff_mr_key;
                }
                if !eager && len > ctrl.buff_len as usize {
                    state.set_error(RailError::MessageSize {
                        size: len,
                        limit: ctrl.buff_len as usize,
                    });
                }
            }
        }

        let outcome = match parked_ctrl {
            Some(_) => self.msgbuff.replace(seq, MsgElem::Req(token), ElemKind::Req),
            None => self.msgbuff.insert(seq, MsgElem::Req(token), ElemKind::Req),
        };
        if outcome != BuffOutcome::Success {
            self.reqs.free(token);
            return Err(RailError::Protocol("send message buffer insert failed"));
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);

        if let Some(bref) = parked_ctrl {
            ep.repost_bounce(bref)?;
        }

        let in_error = req.lock().phase == ReqPhase::Error;
        if !in_error {
            match ep.post_send_req(self, token) {
                Ok(()) => {}
                Err(RailError::Again) => ep.enqueue_pending(comm_ctx(self.id, token)),
                Err(err) => return Err(err),
            }
        }

        self.next_seq
            .store((seq as usize + 1) % SEQ_SPACE as usize, Ordering::SeqCst);

        Ok(Some(ReqHandle::Send {
            comm: self.clone(),
            token,
        }))
    }
}

// ---------------------------------------------------------------------------
// Receive communicator
// ---------------------------------------------------------------------------

pub struct RecvComm {
    pub id: u32,
    pub(crate) ep: Arc<Endpoint>,
    pub(crate) reqs: ReqPool,
    pub(crate) msgbuff: MsgBuff<MsgElem>,
    pub(crate) ctrl_fl: Freelist,
    pub(crate) peer_addrs: Vec<PeerAddr>,
    pub(crate) flush_mr: Arc<MrHandle>,
    peer_id: u32,
    flush_buf: Box<[u8]>,
    inflight: AtomicUsize,
    next_seq: AtomicUsize,
    log: Logger,
}

impl RecvComm {
    /// The endpoint this communicator is bound to.
    #[inline]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.ep
    }

    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn flush_ptr(&self) -> *mut u8 {
        self.flush_buf.as_ptr() as *mut u8
    }

    pub(crate) fn post_conn_resp(&self, ep: &Endpoint, token: ReqToken) -> RailResult<()> {
        ep.post_handshake(self.id, &self.reqs, token, self.peer_addrs[0])
    }

    /// Dispatch handler: an eager payload landed on a bounce buffer.
    pub(crate) fn handle_eager(
        &self,
        ep: &Endpoint,
        seq: u16,
        bref: BounceRef,
    ) -> RailResult<()> {
        let token = match park_or_retrieve(&self.msgbuff, seq, bref)? {
            None => return Ok(()), // parked until irecv; repost deferred
            Some(token) => token,
        };

        self.attach_eager(ep, token, bref)
    }

    /// The receive request at `token` consumes the eager payload in
    /// `bref`: complete immediately for empty payloads, otherwise kick an
    /// eager-copy read. The bounce buffer reposts once drained.
    fn attach_eager(&self, ep: &Endpoint, token: ReqToken, bref: BounceRef) -> RailResult<()> {
        let req = self.reqs.get(token);

        let dst_len = {
            let state = req.lock();
            match &state.kind {
                ReqKind::Recv(data) => data.len,
                _ => return Err(RailError::Protocol("eager payload for non-recv request")),
            }
        };

        if bref.len as usize > dst_len {
            req.lock().set_error(RailError::MessageSize {
                size: bref.len as usize,
                limit: dst_len,
            });
            return ep.repost_bounce(bref);
        }

        if bref.len == 0 {
            ep.repost_bounce(bref)?;
            req.lock().increment(0);
            return Ok(());
        }

        let copy_token = self.alloc_eager_copy(token, bref)?;
        match ep.post_eager_copy_req(self, copy_token) {
            Ok(()) => Ok(()),
            Err(RailError::Again) => {
                ep.enqueue_pending(comm_ctx(self.id, copy_token));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn alloc_eager_copy(&self, parent: ReqToken, bref: BounceRef) -> RailResult<ReqToken> {
        let parent_req = self.reqs.get(parent);
        let (dst, mr, seq) = {
            let state = parent_req.lock();
            match &state.kind {
                ReqKind::Recv(data) => (data.buf, data.mr.clone(), state.msg_seq),
                _ => return Err(RailError::Protocol("eager copy for non-recv request")),
            }
        };

        let (token, req) = self
            .reqs
            .alloc()
            .ok_or(RailError::Resource("recv request pool exhausted"))?;
        {
            let mut state = req.lock();
            state.msg_seq = seq;
            state.total_compls = 1;
            state.phase = ReqPhase::Pending;
            state.kind = ReqKind::EagerCopy(EagerCopyData {
                parent,
                bounce: bref,
                dst,
                mr,
            });
        }

        let mut parent_state = parent_req.lock();
        if let ReqKind::Recv(data) = &mut parent_state.kind {
            data.eager_copy_req = Some(token);
        }
        Ok(token)
    }

    /// Dispatch handler: one RDMA write segment landed. The segment
    /// subrequest learns its total from the first immediate word and rolls
    /// up into the receive once all segments arrived.
    pub(crate) fn on_segment_arrival(
        &self,
        seq: u16,
        num_segments: usize,
        len: usize,
    ) -> RailResult<()> {
        let token = match self.msgbuff.retrieve(seq) {
            Retrieve::Found {
                elem: MsgElem::Req(token),
                ..
            } => token,
            _ => return Err(RailError::Protocol("write segment without posted receive")),
        };

        let req = self.reqs.get(token);
        let segms_token = {
            let state = req.lock();
            match &state.kind {
                ReqKind::Recv(data) => data.segms_req,
                _ => return Err(RailError::Protocol("write segment for non-recv request")),
            }
        };

        let segms_req = self.reqs.get(segms_token);
        let (all_arrived, total_bytes) = {
            let mut state = segms_req.lock();
            if state.total_compls == 0 {
                state.total_compls = num_segments;
                state.phase = ReqPhase::Pending;
            }
            debug_assert_eq!(state.total_compls, num_segments);
            let done = state.increment(len);
            (done, state.size)
        };

        if all_arrived {
            req.lock().increment(total_bytes);
        }
        Ok(())
    }

    pub(crate) fn on_completion(
        &self,
        ep: &Endpoint,
        kind: CompKind,
        token: ReqToken,
        len: usize,
    ) -> RailResult<()> {
        let req = self.reqs.get(token);

        enum Action {
            None,
            RollupParent { parent: ReqToken, add: usize },
            EagerDone { parent: ReqToken, add: usize, bounce: BounceRef },
        }

        let action = {
            let mut state = req.lock();
            match (kind, &state.kind) {
                (CompKind::Send, ReqKind::SendConnResp(_)) => {
                    state.increment(len);
                    Action::None
                }
                (CompKind::Send, ReqKind::SendCtrl(data)) => {
                    let parent = data.parent;
                    state.increment(len);
                    Action::RollupParent { parent, add: 0 }
                }
                (CompKind::Read, ReqKind::EagerCopy(data)) => {
                    let parent = data.parent;
                    let bounce = data.bounce;
                    state.increment(len);
                    Action::EagerDone {
                        parent,
                        add: len,
                        bounce,
                    }
                }
                (CompKind::Read, ReqKind::Flush(_)) => {
                    state.increment(len);
                    Action::None
                }
                _ => {
                    return Err(RailError::Protocol(
                        "unexpected completion on recv communicator",
                    ))
                }
            }
        };

        match action {
            Action::None => Ok(()),
            Action::RollupParent { parent, add } => {
                let parent_req = self.reqs.get(parent);
                parent_req.lock().increment(add);
                Ok(())
            }
            Action::EagerDone {
                parent,
                add,
                bounce,
            } => {
                let parent_req = self.reqs.get(parent);
                parent_req.lock().increment(add);
                ep.repost_bounce(bounce)
            }
        }
    }

    pub(crate) fn on_error(&self, token: ReqToken, fault: FabricFault) -> RailResult<()> {
        let req = self.reqs.get(token);
        let parent = {
            let mut state = req.lock();
            state.set_error(RailError::Fabric(fault));
            match &state.kind {
                ReqKind::SendCtrl(data) => Some(data.parent),
                ReqKind::EagerCopy(data) => Some(data.parent),
                ReqKind::RecvSegms(data) => Some(data.parent),
                _ => None,
            }
        };

        if let Some(parent) = parent {
            let parent_req = self.reqs.get(parent);
            parent_req.lock().set_error(RailError::Fabric(fault));
        }
        Ok(())
    }

    /// Post a receive into `buf`. The control message advertising the
    /// buffer goes out immediately; an already-parked eager payload is
    /// drained instead of waiting for writes.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and registered under `mr` until `test`
    /// reports the returned request complete.
    pub unsafe fn irecv(
        self: &Arc<Self>,
        buf: *mut u8,
        len: usize,
        _tag: u32,
        mr: &Arc<MrHandle>,
    ) -> RailResult<Option<ReqHandle>> {
        if self.inflight.load(Ordering::SeqCst) >= MAX_REQUESTS {
            return Err(RailError::Resource("recv inflight ceiling"));
        }

        let ep = &self.ep;
        if !ep.pending_empty() {
            ep.progress()?;
            if !ep.pending_empty() {
                return Ok(None);
            }
        }

        let seq = self.next_seq.load(Ordering::SeqCst) as u16;

        let parked_eager = match self.msgbuff.retrieve(seq) {
            Retrieve::NotStarted => None,
            Retrieve::Found {
                elem: MsgElem::Buf(bref),
                kind: ElemKind::Buf,
                status: SlotStatus::InProgress,
            } => Some(bref),
            Retrieve::Found { .. } => {
                return Err(RailError::Protocol("recv sequence already occupied"));
            }
        };

        let (token, req) = self
            .reqs
            .alloc()
            .ok_or(RailError::Resource("recv request pool exhausted"))?;

        let ctrl_token = match self.alloc_ctrl(token, seq, buf as usize, len, mr) {
            Ok(token) => token,
            Err(err) => {
                self.reqs.free(token);
                return Err(err);
            }
        };
        let segms_token = match self.alloc_segms(token, seq) {
            Ok(token) => token,
            Err(err) => {
                self.free_ctrl(ctrl_token);
                self.reqs.free(token);
                return Err(err);
            }
        };

        {
            let mut state = req.lock();
            state.msg_seq = seq;
            state.dev_id = self.ep.dev.id;
            state.phase = ReqPhase::Pending;
            // The buffer advertisement and exactly one data-side roll-up:
            // segment arrivals or the eager drain.
            state.total_compls = 2;
            state.kind = ReqKind::Recv(RecvData {
                buf: buf as usize,
                len,
                mr: mr.clone(),
                ctrl_req: ctrl_token,
                segms_req: segms_token,
                eager_copy_req: None,
            });
        }

        let outcome = match parked_eager {
            Some(_) => self.msgbuff.replace(seq, MsgElem::Req(token), ElemKind::Req),
            None => self.msgbuff.insert(seq, MsgElem::Req(token), ElemKind::Req),
        };
        match outcome {
            BuffOutcome::Success => {}
            BuffOutcome::InvalidIdx(SlotStatus::InProgress) => {
                // An eager payload slipped in on another thread between the
                // peek and the insert. Unwind and let the library retry.
                self.free_ctrl(ctrl_token);
                self.reqs.free(segms_token);
                self.reqs.free(token);
                return Ok(None);
            }
            BuffOutcome::InvalidIdx(_) => {
                return Err(RailError::Protocol("recv message buffer insert failed"));
            }
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);

        match ep.post_ctrl_req(self, ctrl_token) {
            Ok(()) => {}
            Err(RailError::Again) => ep.enqueue_pending(comm_ctx(self.id, ctrl_token)),
            Err(err) => return Err(err),
        }

        if let Some(bref) = parked_eager {
            self.attach_eager(ep, token, bref)?;
        }

        self.next_seq
            .store((seq as usize + 1) % SEQ_SPACE as usize, Ordering::SeqCst);

        Ok(Some(ReqHandle::Recv {
            comm: self.clone(),
            token,
        }))
    }

    fn alloc_ctrl(
        &self,
        parent: ReqToken,
        seq: u16,
        buff_addr: usize,
        buff_len: usize,
        mr: &Arc<MrHandle>,
    ) -> RailResult<ReqToken> {
        let entry = self
            .ctrl_fl
            .alloc()?
            .ok_or(RailError::Resource("ctrl freelist exhausted"))?;

        let msg = CtrlMsg {
            remote_comm_id: self.peer_id,
            msg_seq_num: seq,
            buff_addr: buff_addr as u64,
            buff_len: buff_len as u64,
            buff_mr_key: mr.keys(),
        };
        unsafe {
            msg.encode(entry.bytes_mut())?;
        }

        let (token, req) = match self.reqs.alloc() {
            Some(pair) => pair,
            None => {
                self.ctrl_fl.free(entry);
                return Err(RailError::Resource("recv request pool exhausted"));
            }
        };

        let mut state = req.lock();
        state.msg_seq = seq;
        state.total_compls = 1;
        state.kind = ReqKind::SendCtrl(SendCtrlData {
            parent,
            entry_token: entry.token(),
        });
        Ok(token)
    }

    fn free_ctrl(&self, token: ReqToken) {
        let req = self.reqs.get(token);
        let entry_token = {
            let state = req.lock();
            match &state.kind {
                ReqKind::SendCtrl(data) => Some(data.entry_token),
                _ => None,
            }
        };
        if let Some(entry_token) = entry_token {
            self.ctrl_fl.free_token(entry_token);
        }
        self.reqs.free(token);
    }

    fn alloc_segms(&self, parent: ReqToken, seq: u16) -> RailResult<ReqToken> {
        let (token, req) = self
            .reqs
            .alloc()
            .ok_or(RailError::Resource("recv request pool exhausted"))?;

        let mut state = req.lock();
        state.msg_seq = seq;
        state.total_compls = 0; // learned from the first immediate word
        state.kind = ReqKind::RecvSegms(RecvSegmsData { parent });
        Ok(token)
    }

    /// Post a flush forcing ordering of prior RDMA writes before the
    /// buffers are handed to the accelerator. Skipped (returns `None`)
    /// when GPU-direct is unsupported or disabled, or nothing was
    /// received.
    ///
    /// # Safety
    ///
    /// Buffers must stay valid and registered until `test` reports the
    /// returned request complete.
    pub unsafe fn iflush(
        self: &Arc<Self>,
        bufs: &[*mut u8],
        sizes: &[usize],
        mrs: &[Arc<MrHandle>],
    ) -> RailResult<Option<ReqHandle>> {
        if PARAMS.gdr_flush_disable || PARAMS.cuda_flush_enable || !self.ep.dev.hmem_support() {
            return Ok(None);
        }

        let idx = match sizes.iter().position(|&size| size > 0) {
            Some(idx) => idx,
            None => return Ok(None),
        };

        if self.inflight.load(Ordering::SeqCst) >= MAX_REQUESTS {
            return Err(RailError::Resource("recv inflight ceiling"));
        }

        let (token, req) = self
            .reqs
            .alloc()
            .ok_or(RailError::Resource("recv request pool exhausted"))?;
        {
            let mut state = req.lock();
            state.phase = ReqPhase::Pending;
            state.total_compls = 1;
            state.kind = ReqKind::Flush(FlushData {
                src: bufs[idx] as usize,
                mr: mrs[idx].clone(),
            });
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);

        match self.ep.post_flush_req(self, token) {
            Ok(()) => {}
            Err(RailError::Again) => self.ep.enqueue_pending(comm_ctx(self.id, token)),
            Err(err) => return Err(err),
        }

        Ok(Some(ReqHandle::Flush {
            comm: self.clone(),
            token,
        }))
    }
}

// ---------------------------------------------------------------------------
// Listen / connect / accept
// ---------------------------------------------------------------------------

/// Stage a listening communicator and produce the out-of-band handle.
pub fn listen(dev: &Arc<Device>) -> RailResult<(ConnHandle, ListenCommHandle)> {
    let ep = dev.endpoint()?;
    let id = dev.alloc_comm_id()?;

    let conn_req = Arc::new(Request::new());
    {
        let mut state = conn_req.lock();
        state.phase = ReqPhase::Pending;
        state.total_compls = 1;
        state.kind = ReqKind::RecvConn;
    }

    let comm = Arc::new(ListenComm {
        id,
        ep: ep.clone(),
        conn_req,
        peer: Mutex::new(None),
        stage: Mutex::new(AcceptStage::WaitConn),
        log: ep.log().new(logging::o!("comm" => id, "flavour" => "listen")),
    });

    ep.insert_comm(id, CommSlot::Listen(comm.clone()));

    let handle = ConnHandle {
        ep_name: ep.rail(0).ep.name(),
        comm_id: id,
        stage: HandleStage::Fresh,
    };

    logging::debug!(comm.log, "listening"; "context" => "handshake");
    Ok((handle, ListenCommHandle { comm }))
}

/// Drive the caller side of the handshake. Returns `Ok(None)` until the
/// connect response has arrived and all rails are initialized.
pub fn connect(
    dev: &Arc<Device>,
    handle: &mut ConnHandle,
) -> RailResult<Option<SendCommHandle>> {
    match handle.stage {
        HandleStage::Fresh => {
            let ep = dev.endpoint()?;
            let id = dev.alloc_comm_id()?;

            let mut peer_addrs = vec![None; ep.num_rails()];
            peer_addrs[0] = Some(ep.rail(0).ep.av_insert(&handle.ep_name)?);

            // Two slots beyond the inflight ceiling: the handshake pair
            // lives in the same pool as data sends.
            let comm = Arc::new(SendComm {
                id,
                ep: ep.clone(),
                reqs: ReqPool::new(16, 16, MAX_REQUESTS + 2),
                msgbuff: MsgBuff::new(),
                peer_id: AtomicU32::new(0),
                connected: AtomicBool::new(false),
                peer_addrs: RwLock::new(peer_addrs),
                inflight: AtomicUsize::new(0),
                next_seq: AtomicUsize::new(0),
                conn_req: Mutex::new(None),
                conn_resp_req: Mutex::new(None),
                log: ep.log().new(logging::o!("comm" => id, "flavour" => "send")),
            });

            let mut ep_names = [EpName::zeroed(); MAX_NUM_RAILS];
            for rail_id in 0..ep.num_rails() {
                ep_names[rail_id] = ep.rail(rail_id).ep.name();
            }
            let msg = ConnMsg {
                msg_type: MSG_TYPE_CONN,
                local_comm_id: id,
                remote_comm_id: handle.comm_id,
                num_rails: ep.num_rails() as u16,
                ep_names,
            };
            let mut encoded = vec![0u8; CONN_MSG_SIZE].into_boxed_slice();
            msg.encode(&mut encoded)?;

            let (conn_token, conn_req) = comm
                .reqs
                .alloc()
                .ok_or(RailError::Resource("send request pool exhausted"))?;
            {
                let mut state = conn_req.lock();
                state.total_compls = 1;
                state.kind = ReqKind::SendConn(ConnSendData { msg: encoded });
            }
            let (resp_token, resp_req) = comm
                .reqs
                .alloc()
                .ok_or(RailError::Resource("send request pool exhausted"))?;
            {
                let mut state = resp_req.lock();
                state.phase = ReqPhase::Pending;
                state.total_compls = 1;
                state.kind = ReqKind::RecvConnResp;
            }
            *comm.conn_req.lock().unwrap() = Some(conn_token);
            *comm.conn_resp_req.lock().unwrap() = Some(resp_token);

            ep.insert_comm(id, CommSlot::Send(comm.clone()));

            match comm.post_conn_send(&ep, conn_token) {
                Ok(()) => {}
                Err(RailError::Again) => ep.enqueue_pending(comm_ctx(id, conn_token)),
                Err(err) => return Err(err),
            }

            handle.stage = HandleStage::Connecting(id);
            logging::debug!(comm.log, "connect staged";
                            "context" => "handshake",
                            "listener_comm_id" => handle.comm_id);
            Ok(None)
        }

        HandleStage::Connecting(id) => {
            let ep = dev.endpoint()?;
            let comm = match ep.comm(id) {
                Some(CommSlot::Send(comm)) => comm,
                _ => return Err(RailError::Invalid("stale connect handle")),
            };

            ep.progress()?;

            if let Some(resp_token) = *comm.conn_resp_req.lock().unwrap() {
                let resp_req = comm.reqs.get(resp_token);
                let state = resp_req.lock();
                if state.phase == ReqPhase::Error {
                    return Err(state.fault.unwrap_or(RailError::Protocol("handshake failed")));
                }
            }

            if !comm.is_connected() {
                return Ok(None);
            }

            // Handshake requests have served their purpose. The connect
            // send is only reclaimed once its fabric completion has been
            // observed; otherwise it stays allocated until close.
            {
                let mut conn_req = comm.conn_req.lock().unwrap();
                if let Some(token) = *conn_req {
                    if comm.reqs.get(token).lock().phase == ReqPhase::Completed {
                        comm.reqs.free(token);
                        *conn_req = None;
                    }
                }
            }
            if let Some(token) = comm.conn_resp_req.lock().unwrap().take() {
                comm.reqs.free(token);
            }

            handle.stage = HandleStage::Done;
            Ok(Some(SendCommHandle { comm }))
        }

        HandleStage::Done => Err(RailError::Invalid("handle already connected")),
    }
}

impl ListenComm {
    /// Drive the listener side of the handshake. Returns `Ok(None)` until
    /// the connect message has arrived and the connect response send has
    /// completed.
    pub fn accept(self: &Arc<Self>) -> RailResult<Option<RecvCommHandle>> {
        let ep = &self.ep;
        ep.progress()?;

        let mut stage = self.stage.lock().unwrap();
        match &*stage {
            AcceptStage::WaitConn => {
                if self.conn_req.lock().phase != ReqPhase::Completed {
                    return Ok(None);
                }

                let peer = self
                    .peer
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or(RailError::Protocol("connect completed without payload"))?;

                if peer.num_rails as usize != ep.num_rails() {
                    return Err(RailError::Protocol("rail count mismatch in connect"));
                }

                let dev = &ep.dev;
                let id = dev.alloc_comm_id()?;

                let mut peer_addrs = Vec::with_capacity(ep.num_rails());
                for rail_id in 0..ep.num_rails() {
                    peer_addrs.push(ep.rail(rail_id).ep.av_insert(&peer.ep_names[rail_id])?);
                }

                let flush_buf = vec![0u8; FLUSH_PAGE].into_boxed_slice();
                let flush_mr =
                    dev.register_mr(flush_buf.as_ptr() as usize, FLUSH_PAGE, MemType::Host)?;

                let ctrl_fl = Freelist::new(
                    CTRL_MSG_SIZE,
                    16,
                    16,
                    MAX_REQUESTS,
                    8,
                    Some(ep.rail_registrar()),
                )?;

                let comm = Arc::new(RecvComm {
                    id,
                    ep: ep.clone(),
                    reqs: ReqPool::new(16, 16, RECV_REQ_POOL_CAP),
                    msgbuff: MsgBuff::new(),
                    ctrl_fl,
                    peer_addrs,
                    flush_mr,
                    peer_id: peer.sender_comm_id,
                    flush_buf,
                    inflight: AtomicUsize::new(0),
                    next_seq: AtomicUsize::new(0),
                    log: ep.log().new(logging::o!("comm" => id, "flavour" => "recv")),
                });

                ep.insert_comm(id, CommSlot::Recv(comm.clone()));

                let mut ep_names = [EpName::zeroed(); MAX_NUM_RAILS];
                for rail_id in 0..ep.num_rails() {
                    ep_names[rail_id] = ep.rail(rail_id).ep.name();
                }
                let msg = ConnMsg {
                    msg_type: MSG_TYPE_CONN_RESP,
                    local_comm_id: id,
                    remote_comm_id: peer.sender_comm_id,
                    num_rails: ep.num_rails() as u16,
                    ep_names,
                };
                let mut encoded = vec![0u8; CONN_MSG_SIZE].into_boxed_slice();
                msg.encode(&mut encoded)?;

                let (resp_token, resp_req) = comm
                    .reqs
                    .alloc()
                    .ok_or(RailError::Resource("recv request pool exhausted"))?;
                {
                    let mut state = resp_req.lock();
                    state.total_compls = 1;
                    state.kind = ReqKind::SendConnResp(ConnSendData { msg: encoded });
                }

                match comm.post_conn_resp(ep, resp_token) {
                    Ok(()) => {}
                    Err(RailError::Again) => ep.enqueue_pending(comm_ctx(id, resp_token)),
                    Err(err) => return Err(err),
                }

                logging::debug!(self.log, "accept staged";
                                "context" => "handshake",
                                "recv_comm_id" => id);

                *stage = AcceptStage::SendResp {
                    comm,
                    resp_token,
                };
                Ok(None)
            }

            AcceptStage::SendResp { comm, resp_token } => {
                let comm = comm.clone();
                let resp_token = *resp_token;

                let phase = comm.reqs.get(resp_token).lock().phase;
                match phase {
                    ReqPhase::Completed => {
                        comm.reqs.free(resp_token);
                        *stage = AcceptStage::Done;
                        Ok(Some(RecvCommHandle { comm }))
                    }
                    ReqPhase::Error => {
                        Err(RailError::Protocol("connect response send failed"))
                    }
                    _ => Ok(None),
                }
            }

            AcceptStage::Done => Err(RailError::Invalid("listen comm already accepted")),
        }
    }
}

// ---------------------------------------------------------------------------
// Handles, test and close
// ---------------------------------------------------------------------------

pub struct ListenCommHandle {
    pub(crate) comm: Arc<ListenComm>,
}

pub struct SendCommHandle {
    pub(crate) comm: Arc<SendComm>,
}

pub struct RecvCommHandle {
    pub(crate) comm: Arc<RecvComm>,
}

impl ListenCommHandle {
    #[inline]
    pub fn accept(&self) -> RailResult<Option<RecvCommHandle>> {
        self.comm.accept()
    }

    /// Tear down the listening communicator.
    pub fn close(self) -> RailResult<()> {
        let comm = self.comm;
        comm.ep.remove_comm(comm.id);
        comm.ep.dev.free_comm_id(comm.id)?;
        logging::debug!(comm.log, "closed"; "context" => "close");
        Ok(())
    }
}

impl SendCommHandle {
    #[inline]
    pub fn comm(&self) -> &Arc<SendComm> {
        &self.comm
    }

    /// # Safety
    ///
    /// See [`SendComm::isend`].
    #[inline]
    pub unsafe fn isend(
        &self,
        buf: *const u8,
        len: usize,
        mr: &Arc<MrHandle>,
    ) -> RailResult<Option<ReqHandle>> {
        self.comm.isend(buf, len, mr)
    }

    /// Tear down the send communicator. All requests must have been
    /// drained through `test` first; outstanding requests are an error.
    pub fn close(self) -> RailResult<()> {
        let comm = self.comm;
        comm.ep.progress()?;

        if comm.inflight() > 0 {
            return Err(RailError::Invalid("close with outstanding requests"));
        }

        if let Some(token) = comm.conn_req.lock().unwrap().take() {
            comm.reqs.free(token);
        }
        if let Some(token) = comm.conn_resp_req.lock().unwrap().take() {
            comm.reqs.free(token);
        }

        comm.ep.remove_comm(comm.id);
        comm.ep.dev.free_comm_id(comm.id)?;
        logging::debug!(comm.log, "closed"; "context" => "close");
        Ok(())
    }
}

impl RecvCommHandle {
    #[inline]
    pub fn comm(&self) -> &Arc<RecvComm> {
        &self.comm
    }

    /// # Safety
    ///
    /// See [`RecvComm::irecv`].
    #[inline]
    pub unsafe fn irecv(
        &self,
        buf: *mut u8,
        len: usize,
        tag: u32,
        mr: &Arc<MrHandle>,
    ) -> RailResult<Option<ReqHandle>> {
        self.comm.irecv(buf, len, tag, mr)
    }

    /// # Safety
    ///
    /// See [`RecvComm::iflush`].
    #[inline]
    pub unsafe fn iflush(
        &self,
        bufs: &[*mut u8],
        sizes: &[usize],
        mrs: &[Arc<MrHandle>],
    ) -> RailResult<Option<ReqHandle>> {
        self.comm.iflush(bufs, sizes, mrs)
    }

    /// Tear down the receive communicator. All requests must have been
    /// drained through `test` first; outstanding requests are an error.
    pub fn close(self) -> RailResult<()> {
        let comm = self.comm;
        comm.ep.progress()?;

        if comm.inflight() > 0 {
            return Err(RailError::Invalid("close with outstanding requests"));
        }

        comm.ep.dev.deregister_mr(&comm.flush_mr)?;
        comm.ep.remove_comm(comm.id);
        comm.ep.dev.free_comm_id(comm.id)?;
        logging::debug!(comm.log, "closed"; "context" => "close");
        Ok(())
    }
}

/// A request handle returned by isend/irecv/iflush, polled through `test`.
pub enum ReqHandle {
    Send { comm: Arc<SendComm>, token: ReqToken },
    Recv { comm: Arc<RecvComm>, token: ReqToken },
    Flush { comm: Arc<RecvComm>, token: ReqToken },
}

impl ReqHandle {
    /// Poll for completion. On `Ok((true, size))` the request has been
    /// freed and the handle must not be tested again; asynchronous
    /// failures surface here as errors.
    pub fn test(&self) -> RailResult<(bool, usize)> {
        match self {
            ReqHandle::Send { comm, token } => {
                comm.ep.progress()?;

                let req = comm.reqs.get(*token);
                let (phase, size, seq, fault) = {
                    let state = req.lock();
                    (state.phase, state.size, state.msg_seq, state.fault)
                };

                match phase {
                    ReqPhase::Completed => {
                        comm.msgbuff.complete(seq);
                        comm.reqs.free(*token);
                        comm.inflight.fetch_sub(1, Ordering::SeqCst);
                        Ok((true, size))
                    }
                    ReqPhase::Error => Err(fault.unwrap_or(RailError::Protocol("request failed"))),
                    _ => Ok((false, 0)),
                }
            }

            ReqHandle::Recv { comm, token } => {
                comm.ep.progress()?;

                let req = comm.reqs.get(*token);
                let (phase, size, seq, fault, children) = {
                    let state = req.lock();
                    let children = match &state.kind {
                        ReqKind::Recv(data) => {
                            Some((data.ctrl_req, data.segms_req, data.eager_copy_req))
                        }
                        _ => None,
                    };
                    (state.phase, state.size, state.msg_seq, state.fault, children)
                };

                match phase {
                    ReqPhase::Completed => {
                        let (ctrl, segms, eager_copy) =
                            children.ok_or(RailError::Protocol("recv request lost its payload"))?;
                        comm.msgbuff.complete(seq);
                        comm.free_ctrl(ctrl);
                        comm.reqs.free(segms);
                        if let Some(token) = eager_copy {
                            comm.reqs.free(token);
                        }
                        comm.reqs.free(*token);
                        comm.inflight.fetch_sub(1, Ordering::SeqCst);
                        Ok((true, size))
                    }
                    ReqPhase::Error => Err(fault.unwrap_or(RailError::Protocol("request failed"))),
                    _ => Ok((false, 0)),
                }
            }

            ReqHandle::Flush { comm, token } => {
                comm.ep.progress()?;

                let req = comm.reqs.get(*token);
                let (phase, size, fault) = {
                    let state = req.lock();
                    (state.phase, state.size, state.fault)
                };

                match phase {
                    ReqPhase::Completed => {
                        comm.reqs.free(*token);
                        comm.inflight.fetch_sub(1, Ordering::SeqCst);
                        Ok((true, size))
                    }
                    ReqPhase::Error => Err(fault.unwrap_or(RailError::Protocol("request failed"))),
                    _ => Ok((false, 0)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_HANDLE_SIZE;

    #[test]
    fn test_handle_roundtrip() {
        let mut name = EpName::zeroed();
        name.0[..5].copy_from_slice(b"lo-ab");

        let handle = ConnHandle {
            ep_name: name,
            comm_id: 0x2fffe,
            stage: HandleStage::Connecting(17),
        };

        let mut buf = [0u8; MAX_HANDLE_SIZE];
        handle.encode(&mut buf).unwrap();
        let decoded = ConnHandle::decode(&buf).unwrap();

        assert_eq!(decoded.ep_name, handle.ep_name);
        assert_eq!(decoded.comm_id, handle.comm_id);
        assert_eq!(decoded.stage, handle.stage);
    }

    #[test]
    fn test_handle_fits_library_buffer() {
        assert!(ConnHandle::ENCODED_SIZE <= MAX_HANDLE_SIZE);
    }

    #[test]
    fn test_handle_rejects_runt() {
        assert!(ConnHandle::decode(&[0u8; 8]).is_err());
    }
}
