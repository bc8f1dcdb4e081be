//! Per-thread endpoint: one transport endpoint, completion queue and
//! address vector per rail, the bounce-buffer pump, the pending-retry
//! queue and the communicator lookup table. All progress happens here:
//! the library's calls poll the rails, drain the retry queue and step
//! request state machines forward. There are no background threads.

use crate::config::PARAMS;
use crate::error::{RailError, RailResult};
use crate::fabric::{CompKind, Cq, CqEntry, CqError, CqPoll, Domain, Ep, MrDesc, PeerAddr};
use crate::freelist::{FlEntry, Freelist, Registrar};
use crate::msgbuff::{BuffOutcome, ElemKind, Retrieve, SlotStatus};
use crate::rdma::comm::{ListenComm, RecvComm, SendComm};
use crate::rdma::device::Device;
use crate::rdma::request::{
    bounce_ctx, comm_ctx, decode_ctx, BounceRef, CtxTarget, MsgElem, ReqKind, ReqPhase, ReqPool,
    ReqToken,
};
use crate::rdma::wire::{
    self, ConnMsg, CtrlMsg, CONN_MSG_SIZE, CTRL_MSG_SIZE, MSG_TYPE_CONN, MSG_TYPE_CONN_RESP,
    MSG_TYPE_CTRL,
};
use crate::retryq::RetryQueue;
use indexmap::IndexMap;
use lumen::logging::{self, Logger};
use std::sync::{Arc, Mutex, RwLock};

/// One rail: transport endpoint, its completion queue and the bounce
/// posting counters.
pub struct Rail {
    pub id: u16,
    pub ep: Box<dyn Ep>,
    pub cq: Box<dyn Cq>,
    /// Own address on this rail, used for local flush/copy reads.
    pub self_addr: PeerAddr,
    bounce: Mutex<BounceCounters>,
}

struct BounceCounters {
    min_posted: usize,
    max_posted: usize,
    num_posted: usize,
}

/// A communicator registered in the endpoint lookup table.
#[derive(Clone)]
pub enum CommSlot {
    Listen(Arc<ListenComm>),
    Send(Arc<SendComm>),
    Recv(Arc<RecvComm>),
}

/// Registers freelist arenas with every rail domain of the endpoint.
struct RailRegistrar {
    domains: Vec<Arc<dyn Domain>>,
}

impl Registrar for RailRegistrar {
    fn register_block(&self, addr: usize, len: usize) -> RailResult<Vec<MrDesc>> {
        let mut descs = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            match domain.register(addr, len, crate::fabric::MemType::Host, None) {
                Ok(desc) => descs.push(desc),
                Err(err) => {
                    for (domain, desc) in self.domains.iter().zip(descs.iter()) {
                        let _ = domain.deregister(desc);
                    }
                    return Err(err);
                }
            }
        }
        Ok(descs)
    }

    fn deregister_block(&self, descs: &[MrDesc]) -> RailResult<()> {
        for (domain, desc) in self.domains.iter().zip(descs.iter()) {
            domain.deregister(desc)?;
        }
        Ok(())
    }
}

pub struct Endpoint {
    pub dev: Arc<Device>,
    rails: Vec<Rail>,
    comms: RwLock<IndexMap<u32, CommSlot>>,
    pending: RetryQueue,
    bounce_fl: Freelist,
    bounce_reqs: ReqPool,
    bounce_size: usize,
    log: Logger,
}

impl Endpoint {
    pub fn new(dev: Arc<Device>) -> RailResult<Arc<Endpoint>> {
        let mut rails = Vec::with_capacity(dev.num_rails());
        for rail_id in 0..dev.num_rails() {
            let (ep, cq) = dev.domain(rail_id).create_ep()?;
            let self_addr = ep.av_insert(&ep.name())?;
            rails.push(Rail {
                id: rail_id as u16,
                ep,
                cq,
                self_addr,
                bounce: Mutex::new(BounceCounters {
                    min_posted: PARAMS.min_posted_bounce_buffers,
                    max_posted: PARAMS.max_posted_bounce_buffers,
                    num_posted: 0,
                }),
            });
        }

        let bounce_size = CONN_MSG_SIZE
            .max(CTRL_MSG_SIZE)
            .max(PARAMS.eager_max_size);
        let registrar = Arc::new(RailRegistrar {
            domains: dev.domains().to_vec(),
        });
        let bounce_fl = Freelist::new(
            bounce_size,
            0,
            16,
            usize::MAX >> 1,
            crate::config::XFER_ALIGNMENT,
            Some(registrar),
        )?;

        let log = dev.log().new(logging::o!("part" => "endpoint"));
        let ep = Arc::new(Endpoint {
            dev,
            rails,
            comms: RwLock::new(IndexMap::new()),
            pending: RetryQueue::new(),
            bounce_fl,
            bounce_reqs: ReqPool::new(0, 64, u16::MAX as usize),
            bounce_size,
            log,
        });

        for rail in &ep.rails {
            ep.pump_rail(rail)?;
        }
        Ok(ep)
    }

    #[inline]
    pub fn num_rails(&self) -> usize {
        self.rails.len()
    }

    #[inline]
    pub fn rail(&self, rail_id: usize) -> &Rail {
        &self.rails[rail_id]
    }

    #[inline]
    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    #[inline]
    pub(crate) fn pending_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Registrar covering every rail domain, for freelists whose entries
    /// are posted on arbitrary rails.
    pub(crate) fn rail_registrar(&self) -> Arc<dyn Registrar> {
        Arc::new(RailRegistrar {
            domains: self.dev.domains().to_vec(),
        })
    }

    #[inline]
    pub(crate) fn enqueue_pending(&self, ctx: u64) {
        self.pending.insert_back(ctx);
    }

    // ---- communicator table ----

    pub(crate) fn insert_comm(&self, id: u32, slot: CommSlot) {
        let stale = self.comms.write().unwrap().insert(id, slot);
        debug_assert!(stale.is_none(), "communicator id reused while live");
    }

    pub(crate) fn remove_comm(&self, id: u32) -> Option<CommSlot> {
        self.comms.write().unwrap().shift_remove(&id)
    }

    pub(crate) fn comm(&self, id: u32) -> Option<CommSlot> {
        self.comms.read().unwrap().get(&id).cloned()
    }

    pub fn num_comms(&self) -> usize {
        self.comms.read().unwrap().len()
    }

    // ---- progress engine ----

    /// Drain every rail's completion queue, then retry pending posts.
    /// This is the only place the engine makes forward progress.
    pub fn progress(&self) -> RailResult<()> {
        for rail in &self.rails {
            self.poll_rail(rail)?;
        }
        self.process_pending()
    }

    fn poll_rail(&self, rail: &Rail) -> RailResult<()> {
        let mut entries = vec![CqEntry::default(); PARAMS.cq_read_count.max(1)];

        loop {
            match rail.cq.read(&mut entries)? {
                CqPoll::Entries(count) => {
                    for entry in &entries[..count] {
                        self.handle_completion(rail, entry)?;
                    }
                }
                CqPoll::ErrAvail => match rail.cq.read_err()? {
                    Some(err) => self.handle_err_completion(rail, err)?,
                    None => break,
                },
                CqPoll::Empty => break,
            }
        }
        Ok(())
    }

    fn handle_completion(&self, rail: &Rail, entry: &CqEntry) -> RailResult<()> {
        if let CompKind::RemoteWrite { imm } = entry.kind {
            return self.handle_remote_write(imm, entry.len);
        }

        match decode_ctx(entry.ctx) {
            Some(CtxTarget::Bounce { rail_id, token }) => {
                debug_assert_eq!(rail_id, rail.id);
                match entry.kind {
                    CompKind::Recv { imm } => self.handle_bounce_recv(token, imm, entry.len),
                    _ => Err(RailError::Protocol("non-recv completion on bounce request")),
                }
            }
            Some(CtxTarget::Comm { comm_id, token }) => {
                let slot = self
                    .comm(comm_id)
                    .ok_or(RailError::Protocol("completion for unknown communicator"))?;
                match slot {
                    CommSlot::Send(comm) => comm.on_completion(self, entry.kind, token, entry.len),
                    CommSlot::Recv(comm) => comm.on_completion(self, entry.kind, token, entry.len),
                    CommSlot::Listen(_) => {
                        Err(RailError::Protocol("completion for listen communicator"))
                    }
                }
            }
            None => Err(RailError::Protocol("completion with unroutable context")),
        }
    }

    /// An error-queue entry: bounce failures are fatal, request failures
    /// move the request (and its parent) to ERROR for `test` to surface.
    fn handle_err_completion(&self, rail: &Rail, err: CqError) -> RailResult<()> {
        logging::warn!(self.log, "completion error entry";
                       "context" => "cq",
                       "rail" => rail.id,
                       "fault" => ?err.fault);

        match decode_ctx(err.ctx) {
            Some(CtxTarget::Bounce { .. }) | None => {
                Err(RailError::Fabric(err.fault))
            }
            Some(CtxTarget::Comm { comm_id, token }) => {
                let slot = self
                    .comm(comm_id)
                    .ok_or(RailError::Protocol("error entry for unknown communicator"))?;
                match slot {
                    CommSlot::Send(comm) => comm.on_error(token, err.fault),
                    CommSlot::Recv(comm) => comm.on_error(token, err.fault),
                    CommSlot::Listen(_) => {
                        Err(RailError::Protocol("error entry for listen communicator"))
                    }
                }
            }
        }
    }

    /// An RDMA write segment landed in one of our receive buffers. Routed
    /// purely by the immediate word.
    fn handle_remote_write(&self, imm: u32, len: usize) -> RailResult<()> {
        let (comm_id, seq, num_segments) = wire::unpack_imm(imm);

        match self.comm(comm_id) {
            Some(CommSlot::Recv(comm)) => comm.on_segment_arrival(seq, num_segments, len),
            Some(_) => Err(RailError::Protocol("write immediate for non-recv communicator")),
            None => Err(RailError::Protocol("write immediate for unknown communicator")),
        }
    }

    /// A bounce buffer was filled: eager payload (immediate set) or an
    /// unsolicited typed message. The posted counter drops here; the buffer
    /// is reposted once its content has been consumed.
    fn handle_bounce_recv(&self, token: ReqToken, imm: Option<u32>, len: usize) -> RailResult<()> {
        let req = self.bounce_reqs.get(token);
        let (rail_id, entry_token) = {
            let mut state = req.lock();
            match &mut state.kind {
                ReqKind::Bounce(data) => {
                    data.recv_len = len as u32;
                    (data.rail_id, data.entry_token)
                }
                _ => return Err(RailError::Protocol("bounce context on non-bounce request")),
            }
        };

        {
            let mut counters = self.rails[rail_id as usize].bounce.lock().unwrap();
            debug_assert!(counters.num_posted > 0);
            counters.num_posted -= 1;
        }

        let bref = BounceRef {
            rail_id,
            req_token: token,
            len: len as u32,
        };

        let result = match imm {
            Some(imm) => {
                let (comm_id, seq, num_segments) = wire::unpack_imm(imm);
                debug_assert_eq!(num_segments, 1, "eager payloads are single-segment");
                match self.comm(comm_id) {
                    Some(CommSlot::Recv(comm)) => comm.handle_eager(self, seq, bref),
                    _ => Err(RailError::Protocol("eager payload for unknown communicator")),
                }
            }
            None => self.dispatch_unsolicited(bref),
        };

        self.pump_rail(&self.rails[rail_id as usize])?;
        result
    }

    /// Route a typed unsolicited message by its wire type field.
    fn dispatch_unsolicited(&self, bref: BounceRef) -> RailResult<()> {
        let bytes = self.bounce_bytes(&bref);

        match wire::peek_msg_type(&bytes)? {
            MSG_TYPE_CONN => {
                let msg = ConnMsg::decode(&bytes)?;
                let slot = self
                    .comm(msg.remote_comm_id)
                    .ok_or(RailError::Protocol("connect for unknown communicator"))?;
                match slot {
                    CommSlot::Listen(comm) => {
                        comm.handle_conn(&msg)?;
                        self.repost_bounce(bref)
                    }
                    _ => Err(RailError::Protocol("connect for non-listen communicator")),
                }
            }
            MSG_TYPE_CONN_RESP => {
                let msg = ConnMsg::decode(&bytes)?;
                let slot = self
                    .comm(msg.remote_comm_id)
                    .ok_or(RailError::Protocol("connect response for unknown communicator"))?;
                match slot {
                    CommSlot::Send(comm) => {
                        comm.handle_conn_resp(self, &msg)?;
                        self.repost_bounce(bref)
                    }
                    _ => Err(RailError::Protocol("connect response for non-send communicator")),
                }
            }
            MSG_TYPE_CTRL => {
                let msg = CtrlMsg::decode(&bytes)?;
                let slot = self
                    .comm(msg.remote_comm_id)
                    .ok_or(RailError::Protocol("control message for unknown communicator"))?;
                match slot {
                    CommSlot::Send(comm) => comm.handle_ctrl(self, &msg, bref),
                    _ => Err(RailError::Protocol("control message for non-send communicator")),
                }
            }
            _ => Err(RailError::Protocol("unknown unsolicited message type")),
        }
    }

    /// Retry queued posts front-first. A renewed "try again" puts the
    /// request back at the front and stops; younger posts must not jump
    /// the queue.
    fn process_pending(&self) -> RailResult<()> {
        while let Some(ctx) = self.pending.remove_front() {
            match self.drive_ctx(ctx) {
                Ok(()) => {}
                Err(RailError::Again) => {
                    self.pending.insert_front(ctx);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn drive_ctx(&self, ctx: u64) -> RailResult<()> {
        match decode_ctx(ctx) {
            Some(CtxTarget::Bounce { token, .. }) => self.post_bounce_req(token),
            Some(CtxTarget::Comm { comm_id, token }) => {
                let slot = self
                    .comm(comm_id)
                    .ok_or(RailError::Protocol("pending post for unknown communicator"))?;
                match slot {
                    CommSlot::Send(comm) => {
                        let kind_is_conn = {
                            let req = comm.reqs.get(token);
                            let state = req.lock();
                            matches!(state.kind, ReqKind::SendConn(_))
                        };
                        if kind_is_conn {
                            comm.post_conn_send(self, token)
                        } else {
                            self.post_send_req(&comm, token)
                        }
                    }
                    CommSlot::Recv(comm) => {
                        enum Retry {
                            Ctrl,
                            EagerCopy,
                            Flush,
                            ConnResp,
                        }
                        let retry = {
                            let req = comm.reqs.get(token);
                            let state = req.lock();
                            match &state.kind {
                                ReqKind::SendCtrl(_) => Retry::Ctrl,
                                ReqKind::EagerCopy(_) => Retry::EagerCopy,
                                ReqKind::Flush(_) => Retry::Flush,
                                ReqKind::SendConnResp(_) => Retry::ConnResp,
                                _ => return Err(RailError::Protocol("unexpected pending kind")),
                            }
                        };
                        match retry {
                            Retry::Ctrl => self.post_ctrl_req(&comm, token),
                            Retry::EagerCopy => self.post_eager_copy_req(&comm, token),
                            Retry::Flush => self.post_flush_req(&comm, token),
                            Retry::ConnResp => comm.post_conn_resp(self, token),
                        }
                    }
                    CommSlot::Listen(_) => {
                        Err(RailError::Protocol("pending post for listen communicator"))
                    }
                }
            }
            None => Err(RailError::Protocol("pending post with unroutable context")),
        }
    }

    // ---- bounce buffer pump ----

    #[inline]
    pub(crate) fn bounce_entry(&self, bref: &BounceRef) -> FlEntry {
        let req = self.bounce_reqs.get(bref.req_token);
        let state = req.lock();
        match &state.kind {
            ReqKind::Bounce(data) => self.bounce_fl.lookup(data.entry_token),
            _ => panic!("bounce reference to non-bounce request"),
        }
    }

    /// Copy of the received bytes parked in a bounce buffer.
    pub(crate) fn bounce_bytes(&self, bref: &BounceRef) -> Vec<u8> {
        let entry = self.bounce_entry(bref);
        unsafe { entry.bytes()[..bref.len as usize].to_vec() }
    }

    /// Top the rail back up to `max_posted` when it has drained below
    /// `min_posted`. Posts that come back "try again" stay promised on the
    /// pending queue; everything else rolls the counter back to reality.
    fn pump_rail(&self, rail: &Rail) -> RailResult<()> {
        let needed = {
            let mut counters = rail.bounce.lock().unwrap();
            if counters.num_posted >= counters.min_posted {
                return Ok(());
            }
            let needed = counters.max_posted - counters.num_posted;
            counters.num_posted = counters.max_posted;
            needed
        };

        for posted in 0..needed {
            let token = match self.alloc_bounce(rail.id) {
                Some(token) => token,
                None => {
                    let mut counters = rail.bounce.lock().unwrap();
                    counters.num_posted -= needed - posted;
                    return Err(RailError::Resource("bounce pool exhausted"));
                }
            };

            match self.post_bounce_req(token) {
                Ok(()) => {}
                Err(RailError::Again) => {
                    self.enqueue_pending(bounce_ctx(rail.id, token));
                    let failed = needed - posted - 1;
                    let mut counters = rail.bounce.lock().unwrap();
                    counters.num_posted -= failed;
                    return Ok(());
                }
                Err(err) => {
                    self.release_bounce(token);
                    let mut counters = rail.bounce.lock().unwrap();
                    counters.num_posted -= needed - posted;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn alloc_bounce(&self, rail_id: u16) -> Option<ReqToken> {
        let entry = match self.bounce_fl.alloc() {
            Ok(Some(entry)) => entry,
            _ => return None,
        };

        let (token, req) = match self.bounce_reqs.alloc() {
            Some(pair) => pair,
            None => {
                self.bounce_fl.free(entry);
                return None;
            }
        };

        let mut state = req.lock();
        state.phase = ReqPhase::Pending;
        state.dev_id = self.dev.id;
        state.kind = ReqKind::Bounce(crate::rdma::request::BounceData {
            rail_id,
            entry_token: entry.token(),
            recv_len: 0,
        });
        Some(token)
    }

    fn release_bounce(&self, token: ReqToken) {
        let req = self.bounce_reqs.get(token);
        let entry_token = {
            let state = req.lock();
            match &state.kind {
                ReqKind::Bounce(data) => data.entry_token,
                _ => panic!("releasing non-bounce request"),
            }
        };
        self.bounce_fl.free_token(entry_token);
        self.bounce_reqs.free(token);
    }

    /// Put a consumed bounce buffer back on the wire, or release it when
    /// the rail is already fully posted. Exactly one repost per consumed
    /// buffer.
    pub(crate) fn repost_bounce(&self, bref: BounceRef) -> RailResult<()> {
        let rail = &self.rails[bref.rail_id as usize];

        let need_post = {
            let mut counters = rail.bounce.lock().unwrap();
            if counters.num_posted < counters.max_posted {
                counters.num_posted += 1;
                true
            } else {
                false
            }
        };

        if need_post {
            match self.post_bounce_req(bref.req_token) {
                Ok(()) => {}
                Err(RailError::Again) => {
                    self.enqueue_pending(bounce_ctx(bref.rail_id, bref.req_token));
                }
                Err(err) => return Err(err),
            }
            self.pump_rail(rail)
        } else {
            self.release_bounce(bref.req_token);
            Ok(())
        }
    }

    fn post_bounce_req(&self, token: ReqToken) -> RailResult<()> {
        let req = self.bounce_reqs.get(token);
        let (rail_id, entry_token) = {
            let state = req.lock();
            match &state.kind {
                ReqKind::Bounce(data) => (data.rail_id, data.entry_token),
                _ => return Err(RailError::Protocol("posting non-bounce request as bounce")),
            }
        };

        let entry = self.bounce_fl.lookup(entry_token);
        let rail = &self.rails[rail_id as usize];
        unsafe {
            rail.ep.post_recv(
                entry.ptr(),
                self.bounce_size,
                entry.mr(rail_id as usize),
                bounce_ctx(rail_id, token),
            )
        }
    }

    // ---- request posting ----

    /// Dispatch a SEND request: one eager message send, or the scheduled
    /// RDMA write segments. A partial post resumes at the request's
    /// cursor; writes wait until the peer's control message has arrived.
    pub(crate) fn post_send_req(&self, comm: &SendComm, token: ReqToken) -> RailResult<()> {
        let req = comm.reqs.get(token);
        let mut state = req.lock();
        let ctx = comm_ctx(comm.id, token);

        let data = match &mut state.kind {
            ReqKind::Send(data) => data,
            _ => return Err(RailError::Protocol("send progress on non-send request")),
        };

        if data.eager {
            if data.xfer_cursor == 0 {
                let xfer = data.schedule.xfers[0];
                let rail = &self.rails[xfer.rail_id as usize];
                let peer = comm.peer_addr(xfer.rail_id as usize)?;
                unsafe {
                    rail.ep.post_send(
                        data.buf as *const u8,
                        data.len,
                        Some(data.mr.desc(xfer.rail_id as usize)),
                        Some(data.imm),
                        peer,
                        ctx,
                    )?;
                }
                data.xfer_cursor = 1;
            }
        } else {
            if !data.have_ctrl {
                // Rendezvous without the receiver's buffer yet; the control
                // arrival restarts us.
                return Ok(());
            }
            while data.xfer_cursor < data.schedule.xfers.len() {
                let xfer = data.schedule.xfers[data.xfer_cursor];
                let rail = &self.rails[xfer.rail_id as usize];
                let peer = comm.peer_addr(xfer.rail_id as usize)?;
                unsafe {
                    rail.ep.post_write_imm(
                        (data.buf + xfer.offset) as *const u8,
                        xfer.len,
                        Some(data.mr.desc(xfer.rail_id as usize)),
                        peer,
                        data.remote_buff + xfer.offset as u64,
                        data.remote_keys[xfer.rail_id as usize],
                        data.imm,
                        ctx,
                    )?;
                }
                data.xfer_cursor += 1;
            }
        }

        if state.phase == ReqPhase::Created {
            state.phase = ReqPhase::Pending;
        }
        Ok(())
    }

    /// Post the control message of a receive on the leader rail.
    pub(crate) fn post_ctrl_req(&self, comm: &RecvComm, token: ReqToken) -> RailResult<()> {
        let req = comm.reqs.get(token);
        let mut state = req.lock();

        let entry_token = match &state.kind {
            ReqKind::SendCtrl(data) => data.entry_token,
            _ => return Err(RailError::Protocol("ctrl progress on non-ctrl request")),
        };

        let entry = comm.ctrl_fl.lookup(entry_token);
        let rail = &self.rails[0];
        unsafe {
            rail.ep.post_send(
                entry.ptr(),
                CTRL_MSG_SIZE,
                entry.mr(0),
                None,
                comm.peer_addrs[0],
                comm_ctx(comm.id, token),
            )?;
        }

        state.phase = ReqPhase::Pending;
        Ok(())
    }

    /// Local read draining an eager payload out of its bounce buffer into
    /// the destination.
    pub(crate) fn post_eager_copy_req(&self, comm: &RecvComm, token: ReqToken) -> RailResult<()> {
        let req = comm.reqs.get(token);
        let mut state = req.lock();

        let (dst, mr, bounce) = match &state.kind {
            ReqKind::EagerCopy(data) => (data.dst, data.mr.clone(), data.bounce),
            _ => return Err(RailError::Protocol("eager copy progress on wrong request")),
        };

        let entry = self.bounce_entry(&bounce);
        let rail = &self.rails[bounce.rail_id as usize];
        let bounce_mr = *entry
            .mr(bounce.rail_id as usize)
            .expect("bounce arenas are registered on every rail");
        unsafe {
            rail.ep.post_read(
                dst as *mut u8,
                bounce.len as usize,
                Some(mr.desc(bounce.rail_id as usize)),
                rail.self_addr,
                entry.ptr() as u64,
                bounce_mr.key,
                comm_ctx(comm.id, token),
            )?;
        }

        state.phase = ReqPhase::Pending;
        Ok(())
    }

    /// One-word read from the first flushed buffer into the communicator's
    /// flush slot, forcing ordering of prior RDMA writes.
    pub(crate) fn post_flush_req(&self, comm: &RecvComm, token: ReqToken) -> RailResult<()> {
        let req = comm.reqs.get(token);
        let mut state = req.lock();

        let (src, mr) = match &state.kind {
            ReqKind::Flush(data) => (data.src, data.mr.clone()),
            _ => return Err(RailError::Protocol("flush progress on non-flush request")),
        };

        let rail = &self.rails[0];
        unsafe {
            rail.ep.post_read(
                comm.flush_ptr(),
                crate::config::FLUSH_SLOT_SIZE,
                Some(comm.flush_mr.desc(0)),
                rail.self_addr,
                src as u64,
                mr.key(0),
                comm_ctx(comm.id, token),
            )?;
        }

        state.phase = ReqPhase::Pending;
        Ok(())
    }

    /// Generic handshake message send on the leader rail.
    pub(crate) fn post_handshake(
        &self,
        comm_id: u32,
        pool: &ReqPool,
        token: ReqToken,
        peer: PeerAddr,
    ) -> RailResult<()> {
        let req = pool.get(token);
        let mut state = req.lock();

        let msg = match &state.kind {
            ReqKind::SendConn(data) | ReqKind::SendConnResp(data) => &data.msg,
            _ => return Err(RailError::Protocol("handshake progress on wrong request")),
        };

        let rail = &self.rails[0];
        unsafe {
            rail.ep.post_send(
                msg.as_ptr(),
                msg.len(),
                None,
                None,
                peer,
                comm_ctx(comm_id, token),
            )?;
        }

        state.phase = ReqPhase::Pending;
        Ok(())
    }

    /// Quiescence check for tests and teardown: every rail fully posted.
    pub fn bounce_quiescent(&self) -> bool {
        self.rails.iter().all(|rail| {
            let counters = rail.bounce.lock().unwrap();
            counters.num_posted == counters.max_posted
        })
    }
}

// Helpers shared by the communicator implementations.

/// Park a bounce reference in a message buffer, or surface the request the
/// other side already inserted.
pub(crate) fn park_or_retrieve(
    msgbuff: &crate::msgbuff::MsgBuff<MsgElem>,
    seq: u16,
    bref: BounceRef,
) -> RailResult<Option<ReqToken>> {
    match msgbuff.insert(seq, MsgElem::Buf(bref), ElemKind::Buf) {
        BuffOutcome::Success => Ok(None),
        BuffOutcome::InvalidIdx(SlotStatus::InProgress) => match msgbuff.retrieve(seq) {
            Retrieve::Found {
                elem: MsgElem::Req(token),
                kind: ElemKind::Req,
                ..
            } => Ok(Some(token)),
            _ => Err(RailError::Protocol("message slot raced by both peers")),
        },
        BuffOutcome::InvalidIdx(_) => Err(RailError::Protocol("duplicate message sequence")),
    }
}
