//! In-process loopback fabric. Any number of virtual NICs share one
//! registry of endpoints and memory registrations; message sends consume
//! the peer's oldest posted receive, RDMA writes copy straight into the
//! registered remote region and surface as remote-write completions, reads
//! copy remote-to-local. Completion delivery is immediate and FIFO per
//! endpoint pair.
//!
//! The fabric doubles as the engine's test double: it can inject periodic
//! or one-shot "try again" outcomes on posts and fail the next RDMA write
//! with a remote-access fault, deterministically.

use crate::error::{FabricFault, RailError, RailResult};
use crate::fabric::{
    CompKind, Cq, CqEntry, CqError, CqPoll, Domain, Ep, EpName, MemType, MrDesc, NicInfo,
    PeerAddr, Provider,
};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Region {
    addr: usize,
    len: usize,
}

struct PostedRecv {
    buf: usize,
    len: usize,
    ctx: u64,
}

struct InboundMsg {
    data: Vec<u8>,
    imm: Option<u32>,
}

struct CqState {
    queue: Mutex<VecDeque<CqEntry>>,
    errs: Mutex<VecDeque<CqError>>,
}

impl CqState {
    fn new() -> Arc<CqState> {
        Arc::new(CqState {
            queue: Mutex::new(VecDeque::new()),
            errs: Mutex::new(VecDeque::new()),
        })
    }

    fn push(&self, entry: CqEntry) {
        self.queue.lock().unwrap().push_back(entry);
    }

    fn push_err(&self, err: CqError) {
        self.errs.lock().unwrap().push_back(err);
    }
}

struct EpState {
    domain: u64,
    recvs: VecDeque<PostedRecv>,
    /// Sends that arrived before a receive was posted.
    unclaimed: VecDeque<InboundMsg>,
    cq: Arc<CqState>,
}

struct FabricState {
    eps: HashMap<u64, EpState>,
    regions: HashMap<(u64, u64), Region>,
    handles: HashMap<u64, (u64, u64)>,
    next_ep: u64,
    next_domain: u64,
    next_key: u64,
    next_handle: u64,
}

struct Faults {
    post_count: AtomicU64,
    again_every: AtomicU64,
    again_once: AtomicBool,
    fail_next_write: AtomicBool,
}

struct Fabric {
    state: Mutex<FabricState>,
    faults: Faults,
}

impl Fabric {
    /// Returns `Err(Again)` when an injected backpressure fault fires for
    /// this post.
    fn admit_post(&self) -> RailResult<()> {
        if self.faults.again_once.swap(false, Ordering::SeqCst) {
            return Err(RailError::Again);
        }

        let every = self.faults.again_every.load(Ordering::SeqCst);
        let count = self.faults.post_count.fetch_add(1, Ordering::SeqCst);
        if every > 0 && (count + 1) % every == 0 {
            return Err(RailError::Again);
        }

        Ok(())
    }
}

/// Handle for steering deterministic faults into the fabric from tests.
#[derive(Clone)]
pub struct FaultInjector {
    fabric: Arc<Fabric>,
}

impl FaultInjector {
    /// Make every `k`-th post (across all endpoints) return "try again".
    /// Zero disables.
    pub fn again_every(&self, k: u64) {
        self.fabric.faults.again_every.store(k, Ordering::SeqCst);
    }

    /// Make exactly the next post return "try again".
    pub fn again_once(&self) {
        self.fabric.faults.again_once.store(true, Ordering::SeqCst);
    }

    /// Complete the next RDMA write with a remote-access fault instead of
    /// transferring data.
    pub fn fail_next_write(&self) {
        self.fabric.faults.fail_next_write.store(true, Ordering::SeqCst);
    }
}

pub struct LoopbackProvider {
    fabric: Arc<Fabric>,
    nics: Vec<NicInfo>,
    hmem: bool,
}

impl LoopbackProvider {
    /// A fabric of `num_devices * rails_per_device` NICs; NICs of one
    /// device share a group id so the topology layer folds them into one
    /// multi-rail device.
    pub fn new(num_devices: usize, rails_per_device: usize) -> LoopbackProvider {
        assert!(num_devices > 0 && rails_per_device > 0);

        let mut nics = Vec::with_capacity(num_devices * rails_per_device);
        for dev in 0..num_devices {
            for rail in 0..rails_per_device {
                let idx = dev * rails_per_device + rail;
                nics.push(NicInfo {
                    name: format!("lo{}", idx),
                    pci_path: format!("0000:{:02x}:00.{}", dev, rail),
                    guid: 0xca11_0000_0000_0000 | idx as u64,
                    group: dev as u32,
                    speed_mbps: 100_000,
                    port: 1,
                });
            }
        }

        LoopbackProvider {
            hmem: false,
            fabric: Arc::new(Fabric {
                state: Mutex::new(FabricState {
                    eps: HashMap::new(),
                    regions: HashMap::new(),
                    handles: HashMap::new(),
                    next_ep: 1,
                    next_domain: 1,
                    // Provider-assigned keys live far above the engine's
                    // pool-provided key space.
                    next_key: 1 << 32,
                    next_handle: 1,
                }),
                faults: Faults {
                    post_count: AtomicU64::new(0),
                    again_every: AtomicU64::new(0),
                    again_once: AtomicBool::new(false),
                    fail_next_write: AtomicBool::new(false),
                },
            }),
            nics,
        }
    }

    /// Advertise GPU-direct capability through device properties. The
    /// loopback data path still only reaches host memory; this exists so
    /// the flush path can be driven without hardware.
    pub fn with_hmem(mut self) -> LoopbackProvider {
        self.hmem = true;
        self
    }

    pub fn fault_injector(&self) -> FaultInjector {
        FaultInjector {
            fabric: self.fabric.clone(),
        }
    }
}

impl Provider for LoopbackProvider {
    fn name(&self) -> &str {
        "loopback"
    }

    fn nics(&self) -> RailResult<Vec<NicInfo>> {
        Ok(self.nics.clone())
    }

    fn open(&self, _nic: &NicInfo) -> RailResult<Arc<dyn Domain>> {
        let mut state = self.fabric.state.lock().unwrap();
        let id = state.next_domain;
        state.next_domain += 1;

        Ok(Arc::new(LoopbackDomain {
            fabric: self.fabric.clone(),
            id,
        }))
    }

    fn hmem_support(&self) -> bool {
        self.hmem
    }
}

pub struct LoopbackDomain {
    fabric: Arc<Fabric>,
    id: u64,
}

impl Domain for LoopbackDomain {
    fn create_ep(&self) -> RailResult<(Box<dyn Ep>, Box<dyn Cq>)> {
        let mut state = self.fabric.state.lock().unwrap();
        let id = state.next_ep;
        state.next_ep += 1;

        let cq = CqState::new();
        state.eps.insert(
            id,
            EpState {
                domain: self.id,
                recvs: VecDeque::new(),
                unclaimed: VecDeque::new(),
                cq: cq.clone(),
            },
        );

        let ep = LoopbackEp {
            fabric: self.fabric.clone(),
            id,
        };
        let cq = LoopbackCq { cq };
        Ok((Box::new(ep), Box::new(cq)))
    }

    fn register(
        &self,
        addr: usize,
        len: usize,
        mem: MemType,
        key: Option<u64>,
    ) -> RailResult<MrDesc> {
        if mem == MemType::Device {
            return Err(RailError::NotSupported("loopback has no hmem support"));
        }

        let mut state = self.fabric.state.lock().unwrap();
        let key = match key {
            Some(key) => key,
            None => {
                let key = state.next_key;
                state.next_key += 1;
                key
            }
        };

        if state.regions.contains_key(&(self.id, key)) {
            return Err(RailError::Invalid("mr key already registered"));
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.regions.insert((self.id, key), Region { addr, len });
        state.handles.insert(handle, (self.id, key));

        Ok(MrDesc { key, handle })
    }

    fn deregister(&self, desc: &MrDesc) -> RailResult<()> {
        let mut state = self.fabric.state.lock().unwrap();

        match state.handles.remove(&desc.handle) {
            Some(scope) => {
                state.regions.remove(&scope);
                Ok(())
            }
            None => Err(RailError::Invalid("unknown mr handle")),
        }
    }
}

pub struct LoopbackEp {
    fabric: Arc<Fabric>,
    id: u64,
}

const NAME_PREFIX: &[u8] = b"lo-";

impl LoopbackEp {
    /// Resolve the write target: the peer endpoint's CQ plus the region
    /// behind `rkey` in the peer's domain.
    fn resolve_region(
        state: &FabricState,
        peer: PeerAddr,
        rkey: u64,
        remote_addr: u64,
        len: usize,
    ) -> Result<(usize, Arc<CqState>), FabricFault> {
        let target = match state.eps.get(&peer.0) {
            Some(target) => target,
            None => return Err(FabricFault::Unreachable),
        };

        let region = match state.regions.get(&(target.domain, rkey)) {
            Some(region) => region,
            None => return Err(FabricFault::RemoteAccess),
        };

        let start = remote_addr as usize;
        if start < region.addr || start + len > region.addr + region.len {
            return Err(FabricFault::RemoteAccess);
        }

        Ok((start, target.cq.clone()))
    }
}

impl Ep for LoopbackEp {
    fn name(&self) -> EpName {
        let mut name = EpName::zeroed();
        name.0[..NAME_PREFIX.len()].copy_from_slice(NAME_PREFIX);
        name.0[NAME_PREFIX.len()..NAME_PREFIX.len() + 8].copy_from_slice(&self.id.to_le_bytes());
        name
    }

    fn av_insert(&self, name: &EpName) -> RailResult<PeerAddr> {
        if &name.0[..NAME_PREFIX.len()] != NAME_PREFIX {
            return Err(RailError::Invalid("not a loopback endpoint name"));
        }

        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&name.0[NAME_PREFIX.len()..NAME_PREFIX.len() + 8]);
        let id = u64::from_le_bytes(id_bytes);

        let state = self.fabric.state.lock().unwrap();
        if !state.eps.contains_key(&id) {
            return Err(RailError::Remote("unknown loopback endpoint"));
        }

        Ok(PeerAddr(id))
    }

    unsafe fn post_send(
        &self,
        buf: *const u8,
        len: usize,
        _desc: Option<&MrDesc>,
        imm: Option<u32>,
        peer: PeerAddr,
        ctx: u64,
    ) -> RailResult<()> {
        self.fabric.admit_post()?;

        let data = std::slice::from_raw_parts(buf, len).to_vec();
        let mut state = self.fabric.state.lock().unwrap();

        let own_cq = state
            .eps
            .get(&self.id)
            .expect("own endpoint must be registered")
            .cq
            .clone();

        let target = state
            .eps
            .get_mut(&peer.0)
            .ok_or(RailError::Remote("unknown peer endpoint"))?;

        match target.recvs.pop_front() {
            Some(recv) => {
                if data.len() > recv.len {
                    target.cq.push_err(CqError {
                        ctx: recv.ctx,
                        fault: FabricFault::Truncated,
                    });
                } else {
                    ptr::copy_nonoverlapping(data.as_ptr(), recv.buf as *mut u8, data.len());
                    target.cq.push(CqEntry {
                        ctx: recv.ctx,
                        kind: CompKind::Recv { imm },
                        len: data.len(),
                    });
                }
            }
            None => target.unclaimed.push_back(InboundMsg { data, imm }),
        }

        own_cq.push(CqEntry {
            ctx,
            kind: CompKind::Send,
            len,
        });
        Ok(())
    }

    unsafe fn post_recv(
        &self,
        buf: *mut u8,
        len: usize,
        _desc: Option<&MrDesc>,
        ctx: u64,
    ) -> RailResult<()> {
        self.fabric.admit_post()?;

        let mut state = self.fabric.state.lock().unwrap();
        let ep = state
            .eps
            .get_mut(&self.id)
            .expect("own endpoint must be registered");

        match ep.unclaimed.pop_front() {
            Some(msg) => {
                if msg.data.len() > len {
                    ep.cq.push_err(CqError {
                        ctx,
                        fault: FabricFault::Truncated,
                    });
                } else {
                    ptr::copy_nonoverlapping(msg.data.as_ptr(), buf, msg.data.len());
                    ep.cq.push(CqEntry {
                        ctx,
                        kind: CompKind::Recv { imm: msg.imm },
                        len: msg.data.len(),
                    });
                }
            }
            None => ep.recvs.push_back(PostedRecv { buf: buf as usize, len, ctx }),
        }

        Ok(())
    }

    unsafe fn post_write_imm(
        &self,
        src: *const u8,
        len: usize,
        _desc: Option<&MrDesc>,
        peer: PeerAddr,
        remote_addr: u64,
        rkey: u64,
        imm: u32,
        ctx: u64,
    ) -> RailResult<()> {
        self.fabric.admit_post()?;

        let state = self.fabric.state.lock().unwrap();
        let own_cq = state
            .eps
            .get(&self.id)
            .expect("own endpoint must be registered")
            .cq
            .clone();

        if self.fabric.faults.fail_next_write.swap(false, Ordering::SeqCst) {
            own_cq.push_err(CqError {
                ctx,
                fault: FabricFault::RemoteAccess,
            });
            return Ok(());
        }

        match Self::resolve_region(&state, peer, rkey, remote_addr, len) {
            Ok((dst, target_cq)) => {
                ptr::copy_nonoverlapping(src, dst as *mut u8, len);
                target_cq.push(CqEntry {
                    ctx: 0,
                    kind: CompKind::RemoteWrite { imm },
                    len,
                });
                own_cq.push(CqEntry {
                    ctx,
                    kind: CompKind::Write,
                    len,
                });
            }
            Err(fault) => own_cq.push_err(CqError { ctx, fault }),
        }

        Ok(())
    }

    unsafe fn post_read(
        &self,
        dst: *mut u8,
        len: usize,
        _desc: Option<&MrDesc>,
        peer: PeerAddr,
        remote_addr: u64,
        rkey: u64,
        ctx: u64,
    ) -> RailResult<()> {
        self.fabric.admit_post()?;

        let state = self.fabric.state.lock().unwrap();
        let own_cq = state
            .eps
            .get(&self.id)
            .expect("own endpoint must be registered")
            .cq
            .clone();

        match Self::resolve_region(&state, peer, rkey, remote_addr, len) {
            Ok((src, _)) => {
                ptr::copy(src as *const u8, dst, len);
                own_cq.push(CqEntry {
                    ctx,
                    kind: CompKind::Read,
                    len,
                });
            }
            Err(fault) => own_cq.push_err(CqError { ctx, fault }),
        }

        Ok(())
    }
}

pub struct LoopbackCq {
    cq: Arc<CqState>,
}

impl Cq for LoopbackCq {
    fn read(&self, entries: &mut [CqEntry]) -> RailResult<CqPoll> {
        let mut queue = self.cq.queue.lock().unwrap();

        if queue.is_empty() {
            if self.cq.errs.lock().unwrap().is_empty() {
                return Ok(CqPoll::Empty);
            }
            return Ok(CqPoll::ErrAvail);
        }

        let count = entries.len().min(queue.len());
        for slot in entries.iter_mut().take(count) {
            *slot = queue.pop_front().expect("count bounded by queue len");
        }
        Ok(CqPoll::Entries(count))
    }

    fn read_err(&self) -> RailResult<Option<CqError>> {
        Ok(self.cq.errs.lock().unwrap().pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_eps() -> (Box<dyn Ep>, Box<dyn Cq>, Box<dyn Ep>, Box<dyn Cq>, Arc<dyn Domain>) {
        let provider = LoopbackProvider::new(1, 2);
        let nics = provider.nics().unwrap();
        let domain = provider.open(&nics[0]).unwrap();
        let (a, a_cq) = domain.create_ep().unwrap();
        let (b, b_cq) = domain.create_ep().unwrap();
        (a, a_cq, b, b_cq, domain)
    }

    fn drain(cq: &dyn Cq) -> Vec<CqEntry> {
        let mut out = Vec::new();
        let mut buf = [CqEntry::default(); 8];
        while let CqPoll::Entries(n) = cq.read(&mut buf).unwrap() {
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_send_matches_posted_recv() {
        let (a, a_cq, b, b_cq, _domain) = two_eps();

        let mut dst = [0u8; 16];
        unsafe {
            b.post_recv(dst.as_mut_ptr(), dst.len(), None, 42).unwrap();

            let peer = a.av_insert(&b.name()).unwrap();
            let payload = [7u8; 8];
            a.post_send(payload.as_ptr(), payload.len(), None, Some(9), peer, 11)
                .unwrap();
        }

        let sends = drain(a_cq.as_ref());
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].ctx, 11);
        assert_eq!(sends[0].kind, CompKind::Send);

        let recvs = drain(b_cq.as_ref());
        assert_eq!(recvs.len(), 1);
        assert_eq!(recvs[0].ctx, 42);
        assert_eq!(recvs[0].kind, CompKind::Recv { imm: Some(9) });
        assert_eq!(recvs[0].len, 8);
        assert_eq!(&dst[..8], &[7u8; 8]);
    }

    #[test]
    fn test_send_before_recv_is_queued() {
        let (a, _a_cq, b, b_cq, _domain) = two_eps();

        let mut dst = [0u8; 16];
        unsafe {
            let peer = a.av_insert(&b.name()).unwrap();
            let payload = [3u8; 4];
            a.post_send(payload.as_ptr(), payload.len(), None, None, peer, 1)
                .unwrap();

            assert!(drain(b_cq.as_ref()).is_empty());

            b.post_recv(dst.as_mut_ptr(), dst.len(), None, 2).unwrap();
        }

        let recvs = drain(b_cq.as_ref());
        assert_eq!(recvs.len(), 1);
        assert_eq!(recvs[0].kind, CompKind::Recv { imm: None });
        assert_eq!(&dst[..4], &[3u8; 4]);
    }

    #[test]
    fn test_write_imm_hits_registered_region() {
        let (a, a_cq, b, b_cq, domain) = two_eps();

        let mut target = vec![0u8; 64];
        let desc = domain
            .register(target.as_ptr() as usize, target.len(), MemType::Host, Some(0xbeef))
            .unwrap();

        unsafe {
            let peer = a.av_insert(&b.name()).unwrap();
            let src = [5u8; 32];
            a.post_write_imm(
                src.as_ptr(),
                src.len(),
                None,
                peer,
                target.as_ptr() as u64 + 8,
                desc.key,
                0xaa,
                77,
            )
            .unwrap();
        }

        let own = drain(a_cq.as_ref());
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].kind, CompKind::Write);

        let remote = drain(b_cq.as_ref());
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].kind, CompKind::RemoteWrite { imm: 0xaa });
        assert_eq!(&target[8..40], &[5u8; 32]);
    }

    #[test]
    fn test_write_bad_key_errors() {
        let (a, a_cq, b, _b_cq, _domain) = two_eps();

        unsafe {
            let peer = a.av_insert(&b.name()).unwrap();
            let src = [1u8; 4];
            a.post_write_imm(src.as_ptr(), 4, None, peer, 0x1000, 0xdead, 0, 5)
                .unwrap();
        }

        let mut buf = [CqEntry::default(); 4];
        assert_eq!(a_cq.read(&mut buf).unwrap(), CqPoll::ErrAvail);
        let err = a_cq.read_err().unwrap().unwrap();
        assert_eq!(err.ctx, 5);
        assert_eq!(err.fault, FabricFault::RemoteAccess);
    }

    #[test]
    fn test_read_copies_remote_to_local() {
        let (a, a_cq, b, _b_cq, domain) = two_eps();

        let src = vec![9u8; 32];
        let desc = domain
            .register(src.as_ptr() as usize, src.len(), MemType::Host, None)
            .unwrap();

        let mut dst = [0u8; 32];
        unsafe {
            let peer = a.av_insert(&b.name()).unwrap();
            a.post_read(
                dst.as_mut_ptr(),
                dst.len(),
                None,
                peer,
                src.as_ptr() as u64,
                desc.key,
                3,
            )
            .unwrap();
        }

        let own = drain(a_cq.as_ref());
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].kind, CompKind::Read);
        assert_eq!(dst, [9u8; 32]);
    }

    #[test]
    fn test_again_injection() {
        let provider = LoopbackProvider::new(1, 1);
        let nics = provider.nics().unwrap();
        let domain = provider.open(&nics[0]).unwrap();
        let (a, _a_cq) = domain.create_ep().unwrap();
        let (b, _b_cq) = domain.create_ep().unwrap();
        let faults = provider.fault_injector();

        faults.again_once();
        unsafe {
            let peer = a.av_insert(&b.name()).unwrap();
            let payload = [0u8; 1];
            assert_eq!(
                a.post_send(payload.as_ptr(), 1, None, None, peer, 0),
                Err(RailError::Again)
            );
            // The injected fault is one-shot.
            a.post_send(payload.as_ptr(), 1, None, None, peer, 0).unwrap();
        }
    }

    #[test]
    fn test_hmem_rejected() {
        let provider = LoopbackProvider::new(1, 1);
        let nics = provider.nics().unwrap();
        let domain = provider.open(&nics[0]).unwrap();

        assert!(domain.register(0x1000, 64, MemType::Device, None).is_err());
    }

    #[test]
    fn test_dereg_then_write_fails() {
        let (a, a_cq, b, _b_cq, domain) = two_eps();

        let target = vec![0u8; 16];
        let desc = domain
            .register(target.as_ptr() as usize, target.len(), MemType::Host, None)
            .unwrap();
        domain.deregister(&desc).unwrap();

        unsafe {
            let peer = a.av_insert(&b.name()).unwrap();
            let src = [1u8; 4];
            a.post_write_imm(src.as_ptr(), 4, None, peer, target.as_ptr() as u64, desc.key, 0, 1)
                .unwrap();
        }

        let mut buf = [CqEntry::default(); 1];
        assert_eq!(a_cq.read(&mut buf).unwrap(), CqPoll::ErrAvail);
    }
}
