//! A logical device: one rail set with its fabric domains, the transfer
//! scheduler, and the id pools for communicator ids and memory keys.
//! Endpoints onto a device are per thread and built lazily.

use crate::config::{self, MAX_COMMS, MAX_NUM_RAILS, MAX_RECVS, PARAMS};
use crate::error::{RailError, RailResult};
use crate::fabric::{Domain, MemType, MrDesc, Provider};
use crate::idpool::IdPool;
use crate::rdma::endpoint::Endpoint;
use crate::scheduler::Scheduler;
use crate::topology::DeviceLayout;
use hashbrown::HashMap;
use lumen::logging::{self, Logger};
use std::cell::RefCell;
use std::sync::{Arc, Mutex, Weak};

/// Device properties reported to the host library.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub name: String,
    pub pci_path: String,
    pub guid: u64,
    /// Port speed summed across rails, in Mb/s.
    pub speed_mbps: u64,
    pub port: u16,
    pub latency_us: f32,
    pub max_comms: usize,
    pub max_group_receives: usize,
    pub hmem_support: bool,
    pub dmabuf_support: bool,
}

/// A registered memory region: one descriptor per rail plus the pool key
/// shared by all of them. Handed to the library as an opaque handle and
/// referenced by in-flight requests.
#[derive(Debug)]
pub struct MrHandle {
    pub dev_id: usize,
    pub addr: usize,
    pub len: usize,
    pub mem: MemType,
    descs: Vec<MrDesc>,
    key_id: Option<u32>,
}

impl MrHandle {
    #[inline]
    pub fn desc(&self, rail_id: usize) -> &MrDesc {
        &self.descs[rail_id]
    }

    #[inline]
    pub fn key(&self, rail_id: usize) -> u64 {
        self.descs[rail_id].key
    }

    /// Per-rail keys, zero-padded to the wire-format bound.
    pub fn keys(&self) -> [u64; MAX_NUM_RAILS] {
        let mut keys = [0u64; MAX_NUM_RAILS];
        for (slot, desc) in keys.iter_mut().zip(self.descs.iter()) {
            *slot = desc.key;
        }
        keys
    }
}

pub struct Device {
    pub id: usize,
    pub layout: DeviceLayout,
    pub scheduler: Scheduler,
    domains: Vec<Arc<dyn Domain>>,
    key_pool: IdPool,
    comm_pool: IdPool,
    hmem: bool,
    /// Serializes endpoint construction per device.
    ep_lock: Mutex<()>,
    log: Logger,
}

thread_local! {
    // Endpoints are per (device, thread); comms created on a thread stay on
    // that thread's endpoint.
    static THREAD_EPS: RefCell<HashMap<usize, Weak<Endpoint>>> = RefCell::new(HashMap::new());
}

impl Device {
    pub fn new(
        id: usize,
        layout: DeviceLayout,
        provider: &dyn Provider,
        log: &Logger,
    ) -> RailResult<Arc<Device>> {
        let mut domains = Vec::with_capacity(layout.rails.len());
        for nic in &layout.rails {
            domains.push(provider.open(nic)?);
        }

        let key_bits = (PARAMS.mr_key_size * 8).min(20);
        let key_pool = if PARAMS.mr_key_size == 0 {
            IdPool::new(0)
        } else {
            IdPool::new(1 << key_bits)
        };

        let log = log.new(logging::o!("dev" => id));
        logging::debug!(log, "device built";
                        "context" => "device",
                        "rails" => layout.rails.len(),
                        "leader" => %layout.leader().name);

        Ok(Arc::new(Device {
            id,
            scheduler: Scheduler::new(layout.rails.len(), PARAMS.round_robin_threshold),
            domains,
            key_pool,
            comm_pool: IdPool::new(MAX_COMMS),
            hmem: provider.hmem_support(),
            ep_lock: Mutex::new(()),
            layout,
            log,
        }))
    }

    #[inline]
    pub fn num_rails(&self) -> usize {
        self.layout.rails.len()
    }

    #[inline]
    pub fn domain(&self, rail_id: usize) -> &Arc<dyn Domain> {
        &self.domains[rail_id]
    }

    #[inline]
    pub fn domains(&self) -> &[Arc<dyn Domain>] {
        &self.domains
    }

    #[inline]
    pub fn hmem_support(&self) -> bool {
        self.hmem
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn properties(&self) -> DeviceProperties {
        let leader = self.layout.leader();
        DeviceProperties {
            name: leader.name.clone(),
            pci_path: leader.pci_path.clone(),
            guid: leader.guid,
            speed_mbps: self.layout.speed_mbps(),
            port: leader.port,
            latency_us: PARAMS.net_latency,
            max_comms: config::MAX_COMMS,
            max_group_receives: MAX_RECVS,
            hmem_support: self.hmem,
            dmabuf_support: false,
        }
    }

    /// Allocate a communicator id. Ids are recycled on close.
    pub fn alloc_comm_id(&self) -> RailResult<u32> {
        self.comm_pool.allocate()
    }

    pub fn free_comm_id(&self, id: u32) -> RailResult<()> {
        self.comm_pool.free(id)
    }

    /// Register `[addr, addr+len)` with every rail's domain. One key from
    /// the device pool covers all rails; each rail still reports its own
    /// descriptor. The region is registered exactly as given; user regions
    /// are never widened to page boundaries behind the caller's back.
    pub fn register_mr(&self, addr: usize, len: usize, mem: MemType) -> RailResult<Arc<MrHandle>> {
        if len == 0 {
            return Err(RailError::Invalid("empty memory registration"));
        }
        if mem == MemType::Device && !self.hmem {
            return Err(RailError::NotSupported("device memory without hmem support"));
        }

        let key_id = match self.key_pool.capacity() {
            0 => None,
            _ => Some(self.key_pool.allocate()?),
        };

        let mut descs = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            match domain.register(addr, len, mem, key_id.map(u64::from)) {
                Ok(desc) => descs.push(desc),
                Err(err) => {
                    for (domain, desc) in self.domains.iter().zip(descs.iter()) {
                        let _ = domain.deregister(desc);
                    }
                    if let Some(key) = key_id {
                        let _ = self.key_pool.free(key);
                    }
                    return Err(err);
                }
            }
        }

        Ok(Arc::new(MrHandle {
            dev_id: self.id,
            addr,
            len,
            mem,
            descs,
            key_id,
        }))
    }

    pub fn deregister_mr(&self, handle: &MrHandle) -> RailResult<()> {
        for (domain, desc) in self.domains.iter().zip(handle.descs.iter()) {
            domain.deregister(desc)?;
        }
        if let Some(key) = handle.key_id {
            self.key_pool.free(key)?;
        }
        Ok(())
    }

    /// True when both id pools are back to fully free. Teardown sanity.
    pub fn pools_quiescent(&self) -> bool {
        self.comm_pool.is_full() && self.key_pool.is_full()
    }

    /// The calling thread's endpoint onto this device, built on first use.
    pub fn endpoint(self: &Arc<Self>) -> RailResult<Arc<Endpoint>> {
        let slot = Arc::as_ptr(self) as usize;

        THREAD_EPS.with(|cell| {
            let mut map = cell.borrow_mut();

            if let Some(ep) = map.get(&slot).and_then(|weak| weak.upgrade()) {
                return Ok(ep);
            }

            let _guard = self.ep_lock.lock().unwrap();
            let ep = Endpoint::new(self.clone())?;
            map.insert(slot, Arc::downgrade(&ep));
            Ok(ep)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::LoopbackProvider;
    use crate::topology::Topology;

    fn build_device(rails: usize) -> (LoopbackProvider, Arc<Device>) {
        let provider = LoopbackProvider::new(1, rails);
        let topo = Topology::group(provider.nics().unwrap(), 0).unwrap();
        let dev = Device::new(
            0,
            topo.devices[0].clone(),
            &provider,
            &lumen::logging::discard(),
        )
        .unwrap();
        (provider, dev)
    }

    #[test]
    fn test_properties_aggregate_speed() {
        let (_provider, dev) = build_device(2);
        let props = dev.properties();

        assert_eq!(props.speed_mbps, 200_000);
        assert_eq!(props.max_comms, MAX_COMMS);
        assert_eq!(props.max_group_receives, MAX_RECVS);
        assert!(!props.hmem_support);
    }

    #[test]
    fn test_register_mr_covers_all_rails() {
        let (_provider, dev) = build_device(2);

        let data = vec![0u8; 4096];
        let handle = dev
            .register_mr(data.as_ptr() as usize, data.len(), MemType::Host)
            .unwrap();

        assert_eq!(handle.keys()[0], handle.key(0));
        assert_eq!(handle.key(0), handle.key(1)); // one pool key, all rails
        assert_ne!(handle.desc(0).handle, handle.desc(1).handle);

        dev.deregister_mr(&handle).unwrap();
        assert!(dev.pools_quiescent());
    }

    #[test]
    fn test_comm_id_recycled() {
        let (_provider, dev) = build_device(1);

        let id = dev.alloc_comm_id().unwrap();
        dev.free_comm_id(id).unwrap();
        assert_eq!(dev.alloc_comm_id().unwrap(), id);
        dev.free_comm_id(id).unwrap();
        assert!(dev.pools_quiescent());
    }

    #[test]
    fn test_device_mem_rejected_without_hmem() {
        let (_provider, dev) = build_device(1);
        assert!(dev.register_mr(0x1000, 64, MemType::Device).is_err());
    }

    #[test]
    fn test_endpoint_cached_per_thread() {
        let (_provider, dev) = build_device(1);

        let ep1 = dev.endpoint().unwrap();
        let ep2 = dev.endpoint().unwrap();
        assert!(Arc::ptr_eq(&ep1, &ep2));
    }
}
