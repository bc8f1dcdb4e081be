//! The library-facing surface: one `Plugin` per process exposing the
//! vtable operations (init / devices / properties / listen / connect /
//! accept / memory registration / isend / irecv / iflush / test / close).
//! Error values map onto the library's result codes through
//! [`crate::error::RailError::code`].

use crate::config::{Protocol, PARAMS};
use crate::error::{RailError, RailResult};
use crate::fabric::{MemType, Provider};
use crate::rdma::comm::{
    self, ConnHandle, ListenCommHandle, RecvCommHandle, ReqHandle, SendCommHandle,
};
use crate::rdma::device::{Device, DeviceProperties, MrHandle};
use crate::topology::{self, Topology};
use lazy_static::lazy_static;
use lumen::logging::{self, Logger};
use std::sync::{Arc, Mutex};

pub struct Plugin {
    devices: Vec<Arc<Device>>,
    log: Logger,
}

impl Plugin {
    /// Build the plugin: discover NICs, group them into devices, and
    /// optionally export the topology file. Fails with "not supported"
    /// when the fabric is unusable or the selected protocol is not built
    /// into this crate.
    pub fn init(provider: Arc<dyn Provider>, log: Logger) -> RailResult<Plugin> {
        for warning in &PARAMS.warnings {
            logging::warn!(log, "{}", warning; "context" => "params");
        }

        if PARAMS.protocol != Protocol::Rdma {
            return Err(RailError::NotSupported("only the RDMA protocol is built in"));
        }

        let nics = provider.nics()?;
        let topo = Topology::group(nics, PARAMS.nic_dup_conns)?;

        if PARAMS.topo_file_write {
            topology::write_topo_file(&topo, PARAMS.topo_file_template.as_deref(), &log)?;
        }

        let mut devices = Vec::with_capacity(topo.num_devices());
        for (id, layout) in topo.devices.into_iter().enumerate() {
            devices.push(Device::new(id, layout, provider.as_ref(), &log)?);
        }

        logging::info!(log, "plugin initialized";
                       "context" => "init",
                       "provider" => provider.name(),
                       "devices" => devices.len());

        Ok(Plugin { devices, log })
    }

    #[inline]
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, dev: usize) -> RailResult<&Arc<Device>> {
        self.devices
            .get(dev)
            .ok_or(RailError::Invalid("device id out of range"))
    }

    pub fn get_properties(&self, dev: usize) -> RailResult<DeviceProperties> {
        Ok(self.device(dev)?.properties())
    }

    pub fn listen(&self, dev: usize) -> RailResult<(ConnHandle, ListenCommHandle)> {
        comm::listen(self.device(dev)?)
    }

    /// Non-blocking: returns `Ok(None)` while the handshake is in flight;
    /// the library retries with the same handle.
    pub fn connect(
        &self,
        dev: usize,
        handle: &mut ConnHandle,
    ) -> RailResult<Option<SendCommHandle>> {
        comm::connect(self.device(dev)?, handle)
    }

    /// Non-blocking: returns `Ok(None)` until the connect message has
    /// arrived and the response send completed.
    pub fn accept(&self, listen: &ListenCommHandle) -> RailResult<Option<RecvCommHandle>> {
        listen.accept()
    }

    /// Register memory for transfers on a device.
    pub fn reg_mr(
        &self,
        dev: usize,
        addr: usize,
        len: usize,
        mem: MemType,
    ) -> RailResult<Arc<MrHandle>> {
        self.device(dev)?.register_mr(addr, len, mem)
    }

    /// DMA-buf registration adapter. The fd/offset pair is accepted for
    /// interface compatibility; providers without DMA-buf support service
    /// it as a plain registration.
    pub fn reg_mr_dma_buf(
        &self,
        dev: usize,
        addr: usize,
        len: usize,
        mem: MemType,
        _fd: i32,
        _offset: u64,
    ) -> RailResult<Arc<MrHandle>> {
        self.device(dev)?.register_mr(addr, len, mem)
    }

    pub fn dereg_mr(&self, dev: usize, handle: &MrHandle) -> RailResult<()> {
        self.device(dev)?.deregister_mr(handle)
    }

    /// # Safety
    ///
    /// `buf` must stay valid and registered under `mr` until `test`
    /// reports the returned request complete.
    pub unsafe fn isend(
        &self,
        comm: &SendCommHandle,
        buf: *const u8,
        len: usize,
        _tag: u32,
        mr: &Arc<MrHandle>,
    ) -> RailResult<Option<ReqHandle>> {
        comm.isend(buf, len, mr)
    }

    /// Grouped receive; the RDMA engine accepts one buffer per call.
    ///
    /// # Safety
    ///
    /// Buffers must stay valid and registered until `test` reports the
    /// returned request complete.
    pub unsafe fn irecv(
        &self,
        comm: &RecvCommHandle,
        bufs: &[*mut u8],
        sizes: &[usize],
        tags: &[u32],
        mrs: &[Arc<MrHandle>],
    ) -> RailResult<Option<ReqHandle>> {
        if bufs.len() != 1 || sizes.len() != 1 || mrs.len() != 1 {
            return Err(RailError::Invalid("grouped receives are limited to one buffer"));
        }
        comm.irecv(bufs[0], sizes[0], tags.first().copied().unwrap_or(0), &mrs[0])
    }

    /// # Safety
    ///
    /// Buffers must stay valid and registered until `test` reports the
    /// returned request complete.
    pub unsafe fn iflush(
        &self,
        comm: &RecvCommHandle,
        bufs: &[*mut u8],
        sizes: &[usize],
        mrs: &[Arc<MrHandle>],
    ) -> RailResult<Option<ReqHandle>> {
        comm.iflush(bufs, sizes, mrs)
    }

    /// Poll a request. On completion the request is freed and must not be
    /// tested again.
    pub fn test(&self, req: &ReqHandle) -> RailResult<(bool, usize)> {
        req.test()
    }

    pub fn close_send(&self, comm: SendCommHandle) -> RailResult<()> {
        comm.close()
    }

    pub fn close_recv(&self, comm: RecvCommHandle) -> RailResult<()> {
        comm.close()
    }

    pub fn close_listen(&self, comm: ListenCommHandle) -> RailResult<()> {
        comm.close()
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }
}

lazy_static! {
    static ref GLOBAL_PLUGIN: Mutex<Option<Arc<Plugin>>> = Mutex::new(None);
}

/// Install the process-global plugin instance. The vtable shim calls this
/// once from its `init` entry point; repeated initialization returns the
/// existing instance.
pub fn init_global(provider: Arc<dyn Provider>, log: Logger) -> RailResult<Arc<Plugin>> {
    let mut slot = GLOBAL_PLUGIN.lock().unwrap();
    if let Some(plugin) = slot.as_ref() {
        return Ok(plugin.clone());
    }

    let plugin = Arc::new(Plugin::init(provider, log)?);
    *slot = Some(plugin.clone());
    Ok(plugin)
}

/// The installed global plugin, if `init_global` has run.
pub fn global() -> Option<Arc<Plugin>> {
    GLOBAL_PLUGIN.lock().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::LoopbackProvider;

    fn plugin(devices: usize, rails: usize) -> Plugin {
        let provider = Arc::new(LoopbackProvider::new(devices, rails));
        Plugin::init(provider, lumen::logging::discard()).unwrap()
    }

    #[test]
    fn test_init_groups_devices() {
        let plugin = plugin(2, 2);
        assert_eq!(plugin.num_devices(), 2);

        let props = plugin.get_properties(0).unwrap();
        assert_eq!(props.speed_mbps, 200_000);
        assert!(plugin.get_properties(2).is_err());
    }

    #[test]
    fn test_handshake_completes() {
        let plugin = plugin(2, 1);

        let (mut handle, listen) = plugin.listen(1).unwrap();

        let mut send = None;
        let mut recv = None;
        for _ in 0..20 {
            if send.is_none() {
                send = plugin.connect(0, &mut handle).unwrap();
            }
            if recv.is_none() {
                recv = plugin.accept(&listen).unwrap();
            }
            if send.is_some() && recv.is_some() {
                break;
            }
        }

        let send = send.expect("connect must finish");
        let recv = recv.expect("accept must finish");
        assert!(send.comm().is_connected());

        plugin.close_send(send).unwrap();
        plugin.close_recv(recv).unwrap();
        plugin.close_listen(listen).unwrap();

        let dev0 = plugin.device(0).unwrap();
        let dev1 = plugin.device(1).unwrap();
        assert!(dev0.pools_quiescent());
        assert!(dev1.pools_quiescent());
    }

    #[test]
    fn test_handle_reuse_after_connect_errors() {
        let plugin = plugin(2, 1);

        let (mut handle, listen) = plugin.listen(1).unwrap();
        let mut send = None;
        let mut recv = None;
        for _ in 0..20 {
            if send.is_none() {
                send = plugin.connect(0, &mut handle).unwrap();
            }
            if recv.is_none() {
                recv = plugin.accept(&listen).unwrap();
            }
            if send.is_some() && recv.is_some() {
                break;
            }
        }
        assert!(send.is_some());

        assert!(plugin.connect(0, &mut handle).is_err());
    }

    #[test]
    fn test_reg_mr_roundtrip() {
        let plugin = plugin(1, 2);
        let data = vec![0u8; 1 << 12];

        let mr = plugin
            .reg_mr(0, data.as_ptr() as usize, data.len(), MemType::Host)
            .unwrap();
        plugin.dereg_mr(0, &mr).unwrap();
        assert!(plugin.device(0).unwrap().pools_quiescent());
    }

    #[test]
    fn test_global_slot_idempotent() {
        let provider = Arc::new(LoopbackProvider::new(1, 1));
        let first = init_global(provider.clone(), lumen::logging::discard()).unwrap();
        let second = init_global(provider, lumen::logging::discard()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(global().is_some());
    }
}
