//! Groups discovered NICs into per-device rail sets and optionally exports
//! an NCCL-style topology file describing the grouping.

use crate::config::MAX_NUM_RAILS;
use crate::error::{RailError, RailResult};
use crate::fabric::NicInfo;
use ctor::dtor;
use lazy_static::lazy_static;
use lumen::logging::{self, Logger};
use lumen::time::timestamp_nanos;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

const DEFAULT_TOPO_TEMPLATE: &str = "/tmp/railnet-topo-XXXXXX";
const TEMPLATE_SUFFIX: &str = "XXXXXX";

/// The rails of one logical device.
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    pub rails: Vec<NicInfo>,
}

impl DeviceLayout {
    /// Leader rail; its NIC lends the device its name and pci path.
    #[inline]
    pub fn leader(&self) -> &NicInfo {
        &self.rails[0]
    }

    /// Aggregate port speed across rails.
    #[inline]
    pub fn speed_mbps(&self) -> u64 {
        self.rails.iter().map(|nic| nic.speed_mbps as u64).sum()
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub devices: Vec<DeviceLayout>,
}

impl Topology {
    /// Fold NICs into devices. NICs sharing a provider-reported group form
    /// one multi-rail device, capped at the wire-format rail bound. With
    /// `nic_dup_conns` set, grouping is disabled and every NIC instead
    /// appears as that many single-rail devices.
    pub fn group(nics: Vec<NicInfo>, nic_dup_conns: usize) -> RailResult<Topology> {
        if nics.is_empty() {
            return Err(RailError::NotSupported("no NICs discovered"));
        }

        if nic_dup_conns > 0 {
            let mut devices = Vec::with_capacity(nics.len() * nic_dup_conns);
            for nic in &nics {
                for _ in 0..nic_dup_conns {
                    devices.push(DeviceLayout {
                        rails: vec![nic.clone()],
                    });
                }
            }
            return Ok(Topology { devices });
        }

        let mut devices: Vec<DeviceLayout> = Vec::new();
        for nic in nics {
            match devices
                .iter_mut()
                .find(|dev| dev.leader().group == nic.group && dev.rails.len() < MAX_NUM_RAILS)
            {
                Some(dev) => dev.rails.push(nic),
                None => devices.push(DeviceLayout { rails: vec![nic] }),
            }
        }

        Ok(Topology { devices })
    }

    #[inline]
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }
}

lazy_static! {
    // Path of the exported topology file, kept for unlinking at exit.
    static ref TOPO_FILE_UNLINK: Mutex<Option<PathBuf>> = Mutex::new(None);
}

/// Render the NCCL topology XML for the grouped devices.
fn render_topo_xml(topo: &Topology) -> String {
    let mut xml = String::new();
    xml.push_str("<system version=\"1\">\n");
    xml.push_str("  <cpu numaid=\"0\">\n");
    for dev in &topo.devices {
        for nic in &dev.rails {
            xml.push_str(&format!(
                "    <pci busid=\"{}\" class=\"0x020000\" link_speed=\"{} Mb/s\" link_width=\"16\"/>\n",
                nic.pci_path, nic.speed_mbps
            ));
        }
    }
    xml.push_str("  </cpu>\n");
    xml.push_str("</system>\n");
    xml
}

// Attempts at exclusive creation before giving up on the template.
const TOPO_CREATE_ATTEMPTS: usize = 64;

/// Write the topology file to a unique path derived from `template`, export
/// it through `NCCL_TOPO_FILE` and schedule it for unlinking at process
/// exit. The template must end in `XXXXXX`; as with `mkstemp`, the file is
/// created exclusively, rerolling the suffix until an unused name is found,
/// so concurrent writers never clobber each other.
pub fn write_topo_file(
    topo: &Topology,
    template: Option<&str>,
    log: &Logger,
) -> RailResult<PathBuf> {
    let template = template.unwrap_or(DEFAULT_TOPO_TEMPLATE);
    if !template.ends_with(TEMPLATE_SUFFIX) {
        return Err(RailError::Invalid("topology file template must end in XXXXXX"));
    }
    let prefix = &template[..template.len() - TEMPLATE_SUFFIX.len()];

    let mut created = None;
    for attempt in 0..TOPO_CREATE_ATTEMPTS {
        let suffix = (process::id() as u128 ^ timestamp_nanos() ^ attempt as u128) & 0xff_ffff;
        let candidate = PathBuf::from(format!("{}{:06x}", prefix, suffix));

        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => {
                created = Some((file, candidate));
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let (mut file, path) =
        created.ok_or(RailError::Io(io::ErrorKind::AlreadyExists))?;
    file.write_all(render_topo_xml(topo).as_bytes())?;

    std::env::set_var("NCCL_TOPO_FILE", &path);
    *TOPO_FILE_UNLINK.lock().unwrap() = Some(path.clone());

    logging::info!(log, "wrote topology file";
                   "context" => "topology",
                   "path" => %path.display(),
                   "devices" => topo.num_devices());

    Ok(path)
}

#[dtor]
fn unlink_topo_file() {
    if let Ok(mut guard) = TOPO_FILE_UNLINK.lock() {
        if let Some(path) = guard.take() {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic(idx: u64, group: u32) -> NicInfo {
        NicInfo {
            name: format!("nic{}", idx),
            pci_path: format!("0000:{:02x}:00.0", idx),
            guid: idx,
            group,
            speed_mbps: 100_000,
            port: 1,
        }
    }

    #[test]
    fn test_group_by_locality() {
        let nics = vec![nic(0, 0), nic(1, 0), nic(2, 1), nic(3, 1)];
        let topo = Topology::group(nics, 0).unwrap();

        assert_eq!(topo.num_devices(), 2);
        assert_eq!(topo.devices[0].rails.len(), 2);
        assert_eq!(topo.devices[1].rails.len(), 2);
        assert_eq!(topo.devices[0].speed_mbps(), 200_000);
    }

    #[test]
    fn test_group_caps_rail_count() {
        let nics = (0..6).map(|idx| nic(idx, 0)).collect();
        let topo = Topology::group(nics, 0).unwrap();

        assert_eq!(topo.num_devices(), 2);
        assert_eq!(topo.devices[0].rails.len(), MAX_NUM_RAILS);
        assert_eq!(topo.devices[1].rails.len(), 2);
    }

    #[test]
    fn test_nic_duplication() {
        let nics = vec![nic(0, 0), nic(1, 0)];
        let topo = Topology::group(nics, 3).unwrap();

        assert_eq!(topo.num_devices(), 6);
        assert!(topo.devices.iter().all(|dev| dev.rails.len() == 1));
    }

    #[test]
    fn test_no_nics_is_unsupported() {
        assert!(Topology::group(Vec::new(), 0).is_err());
    }

    #[test]
    fn test_topo_file_roundtrip() {
        let topo = Topology::group(vec![nic(0, 0)], 0).unwrap();
        let log = lumen::logging::discard();

        let template = std::env::temp_dir().join("railnet-test-topo-XXXXXX");
        let path = write_topo_file(&topo, template.to_str(), &log).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("<system version=\"1\">"));
        assert!(contents.contains("0000:00:00.0"));
        assert_eq!(std::env::var("NCCL_TOPO_FILE").unwrap(), path.to_str().unwrap());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_topo_file_unique_per_writer() {
        let topo = Topology::group(vec![nic(0, 0)], 0).unwrap();
        let log = lumen::logging::discard();

        let template = std::env::temp_dir().join("railnet-test-topo-uniq-XXXXXX");
        let first = write_topo_file(&topo, template.to_str(), &log).unwrap();
        let second = write_topo_file(&topo, template.to_str(), &log).unwrap();

        // Exclusive creation: a second writer rolls a fresh name instead of
        // truncating the first file.
        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());

        fs::remove_file(first).unwrap();
        fs::remove_file(second).unwrap();
    }

    #[test]
    fn test_bad_template_rejected() {
        let topo = Topology::group(vec![nic(0, 0)], 0).unwrap();
        let log = lumen::logging::discard();

        assert!(write_topo_file(&topo, Some("/tmp/topo.xml"), &log).is_err());
    }
}
