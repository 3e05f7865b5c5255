//! Server configuration and network-interface attributes.
//!
//! The gateway is configured once at startup from a plain value record —
//! there is no global registry. The CLI builds a [`ServerConfig`] from its
//! flags and hands it to [`RtspServer`](crate::server::RtspServer) and
//! [`StreamManager`](crate::stream::StreamManager) constructors.

use std::net::IpAddr;
use std::path::PathBuf;

/// SAT>IP device UUID prefix; the suffix is the 12-hex-digit MAC of the
/// bound interface.
const UUID_PREFIX: &str = "50c958a8-e839-4b96-b7ae";

/// How the CA-PMT is flagged when pushed to the control-word provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaPmtListMode {
    /// `ca_pmt_list_management` = 0x03 (only).
    ListOnly,
    /// `ca_pmt_list_management` = 0x05 (update). The provider treats each
    /// push as a replacement for the same program.
    #[default]
    ListOnlyUpdate,
}

impl CaPmtListMode {
    /// Wire value placed in the CA-PMT list-management byte.
    pub fn wire(self) -> u8 {
        match self {
            Self::ListOnly => 0x03,
            Self::ListOnlyUpdate => 0x05,
        }
    }
}

/// Control-word provider (DVB-API protocol) settings.
#[derive(Debug, Clone)]
pub struct DecryptConfig {
    /// Whether the decrypt client connects at all.
    pub enabled: bool,
    /// Provider host.
    pub server_addr: String,
    /// Provider TCP port.
    pub server_port: u16,
    /// Added to the stream ID to form the demux index seen by the provider.
    pub adapter_offset: u8,
    /// Strip CA descriptors from PMTs before they reach the client.
    pub rewrite_pmt: bool,
    /// CA-PMT list-management mode.
    pub list_mode: CaPmtListMode,
}

impl Default for DecryptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_addr: "127.0.0.1".to_string(),
            server_port: 15011,
            adapter_offset: 0,
            rewrite_pmt: false,
            list_mode: CaPmtListMode::default(),
        }
    }
}

/// Process-level configuration record, threaded explicitly through
/// constructors.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the RTSP (and advertised HTTP) services bind to.
    pub bind_ip: IpAddr,
    /// RTSP port (SAT>IP default: 554).
    pub rtsp_port: u16,
    /// HTTP port advertised to the web collaborator.
    pub http_port: u16,
    /// Where the settings collaborator keeps its XML file.
    pub app_data_path: PathBuf,
    /// Static web content path (consumed by the HTTP collaborator).
    pub web_path: PathBuf,
    /// Root of the DVB device tree, conventionally `/dev/dvb`.
    pub dvb_path: PathBuf,
    /// Per-device UUID, `50c958a8-e839-4b96-b7ae-<12-hex-MAC>`.
    pub uuid: String,
    /// Control-word provider settings.
    pub decrypt: DecryptConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let iface = InterfaceAttr::resolve(None);
        Self {
            bind_ip: iface
                .as_ref()
                .map(|i| i.ip)
                .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1])),
            rtsp_port: 554,
            http_port: 8875,
            app_data_path: PathBuf::from("."),
            web_path: PathBuf::from("web"),
            dvb_path: PathBuf::from("/dev/dvb"),
            uuid: device_uuid(iface.as_ref().map(|i| i.mac).unwrap_or_default()),
            decrypt: DecryptConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build a configuration bound to a named interface (or the first
    /// usable non-loopback interface when `iface` is `None`).
    pub fn for_interface(iface: Option<&str>) -> Self {
        let attr = InterfaceAttr::resolve(iface);
        let mut cfg = Self::default();
        if let Some(attr) = attr {
            tracing::info!(iface = %attr.name, ip = %attr.ip, mac = %attr.mac_decorated(), "bound interface");
            cfg.bind_ip = attr.ip;
            cfg.uuid = device_uuid(attr.mac);
        } else {
            tracing::warn!(requested = iface.unwrap_or("<any>"), "no usable network interface found");
        }
        cfg
    }
}

/// Format the SAT>IP device UUID for a MAC address.
pub fn device_uuid(mac: [u8; 6]) -> String {
    let hex: String = mac.iter().map(|b| format!("{b:02x}")).collect();
    format!("{UUID_PREFIX}-{hex}")
}

/// Name, IPv4 address and hardware address of a network interface.
#[derive(Debug, Clone)]
pub struct InterfaceAttr {
    pub name: String,
    pub ip: IpAddr,
    pub mac: [u8; 6],
}

impl InterfaceAttr {
    /// Find the requested interface, or the first non-loopback interface
    /// with an IPv4 address when `name` is `None`.
    pub fn resolve(name: Option<&str>) -> Option<Self> {
        let addrs = nix::ifaddrs::getifaddrs().ok()?;

        let mut ips: Vec<(String, IpAddr)> = Vec::new();
        let mut macs: Vec<(String, [u8; 6])> = Vec::new();
        for ifa in addrs {
            if ifa
                .flags
                .contains(nix::net::if_::InterfaceFlags::IFF_LOOPBACK)
            {
                continue;
            }
            let Some(addr) = ifa.address else { continue };
            if let Some(sin) = addr.as_sockaddr_in() {
                ips.push((ifa.interface_name.clone(), IpAddr::V4(sin.ip())));
            } else if let Some(link) = addr.as_link_addr()
                && let Some(mac) = link.addr()
            {
                macs.push((ifa.interface_name.clone(), mac));
            }
        }

        let (iface, ip) = ips
            .into_iter()
            .find(|(n, _)| name.is_none_or(|want| want == n))?;
        let mac = macs
            .into_iter()
            .find(|(n, _)| *n == iface)
            .map(|(_, m)| m)
            .unwrap_or_default();

        Some(InterfaceAttr {
            name: iface,
            ip,
            mac,
        })
    }

    /// MAC formatted with colon separators, for logs.
    pub fn mac_decorated(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_format() {
        let uuid = device_uuid([0xde, 0xad, 0xbe, 0xef, 0x00, 0x42]);
        assert_eq!(uuid, "50c958a8-e839-4b96-b7ae-deadbeef0042");
    }

    #[test]
    fn list_mode_wire_values() {
        assert_eq!(CaPmtListMode::ListOnly.wire(), 0x03);
        assert_eq!(CaPmtListMode::ListOnlyUpdate.wire(), 0x05);
    }

    #[test]
    fn default_decrypt_disabled() {
        let cfg = DecryptConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.server_port, 15011);
        assert_eq!(cfg.list_mode, CaPmtListMode::ListOnlyUpdate);
    }
}
