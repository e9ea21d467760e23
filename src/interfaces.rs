//! OS network interface table
//!
//! Both readiness detection and traffic statistics work from one snapshot of
//! the interface table: names, descriptions, operational state, assigned
//! addresses and cumulative counters.

use serde::Serialize;
use std::net::IpAddr;

use crate::error::DriverError;

/// One row of the interface table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterfaceSnapshot {
    pub index: u32,
    /// Kernel name (`tun0`) or adapter GUID string on Windows
    pub name: String,
    /// Friendly name shown to users
    pub alias: String,
    pub description: String,
    pub is_up: bool,
    pub addresses: Vec<IpAddr>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

impl InterfaceSnapshot {
    /// Case-insensitive substring match against description, alias and name
    pub fn matches_any(&self, patterns: &[String]) -> bool {
        let fields = [
            self.description.to_lowercase(),
            self.alias.to_lowercase(),
            self.name.to_lowercase(),
        ];
        patterns.iter().any(|pattern| {
            let pattern = pattern.to_lowercase();
            !pattern.is_empty() && fields.iter().any(|field| field.contains(&pattern))
        })
    }

    /// Whether the adapter answers to `name` (kernel name or friendly name)
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.alias.eq_ignore_ascii_case(name)
    }

    /// Operationally up with at least one assigned address
    pub fn is_ready(&self) -> bool {
        self.is_up && !self.addresses.is_empty()
    }
}

/// Source of interface table snapshots
pub trait InterfaceTable: Send + Sync {
    fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>, DriverError>;
}

/// Interface table of the host operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaceTable;

impl SystemInterfaceTable {
    pub fn new() -> Self {
        Self
    }
}

impl InterfaceTable for SystemInterfaceTable {
    fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>, DriverError> {
        platform::collect()
    }
}

#[cfg(unix)]
mod platform {
    use std::collections::BTreeMap;
    use std::ffi::CStr;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::InterfaceSnapshot;
    use crate::error::DriverError;

    pub(super) fn collect() -> Result<Vec<InterfaceSnapshot>, DriverError> {
        let mut table: BTreeMap<String, InterfaceSnapshot> = BTreeMap::new();

        unsafe {
            let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
            if libc::getifaddrs(&mut ifap) != 0 {
                return Err(DriverError::AdapterEnumerationFailed(
                    io::Error::last_os_error().to_string(),
                ));
            }

            let mut cursor = ifap;
            while !cursor.is_null() {
                let ifa = &*cursor;
                cursor = ifa.ifa_next;

                if ifa.ifa_name.is_null() {
                    continue;
                }
                let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
                let entry = table.entry(name.clone()).or_insert_with(|| InterfaceSnapshot {
                    name: name.clone(),
                    alias: name.clone(),
                    description: name,
                    ..Default::default()
                });

                let flags = ifa.ifa_flags as libc::c_int;
                if flags & libc::IFF_UP != 0 && flags & libc::IFF_RUNNING != 0 {
                    entry.is_up = true;
                }

                if ifa.ifa_addr.is_null() {
                    continue;
                }
                match (*ifa.ifa_addr).sa_family as libc::c_int {
                    libc::AF_INET => {
                        let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        entry.addresses.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                            sin.sin_addr.s_addr,
                        ))));
                    }
                    libc::AF_INET6 => {
                        let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                        entry
                            .addresses
                            .push(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)));
                    }
                    _ => {}
                }
            }

            libc::freeifaddrs(ifap);
        }

        let mut interfaces: Vec<InterfaceSnapshot> = table.into_values().collect();
        for iface in &mut interfaces {
            fill_sysfs_details(iface);
        }
        Ok(interfaces)
    }

    /// Counters and index from /sys/class/net (Linux only; zero elsewhere)
    fn fill_sysfs_details(iface: &mut InterfaceSnapshot) {
        let base = format!("/sys/class/net/{}", iface.name);
        iface.index = read_u64(&format!("{}/ifindex", base)).unwrap_or(0) as u32;
        iface.rx_bytes = read_u64(&format!("{}/statistics/rx_bytes", base)).unwrap_or(0);
        iface.tx_bytes = read_u64(&format!("{}/statistics/tx_bytes", base)).unwrap_or(0);
        iface.rx_packets = read_u64(&format!("{}/statistics/rx_packets", base)).unwrap_or(0);
        iface.tx_packets = read_u64(&format!("{}/statistics/tx_packets", base)).unwrap_or(0);

        if let Ok(alias) = std::fs::read_to_string(format!("{}/ifalias", base)) {
            let alias = alias.trim();
            if !alias.is_empty() {
                iface.alias = alias.to_string();
            }
        }
    }

    fn read_u64(path: &str) -> Option<u64> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

#[cfg(windows)]
mod platform {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use windows::Win32::Foundation::{ERROR_BUFFER_OVERFLOW, NO_ERROR};
    use windows::Win32::NetworkManagement::IpHelper::{
        GetAdaptersAddresses, GetIfEntry2, GAA_FLAG_INCLUDE_PREFIX, IP_ADAPTER_ADDRESSES_LH,
        MIB_IF_ROW2,
    };
    use windows::Win32::NetworkManagement::Ndis::IfOperStatusUp;
    use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6, AF_UNSPEC, SOCKADDR_IN, SOCKADDR_IN6};

    use super::InterfaceSnapshot;
    use crate::error::DriverError;

    pub(super) fn collect() -> Result<Vec<InterfaceSnapshot>, DriverError> {
        let mut size: u32 = 16 * 1024;
        // u64 storage keeps the adapter records 8-byte aligned
        let mut buffer: Vec<u64>;
        let mut attempts = 0;
        loop {
            buffer = vec![0u64; (size as usize + 7) / 8];
            let rc = unsafe {
                GetAdaptersAddresses(
                    AF_UNSPEC.0 as u32,
                    GAA_FLAG_INCLUDE_PREFIX,
                    None,
                    Some(buffer.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH),
                    &mut size,
                )
            };
            attempts += 1;
            if rc == ERROR_BUFFER_OVERFLOW.0 && attempts < 4 {
                continue;
            }
            if rc != NO_ERROR.0 {
                return Err(DriverError::AdapterEnumerationFailed(format!(
                    "GetAdaptersAddresses returned {}",
                    rc
                )));
            }
            break;
        }

        let mut interfaces = Vec::new();
        let mut cursor = buffer.as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;
        while !cursor.is_null() {
            let adapter = unsafe { &*cursor };
            cursor = adapter.Next;

            let mut iface = InterfaceSnapshot {
                index: unsafe { adapter.Anonymous1.Anonymous.IfIndex },
                name: unsafe { adapter.AdapterName.to_string() }.unwrap_or_default(),
                alias: unsafe { adapter.FriendlyName.to_string() }.unwrap_or_default(),
                description: unsafe { adapter.Description.to_string() }.unwrap_or_default(),
                is_up: adapter.OperStatus == IfOperStatusUp,
                ..Default::default()
            };

            let mut unicast = adapter.FirstUnicastAddress;
            while !unicast.is_null() {
                let entry = unsafe { &*unicast };
                unicast = entry.Next;
                let sockaddr = entry.Address.lpSockaddr;
                if sockaddr.is_null() {
                    continue;
                }
                unsafe {
                    let family = (*sockaddr).sa_family;
                    if family == AF_INET {
                        let sin = &*(sockaddr as *const SOCKADDR_IN);
                        iface.addresses.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                            sin.sin_addr.S_un.S_addr,
                        ))));
                    } else if family == AF_INET6 {
                        let sin6 = &*(sockaddr as *const SOCKADDR_IN6);
                        iface
                            .addresses
                            .push(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.u.Byte)));
                    }
                }
            }

            let mut row = MIB_IF_ROW2 {
                InterfaceIndex: iface.index,
                ..Default::default()
            };
            if unsafe { GetIfEntry2(&mut row) } == NO_ERROR {
                iface.rx_bytes = row.InOctets;
                iface.tx_bytes = row.OutOctets;
                iface.rx_packets = row.InUcastPkts + row.InNUcastPkts;
                iface.tx_packets = row.OutUcastPkts + row.OutNUcastPkts;
            }

            interfaces.push(iface);
        }

        Ok(interfaces)
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use super::InterfaceSnapshot;
    use crate::error::DriverError;

    pub(super) fn collect() -> Result<Vec<InterfaceSnapshot>, DriverError> {
        Err(DriverError::AdapterEnumerationFailed(
            "interface enumeration not supported on this platform".to_string(),
        ))
    }
}
