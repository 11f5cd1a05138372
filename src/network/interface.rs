use std::net::{IpAddr, Ipv4Addr};

use super::{Bind, TransportError};

const CELLULAR_PREFIXES: &[&str] = &["rmnet", "pdp_ip", "ccmni", "wwan"];
const WIRELESS_PREFIXES: &[&str] = &["wl", "wifi", "ath"];

/// Local address a session binds or dials from
pub fn resolve(bind: &Bind) -> Result<IpAddr, TransportError> {
    match bind {
        Bind::Address(ip) => Ok(*ip),
        Bind::Interface(name) => interface_address(name)
            .map(IpAddr::V4)
            .ok_or_else(|| TransportError::InterfaceUnavailable(name.clone())),
        Bind::Wireless => wireless_address().map(IpAddr::V4),
    }
}

fn is_cellular(name: &str) -> bool {
    CELLULAR_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn is_wireless(name: &str) -> bool {
    if is_cellular(name) {
        return false;
    }
    let sysfs = std::path::Path::new("/sys/class/net").join(name);
    if sysfs.join("wireless").exists() || sysfs.join("phy80211").exists() {
        return true;
    }
    // Apple platforms put Wi-Fi on en0
    if cfg!(target_vendor = "apple") && name == "en0" {
        return true;
    }
    WIRELESS_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[cfg(unix)]
fn candidates() -> Vec<(String, Ipv4Addr)> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;
    use std::net::SocketAddrV4;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!(error = %e, "failed to enumerate interfaces");
            return Vec::new();
        }
    };
    addrs
        .filter(|iface| {
            iface.flags.contains(InterfaceFlags::IFF_UP)
                && !iface.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .filter_map(|iface| {
            let sin = iface.address.as_ref()?.as_sockaddr_in()?;
            let ip = *SocketAddrV4::from(*sin).ip();
            Some((iface.interface_name, ip))
        })
        .collect()
}

#[cfg(not(unix))]
fn candidates() -> Vec<(String, Ipv4Addr)> {
    Vec::new()
}

fn interface_address(name: &str) -> Option<Ipv4Addr> {
    candidates()
        .into_iter()
        .find(|(iface, _)| iface == name)
        .map(|(_, ip)| ip)
}

fn wireless_address() -> Result<Ipv4Addr, TransportError> {
    let found = candidates()
        .into_iter()
        .find(|(name, _)| is_wireless(name));
    match found {
        Some((name, ip)) => {
            tracing::debug!(interface = %name, %ip, "selected wireless interface");
            Ok(ip)
        }
        None => Err(TransportError::NoWirelessInterface),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_address() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(resolve(&Bind::Address(ip)).unwrap(), ip);
    }

    #[test]
    fn test_cellular_never_wireless() {
        assert!(is_cellular("rmnet_data0"));
        assert!(is_cellular("pdp_ip0"));
        assert!(!is_wireless("pdp_ip0"));
        assert!(!is_wireless("wwan0"));
    }

    #[test]
    fn test_wireless_names() {
        assert!(is_wireless("wlan0"));
        assert!(is_wireless("wlp3s0"));
        assert!(!is_wireless("lo"));
    }

    #[test]
    fn test_missing_interface() {
        let err = resolve(&Bind::Interface("no-such-if0".to_string())).unwrap_err();
        assert!(matches!(err, TransportError::InterfaceUnavailable(_)));
    }
}
