//! Local interface addresses.
//!
//! Every address assigned to this host, read with `getifaddrs(3)`. A bin's
//! access point network usually has no default route, so the address of
//! the route towards a public host is not enough to recognise our own
//! broadcasts.

use std::net::{IpAddr, Ipv4Addr};

/// All IPv4 and IPv6 addresses of the host's interfaces, loopback included.
///
/// Falls back to loopback plus [`crate::udp::detect_local_ip`] if the
/// interface list cannot be read.
#[must_use]
pub fn local_addresses() -> Vec<IpAddr> {
    let mut addrs = interface_addresses();
    addrs.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    if let Some(ip) = crate::udp::detect_local_ip() {
        addrs.push(ip);
    }
    addrs.sort();
    addrs.dedup();
    addrs
}

#[cfg(unix)]
fn interface_addresses() -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs is a standard POSIX call. On success it stores the
    // head of a list that is released with freeifaddrs below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        tracing::debug!(
            "getifaddrs failed: {}",
            std::io::Error::last_os_error()
        );
        return addrs;
    }

    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor is a non-null node of the list returned above and
        // stays valid until freeifaddrs.
        let entry = unsafe { &*cursor };
        // SAFETY: ifa_addr is either null or points to a sockaddr whose
        // concrete layout is given by sa_family.
        if let Some(ip) = unsafe { sockaddr_ip(entry.ifa_addr) } {
            addrs.push(ip);
        }
        cursor = entry.ifa_next;
    }

    // SAFETY: head came from a successful getifaddrs and is freed once.
    unsafe { libc::freeifaddrs(head) };
    addrs
}

/// # Safety
///
/// `addr` must be null or point to a valid `sockaddr` of its family.
#[cfg(unix)]
unsafe fn sockaddr_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    if addr.is_null() {
        return None;
    }
    // SAFETY: addr is non-null and valid per the caller contract.
    let family = i32::from(unsafe { (*addr).sa_family });
    match family {
        libc::AF_INET => {
            // SAFETY: AF_INET entries are sockaddr_in.
            let sin = unsafe { &*addr.cast::<libc::sockaddr_in>() };
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            // SAFETY: AF_INET6 entries are sockaddr_in6.
            let sin6 = unsafe { &*addr.cast::<libc::sockaddr_in6>() };
            Some(IpAddr::V6(sin6.sin6_addr.s6_addr.into()))
        }
        _ => None,
    }
}

#[cfg(not(unix))]
fn interface_addresses() -> Vec<IpAddr> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_addresses_include_loopback() {
        let addrs = local_addresses();
        assert!(addrs.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_local_addresses_sorted_unique() {
        let addrs = local_addresses();
        assert!(addrs.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[cfg(unix)]
    #[test]
    fn test_interface_addresses_list_loopback() {
        // Every unix host has a loopback interface with 127.0.0.1.
        assert!(interface_addresses().contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
