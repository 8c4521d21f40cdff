use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::subnet::Subnet;

/// A network interface as reported by [`InterfaceStorage`]: a name plus the subnets configured
/// on it.
pub struct Interface {
    name: String,
    subnets: Vec<Subnet>,
}

impl Interface {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    #[cfg(test)]
    pub(crate) fn for_test(name: impl Into<String>, subnets: Vec<Subnet>) -> Self {
        Self {
            name: name.into(),
            subnets,
        }
    }
}

/// Collaborator queried by `Manager::add` to validate that an interface exists, and by
/// `Manager::listen_config` to validate that a requested subnet actually falls within one of the
/// interface's configured subnets.
///
/// A small `Arc<dyn Trait + Send + Sync>` surface, matching this codebase's preference for
/// trait-object collaborators (`SocketFactory<S>`) over threading a generic parameter through
/// every component.
pub trait InterfaceStorage: Send + Sync {
    fn interface_by_name(&self, name: &str) -> Result<Interface>;
}

/// Default [`InterfaceStorage`] implementation, querying the OS via the raw `libc::getifaddrs`/
/// `freeifaddrs` FFI pair — the same confined-`unsafe`-module approach as
/// [`crate::platform::linux`]'s socket setup, rather than hand-written `/proc` or netlink parsing.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsInterfaceStorage;

impl InterfaceStorage for OsInterfaceStorage {
    fn interface_by_name(&self, name: &str) -> Result<Interface> {
        let subnets = list_subnets(name)?;

        if subnets.is_empty() {
            return Err(Error::InterfaceNotFound(name.to_string()));
        }

        Ok(Interface {
            name: name.to_string(),
            subnets,
        })
    }
}

#[cfg(target_os = "linux")]
fn list_subnets(name: &str) -> Result<Vec<Subnet>> {
    use std::ffi::CStr;

    let mut subnets = Vec::new();

    // SAFETY: `getifaddrs` populates `head` with a valid linked list (or leaves it null on
    // error), which we always pass to `freeifaddrs` exactly once before returning.
    unsafe {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut head) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let mut cursor = head;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;

            if entry.ifa_name.is_null() || entry.ifa_addr.is_null() || entry.ifa_netmask.is_null() {
                continue;
            }

            let ifa_name = CStr::from_ptr(entry.ifa_name).to_string_lossy();
            if ifa_name != name {
                continue;
            }

            let Some(addr) = sockaddr_to_ip(entry.ifa_addr) else {
                continue;
            };
            let Some(mask) = sockaddr_to_ip(entry.ifa_netmask) else {
                continue;
            };

            let prefix_len = mask_to_prefix_len(mask);
            if let Ok(subnet) = Subnet::new(addr, prefix_len) {
                subnets.push(subnet.masked());
            }
        }

        libc::freeifaddrs(head);
    }

    Ok(subnets)
}

#[cfg(target_os = "linux")]
/// # Safety
/// `addr` must be null or point at a valid `sockaddr` of at least `sockaddr_in`/`sockaddr_in6`
/// size for its `sa_family`.
unsafe fn sockaddr_to_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    if addr.is_null() {
        return None;
    }

    // SAFETY: delegated to the caller's precondition on `addr`.
    let family = unsafe { (*addr).sa_family as libc::c_int };
    match family {
        libc::AF_INET => {
            // SAFETY: `sa_family == AF_INET` guarantees `addr` points at a `sockaddr_in`.
            let addr: &libc::sockaddr_in = unsafe { &*(addr as *const libc::sockaddr_in) };
            Some(IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(
                addr.sin_addr.s_addr,
            ))))
        }
        libc::AF_INET6 => {
            // SAFETY: `sa_family == AF_INET6` guarantees `addr` points at a `sockaddr_in6`.
            let addr: &libc::sockaddr_in6 = unsafe { &*(addr as *const libc::sockaddr_in6) };
            Some(IpAddr::V6(std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn mask_to_prefix_len(mask: IpAddr) -> u8 {
    match mask {
        IpAddr::V4(mask) => u32::from(mask).count_ones() as u8,
        IpAddr::V6(mask) => mask.octets().iter().map(|byte| byte.count_ones() as u8).sum(),
    }
}

#[cfg(not(target_os = "linux"))]
fn list_subnets(_name: &str) -> Result<Vec<Subnet>> {
    Err(Error::Unsupported)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn mask_to_prefix_len_counts_set_bits() {
        assert_eq!(
            mask_to_prefix_len("255.255.255.0".parse().unwrap()),
            24
        );
        assert_eq!(mask_to_prefix_len("255.255.0.0".parse().unwrap()), 16);
    }
}
