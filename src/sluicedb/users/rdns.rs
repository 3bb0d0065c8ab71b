use std::ffi::CStr;
use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::{warn, debug};

use crate::sluicedb::config::SLOW_NAME_LOOKUP_MILLIS;
use crate::sluicedb::mysql::protocol::proxy_protocol::normalize_ip;

// NI_MAXHOST
const MAX_HOST_LEN: usize = 1025;

/// Resolves the host name of addr with getnameinfo. Blocks, call it from a blocking thread.
/// Returns None if the address has no name.
pub fn reverse_lookup_blocking(addr: IpAddr) -> Option<String> {
    let addr = normalize_ip(addr);
    let mut host = [0 as libc::c_char; MAX_HOST_LEN];
    let ret = match addr {
        IpAddr::V4(v4) => {
            // Safety: sockaddr_in is plain old data, zeroed is a valid value
            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
            unsafe {
                libc::getnameinfo(
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of_val(&sa) as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD)
            }
        },
        IpAddr::V6(v6) => {
            let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_addr.s6_addr = v6.octets();
            unsafe {
                libc::getnameinfo(
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of_val(&sa) as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD)
            }
        },
    };
    if ret != 0 {
        debug!(%addr, code = ret, "reverse name lookup failed");
        return None;
    }
    // Safety: getnameinfo nul-terminates host on success
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

/// Resolves the host name of addr on tokio's blocking thread pool. Lookups slower
/// than SLOW_NAME_LOOKUP_MILLIS are logged, they hold up the client's authentication.
pub async fn reverse_lookup(addr: IpAddr) -> io::Result<Option<String>> {
    let start = Instant::now();
    let name = tokio::task::spawn_blocking(move || reverse_lookup_blocking(addr))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let elapsed = start.elapsed();
    if elapsed > Duration::from_millis(SLOW_NAME_LOOKUP_MILLIS) {
        warn!(%addr, elapsed_ms = elapsed.as_millis() as u64, "reverse name lookup was slow, consider skip_name_resolve");
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_does_not_fail_hard() {
        // The result depends on the host's resolver, only check that it completes
        let result = reverse_lookup("192.0.2.1".parse().unwrap()).await;
        assert!(result.is_ok());
    }
}
