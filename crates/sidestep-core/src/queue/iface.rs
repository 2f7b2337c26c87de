//! Interface allow-list
//!
//! Queue messages carry in/out device indices; resolving an index to
//! a name costs a syscall, so resolved names are cached for the
//! process lifetime (indices are not recycled while a device exists).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;

fn cache() -> &'static RwLock<HashMap<u32, String>> {
    static CACHE: OnceLock<RwLock<HashMap<u32, String>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Resolve an interface index to its name, cached
fn iface_name(index: u32) -> String {
    if index == 0 {
        return String::new();
    }
    if let Some(name) = cache().read().get(&index) {
        return name.clone();
    }

    let mut buf = [0u8; libc::IF_NAMESIZE];
    let name = unsafe {
        if libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char).is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_bytes_until_nul(&buf)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        }
    };

    if !name.is_empty() {
        cache().write().insert(index, name.clone());
    }
    name
}

/// Whether a packet on these device indices passes the allow-list.
/// An empty list means all interfaces; an unresolvable index is
/// allowed rather than silently black-holing traffic.
pub fn matches_interface(allowed: &[String], indev: u32, outdev: u32) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let index = if outdev != 0 { outdev } else { indev };
    if index == 0 {
        return true;
    }

    let name = iface_name(index);
    if name.is_empty() {
        return true;
    }
    allowed.iter().any(|a| a == &name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_allows_all() {
        assert!(matches_interface(&[], 1, 2));
        assert!(matches_interface(&[], 0, 0));
    }

    #[test]
    fn test_unresolvable_index_allowed() {
        let allowed = vec!["eth0".to_string()];
        // index 0 means the kernel did not say; never block on that
        assert!(matches_interface(&allowed, 0, 0));
    }

    #[test]
    fn test_loopback_resolution() {
        // index 1 is lo on every Linux system
        let name = iface_name(1);
        if !name.is_empty() {
            assert!(matches_interface(&[name.clone()], 0, 1));
            assert!(!matches_interface(&["definitely-not-a-dev".to_string()], 0, 1));
        }
    }
}
