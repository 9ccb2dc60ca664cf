// src/device/registry.rs
//! Process-wide driver library bookkeeping
//!
//! The driver library is initialised when the first card connects and torn
//! down after the last one disconnects. The same table records which
//! addresses are owned so a second handle to a card fails fast.

use parking_lot::{const_mutex, Mutex};
use std::collections::BTreeSet;
use tracing::info;

use crate::error::{CardError, CardResult};
use crate::hal::DeviceAddress;

struct Library {
    refs: usize,
    claimed: BTreeSet<DeviceAddress>,
}

static LIBRARY: Mutex<Library> = const_mutex(Library {
    refs: 0,
    claimed: BTreeSet::new(),
});

/// Ownership of one card address; dropping it releases the claim
#[derive(Debug)]
pub struct DriverLease {
    address: DeviceAddress,
}

impl DriverLease {
    /// Claim `address`, initialising the library on first use
    pub fn acquire(address: &DeviceAddress) -> CardResult<Self> {
        let mut library = LIBRARY.lock();
        if !library.claimed.insert(address.clone()) {
            return Err(CardError::DeviceInUse {
                address: address.to_string(),
            });
        }
        library.refs += 1;
        if library.refs == 1 {
            info!("driver library initialised");
        }
        Ok(Self {
            address: address.clone(),
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }
}

impl Drop for DriverLease {
    fn drop(&mut self) {
        let mut library = LIBRARY.lock();
        library.claimed.remove(&self.address);
        library.refs = library.refs.saturating_sub(1);
        if library.refs == 0 {
            info!("driver library released");
        }
    }
}

/// Open leases in this process
pub fn library_refcount() -> usize {
    LIBRARY.lock().refs
}

/// True while some handle owns `address`
pub fn is_claimed(address: &DeviceAddress) -> bool {
    LIBRARY.lock().claimed.contains(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_refcount_follows_leases() {
        let before = library_refcount();
        let a = DriverLease::acquire(&DeviceAddress::new("/registry-test/a")).unwrap();
        let b = DriverLease::acquire(&DeviceAddress::new("/registry-test/b")).unwrap();
        assert_eq!(library_refcount(), before + 2);
        drop(a);
        assert_eq!(library_refcount(), before + 1);
        drop(b);
        assert_eq!(library_refcount(), before);
    }

    #[test]
    #[serial]
    fn test_second_claim_rejected() {
        let address = DeviceAddress::new("/registry-test/c");
        let lease = DriverLease::acquire(&address).unwrap();
        let err = DriverLease::acquire(&address).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceInUse);
        drop(lease);
        assert!(!is_claimed(&address));
        assert!(DriverLease::acquire(&address).is_ok());
    }
}
