// src/utils/system.rs
//! System-related utilities.
//!
//! The server runs with the least privilege it can and only raises its
//! effective uid around the host changes that need it: enabling forwarding,
//! masquerading, and creating TUN devices. [`PrivilegeManager`] is that
//! acquire/release pair, [`ElevatedScope`] keeps it balanced.

use thiserror::Error;
use tracing::{debug, error, info};

#[cfg(unix)]
use nix::unistd::{geteuid, getuid, seteuid, Uid};
#[cfg(unix)]
use parking_lot::Mutex;

/// Error type for privilege changes
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("Failed to acquire privileges: {0}")]
    Acquire(String),

    #[error("Failed to release privileges: {0}")]
    Release(String),

    #[error("Privileges released more often than acquired")]
    Unbalanced,
}

/// Proof that privileges were acquired; hand it back to release them
#[must_use = "privileges stay raised until the token is released"]
#[derive(Debug)]
pub struct PrivilegeToken {
    _private: (),
}

impl PrivilegeToken {
    /// Only [`PrivilegeManager`] implementations should mint tokens
    pub fn new() -> Self {
        Self { _private: () }
    }
}

/// Raises and lowers the privileges of the whole process
#[cfg_attr(test, mockall::automock)]
pub trait PrivilegeManager: Send + Sync + 'static {
    fn acquire(&self) -> Result<PrivilegeToken, PrivilegeError>;

    fn release(&self, token: PrivilegeToken) -> Result<(), PrivilegeError>;
}

/// Holds privileges until dropped or explicitly released
pub struct ElevatedScope<'a, P: PrivilegeManager + ?Sized> {
    manager: &'a P,
    token: Option<PrivilegeToken>,
}

impl<'a, P: PrivilegeManager + ?Sized> ElevatedScope<'a, P> {
    pub fn enter(manager: &'a P) -> Result<Self, PrivilegeError> {
        let token = manager.acquire()?;
        Ok(Self {
            manager,
            token: Some(token),
        })
    }

    /// Release now and report the outcome instead of logging it
    pub fn release(mut self) -> Result<(), PrivilegeError> {
        match self.token.take() {
            Some(token) => self.manager.release(token),
            None => Ok(()),
        }
    }
}

impl<P: PrivilegeManager + ?Sized> Drop for ElevatedScope<'_, P> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.manager.release(token) {
                error!("Failed to release privileges: {}", e);
            }
        }
    }
}

/// Effective-uid switching for a setuid-root binary (or one run as root).
///
/// Several sessions may provision interfaces at once while the effective
/// uid is process-wide, so holders are counted: the uid goes up with the
/// first holder and back down with the last.
#[cfg(unix)]
pub struct SetuidPrivileges {
    real_uid: Uid,
    holders: Mutex<usize>,
}

#[cfg(unix)]
impl SetuidPrivileges {
    /// Drop the effective uid to the real uid until privileges are needed
    pub fn new() -> Result<Self, PrivilegeError> {
        let real_uid = getuid();
        let effective_uid = geteuid();
        if effective_uid != real_uid {
            seteuid(real_uid).map_err(|e| {
                PrivilegeError::Release(format!("seteuid({}) failed: {}", real_uid, e))
            })?;
        }
        info!(
            "Running with real uid {} (effective uid was {})",
            real_uid, effective_uid
        );
        Ok(Self {
            real_uid,
            holders: Mutex::new(0),
        })
    }

    /// Acquire and release once to fail early when elevation is impossible
    pub fn probe(&self) -> Result<(), PrivilegeError> {
        let token = self.acquire()?;
        self.release(token)
    }

    pub fn real_uid(&self) -> Uid {
        self.real_uid
    }
}

#[cfg(unix)]
impl PrivilegeManager for SetuidPrivileges {
    fn acquire(&self) -> Result<PrivilegeToken, PrivilegeError> {
        let mut holders = self.holders.lock();
        if *holders == 0 {
            seteuid(Uid::from_raw(0))
                .map_err(|e| PrivilegeError::Acquire(format!("seteuid(0) failed: {}", e)))?;
            debug!("Raised effective uid to 0");
        }
        *holders += 1;
        Ok(PrivilegeToken::new())
    }

    fn release(&self, _token: PrivilegeToken) -> Result<(), PrivilegeError> {
        let mut holders = self.holders.lock();
        match *holders {
            0 => Err(PrivilegeError::Unbalanced),
            1 => {
                seteuid(self.real_uid).map_err(|e| {
                    PrivilegeError::Release(format!("seteuid({}) failed: {}", self.real_uid, e))
                })?;
                *holders = 0;
                debug!("Lowered effective uid to {}", self.real_uid);
                Ok(())
            }
            _ => {
                *holders -= 1;
                Ok(())
            }
        }
    }
}

/// Check if the current process is running as root
pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        geteuid().is_root()
    }

    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_releases_on_drop() {
        let mut manager = MockPrivilegeManager::new();
        manager
            .expect_acquire()
            .times(1)
            .returning(|| Ok(PrivilegeToken::new()));
        manager.expect_release().times(1).returning(|_| Ok(()));

        {
            let _scope = ElevatedScope::enter(&manager).unwrap();
        }
        manager.checkpoint();
    }

    #[test]
    fn test_explicit_release_reports_error_once() {
        let mut manager = MockPrivilegeManager::new();
        manager
            .expect_acquire()
            .times(1)
            .returning(|| Ok(PrivilegeToken::new()));
        manager
            .expect_release()
            .times(1)
            .returning(|_| Err(PrivilegeError::Release("denied".into())));

        let scope = ElevatedScope::enter(&manager).unwrap();
        assert!(matches!(scope.release(), Err(PrivilegeError::Release(_))));
    }

    #[test]
    fn test_failed_acquire_releases_nothing() {
        let mut manager = MockPrivilegeManager::new();
        manager
            .expect_acquire()
            .times(1)
            .returning(|| Err(PrivilegeError::Acquire("not setuid".into())));
        manager.expect_release().never();

        assert!(ElevatedScope::enter(&manager).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_release_without_acquire_is_unbalanced() {
        let privileges = SetuidPrivileges {
            real_uid: getuid(),
            holders: Mutex::new(0),
        };
        assert!(matches!(
            privileges.release(PrivilegeToken::new()),
            Err(PrivilegeError::Unbalanced)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_nested_holders_share_one_elevation() {
        if !is_root() {
            return;
        }
        let privileges = SetuidPrivileges {
            real_uid: getuid(),
            holders: Mutex::new(0),
        };

        let outer = ElevatedScope::enter(&privileges).unwrap();
        let inner = ElevatedScope::enter(&privileges).unwrap();
        assert_eq!(*privileges.holders.lock(), 2);

        inner.release().unwrap();
        assert_eq!(*privileges.holders.lock(), 1);
        outer.release().unwrap();
        assert_eq!(*privileges.holders.lock(), 0);
    }
}
