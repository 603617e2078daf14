//! Socket fd protection: exempting outbound sockets from TUN routing.

use parking_lot::RwLock;
#[cfg(any(target_os = "linux", target_os = "android"))]
use tracing::{debug, warn};

/// Exempts a socket fd from the TUN routing rules, typically by binding it to
/// the underlying physical interface. Must be callable from any task.
pub trait Protector: Send + Sync {
    fn protect(&self, fd: i32) -> bool;
}

/// Protector that accepts every fd; installed when protection is disabled.
pub struct NoopProtector;

impl Protector for NoopProtector {
    fn protect(&self, _fd: i32) -> bool {
        true
    }
}

/// Closure adapter for platform layers that hand a bare callback.
pub struct FnProtector<F>(pub F);

impl<F: Fn(i32) -> bool + Send + Sync> Protector for FnProtector<F> {
    fn protect(&self, fd: i32) -> bool {
        (self.0)(fd)
    }
}

static UPSTREAM_INTERFACE: RwLock<Option<String>> = RwLock::new(None);

/// Record the name of the upstream network interface; ping sockets are bound
/// to it when no BindUpstream protector is configured.
pub fn set_upstream_interface(name: Option<String>) {
    *UPSTREAM_INTERFACE.write() = name;
}

/// Bind `fd` to the recorded upstream interface.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn bind_to_upstream(fd: i32) {
    let guard = UPSTREAM_INTERFACE.read();
    let Some(name) = guard.as_deref() else { return };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            name.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(
            "failed to bind fd {} to {}: {}",
            fd,
            name,
            std::io::Error::last_os_error()
        );
    } else {
        debug!("bound ping socket {} to {}", fd, name);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn bind_to_upstream(_fd: i32) {}
