//! Linux capability manipulation for the privilege-drop pipeline (C6).
//!
//! Grounded on `wormhole/src/bin/wormhole-attach/main.rs`, which calls
//! `capset`/`prctl(PR_CAP_AMBIENT, ...)` directly via `libc::syscall`
//! rather than generating bindings for `linux/capability.h` (the approach
//! `mdavidsaver-sandbox/build.rs` takes, but its header isn't available
//! here and a hand-authored one would be unverifiable).

use nix::errno::Errno;

const _LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Clears the effective, permitted, and inheritable capability sets of the
/// calling process, and clears the ambient set (`spec.md` §4.6: "drop all
/// capabilities").
///
/// Called after `setresuid`/`setresgid` away from root (`launch.rs`'s step
/// ordering matches `endpoint_manager.py`'s: uid/gid drop first, then
/// capabilities), not before — a `setresuid` to a non-root uid does not by
/// itself clear permitted capabilities, so `capset` still has permission to
/// run at that point.
pub fn clear_all_capabilities() -> Result<(), Errno> {
    let header = CapUserHeader {
        version: _LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapUserData::default(), CapUserData::default()];

    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }

    clear_ambient_capabilities()
}

fn clear_ambient_capabilities() -> Result<(), Errno> {
    let rc = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Sets `PR_SET_NO_NEW_PRIVS`, permanently preventing the child (and any
/// descendant it execs) from regaining capabilities via a setuid/setcap
/// binary (`spec.md` §4.6).
pub fn set_no_new_privs() -> Result<(), Errno> {
    nix::sys::prctl::set_no_new_privs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_struct_layout_matches_kernel_abi() {
        assert_eq!(std::mem::size_of::<CapUserHeader>(), 8);
        assert_eq!(std::mem::size_of::<CapUserData>(), 12);
    }
}
