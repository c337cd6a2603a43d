//! Capability manipulation for the container init.
//!
//! The kernel interface is used directly: bounding-set entries outside the
//! whitelist are dropped with prctl, and after switching to the dyno uid
//! the remaining sets are installed with capset(2).

use nix::errno::Errno;

use crate::error::{ContainerError, Result};

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Fallback when /proc does not expose the last capability number.
const CAP_LAST_FALLBACK: u32 = 40;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Capability names resolvable in a container spec.
const CAP_NAMES: &[(&str, u32)] = &[
    ("CHOWN", 0),
    ("DAC_OVERRIDE", 1),
    ("DAC_READ_SEARCH", 2),
    ("FOWNER", 3),
    ("FSETID", 4),
    ("KILL", 5),
    ("SETGID", 6),
    ("SETUID", 7),
    ("SETPCAP", 8),
    ("LINUX_IMMUTABLE", 9),
    ("NET_BIND_SERVICE", 10),
    ("NET_BROADCAST", 11),
    ("NET_ADMIN", 12),
    ("NET_RAW", 13),
    ("IPC_LOCK", 14),
    ("IPC_OWNER", 15),
    ("SYS_MODULE", 16),
    ("SYS_RAWIO", 17),
    ("SYS_CHROOT", 18),
    ("SYS_PTRACE", 19),
    ("SYS_PACCT", 20),
    ("SYS_ADMIN", 21),
    ("SYS_BOOT", 22),
    ("SYS_NICE", 23),
    ("SYS_RESOURCE", 24),
    ("SYS_TIME", 25),
    ("SYS_TTY_CONFIG", 26),
    ("MKNOD", 27),
    ("LEASE", 28),
    ("AUDIT_WRITE", 29),
    ("AUDIT_CONTROL", 30),
    ("SETFCAP", 31),
    ("MAC_OVERRIDE", 32),
    ("MAC_ADMIN", 33),
    ("SYSLOG", 34),
    ("WAKE_ALARM", 35),
    ("BLOCK_SUSPEND", 36),
    ("AUDIT_READ", 37),
    ("PERFMON", 38),
    ("BPF", 39),
    ("CHECKPOINT_RESTORE", 40),
];

/// Resolves a whitelist of capability names to numbers.
///
/// # Errors
///
/// Returns an error for unknown capability names; a typo here must not
/// silently widen the sandbox.
pub fn resolve(names: &[String]) -> Result<Vec<u32>> {
    names
        .iter()
        .map(|name| {
            CAP_NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
                .ok_or_else(|| ContainerError::Init(format!("unknown capability {name:?}")))
        })
        .collect()
}

fn cap_last() -> u32 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(CAP_LAST_FALLBACK)
}

/// Drops every bounding-set capability outside `allowed`. Requires
/// CAP_SETPCAP, so it must run before the uid switch.
///
/// # Errors
///
/// Returns an error if a drop fails.
pub fn drop_bounding_except(allowed: &[u32]) -> Result<()> {
    for cap in 0..=cap_last() {
        if allowed.contains(&cap) {
            continue;
        }
        let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, libc::c_ulong::from(cap), 0, 0, 0) };
        if ret != 0 {
            let errno = Errno::last();
            // Caps unknown to this kernel read as EINVAL; that is fine.
            if errno != Errno::EINVAL {
                return Err(ContainerError::sys(
                    format!("prctl(PR_CAPBSET_DROP, {cap})"),
                    errno,
                ));
            }
        }
    }
    Ok(())
}

/// Installs `allowed` as the effective, permitted and inheritable sets.
/// Run after the uid switch (with keepcaps) to end with exactly the
/// whitelist.
///
/// # Errors
///
/// Returns an error if capset fails.
pub fn install(allowed: &[u32]) -> Result<()> {
    let mut data = [CapUserData::default(); 2];
    for &cap in allowed {
        let idx = (cap / 32) as usize;
        if idx >= data.len() {
            continue;
        }
        let bit = 1u32 << (cap % 32);
        data[idx].effective |= bit;
        data[idx].permitted |= bit;
        data[idx].inheritable |= bit;
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let ret = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if ret != 0 {
        return Err(ContainerError::sys("capset", Errno::last()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::DEFAULT_CAPABILITIES;

    #[test]
    fn default_whitelist_resolves() {
        let names: Vec<String> = DEFAULT_CAPABILITIES.iter().map(|s| (*s).to_string()).collect();
        let caps = resolve(&names).unwrap();
        assert_eq!(caps.len(), names.len());
        assert!(caps.contains(&18)); // SYS_CHROOT
        assert!(caps.contains(&29)); // AUDIT_WRITE
        assert!(!caps.contains(&21)); // SYS_ADMIN never whitelisted
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(resolve(&["NOT_A_CAP".to_string()]).is_err());
    }
}
