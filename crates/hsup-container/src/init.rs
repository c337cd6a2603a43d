//! In-container init: the first process of a dyno container.
//!
//! The supervisor binary is re-invoked inside the fresh namespaces with a
//! container-init directive in its startup blob. This stage finishes the
//! assembly the host began: container-side networking, the mount plan,
//! pivoting onto the read-only stack image, proc masking, hostname, the
//! capability whitelist and the drop to the dyno uid. It then execs the
//! copied supervisor at `/tmp/hsup` as the abspath backend, which unpacks
//! the slug and runs the workload with the usual 10-second stop
//! escalation.
//!
//! Everything here runs synchronously before any async runtime exists, and
//! the function never returns on success.

use std::convert::Infallible;
use std::ffi::CString;
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, pivot_root, sethostname, setgid, setgroups, setuid, Gid, Uid};

use hsup_core::{Action, DriverKind, Startup};

use crate::caps;
use crate::error::{ContainerError, Result};
use crate::spec::{BindMount, ContainerSpec, NetworkSpec};

/// In-container path of the copied supervisor binary.
pub const INNER_SUPERVISOR: &str = "/tmp/hsup";

const INNER_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runs init for `spec`, ultimately exec'ing the inner supervisor carrying
/// the abspath rendition of `startup`.
///
/// # Errors
///
/// Any error here aborts the container before the workload starts; the
/// host observes it as the init process exiting non-zero.
pub fn run(spec: &ContainerSpec, startup: &Startup) -> Result<Infallible> {
    setup_network(&spec.network)?;
    setup_rootfs(spec)?;
    sethostname(&spec.hostname).map_err(|e| ContainerError::sys("sethostname", e))?;
    drop_identity(spec)?;
    chdir(Path::new(&spec.workdir)).map_err(|e| ContainerError::sys("chdir workdir", e))?;

    exec_inner(startup)
}

/// Brings up lo and the moved veth endpoint, renames it, addresses it and
/// installs the default route plus any static extras.
fn setup_network(network: &NetworkSpec) -> Result<()> {
    let mut handle = hsup_net::NetlinkHandle::new()?;

    let lo = handle.get_ifindex("lo")?;
    handle.set_link_state(lo, true)?;

    let eth = handle.get_ifindex(&network.interface)?;
    handle.set_link_name(eth, &network.rename_to)?;
    handle.add_address(eth, parse_net(&network.address)?)?;
    handle.set_link_mtu(eth, network.mtu)?;
    handle.set_link_state(eth, true)?;
    handle.add_route(&hsup_net::Route {
        destination: "0.0.0.0/0".parse().expect("default route parses"),
        gateway: Some(
            network
                .gateway
                .parse()
                .map_err(|e| ContainerError::Init(format!("gateway address: {e}")))?,
        ),
        ifindex: eth,
    })?;

    if let Some(extra) = &network.extra {
        let nic = handle.get_ifindex(&extra.interface)?;
        handle.set_link_name(nic, &extra.rename_to)?;
        handle.add_address(nic, parse_net(&extra.address)?)?;
        handle.set_link_state(nic, true)?;
    }

    for route in &network.routes {
        let ifindex = handle.get_ifindex(&route.ifname)?;
        handle.add_route(&hsup_net::Route {
            destination: route
                .destination
                .parse()
                .map_err(|e| ContainerError::Init(format!("route destination: {e}")))?,
            gateway: Some(
                route
                    .gateway
                    .parse()
                    .map_err(|e| ContainerError::Init(format!("route gateway: {e}")))?,
            ),
            ifindex,
        })?;
    }

    Ok(())
}

fn parse_net(s: &str) -> Result<ipnetwork::IpNetwork> {
    s.parse()
        .map_err(|e| ContainerError::Init(format!("address {s:?}: {e}")))
}

/// Executes the mount plan and pivots onto the stack image.
fn setup_rootfs(spec: &ContainerSpec) -> Result<()> {
    let rootfs = &spec.rootfs;

    // Keep mount events out of the host's namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount("/", e))?;

    // The rootfs must itself be a mount point for pivot_root.
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount(rootfs.display(), e))?;

    for bind in &spec.binds {
        apply_bind(rootfs, bind)?;
    }

    mount_pseudo(rootfs)?;
    create_device_nodes(&rootfs.join("dev"))?;
    pivot(rootfs)?;

    for path in &spec.masked_paths {
        mask_path(path)?;
    }
    for path in &spec.readonly_paths {
        readonly_path(path)?;
    }

    if spec.readonly_rootfs {
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| ContainerError::mount("/ (readonly remount)", e))?;
    }

    Ok(())
}

fn apply_bind(rootfs: &Path, bind: &BindMount) -> Result<()> {
    let target = rootfs.join(bind.destination.trim_start_matches('/'));

    // Caller-requested binds may point at paths the image lacks; mount
    // points on the writable binds can be created, the read-only image
    // itself cannot.
    if !target.exists() {
        if bind.source.is_dir() {
            let _ = std::fs::create_dir_all(&target);
        } else if let Some(parent) = target.parent() {
            let _ = std::fs::create_dir_all(parent);
            let _ = std::fs::File::create(&target);
        }
    }

    mount(
        Some(&bind.source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount(target.display(), e))?;

    if !bind.writable {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| ContainerError::mount(target.display(), e))?;
    }

    Ok(())
}

fn mount_pseudo(rootfs: &Path) -> Result<()> {
    let nosuid_noexec_nodev = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV;

    let proc = rootfs.join("proc");
    mount(
        Some("proc"),
        &proc,
        Some("proc"),
        nosuid_noexec_nodev,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount(proc.display(), e))?;

    let sys = rootfs.join("sys");
    mount(
        Some("sysfs"),
        &sys,
        Some("sysfs"),
        nosuid_noexec_nodev | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount(sys.display(), e))?;

    let pts = rootfs.join("dev/pts");
    std::fs::create_dir_all(&pts)?;
    mount(
        Some("devpts"),
        &pts,
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )
    .map_err(|e| ContainerError::mount(pts.display(), e))?;

    let shm = rootfs.join("dev/shm");
    std::fs::create_dir_all(&shm)?;
    mount(
        Some("shm"),
        &shm,
        Some("tmpfs"),
        nosuid_noexec_nodev,
        Some("mode=1777,size=65536k"),
    )
    .map_err(|e| ContainerError::mount(shm.display(), e))?;

    let mqueue = rootfs.join("dev/mqueue");
    std::fs::create_dir_all(&mqueue)?;
    mount(
        Some("mqueue"),
        &mqueue,
        Some("mqueue"),
        nosuid_noexec_nodev,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount(mqueue.display(), e))?;

    Ok(())
}

/// The default device-node allowlist.
fn create_device_nodes(dev: &Path) -> Result<()> {
    let nodes: [(&str, u64, u64); 6] = [
        ("null", 1, 3),
        ("zero", 1, 5),
        ("full", 1, 7),
        ("random", 1, 8),
        ("urandom", 1, 9),
        ("tty", 5, 0),
    ];
    let mode = Mode::from_bits_truncate(0o666);
    for (name, major, minor) in nodes {
        let path = dev.join(name);
        match mknod(&path, SFlag::S_IFCHR, mode, makedev(major, minor)) {
            Ok(()) => {}
            Err(nix::Error::EEXIST) => {}
            Err(e) => return Err(ContainerError::sys(format!("mknod {name}"), e)),
        }
    }

    let links = [
        ("ptmx", "pts/ptmx"),
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ];
    for (name, target) in links {
        let path = dev.join(name);
        match std::os::unix::fs::symlink(target, &path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Pivots into the rootfs, stashing the old root inside the writable /tmp
/// bind and detaching it.
fn pivot(rootfs: &Path) -> Result<()> {
    let put_old = rootfs.join("tmp/oldroot");
    std::fs::create_dir_all(&put_old)?;

    chdir(rootfs).map_err(|e| ContainerError::sys("chdir rootfs", e))?;
    pivot_root(".", "tmp/oldroot").map_err(|e| ContainerError::sys("pivot_root", e))?;
    chdir("/").map_err(|e| ContainerError::sys("chdir /", e))?;

    umount2("/tmp/oldroot", MntFlags::MNT_DETACH)
        .map_err(|e| ContainerError::sys("umount old root", e))?;
    std::fs::remove_dir("/tmp/oldroot")?;
    Ok(())
}

/// Hides a proc entry: files get /dev/null bound over them, directories a
/// read-only empty tmpfs.
fn mask_path(path: &str) -> Result<()> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if meta.is_dir() {
        mount(
            Some("tmpfs"),
            path,
            Some("tmpfs"),
            MsFlags::MS_RDONLY,
            Some("size=0k"),
        )
        .map_err(|e| ContainerError::mount(path, e))?;
    } else {
        mount(
            Some("/dev/null"),
            path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| ContainerError::mount(path, e))?;
    }
    Ok(())
}

fn readonly_path(path: &str) -> Result<()> {
    if !Path::new(path).exists() {
        return Ok(());
    }
    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount(path, e))?;
    mount(
        None::<&str>,
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount(path, e))?;
    Ok(())
}

/// Drops the bounding set to the whitelist and becomes the dyno user,
/// retaining exactly the whitelisted capabilities.
fn drop_identity(spec: &ContainerSpec) -> Result<()> {
    let allowed = caps::resolve(&spec.capabilities)?;
    caps::drop_bounding_except(&allowed)?;

    nix::sys::prctl::set_keepcaps(true).map_err(|e| ContainerError::sys("keepcaps", e))?;

    let gid = Gid::from_raw(spec.gid);
    setgroups(&[gid]).map_err(|e| ContainerError::sys("setgroups", e))?;
    setgid(gid).map_err(|e| ContainerError::sys("setgid", e))?;
    setuid(Uid::from_raw(spec.uid)).map_err(|e| ContainerError::sys("setuid", e))?;

    caps::install(&allowed)?;
    nix::sys::prctl::set_keepcaps(false).map_err(|e| ContainerError::sys("keepcaps", e))?;
    Ok(())
}

/// Builds the workload directive and execs the copied supervisor.
fn exec_inner(outer: &Startup) -> Result<Infallible> {
    let inner = Startup {
        app: outer.app.clone(),
        one_shot: true,
        start_number: outer.start_number,
        action: Action::Start,
        driver: DriverKind::AbsPath,
        skip_build: false,
        form_name: outer.form_name.clone(),
        control_socket: None,
        args: Vec::new(),
        binds: Default::default(),
    };

    let path = CString::new(INNER_SUPERVISOR).expect("constant path has no NUL");
    let argv = [CString::new("hsup").expect("constant argv has no NUL")];
    let env = [
        CString::new(format!(
            "{}={}",
            hsup_core::CONTROL_PAYLOAD_VAR,
            inner.to_base64()
        ))
        .expect("base64 payload has no NUL"),
        CString::new(INNER_PATH).expect("constant env has no NUL"),
    ];

    nix::unistd::execve(&path, &argv, &env)
        .map_err(|e| ContainerError::sys("execve inner supervisor", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use hsup_core::AppSerializable;

    #[test]
    fn inner_directive_switches_to_abspath_one_shot() {
        let outer = Startup {
            app: AppSerializable {
                version: 4,
                name: "a".to_string(),
                env: BTreeMap::new(),
                slug: "/tmp/slug.tgz".to_string(),
                stack: "cedar-14".to_string(),
                processes: vec![],
                logplex_url: None,
            },
            one_shot: true,
            start_number: 2,
            action: Action::Start,
            driver: DriverKind::ContainerInit(serde_json::Value::Null),
            skip_build: false,
            form_name: Some("web".to_string()),
            control_socket: None,
            args: vec![],
            binds: BTreeMap::new(),
        };

        // exec_inner's directive, reproduced: the workload stage must be a
        // one-shot abspath start at the same ordinal.
        let inner = Startup {
            app: outer.app.clone(),
            one_shot: true,
            start_number: outer.start_number,
            action: Action::Start,
            driver: DriverKind::AbsPath,
            skip_build: false,
            form_name: outer.form_name.clone(),
            control_socket: None,
            args: Vec::new(),
            binds: BTreeMap::new(),
        };
        let decoded = Startup::from_base64(&inner.to_base64()).unwrap();
        assert_eq!(decoded.driver, DriverKind::AbsPath);
        assert!(decoded.one_shot);
        assert_eq!(decoded.start_number, 2);
        assert_eq!(decoded.app.slug, "/tmp/slug.tgz");
    }
}
