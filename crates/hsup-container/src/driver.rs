//! Host-side container backend.
//!
//! Start assembles everything a dyno container needs (allocated uid and
//! /30 subnet, per-container data directory, read-only stack image bind,
//! synthesized passwd, veth pair and NAT), then clones the supervisor
//! binary as init inside fresh namespaces. A terminal-wait task reaps the
//! init process and garbage-collects every allocated resource exactly once.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{info, warn};

use hsup_allocator::Allocator;
use hsup_core::{
    ContainerSlot, DriverKind, DynoDriver, Error, Executor, ExitStatus, Release, Result, SlugWhere,
    Startup,
};
use hsup_net::{NetConfig, NetlinkHandle, PortMap, VlanKind};

use crate::cgroup;
use crate::error::ContainerError;
use crate::spec::{ContainerSpec, ExtraNicSpec, NetworkSpec, RouteSpec};
use crate::stack;

/// Cap on endpoint teardown during container GC.
const NET_GC_BUDGET: Duration = Duration::from_secs(10);

/// Runs each dyno as init of its own Linux container.
pub struct ContainerDriver {
    stacks_dir: PathBuf,
    containers_dir: PathBuf,
    allocator: Arc<Allocator>,
    net: NetConfig,
}

/// Host-side resources to tear down when a container's init exits.
struct Teardown {
    uuid: String,
    uid: u32,
    data_dir: PathBuf,
    writable_dirs: Vec<PathBuf>,
    rootfs: PathBuf,
    veth_host: String,
    port_map: Option<PortMap>,
    host_port: Option<u16>,
}

impl ContainerDriver {
    /// Creates the backend rooted at `work_dir`, reading network policy
    /// from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if state directories cannot be created or the
    /// policy is invalid.
    pub fn new(work_dir: &Path) -> Result<Self> {
        let net = NetConfig::from_env().map_err(Error::driver)?;
        let stacks_dir = work_dir.join("stacks");
        let containers_dir = work_dir.join("containers");
        std::fs::create_dir_all(&stacks_dir)?;
        std::fs::create_dir_all(&containers_dir)?;

        let allocator = Allocator::new(work_dir, net.private_subnet, net.uid_min, net.uid_max)
            .map_err(Error::driver)?;

        Ok(Self {
            stacks_dir,
            containers_dir,
            allocator: Arc::new(allocator),
            net,
        })
    }

    fn masquerade_block(&self) -> Ipv4Network {
        Ipv4Network::new(self.net.private_subnet.network(), self.net.private_subnet.prefix())
            .expect("normalizing a valid block cannot fail")
    }

    /// Everything between uid reservation and the spawned init process.
    #[allow(clippy::too_many_lines)]
    fn assemble(&self, ex: &Arc<Executor>, uid: u32, uuid: &str) -> std::result::Result<(), ContainerError> {
        let subnet = self.allocator.subnet_for_uid(uid)?;
        let stack_image = stack::current_stack_image_path(&self.stacks_dir, &ex.release.stack)?;

        // Per-container data directory, writable subtrees owned by the
        // dyno uid.
        let data_dir = self.containers_dir.join(uuid);
        let writable_dirs = [
            data_dir.join("app"),
            data_dir.join("dev"),
            data_dir.join("tmp"),
            data_dir.join("var/tmp"),
        ];
        for dir in &writable_dirs {
            std::fs::create_dir_all(dir)?;
            nix::unistd::chown(
                dir.as_path(),
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(uid)),
            )
            .map_err(|e| ContainerError::sys(format!("chown {}", dir.display()), e))?;
        }

        // The shared stack image is the (read-only) rootfs.
        let rootfs = data_dir.join("root");
        std::fs::create_dir_all(&rootfs)?;
        nix::mount::mount(
            Some(&stack_image),
            &rootfs,
            Some("bind"),
            nix::mount::MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| ContainerError::mount(rootfs.display(), e))?;
        nix::mount::mount(
            None::<&str>,
            &rootfs,
            None::<&str>,
            nix::mount::MsFlags::MS_BIND
                | nix::mount::MsFlags::MS_REMOUNT
                | nix::mount::MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| ContainerError::mount(rootfs.display(), e))?;

        create_passwd_with_dyno_user(&stack_image, &data_dir, uid)?;

        // Local slugs move into the container; remote ones are fetched by
        // the inner abspath build, which has container networking.
        let mut app = build_app_snapshot(ex);
        if ex.release.slug_where() == SlugWhere::Local {
            let staged = data_dir.join("tmp/slug.tgz");
            std::fs::copy(&ex.release.slug_url, &staged)?;
            std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o644))?;
            app.slug = "/tmp/slug.tgz".to_string();
        }

        // The supervisor re-execs itself as container init and again as
        // the in-container workload stage.
        let own_binary = std::env::current_exe()?;
        let inner_binary = data_dir.join("tmp/hsup");
        std::fs::copy(&own_binary, &inner_binary)?;
        std::fs::set_permissions(&inner_binary, std::fs::Permissions::from_mode(0o755))?;

        // Host-side networking: veth pair with the gateway address on the
        // host end, NAT for the whole private block.
        let veth_host = format!("veth{uid}");
        let veth_guest = format!("veth{uid}c");
        let mut handle = NetlinkHandle::new()?;
        let host_ifindex = handle.create_veth_pair(&veth_host, &veth_guest)?;
        handle.add_address(host_ifindex, subnet.gateway().into())?;
        handle.set_link_mtu(host_ifindex, 1500)?;
        handle.set_link_state(host_ifindex, true)?;
        hsup_net::enable_packet_forwarding()?;
        hsup_net::ensure_masquerade(self.masquerade_block())?;

        let extra_nic = match &self.net.extra_interface {
            Some(extra) => {
                let parent = handle.get_ifindex(&extra.parent)?;
                let name = format!("hsup{uid}e");
                let kind = match extra.kind {
                    VlanKind::Macvlan => "macvlan",
                    VlanKind::Ipvlan => "ipvlan",
                };
                handle.create_vlan_child(&name, parent, kind)?;
                Some((name, extra.address.to_string()))
            }
            None => None,
        };

        // One forwarded host port per container.
        let host_port = self.allocator.reserve_port()?;
        let port_map = PortMap {
            chain_id: uid,
            port: host_port,
            container_ip: subnet.host().ip(),
        };

        let launch = self.launch(
            ex, uid, uuid, &subnet, app, &own_binary, &data_dir, &writable_dirs, &rootfs,
            &mut handle, &veth_host, &veth_guest, &extra_nic, host_port, &port_map,
        );
        if let Err(e) = launch {
            let _ = port_map.destroy();
            if let Err(free_err) = self.allocator.free_port(host_port) {
                warn!("could not free port {host_port} after failed start: {free_err}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// The point-of-no-return half of assembly: DNAT, the init clone, netns
    /// moves and handle publication. Failures here still own no running
    /// container, so the caller unwinds the port resources.
    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        ex: &Arc<Executor>,
        uid: u32,
        uuid: &str,
        subnet: &hsup_net::SmallSubnet,
        app: hsup_core::AppSerializable,
        own_binary: &Path,
        data_dir: &Path,
        writable_dirs: &[PathBuf],
        rootfs: &Path,
        handle: &mut NetlinkHandle,
        veth_host: &str,
        veth_guest: &str,
        extra_nic: &Option<(String, String)>,
        host_port: u16,
        port_map: &PortMap,
    ) -> std::result::Result<(), ContainerError> {
        port_map.create()?;

        let network = NetworkSpec {
            interface: veth_guest.to_string(),
            rename_to: "eth0".to_string(),
            address: subnet.host().to_string(),
            gateway: subnet.gateway().ip().to_string(),
            mtu: 1500,
            extra: extra_nic.as_ref().map(|(name, address)| ExtraNicSpec {
                interface: name.clone(),
                rename_to: "eth1".to_string(),
                address: address.clone(),
            }),
            routes: self
                .net
                .extra_routes
                .iter()
                .map(|r| RouteSpec {
                    destination: r.destination.to_string(),
                    gateway: r.gateway.to_string(),
                    ifname: r.ifname.clone(),
                })
                .collect(),
        };
        let spec = ContainerSpec::for_dyno(uuid, uid, data_dir, network, &ex.binds);

        let startup = Startup {
            app,
            one_shot: true,
            start_number: ex.process_id,
            action: hsup_core::Action::Start,
            driver: DriverKind::ContainerInit(
                serde_json::to_value(&spec)
                    .map_err(|e| ContainerError::Payload(e.to_string()))?,
            ),
            skip_build: false,
            form_name: Some(ex.process_type.clone()),
            control_socket: None,
            args: Vec::new(),
            binds: ex.binds.clone(),
        };

        if let Err(e) = cgroup::create(uuid) {
            warn!("could not create container cgroup: {e}");
        }

        let (init_pid, sync_tx) = spawn_init(own_binary, &spec, &startup)?;

        // The guest endpoints enter the init's netns before it is released
        // through the sync pipe.
        let guest_ifindex = handle.get_ifindex(veth_guest)?;
        handle.set_link_netns_pid(guest_ifindex, init_pid.as_raw() as u32)?;
        if let Some((name, _)) = extra_nic {
            let nic_ifindex = handle.get_ifindex(name)?;
            handle.set_link_netns_pid(nic_ifindex, init_pid.as_raw() as u32)?;
        }
        if let Err(e) = cgroup::attach(uuid, init_pid.as_raw()) {
            warn!("could not attach container init to cgroup: {e}");
        }
        nix::unistd::write(&sync_tx, b"x")
            .map_err(|e| ContainerError::sys("release init through sync pipe", e))?;
        drop(sync_tx);

        // Publish handles, then hand all teardown to the terminal-wait
        // task: resources are released exactly once, on the path that
        // observes the init's terminal exit.
        let (exit_tx, exit_rx) = mpsc::channel(1);
        {
            let mut slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.child_pid = Some(init_pid.as_raw());
            slots.init_exit = Some(exit_rx);
            slots.container = Some(ContainerSlot {
                uuid: uuid.to_string(),
                uid,
                data_dir: data_dir.to_path_buf(),
            });
            slots.ip_address = Some(subnet.host().ip().to_string());
            slots.port = Some(host_port);
        }

        let teardown = Teardown {
            uuid: uuid.to_string(),
            uid,
            data_dir: data_dir.to_path_buf(),
            writable_dirs: writable_dirs.to_vec(),
            rootfs: rootfs.to_path_buf(),
            veth_host: veth_host.to_string(),
            port_map: Some(port_map.clone()),
            host_port: Some(host_port),
        };
        let allocator = Arc::clone(&self.allocator);
        tokio::spawn(async move {
            let status = reap_init(init_pid).await;
            collect_garbage(&allocator, teardown).await;
            let _ = exit_tx.send(status).await;
        });

        Ok(())
    }

    /// Best-effort cleanup when start fails before the init process exists.
    fn cleanup_failed_start(&self, uid: u32, uuid: &str) {
        let data_dir = self.containers_dir.join(uuid);
        let _ = nix::mount::umount2(&data_dir.join("root"), nix::mount::MntFlags::MNT_DETACH);
        let _ = std::fs::remove_dir_all(&data_dir);
        if let Ok(mut handle) = NetlinkHandle::new() {
            if let Ok(ifindex) = handle.get_ifindex(&format!("veth{uid}")) {
                let _ = handle.delete_link(ifindex);
            }
        }
        let _ = cgroup::remove(uuid);
        if let Err(e) = self.allocator.free_uid(uid) {
            warn!("could not free uid {uid} after failed start: {e}");
        }
    }
}

#[async_trait]
impl DynoDriver for ContainerDriver {
    async fn build(&self, release: &mut Release) -> Result<()> {
        let mounted = stack::ensure_mounted(&self.stacks_dir, &release.stack)
            .map_err(Error::driver)?;
        info!("stack {} ready at {}", release.stack, mounted.display());
        Ok(())
    }

    async fn start(&self, ex: &Arc<Executor>) -> Result<()> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let uid = self.allocator.reserve_uid().map_err(Error::driver)?;

        match self.assemble(ex, uid, &uuid) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cleanup_failed_start(uid, &uuid);
                Err(Error::driver(e))
            }
        }
    }

    async fn wait(&self, ex: &Arc<Executor>) -> ExitStatus {
        let exit_rx = {
            let mut slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.init_exit.take()
        };
        match exit_rx {
            Some(mut rx) => rx.recv().await.unwrap_or_else(|| {
                ExitStatus::failed_to_execute("container terminal-wait task vanished")
            }),
            None => ExitStatus::failed_to_execute("init exit channel missing; wait called twice?"),
        }
    }

    async fn stop(&self, ex: &Arc<Executor>) -> Result<()> {
        let pid = {
            let slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.child_pid
        };
        let Some(pid) = pid else {
            return Ok(());
        };

        // Graceful shutdown is delegated to the embedded abspath backend
        // inside the container; SIGTERM to init is all the host sends.
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
            Err(e) => Err(Error::driver(e)),
        }
    }
}

/// Copies the stack image's passwd, appending the dyno user.
fn create_passwd_with_dyno_user(
    stack_image: &Path,
    data_dir: &Path,
    uid: u32,
) -> std::result::Result<(), ContainerError> {
    let mut contents = std::fs::read_to_string(stack_image.join("etc/passwd"))?;
    contents.push_str(&format!("\ndyno:x:{uid}:{uid}::/app:/bin/bash\n"));

    let dst = data_dir.join("passwd");
    std::fs::write(&dst, contents)?;
    std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

fn build_app_snapshot(ex: &Arc<Executor>) -> hsup_core::AppSerializable {
    hsup_core::AppSerializable {
        version: ex.release.version,
        name: ex.release.app_name.clone(),
        env: ex.release.config.clone(),
        slug: ex.release.slug_url.clone(),
        stack: ex.release.stack.clone(),
        processes: vec![hsup_core::Formation {
            args: ex.args.clone(),
            quantity: 1,
            proc_type: ex.process_type.clone(),
        }],
        logplex_url: ex.logplex_url.clone(),
    }
}

/// Clones the init child into fresh namespaces. The child blocks on the
/// sync pipe until host-side networking has moved its endpoints in, then
/// execs the supervisor with the container-init directive.
fn spawn_init(
    own_binary: &Path,
    spec: &ContainerSpec,
    startup: &Startup,
) -> std::result::Result<(Pid, OwnedFd), ContainerError> {
    let (sync_rx, sync_tx) =
        nix::unistd::pipe().map_err(|e| ContainerError::sys("sync pipe", e))?;

    // Everything the child touches is prepared before clone; the callback
    // only reads the pipe and execs.
    let path = CString::new(own_binary.as_os_str().as_encoded_bytes())
        .map_err(|e| ContainerError::Payload(e.to_string()))?;
    let argv = [CString::new("hsup").expect("constant argv has no NUL")];
    let env = [CString::new(format!(
        "{}={}",
        hsup_core::CONTROL_PAYLOAD_VAR,
        startup.to_base64()
    ))
    .expect("base64 payload has no NUL")];

    let mut flags = CloneFlags::empty();
    for ns in &spec.namespaces {
        flags |= match ns {
            crate::spec::NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
            crate::spec::NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
            crate::spec::NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
            crate::spec::NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
            crate::spec::NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
        };
    }

    let sync_fd = sync_rx.as_raw_fd();
    let mut stack = vec![0u8; 1024 * 1024];
    let child = Box::new(move || -> isize {
        // Die with the supervisor rather than leak namespaced orphans.
        let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL);

        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(sync_fd, byte.as_mut_ptr().cast(), 1) };
        if n != 1 {
            return 255;
        }

        let _ = nix::unistd::execve(&path, &argv, &env);
        255
    });

    // Safety: the callback only performs async-signal-safe work (read,
    // prctl, execve) on data prepared before the clone.
    let pid = unsafe {
        nix::sched::clone(child, &mut stack, flags, Some(libc::SIGCHLD))
    }
    .map_err(|e| ContainerError::sys("clone container init", e))?;

    drop(sync_rx);
    Ok((pid, sync_tx))
}

/// Blocks in waitpid until the init process terminates.
async fn reap_init(pid: Pid) -> ExitStatus {
    let reaped = tokio::task::spawn_blocking(move || loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitStatus { code, err: None },
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return ExitStatus {
                    code: 128 + signal as i32,
                    err: None,
                }
            }
            Ok(_) => continue,
            Err(nix::Error::EINTR) => continue,
            Err(e) => return ExitStatus::failed_to_execute(e),
        }
    })
    .await;

    reaped.unwrap_or_else(|e| ExitStatus::failed_to_execute(e))
}

/// Releases everything the container held, in dependency order: cgroup,
/// rootfs mount, writable subtrees, data directory, network endpoints
/// (capped), then the uid.
async fn collect_garbage(allocator: &Arc<Allocator>, teardown: Teardown) {
    if let Err(e) = cgroup::remove(&teardown.uuid) {
        warn!("cgroup removal failed for {}: {e}", teardown.uuid);
    }

    if let Err(e) = nix::mount::umount2(&teardown.rootfs, nix::mount::MntFlags::MNT_DETACH) {
        warn!("unmount error for {}: {e}", teardown.rootfs.display());
    }
    for dir in &teardown.writable_dirs {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            warn!("remove error for {}: {e}", dir.display());
        }
    }
    if let Err(e) = std::fs::remove_dir_all(&teardown.data_dir) {
        warn!("remove error for {}: {e}", teardown.data_dir.display());
    }

    // Endpoint teardown talks to the kernel and iptables; cap it so a
    // wedged netfilter cannot stall dyno turnover.
    let allocator_for_port = Arc::clone(allocator);
    let veth_host = teardown.veth_host.clone();
    let port_map = teardown.port_map;
    let host_port = teardown.host_port;
    let net_gc = tokio::task::spawn_blocking(move || {
        if let Ok(mut handle) = NetlinkHandle::new() {
            // The guest endpoint died with its namespace; the host side
            // can linger when init never ran.
            if let Ok(ifindex) = handle.get_ifindex(&veth_host) {
                if let Err(e) = handle.delete_link(ifindex) {
                    warn!("could not delete {veth_host}: {e}");
                }
            }
        }
        if let Some(map) = port_map {
            if let Err(e) = map.destroy() {
                warn!("could not remove port mapping: {e}");
            }
        }
        if let Some(port) = host_port {
            if let Err(e) = allocator_for_port.free_port(port) {
                warn!("could not free port {port}: {e}");
            }
        }
    });
    if tokio::time::timeout(NET_GC_BUDGET, net_gc).await.is_err() {
        warn!("network GC for {} exceeded its budget", teardown.uuid);
    }

    // Worst case when this fails: the uid is never reused.
    if let Err(e) = allocator.free_uid(teardown.uid) {
        warn!("could not free uid {}: {e}", teardown.uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn passwd_gains_exactly_one_dyno_user() {
        let stack = TempDir::new().unwrap();
        std::fs::create_dir_all(stack.path().join("etc")).unwrap();
        std::fs::write(
            stack.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\n",
        )
        .unwrap();
        let data = TempDir::new().unwrap();

        create_passwd_with_dyno_user(stack.path(), data.path(), 3042).unwrap();

        let passwd = std::fs::read_to_string(data.path().join("passwd")).unwrap();
        assert!(passwd.starts_with("root:x:0:0"));
        assert!(passwd.contains("\ndyno:x:3042:3042::/app:/bin/bash\n"));
        assert_eq!(passwd.matches("dyno:").count(), 1);

        let mode = std::fs::metadata(data.path().join("passwd"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn app_snapshot_pins_a_single_formation() {
        let release = Arc::new(Release {
            app_name: "a".to_string(),
            version: 9,
            config: BTreeMap::new(),
            slug_url: "/tmp/s.tgz".to_string(),
            stack: "cedar-14".to_string(),
            image_name: None,
        });
        let (ex, _) = Executor::create(
            hsup_core::ExecutorSpec {
                args: vec!["./w".to_string()],
                process_type: "web".to_string(),
                process_id: 4,
                one_shot: false,
                logplex_url: Some("https://logs.example.com".to_string()),
                binds: BTreeMap::new(),
            },
            Arc::new(crate::test_support::NullDriver),
            release,
        );

        let app = build_app_snapshot(&ex);
        assert_eq!(app.processes.len(), 1);
        assert_eq!(app.processes[0].quantity, 1);
        assert_eq!(app.processes[0].proc_type, "web");
        assert_eq!(app.version, 9);
        assert_eq!(app.logplex_url.as_deref(), Some("https://logs.example.com"));
    }
}
