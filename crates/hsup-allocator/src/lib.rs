//! Allocation of globally unique (per host) dyno resources.
//!
//! Uids and host ports are reserved by optimistically creating exclusive
//! files under the supervisor's work directory; the filesystem provides the
//! atomicity, which keeps reservations correct across multiple concurrent
//! supervisor processes on the same host. Each reserved uid additionally
//! determines a /30 IPv4 subnet for the dyno's container.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ipnetwork::Ipv4Network;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use hsup_net::SmallSubnet;

/// Allocation errors.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Every number in the range was taken within the retry budget.
    #[error("no free number available at {0}")]
    Exhausted(PathBuf),

    /// A derived subnet fell outside the configured block.
    #[error("the assigned IP {ip} falls out of the allowed subnet {subnet}")]
    OutOfSubnet { ip: Ipv4Addr, subnet: Ipv4Network },

    /// The requested uid is below the configured minimum.
    #[error("uid {uid} is below the configured minimum {min}")]
    UidBelowRange { uid: u32, min: u32 },

    #[error(transparent)]
    Net(#[from] hsup_net::NetError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for allocator operations.
pub type Result<T> = std::result::Result<T, AllocError>;

/// Outside of the usual range used as ephemeral ports (32768-61000).
const MIN_PORT: u32 = 3000;
const MAX_PORT: u32 = 9999;

/// Hands out host-unique uids and ports, and derives per-uid /30 subnets.
///
/// `(max_uid - min_uid)` must stay below the number of /30 subnets the
/// private block provides; see [`Allocator::subnet_for_uid`].
pub struct Allocator {
    uids_dir: PathBuf,
    ports_dir: PathBuf,

    min_uid: u32,
    max_uid: u32,

    /// First /30 to hand out, plus the block it must stay inside.
    private_subnet: Ipv4Network,

    rng: Mutex<SmallRng>,
}

impl Allocator {
    /// Creates an allocator rooted at `work_dir`, deriving subnets from
    /// `private_subnet` for uids in `[min_uid, max_uid]`.
    ///
    /// The rng is seeded from OS entropy once here so reservation retries
    /// stay cheap.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directories cannot be created.
    pub fn new(
        work_dir: &Path,
        private_subnet: Ipv4Network,
        min_uid: u32,
        max_uid: u32,
    ) -> Result<Self> {
        let uids_dir = work_dir.join("uids");
        std::fs::create_dir_all(&uids_dir)?;
        let ports_dir = work_dir.join("ports");
        std::fs::create_dir_all(&ports_dir)?;

        Ok(Self {
            uids_dir,
            ports_dir,
            min_uid,
            max_uid,
            private_subnet,
            rng: Mutex::new(SmallRng::from_entropy()),
        })
    }

    /// Optimistically locks uid numbers until one is successfully allocated.
    ///
    /// Atomic filesystem operations guarantee that concurrent tasks (and
    /// concurrent supervisor processes) never allocate the same uid. Return
    /// the uid to the pool with [`Allocator::free_uid`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Exhausted`] after the retry budget.
    pub fn reserve_uid(&self) -> Result<u32> {
        self.allocate(&self.uids_dir, self.min_uid, self.max_uid)
    }

    /// Returns the provided uid to the pool to be used by others.
    ///
    /// # Errors
    ///
    /// Returns an error if the reservation file cannot be removed.
    pub fn free_uid(&self, uid: u32) -> Result<()> {
        std::fs::remove_file(self.uids_dir.join(uid.to_string()))?;
        Ok(())
    }

    /// Optimistically locks a host port in the non-ephemeral range.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Exhausted`] after the retry budget.
    pub fn reserve_port(&self) -> Result<u16> {
        self.allocate(&self.ports_dir, MIN_PORT, MAX_PORT)
            .map(|p| p as u16)
    }

    /// Returns the provided port to the pool to be used by others.
    ///
    /// # Errors
    ///
    /// Returns an error if the reservation file cannot be removed.
    pub fn free_port(&self, port: u16) -> Result<()> {
        std::fs::remove_file(self.ports_dir.join(port.to_string()))?;
        Ok(())
    }

    /// Tries random numbers in `[min, max]` until an exclusive file named
    /// after one can be created under `numbers_dir`.
    ///
    /// With a good random distribution, a few times the number of possible
    /// values is enough attempts to eventually try all of them, so the retry
    /// budget is `5 * (max - min + 1)`.
    fn allocate(&self, numbers_dir: &Path, min: u32, max: u32) -> Result<u32> {
        let interval = max - min + 1;
        let max_retries = 5 * interval;

        for _ in 0..max_retries {
            let n = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                rng.gen_range(0..interval) + min
            };
            let file = numbers_dir.join(n.to_string());
            // Check if free by optimistically locking this number.
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&file)
            {
                Ok(_) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(AllocError::Exhausted(numbers_dir.to_path_buf()))
    }

    /// Determines which /30 IPv4 network to use for a container, relying on
    /// the fact that each one has a different, unique uid allocated to it.
    ///
    /// Subnets are carved from the configured private block starting at the
    /// block's configured base address: the base address is treated as a
    /// 32-bit integer, shifted right by 2, advanced by `uid - min_uid`, and
    /// shifted left by 2, yielding the network address of a /30. A /12 block
    /// provides at most 2^18 = 262144 subnets, so `(max_uid - min_uid)` must
    /// stay smaller than that.
    ///
    /// # Errors
    ///
    /// Returns an error when the uid is below the range or the derived
    /// subnet falls outside the block.
    pub fn subnet_for_uid(&self, uid: u32) -> Result<SmallSubnet> {
        if uid < self.min_uid {
            return Err(AllocError::UidBelowRange {
                uid,
                min: self.min_uid,
            });
        }
        let shift = uid - self.min_uid;

        let mut as_int = u32::from(self.private_subnet.ip());
        as_int >>= 2;
        as_int = as_int.wrapping_add(shift);
        as_int <<= 2;

        let ip = Ipv4Addr::from(as_int);
        if !self.private_subnet.contains(ip) {
            return Err(AllocError::OutOfSubnet {
                ip,
                subnet: self.private_subnet,
            });
        }

        let net = Ipv4Network::new(ip, 30).expect("/30 is a valid prefix");
        Ok(SmallSubnet::new(net)?)
    }
}
