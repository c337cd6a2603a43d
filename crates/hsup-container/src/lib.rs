//! The container backend: one Linux container per dyno.
//!
//! The host side assembles container resources (uid, /30 subnet, data
//! directory, read-only stack image, veth + NAT) and clones the supervisor
//! binary as the container's init. The init half of this crate runs inside
//! the fresh namespaces and finishes assembly before exec'ing the workload
//! stage.

pub mod caps;
pub mod cgroup;
pub mod driver;
pub mod error;
pub mod init;
pub mod spec;
pub mod stack;

pub use driver::ContainerDriver;
pub use error::{ContainerError, Result};
pub use spec::{BindMount, ContainerSpec, NamespaceKind, NetworkSpec};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;

    use hsup_core::{DynoDriver, Executor, ExitStatus, Release};

    /// Inert driver for constructing executors in tests.
    pub struct NullDriver;

    #[async_trait]
    impl DynoDriver for NullDriver {
        async fn build(&self, _release: &mut Release) -> hsup_core::Result<()> {
            Ok(())
        }

        async fn start(&self, _ex: &Arc<Executor>) -> hsup_core::Result<()> {
            Ok(())
        }

        async fn wait(&self, _ex: &Arc<Executor>) -> ExitStatus {
            ExitStatus::default()
        }

        async fn stop(&self, _ex: &Arc<Executor>) -> hsup_core::Result<()> {
            Ok(())
        }
    }
}
