//! Core of the per-host dyno supervisor.
//!
//! Defines the data model (releases, formations, generations), the per-dyno
//! lifecycle state machine, the execution-backend contract, and the startup
//! blob used to hand complete directives to sub-invocations of the
//! supervisor.

pub mod driver;
pub mod error;
pub mod executor;
pub mod processes;
pub mod release;
pub mod serialization;

pub use driver::{DynoDriver, ExitStatus};
pub use error::{Error, Result};
pub use executor::{ContainerSlot, DriverSlots, DynoInput, DynoState, Executor, ExecutorSpec};
pub use processes::{ConcResolver, Processes};
pub use release::{Formation, Release, SlugWhere};
pub use serialization::{Action, AppSerializable, DriverKind, Startup, CONTROL_PAYLOAD_VAR};
