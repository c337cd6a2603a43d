//! The startup blob handed to sub-invocations of the supervisor.
//!
//! A [`Startup`] is a single self-describing payload sufficient to perform
//! a complete sub-invocation, notably as init inside a container. It is
//! encoded as JSON, base64'd and carried in the `HSUP_CONTROL_GOB`
//! environment variable.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::driver::DynoDriver;
use crate::error::{Error, Result};
use crate::processes::Processes;
use crate::release::{Formation, Release};

/// Name of the environment variable carrying the encoded startup blob.
pub const CONTROL_PAYLOAD_VAR: &str = "HSUP_CONTROL_GOB";

/// High-level action of one supervisor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Build,
    Start,
    Run,
}

/// The dyno driver chosen for a (sub-)invocation.
///
/// The set is closed; the container-init variant carries the container
/// backend's full assembly directive as an embedded document so the blob
/// stays self-contained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Kind", content = "Config")]
pub enum DriverKind {
    Simple,
    AbsPath,
    Container,
    ContainerInit(serde_json::Value),
}

impl DriverKind {
    /// Parses a `--dynodriver` flag value. Container-init is only ever
    /// selected by self-invocations, never by flag.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown driver names.
    pub fn from_flag(name: &str) -> Result<Self> {
        match name {
            "simple" => Ok(Self::Simple),
            "abspath" => Ok(Self::AbsPath),
            "container" | "libcontainer" => Ok(Self::Container),
            other => Err(Error::Payload(format!("unknown dyno driver {other:?}"))),
        }
    }
}

/// A representation of a single release of an application to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSerializable {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Env", default)]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "Slug")]
    pub slug: String,
    #[serde(rename = "Stack")]
    pub stack: String,
    #[serde(rename = "Processes")]
    pub processes: Vec<Formation>,

    /// Where to forward supervised process stdout/stderr when non-empty.
    #[serde(rename = "LogplexURL", default, skip_serializing_if = "Option::is_none")]
    pub logplex_url: Option<String>,
}

impl AppSerializable {
    /// Materializes a generation from this app snapshot.
    ///
    /// `app_name` is the supervisor's `--app` flag, used when the snapshot
    /// itself carries no name.
    #[must_use]
    pub fn procs(
        &self,
        app_name: &str,
        driver: Arc<dyn DynoDriver>,
        one_shot: bool,
    ) -> Processes {
        let name = if self.name.is_empty() {
            app_name.to_string()
        } else {
            self.name.clone()
        };
        let release = Release {
            app_name: name,
            version: self.version,
            config: self.env.clone(),
            slug_url: self.slug.clone(),
            stack: self.stack.clone(),
            image_name: None,
        };
        let mut procs = Processes::new(release, self.processes.clone(), driver, one_shot);
        procs.logplex_url = self.logplex_url.clone();
        procs
    }
}

/// A serializable directive sufficient to perform sub-invocations of the
/// supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Startup {
    /// The release to run.
    #[serde(rename = "App")]
    pub app: AppSerializable,

    /// True when the supervisor terminates after the supervised program
    /// exits.
    #[serde(rename = "OneShot")]
    pub one_shot: bool,

    /// The first allocated process ordinal, e.g. 2 in the case of `web.2`.
    #[serde(rename = "StartNumber")]
    pub start_number: u32,

    /// High-level action of this invocation.
    #[serde(rename = "Action")]
    pub action: Action,

    /// The execution backend to run under.
    #[serde(rename = "Driver")]
    pub driver: DriverKind,

    /// Skip the build step; useful when executing in the context of an
    /// already-prepared environment.
    #[serde(rename = "SkipBuild", default)]
    pub skip_build: bool,

    /// Formation name for the `Start` action.
    #[serde(rename = "FormName", default, skip_serializing_if = "Option::is_none")]
    pub form_name: Option<String>,

    /// Unix socket the control API listens on; `None` disables the API.
    #[serde(
        rename = "ControlSocket",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub control_socket: Option<String>,

    /// Argv for the `Run` action.
    #[serde(rename = "Args", default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Paths bound from the host into a container, host → guest.
    #[serde(rename = "Binds", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binds: BTreeMap<String, String>,
}

impl Startup {
    /// Encodes the blob for the environment.
    ///
    /// # Panics
    ///
    /// Panics when serialization fails, which would indicate a bug in the
    /// blob's type definitions rather than anything runtime-dependent.
    #[must_use]
    pub fn to_base64(&self) -> String {
        let json = serde_json::to_vec(self).expect("startup payload is always serializable");
        BASE64.encode(json)
    }

    /// Decodes a blob previously produced by [`Startup::to_base64`].
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not valid base64-wrapped JSON.
    pub fn from_base64(payload: &str) -> Result<Self> {
        let json = BASE64
            .decode(payload.trim())
            .map_err(|e| Error::Payload(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| Error::Payload(e.to_string()))
    }

    /// Materializes this directive's generation. When a formation name is
    /// pinned, only that formation is realized.
    #[must_use]
    pub fn procs(&self, driver: Arc<dyn DynoDriver>) -> Processes {
        let mut procs = self.app.procs("", driver, self.one_shot);
        if let Some(form_name) = &self.form_name {
            procs
                .formations
                .retain(|form| &form.proc_type == form_name);
        }
        procs.skip_build = self.skip_build;
        procs.binds = self.binds.clone();
        procs
    }
}
