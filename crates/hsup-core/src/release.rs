//! Releases and formations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where a release's slug currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlugWhere {
    /// A path on the local filesystem.
    Local,
    /// A remote http(s) URL that still needs fetching.
    Http,
}

/// Immutable snapshot of an application at one version.
///
/// A release enters existence at ingestion, is shared by reference among all
/// executors of its generation, and is discarded when the generation is
/// retired. After a driver's build step the slug locator is always a local
/// filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub app_name: String,
    pub version: u32,
    pub config: BTreeMap<String, String>,
    pub slug_url: String,
    pub stack: String,

    /// Filled by the container backend after build.
    pub image_name: Option<String>,
}

impl Release {
    /// The release's display name, e.g. `myapp-v42`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-v{}", self.app_name, self.version)
    }

    /// Classifies the slug locator.
    #[must_use]
    pub fn slug_where(&self) -> SlugWhere {
        if self.slug_url.starts_with("http://") || self.slug_url.starts_with("https://") {
            SlugWhere::Http
        } else {
            // file:// and bare paths are both local.
            SlugWhere::Local
        }
    }

    /// The environment as `K=V` pairs, sorted by key.
    #[must_use]
    pub fn env_pairs(&self) -> Vec<String> {
        self.config
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

/// The declared scale of one process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formation {
    #[serde(rename = "Args")]
    pub args: Vec<String>,
    #[serde(rename = "Quantity")]
    pub quantity: u32,
    #[serde(rename = "Type")]
    pub proc_type: String,
}
