//! The `cbuild.json` run configuration

use anyhow::{Context, Result};
use cbuildrt_mount::{Essentials, MountSpec};
use cbuildrt_namespace::{ChildSpec, NamespaceConfig, RootSpec, RunSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// `PATH` given to commands running as root when none is declared
pub const ROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// `PATH` given to other users when none is declared
pub const USER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BuildConfig {
    /// Root directory; a scratch directory is used when absent
    #[serde(default)]
    pub rootfs: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub rootfs_read_only: bool,

    #[serde(default)]
    pub user: User,

    pub process: Process,

    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,

    /// Extra scratch tmpfs mount points
    #[serde(default)]
    pub tmpfs: Vec<PathBuf>,

    #[serde(default)]
    pub namespaces: Namespaces,

    #[serde(default)]
    pub essentials: Essentials,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Process {
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Namespaces {
    pub pid: bool,
    pub net: bool,
    pub user: bool,
}

impl Default for Namespaces {
    fn default() -> Self {
        Self {
            pid: true,
            net: false,
            user: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

impl BuildConfig {
    /// Parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Unable to open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Translate into the runtime's input
    ///
    /// `root` overrides the configured `rootfs`.
    pub fn into_run_spec(self, root: Option<PathBuf>) -> RunSpec {
        let mut namespaces = NamespaceConfig::new()
            .with_pid(self.namespaces.pid)
            .with_network(self.namespaces.net)
            .with_user(self.namespaces.user);
        if self.namespaces.user {
            namespaces = namespaces.with_identity(self.user.uid, self.user.gid);
        }

        let mut env = self.process.env;
        env.entry("PATH".to_string())
            .or_insert_with(|| default_path(self.user.uid).to_string());

        let child = ChildSpec::new(self.process.args)
            .envs(env)
            .working_dir(self.process.cwd)
            .identity(self.user.uid, self.user.gid);

        let mut mounts: Vec<MountSpec> = self
            .bind_mounts
            .into_iter()
            .map(|bind| {
                let spec = MountSpec::bind(bind.source, bind.destination);
                if bind.read_only { spec.read_only() } else { spec }
            })
            .collect();
        mounts.extend(self.tmpfs.into_iter().map(MountSpec::tmpfs));

        RunSpec {
            mounts,
            essentials: self.essentials,
            root: root
                .or(self.rootfs)
                .map_or(RootSpec::Scratch, RootSpec::Path),
            root_read_only: self.rootfs_read_only,
            namespaces,
            child,
        }
    }
}

/// Search path injected when the configuration declares none
#[must_use]
pub const fn default_path(uid: u32) -> &'static str {
    if uid == 0 { ROOT_PATH } else { USER_PATH }
}
