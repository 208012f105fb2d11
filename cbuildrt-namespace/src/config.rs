//! Namespace configuration

use cbuildrt_core::{Error, Result};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One line of a `uid_map`/`gid_map`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the namespace
    pub inside: u32,
    /// First id in the parent namespace
    pub outside: u32,
    /// Length of the range
    pub count: u32,
}

impl IdMap {
    /// Map exactly one id
    #[must_use]
    pub const fn single(inside: u32, outside: u32) -> Self {
        Self {
            inside,
            outside,
            count: 1,
        }
    }

    /// Whether `id` is inside the mapped range
    #[must_use]
    pub const fn maps(&self, id: u32) -> bool {
        id >= self.inside && id - self.inside < self.count
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.inside, self.outside, self.count)
    }
}

/// Namespace configuration for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Child becomes PID 1 of a new PID namespace
    pub use_pid_ns: bool,

    /// Private mount table (always required)
    pub use_mount_ns: bool,

    /// Unprivileged mounting through a new user namespace
    pub use_user_ns: bool,

    /// Empty network namespace (no interfaces up)
    pub use_net_ns: bool,

    /// UID mapping written when the user namespace is created
    pub uid_map: Option<IdMap>,

    /// GID mapping written when the user namespace is created
    pub gid_map: Option<IdMap>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            use_pid_ns: true,
            use_mount_ns: true,
            use_user_ns: true,
            use_net_ns: false,
            uid_map: None,
            gid_map: None,
        }
    }
}

impl NamespaceConfig {
    /// Create a new namespace configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable PID namespace
    #[must_use]
    pub const fn with_pid(mut self, enable: bool) -> Self {
        self.use_pid_ns = enable;
        self
    }

    /// Enable network namespace
    #[must_use]
    pub const fn with_network(mut self, enable: bool) -> Self {
        self.use_net_ns = enable;
        self
    }

    /// Enable user namespace
    #[must_use]
    pub const fn with_user(mut self, enable: bool) -> Self {
        self.use_user_ns = enable;
        self
    }

    /// Set both id maps explicitly
    #[must_use]
    pub const fn with_maps(mut self, uid_map: IdMap, gid_map: IdMap) -> Self {
        self.uid_map = Some(uid_map);
        self.gid_map = Some(gid_map);
        self
    }

    /// Map `uid`/`gid` inside the namespace onto the caller's effective ids
    #[must_use]
    pub fn with_identity(self, uid: u32, gid: u32) -> Self {
        let euid = nix::unistd::geteuid().as_raw();
        let egid = nix::unistd::getegid().as_raw();
        self.with_maps(IdMap::single(uid, euid), IdMap::single(gid, egid))
    }

    /// Check the flags and maps before anything is unshared
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] when the mount namespace is disabled or the
    /// maps do not match the user namespace setting.
    pub fn validate(&self) -> Result<()> {
        if !self.use_mount_ns {
            return Err(Error::invalid_config("a mount namespace is required"));
        }

        match (self.use_user_ns, self.uid_map, self.gid_map) {
            (true, Some(uid_map), Some(gid_map)) => {
                if uid_map.count == 0 || gid_map.count == 0 {
                    return Err(Error::invalid_config("id maps must not be empty"));
                }
                Ok(())
            }
            (true, _, _) => Err(Error::invalid_config(
                "user namespace needs both a uid and a gid map",
            )),
            (false, None, None) => Ok(()),
            (false, _, _) => Err(Error::invalid_config(
                "id maps require a user namespace",
            )),
        }
    }

    /// Whether `uid`/`gid` exist inside the namespace
    #[must_use]
    pub fn maps_identity(&self, uid: u32, gid: u32) -> bool {
        if !self.use_user_ns {
            return true;
        }
        self.uid_map.is_some_and(|m| m.maps(uid)) && self.gid_map.is_some_and(|m| m.maps(gid))
    }

    /// Convert to clone flags for unshare(2)
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.use_user_ns {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.use_mount_ns {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.use_pid_ns {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.use_net_ns {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        flags
    }

    /// Get list of enabled namespace names
    #[must_use]
    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = Vec::new();

        if self.use_user_ns {
            namespaces.push("user");
        }
        if self.use_mount_ns {
            namespaces.push("mnt");
        }
        if self.use_pid_ns {
            namespaces.push("pid");
        }
        if self.use_net_ns {
            namespaces.push("net");
        }

        namespaces
    }
}
