use crate::idmap::MappingList;
use anyhow::{Context, Result};
use nix::unistd::{Gid, Pid, Uid};
use std::fs;

/// Id maps for a new user namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNamespace {
    pub uid_map: MappingList,
    pub gid_map: MappingList,
}

impl UserNamespace {
    /// Maps that the calling user is allowed to install.
    ///
    /// Root gets the default block; anyone else can only map container root
    /// onto themselves.
    pub fn for_current_user() -> Self {
        let uid = Uid::current();
        if uid.is_root() {
            UserNamespace {
                uid_map: MappingList::default_map(),
                gid_map: MappingList::default_map(),
            }
        } else {
            UserNamespace {
                uid_map: MappingList::single(uid.as_raw()),
                gid_map: MappingList::single(Gid::current().as_raw()),
            }
        }
    }

    /// Install the maps for `pid`. Must run before the child relies on its ids.
    pub fn apply(&self, pid: Pid) -> Result<()> {
        let proc_dir = format!("/proc/{}", pid);

        fs::write(format!("{}/setgroups", proc_dir), "deny")
            .with_context(|| format!("writing setgroups for {}", pid))?;
        fs::write(format!("{}/uid_map", proc_dir), self.uid_map.to_string())
            .with_context(|| format!("writing uid_map for {}", pid))?;
        fs::write(format!("{}/gid_map", proc_dir), self.gid_map.to_string())
            .with_context(|| format!("writing gid_map for {}", pid))?;

        tracing::debug!(%pid, uid_map = %self.uid_map, gid_map = %self.gid_map, "id maps written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_user_maps_are_writable() {
        let userns = UserNamespace::for_current_user();
        let uid = Uid::current();

        if uid.is_root() {
            assert_eq!(userns.uid_map, MappingList::default_map());
        } else {
            assert_eq!(userns.uid_map.map(0), uid.as_raw());
            assert_eq!(userns.uid_map.map(1), 1);
        }
    }
}
