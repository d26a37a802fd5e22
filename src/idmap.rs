//! User namespace id translation.
//!
//! A [`MappingList`] says which ids inside a container correspond to which ids
//! on the host. Each [`Mapping`] covers `size` consecutive ids starting at
//! `from_id` (container side) and lands on `to_id` (host side), which is the
//! same column order the kernel expects in `/proc/<pid>/uid_map`.

use crate::errors::IdMapError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// First host id handed to containers by default, just past the 16-bit range.
pub const DEFAULT_HOST_BASE: u32 = 65536;

/// Number of container ids covered by the default map.
pub const DEFAULT_RANGE_SIZE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub from_id: u32,
    pub to_id: u32,
    pub size: u32,
}

impl Mapping {
    pub fn new(from_id: u32, to_id: u32, size: u32) -> Self {
        Mapping {
            from_id,
            to_id,
            size,
        }
    }

    /// Translate `id` if it falls inside this range.
    fn translate(&self, id: u32) -> Option<u32> {
        let delta = id.checked_sub(self.from_id)?;
        if delta < self.size {
            self.to_id.checked_add(delta)
        } else {
            None
        }
    }
}

impl FromStr for Mapping {
    type Err = IdMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [from, to, size] = fields.as_slice() else {
            return Err(IdMapError::InvalidFormat(s.to_string()));
        };

        let parse = |value: &str| {
            value.trim().parse::<u32>().map_err(|source| IdMapError::InvalidId {
                value: value.to_string(),
                source,
            })
        };

        Ok(Mapping::new(parse(*from)?, parse(*to)?, parse(*size)?))
    }
}

/// Ordered id ranges; lookup is first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingList(Vec<Mapping>);

impl MappingList {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        MappingList(mappings)
    }

    /// Default map: container ids `0..65536` onto host ids starting at 65536.
    pub fn default_map() -> Self {
        MappingList(vec![Mapping::new(0, DEFAULT_HOST_BASE, DEFAULT_RANGE_SIZE)])
    }

    /// Map only container root onto a single host id (rootless setups).
    pub fn single(host_id: u32) -> Self {
        MappingList(vec![Mapping::new(0, host_id, 1)])
    }

    /// Translate an id; ids outside every range map to themselves.
    pub fn map(&self, id: u32) -> u32 {
        self.0
            .iter()
            .find_map(|mapping| mapping.translate(id))
            .unwrap_or(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.0.iter()
    }
}

impl From<Vec<Mapping>> for MappingList {
    fn from(mappings: Vec<Mapping>) -> Self {
        MappingList(mappings)
    }
}

/// Renders the list in the format `/proc/<pid>/uid_map` accepts.
impl fmt::Display for MappingList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for mapping in &self.0 {
            writeln!(f, "{} {} {}", mapping.from_id, mapping.to_id, mapping.size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_boundaries() {
        let list = MappingList::new(vec![Mapping::new(0, 65536, 65530)]);

        assert_eq!(list.map(0), 65536);
        assert_eq!(list.map(65529), 131065);
        assert_eq!(list.map(65530), 65530);
    }

    #[test]
    fn test_ids_below_range_are_identity() {
        let list = MappingList::new(vec![Mapping::new(1000, 200000, 10)]);

        assert_eq!(list.map(999), 999);
        assert_eq!(list.map(1000), 200000);
        assert_eq!(list.map(1009), 200009);
        assert_eq!(list.map(1010), 1010);
    }

    #[test]
    fn test_first_match_wins() {
        let list = MappingList::new(vec![
            Mapping::new(0, 100, 10),
            Mapping::new(5, 500, 10),
        ]);

        assert_eq!(list.map(5), 105);
        assert_eq!(list.map(12), 507);
    }

    #[test]
    fn test_zero_size_never_matches() {
        let list = MappingList::new(vec![Mapping::new(7, 90000, 0)]);

        assert_eq!(list.map(7), 7);
    }

    #[test]
    fn test_default_map_leaves_high_ids_alone() {
        let list = MappingList::default_map();

        assert_eq!(list.map(0), DEFAULT_HOST_BASE);
        assert_eq!(list.map(1000), DEFAULT_HOST_BASE + 1000);
        assert_eq!(list.map(70000), 70000);
    }

    #[test]
    fn test_parse_mapping() {
        let mapping: Mapping = "0:65536:4096".parse().unwrap();
        assert_eq!(mapping, Mapping::new(0, 65536, 4096));

        assert_eq!(
            "0:65536".parse::<Mapping>(),
            Err(IdMapError::InvalidFormat("0:65536".to_string()))
        );
        assert!(matches!(
            "0:-1:5".parse::<Mapping>(),
            Err(IdMapError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_proc_format() {
        let list = MappingList::new(vec![Mapping::new(0, 1000, 1), Mapping::new(1, 65536, 100)]);

        assert_eq!(list.to_string(), "0 1000 1\n1 65536 100\n");
    }
}
