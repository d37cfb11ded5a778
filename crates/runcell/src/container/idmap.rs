//! uid/gid mappings for user-namespaced containers

use thiserror::Error;

use crate::types::UserNamespaceConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdMapError {
    #[error("{kind} map range is empty")]
    EmptyRange { kind: &'static str },

    #[error("{kind} map range {begin}+{count} overflows")]
    Overflow {
        kind: &'static str,
        begin: u32,
        count: u32,
    },

    #[error("root {kind} {root} overlaps the subordinate range {begin}+{count}")]
    Overlap {
        kind: &'static str,
        root: u32,
        begin: u32,
        count: u32,
    },
}

/// One line of a uid_map/gid_map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Compute the uid and gid mappings for a user namespace.
///
/// Returns two empty vectors when the namespace is absent or disabled, in
/// which case the container shares host identities.
pub fn id_mappings(
    config: Option<&UserNamespaceConfig>,
) -> Result<(Vec<IdMapping>, Vec<IdMapping>), IdMapError> {
    let Some(config) = config.filter(|config| config.enabled) else {
        return Ok((Vec::new(), Vec::new()));
    };

    let uids = mappings_for(
        "uid",
        config.root_uid,
        config.uid_map_begin,
        config.uid_map_count,
    )?;
    let gids = mappings_for(
        "gid",
        config.root_gid,
        config.gid_map_begin,
        config.gid_map_count,
    )?;

    Ok((uids, gids))
}

fn mappings_for(
    kind: &'static str,
    root: u32,
    begin: u32,
    count: u32,
) -> Result<Vec<IdMapping>, IdMapError> {
    if count == 0 {
        return Err(IdMapError::EmptyRange { kind });
    }

    // Container ids 1..=count must fit as well as host ids begin..begin+count
    let end = begin
        .checked_add(count)
        .filter(|_| count < u32::MAX)
        .ok_or(IdMapError::Overflow { kind, begin, count })?;

    if (begin..end).contains(&root) {
        return Err(IdMapError::Overlap {
            kind,
            root,
            begin,
            count,
        });
    }

    Ok(vec![
        IdMapping {
            container_id: 0,
            host_id: root,
            size: 1,
        },
        IdMapping {
            container_id: 1,
            host_id: begin,
            size: count,
        },
    ])
}
