//! Translation of declared rlimits into the records handed to a backend

use thiserror::Error;

use crate::types::{RlimitConfig, RlimitItem};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("rlimit {resource} has soft limit {soft} above hard limit {hard}")]
    SoftAboveHard {
        resource: &'static str,
        soft: u64,
        hard: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitResource {
    Core,
    NoFile,
    Fsize,
}

impl RlimitResource {
    pub fn name(&self) -> &'static str {
        match self {
            RlimitResource::Core => "core",
            RlimitResource::NoFile => "no_file",
            RlimitResource::Fsize => "fsize",
        }
    }

    /// The `RLIMIT_*` constant for setrlimit(2)
    pub fn as_raw(&self) -> libc::__rlimit_resource_t {
        match self {
            RlimitResource::Core => libc::RLIMIT_CORE,
            RlimitResource::NoFile => libc::RLIMIT_NOFILE,
            RlimitResource::Fsize => libc::RLIMIT_FSIZE,
        }
    }
}

/// An rlimit as enforced on the sandboxed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: RlimitResource,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedLimits {
    pub rlimits: Vec<Rlimit>,

    /// The fsize hard limit as configured, before the one-byte margin.
    ///
    /// The kernel raises SIGXFSZ on the write that crosses the enforced
    /// limit, so output larger than this value means the configured limit
    /// was hit rather than some unrelated SIGXFSZ.
    pub fsize_baseline: Option<u64>,
}

/// Translate declared limits; absent categories are omitted, never zeroed.
pub fn translate(config: Option<&RlimitConfig>) -> Result<TranslatedLimits, LimitError> {
    let Some(config) = config else {
        return Ok(TranslatedLimits::default());
    };

    let mut translated = TranslatedLimits::default();

    if let Some(core) = &config.core {
        translated.rlimits.push(checked(RlimitResource::Core, core)?);
    }

    if let Some(no_file) = &config.no_file {
        translated
            .rlimits
            .push(checked(RlimitResource::NoFile, no_file)?);
    }

    if let Some(fsize) = &config.fsize {
        let declared = checked(RlimitResource::Fsize, fsize)?;
        translated.rlimits.push(Rlimit {
            soft: declared.soft.saturating_add(1),
            hard: declared.hard.saturating_add(1),
            ..declared
        });
        translated.fsize_baseline = Some(declared.hard);
    }

    Ok(translated)
}

fn checked(resource: RlimitResource, item: &RlimitItem) -> Result<Rlimit, LimitError> {
    if item.soft > item.hard {
        return Err(LimitError::SoftAboveHard {
            resource: resource.name(),
            soft: item.soft,
            hard: item.hard,
        });
    }

    Ok(Rlimit {
        resource,
        soft: item.soft,
        hard: item.hard,
    })
}
