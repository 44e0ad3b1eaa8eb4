//! Context configuration.

use std::path::PathBuf;

use serde::Serialize;

use mlblock_core::DType;

/// Behaviour flags of a computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CtxFlags {
    /// Keep the compute pool so `compute` can be called repeatedly.
    pub multi_compute: bool,
    /// Do not log the per-computation summary.
    pub quiet: bool,
    /// Write the sealed graph as DOT into `dump_dir`.
    pub dump: bool,
}

impl CtxFlags {
    pub const NONE: Self = Self {
        multi_compute: false,
        quiet: false,
        dump: false,
    };
    pub const MULTI_COMPUTE: Self = Self {
        multi_compute: true,
        ..Self::NONE
    };
    pub const QUIET: Self = Self {
        quiet: true,
        ..Self::NONE
    };
    pub const DUMP: Self = Self {
        dump: true,
        ..Self::NONE
    };

    pub fn union(self, other: Self) -> Self {
        Self {
            multi_compute: self.multi_compute || other.multi_compute,
            quiet: self.quiet || other.quiet,
            dump: self.dump || other.dump,
        }
    }
}

impl std::ops::BitOr for CtxFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// What happens to the parameter pool at `end`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ParamResidency {
    /// Freed with the computation.
    #[default]
    PerComputation,
    /// Kept and reused by the next computation with the same leaf layout.
    Resident,
}

/// Context configuration. The active computation works on a snapshot taken
/// at `begin`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Dtype of tensors created with `weight_new`.
    pub wtype: DType,
    /// Maximum number of registered tensors (entries and inputs).
    pub n_tensor_max: usize,
    /// Separator between name segments.
    pub tpath_sep: char,
    /// Prefix of every registered name; empty for none.
    pub tprefix: String,
    pub flags: CtxFlags,
    /// Merged into the flags of the next computation only.
    pub flags_once: CtxFlags,
    pub param_residency: ParamResidency,
    /// Where DUMP writes `<name>.dot`.
    pub dump_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wtype: DType::F16,
            n_tensor_max: 8192,
            tpath_sep: '.',
            tprefix: String::new(),
            flags: CtxFlags::NONE,
            flags_once: CtxFlags::NONE,
            param_residency: ParamResidency::PerComputation,
            dump_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wtype(mut self, wtype: DType) -> Self {
        self.wtype = wtype;
        self
    }

    pub fn with_n_tensor_max(mut self, n: usize) -> Self {
        self.n_tensor_max = n;
        self
    }

    pub fn with_tpath_sep(mut self, sep: char) -> Self {
        self.tpath_sep = sep;
        self
    }

    pub fn with_tprefix(mut self, prefix: impl Into<String>) -> Self {
        self.tprefix = prefix.into();
        self
    }

    pub fn with_flags(mut self, flags: CtxFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_flags_once(mut self, flags: CtxFlags) -> Self {
        self.flags_once = flags;
        self
    }

    pub fn with_param_residency(mut self, residency: ParamResidency) -> Self {
        self.param_residency = residency;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }

    /// Snapshot for a new computation; consumes `flags_once`.
    pub(crate) fn snapshot(&mut self) -> Config {
        let mut snap = self.clone();
        snap.flags = self.flags | std::mem::take(&mut self.flags_once);
        snap.flags_once = CtxFlags::NONE;
        snap
    }
}
