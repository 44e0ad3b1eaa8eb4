//! Per-computation statistics.

use serde::Serialize;

/// Memory and timing of the current (or last) computation. Reset by `begin`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Stats {
    /// Bytes of the parameter pool over all backends.
    pub mem_params: usize,
    /// Bytes of the compute pool over all backends.
    pub mem_compute: usize,
    pub mem_total: usize,
    /// Seconds spent loading parameters.
    pub t_load: f64,
    /// Seconds spent computing, summed over every compute.
    pub t_compute: f64,
    pub n_compute: usize,
    /// Parameters converted between float dtypes while loading.
    pub n_conv: usize,
    /// Parameters served from a resident pool.
    pub n_resident: usize,
    /// Cross-backend copies executed.
    pub n_transfer: usize,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "params {:.1} KiB, compute {:.1} KiB, load {:.3}s, compute {:.3}s x{}",
            self.mem_params as f64 / 1024.0,
            self.mem_compute as f64 / 1024.0,
            self.t_load,
            self.t_compute,
            self.n_compute
        )?;
        if self.n_conv > 0 {
            write!(f, ", {} converted", self.n_conv)?;
        }
        if self.n_resident > 0 {
            write!(f, ", {} resident", self.n_resident)?;
        }
        if self.n_transfer > 0 {
            write!(f, ", {} transfers", self.n_transfer)?;
        }
        Ok(())
    }
}
