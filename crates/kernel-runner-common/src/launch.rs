//! Launch-geometry deduction.
//!
//! Block, grid and overall dimensions are related elementwise by
//! `overall <= block * grid`, with equality exactly when every block is full.
//! Given a block together with either the grid or the overall extent, the
//! remaining component is derived here; the grid is rounded up whenever the
//! overall extent is not a multiple of the block.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, RunnerError};

/// A three-component extent (x, y, z).
pub type Dims = [u32; 3];

// ---------------------------------------------------------------------------
// Dimension helpers
// ---------------------------------------------------------------------------

/// Right-pad a one-to-three component extent with 1s.
pub fn pad_dims(components: &[u32]) -> Result<Dims> {
    if components.is_empty() || components.len() > 3 {
        return Err(RunnerError::configuration(format!(
            "dimensions must have between 1 and 3 components, got {}",
            components.len()
        )));
    }
    if let Some(pos) = components.iter().position(|&c| c == 0) {
        return Err(RunnerError::configuration(format!(
            "dimension component {pos} must be > 0"
        )));
    }
    let mut dims = [1u32; 3];
    dims[..components.len()].copy_from_slice(components);
    Ok(dims)
}

/// Integer division rounding towards positive infinity.
#[inline]
fn div_round_up(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor)
}

fn elementwise_product(a: Dims, b: Dims) -> Result<Dims> {
    let mut out = [0u32; 3];
    for i in 0..3 {
        out[i] = a[i].checked_mul(b[i]).ok_or_else(|| {
            RunnerError::configuration(format!(
                "overall dimension {i} overflows: {} x {}",
                a[i], b[i]
            ))
        })?;
    }
    Ok(out)
}

fn check_nonzero(label: &str, dims: Option<Dims>) -> Result<()> {
    if let Some(d) = dims {
        if d.contains(&0) {
            return Err(RunnerError::configuration(format!(
                "{label} dimensions must be > 0, got {d:?}"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Possibly incomplete launch geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfigComponents {
    /// Threads per block (work-group size).
    pub block: Option<Dims>,
    /// Blocks per grid.
    pub grid: Option<Dims>,
    /// Threads overall.
    pub overall: Option<Dims>,
    /// Dynamic shared (local) memory in bytes.
    pub dynamic_shared_memory_size: Option<u32>,
}

impl LaunchConfigComponents {
    /// Components forced from one source (e.g. the command line).
    ///
    /// Grid and overall dimensions are mutually exclusive here.
    pub fn forced(
        block: Option<Dims>,
        grid: Option<Dims>,
        overall: Option<Dims>,
        dynamic_shared_memory_size: Option<u32>,
    ) -> Result<Self> {
        if grid.is_some() && overall.is_some() {
            return Err(RunnerError::AmbiguousLaunchConfig {
                reason: "both grid dimensions (in blocks) and overall dimensions (in threads) \
                         were specified; specify only one of them"
                    .into(),
            });
        }
        let components = Self { block, grid, overall, dynamic_shared_memory_size };
        components.check_nonzero()?;
        Ok(components)
    }

    /// Whether the components determine a launch without adapter help.
    ///
    /// The shared memory size defaults to zero and never blocks sufficiency.
    pub fn is_sufficient(&self) -> bool {
        self.block.is_some() && (self.grid.is_some() || self.overall.is_some())
    }

    /// Whether nothing at all was specified.
    pub fn is_empty(&self) -> bool {
        self.block.is_none()
            && self.grid.is_none()
            && self.overall.is_none()
            && self.dynamic_shared_memory_size.is_none()
    }

    fn check_nonzero(&self) -> Result<()> {
        check_nonzero("block", self.block)?;
        check_nonzero("grid", self.grid)?;
        check_nonzero("overall", self.overall)
    }

    /// Fill in the missing component and compute the full-block flag.
    pub fn deduce_missing(&self, kernel: &str) -> Result<ResolvedLaunchConfig> {
        self.check_nonzero()?;
        let dynamic_shared_memory_size = self.dynamic_shared_memory_size.unwrap_or(0);

        let (block, grid, overall) = match (self.block, self.grid, self.overall) {
            (Some(block), Some(grid), None) => (block, grid, elementwise_product(block, grid)?),
            (Some(block), None, Some(overall)) => {
                let grid = std::array::from_fn(|i| div_round_up(overall[i], block[i]));
                (block, grid, overall)
            }
            (Some(block), Some(grid), Some(overall)) => {
                let expected: Dims = std::array::from_fn(|i| div_round_up(overall[i], block[i]));
                if expected != grid {
                    return Err(RunnerError::AmbiguousLaunchConfig {
                        reason: format!(
                            "grid {grid:?} does not cover overall {overall:?} with block {block:?}"
                        ),
                    });
                }
                (block, grid, overall)
            }
            (None, Some(grid), Some(overall)) => {
                let block = std::array::from_fn(|i| div_round_up(overall[i], grid[i]));
                (block, grid, overall)
            }
            (None, _, _) => {
                return Err(RunnerError::UndeducibleLaunchConfig {
                    kernel: kernel.to_string(),
                    missing: "the block dimensions".into(),
                });
            }
            (Some(_), None, None) => {
                return Err(RunnerError::UndeducibleLaunchConfig {
                    kernel: kernel.to_string(),
                    missing: "either the grid or the overall dimensions".into(),
                });
            }
        };

        let full_blocks = (0..3).all(|i| overall[i] % block[i] == 0);
        Ok(ResolvedLaunchConfig { block, grid, overall, dynamic_shared_memory_size, full_blocks })
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully determined launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLaunchConfig {
    pub block: Dims,
    pub grid: Dims,
    /// Threads requested; may be below `block * grid` when blocks are partial.
    pub overall: Dims,
    pub dynamic_shared_memory_size: u32,
    /// True iff `overall` is an exact elementwise multiple of `block`.
    pub full_blocks: bool,
}

impl ResolvedLaunchConfig {
    /// Threads actually dispatched in each dimension (`block * grid`).
    pub fn dispatched(&self) -> [usize; 3] {
        std::array::from_fn(|i| self.block[i] as usize * self.grid[i] as usize)
    }

    /// Number of meaningful dimensions (trailing 1s in both block and grid dropped).
    pub fn work_dim(&self) -> u32 {
        (1..=3u32)
            .rev()
            .find(|&d| {
                let i = (d - 1) as usize;
                self.block[i] != 1 || self.grid[i] != 1
            })
            .unwrap_or(1)
    }
}

impl fmt::Display for ResolvedLaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [bx, by, bz] = self.block;
        let [gx, gy, gz] = self.grid;
        let [ox, oy, oz] = self.overall;
        write!(
            f,
            "block {bx} x {by} x {bz} threads, grid {gx} x {gy} x {gz} blocks, \
             overall {ox} x {oy} x {oz} threads, {} bytes dynamic shared memory{}",
            self.dynamic_shared_memory_size,
            if self.full_blocks { "" } else { " (partial blocks)" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_dims_pads_with_ones() {
        assert_eq!(pad_dims(&[7]).unwrap(), [7, 1, 1]);
        assert_eq!(pad_dims(&[7, 3]).unwrap(), [7, 3, 1]);
        assert_eq!(pad_dims(&[7, 3, 2]).unwrap(), [7, 3, 2]);
    }

    #[test]
    fn pad_dims_rejects_bad_input() {
        assert!(pad_dims(&[]).is_err());
        assert!(pad_dims(&[1, 2, 3, 4]).is_err());
        assert!(pad_dims(&[4, 0]).is_err());
    }

    #[test]
    fn block_and_overall_round_grid_up() {
        let c = LaunchConfigComponents {
            block: Some([16, 1, 1]),
            overall: Some([33, 1, 1]),
            ..Default::default()
        };
        let r = c.deduce_missing("k").unwrap();
        assert_eq!(r.grid, [3, 1, 1]);
        assert!(!r.full_blocks);
        assert_eq!(r.dynamic_shared_memory_size, 0);
    }

    #[test]
    fn block_and_grid_give_overall() {
        let c = LaunchConfigComponents {
            block: Some([8, 4, 1]),
            grid: Some([2, 3, 5]),
            dynamic_shared_memory_size: Some(512),
            ..Default::default()
        };
        let r = c.deduce_missing("k").unwrap();
        assert_eq!(r.overall, [16, 12, 5]);
        assert!(r.full_blocks);
        assert_eq!(r.dynamic_shared_memory_size, 512);
    }

    #[test]
    fn grid_and_overall_give_block() {
        let c = LaunchConfigComponents {
            grid: Some([4, 1, 1]),
            overall: Some([1024, 1, 1]),
            ..Default::default()
        };
        let r = c.deduce_missing("k").unwrap();
        assert_eq!(r.block, [256, 1, 1]);
        assert!(r.full_blocks);
    }

    #[test]
    fn forcing_grid_and_overall_is_ambiguous() {
        let err = LaunchConfigComponents::forced(
            Some([32, 1, 1]),
            Some([2, 1, 1]),
            Some([64, 1, 1]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::AmbiguousLaunchConfig { .. }));
    }

    #[test]
    fn sufficiency() {
        let mut c = LaunchConfigComponents::default();
        assert!(!c.is_sufficient());
        c.block = Some([64, 1, 1]);
        assert!(!c.is_sufficient());
        c.overall = Some([100, 1, 1]);
        assert!(c.is_sufficient());
        c.overall = None;
        c.grid = Some([2, 1, 1]);
        assert!(c.is_sufficient());
    }

    #[test]
    fn single_component_is_undeducible() {
        let c = LaunchConfigComponents { block: Some([64, 1, 1]), ..Default::default() };
        let err = c.deduce_missing("scan").unwrap_err();
        assert!(err.to_string().contains("scan"));

        let c = LaunchConfigComponents { overall: Some([64, 1, 1]), ..Default::default() };
        assert!(matches!(
            c.deduce_missing("scan"),
            Err(RunnerError::UndeducibleLaunchConfig { .. })
        ));
    }

    #[test]
    fn inconsistent_triple_is_rejected() {
        let c = LaunchConfigComponents {
            block: Some([16, 1, 1]),
            grid: Some([2, 1, 1]),
            overall: Some([64, 1, 1]),
            dynamic_shared_memory_size: None,
        };
        assert!(c.deduce_missing("k").is_err());
    }

    #[test]
    fn zero_components_are_rejected() {
        let c = LaunchConfigComponents {
            block: Some([0, 1, 1]),
            grid: Some([2, 1, 1]),
            ..Default::default()
        };
        assert!(c.deduce_missing("k").is_err());
    }

    #[test]
    fn work_dim_ignores_trailing_unit_dims() {
        let c = LaunchConfigComponents {
            block: Some([16, 4, 1]),
            grid: Some([2, 1, 1]),
            ..Default::default()
        };
        assert_eq!(c.deduce_missing("k").unwrap().work_dim(), 2);
        let c = LaunchConfigComponents {
            block: Some([1, 1, 1]),
            grid: Some([1, 1, 1]),
            ..Default::default()
        };
        assert_eq!(c.deduce_missing("k").unwrap().work_dim(), 1);
    }
}
