//! Linear memory consumption model built from two runs at different scales.
//!
//! Matching call sites are compared between a baseline run `a` and a target
//! run `b`. The ratio `mem_b / mem_a` is tested against the ratios expected
//! for memory that stays constant, grows with the rank count or follows the
//! per-rank problem size (optionally split with a ghost cell share).

use crate::analysis::hwm::FunctionSiteAllocation;
use crate::types::Bytes;
use derive_more::Display;
use std::fmt;
use tracing::{debug, warn};

/// Run metadata the ratios are derived from
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RunScale {
    /// Number of ranks in the run
    pub ranks: u32,
    /// Global problem dimensions, unused dimensions set to 1
    pub problem: [u64; 3],
    /// Ranks along each problem dimension
    pub decomposition: [u32; 3],
}

impl RunScale {
    pub fn new(ranks: u32, problem: [u64; 3]) -> Self {
        Self {
            ranks,
            problem,
            decomposition: [1, 1, 1],
        }
    }

    pub fn with_decomposition(mut self, decomposition: [u32; 3]) -> Self {
        self.decomposition = decomposition;
        self
    }

    pub fn global_problem(&self) -> u64 {
        self.problem.iter().product()
    }

    /// Problem cells per rank
    pub fn local_problem(&self) -> f64 {
        self.global_problem() as f64 / f64::from(self.ranks)
    }

    fn decomposition_size(&self) -> u64 {
        self.decomposition.iter().map(|d| u64::from(*d)).product()
    }

    /// Cells owned by one rank, excluding (`halo = 0`) or including
    /// (`halo = 2`) one ghost layer per side
    fn local_cells(&self, halo: f64) -> f64 {
        self.problem
            .iter()
            .zip(self.decomposition.iter())
            .map(|(p, d)| (*p as f64 / f64::from(*d)).ceil() + halo)
            .product()
    }
}

/// Expected growth ratios between a baseline and a target run.
/// A `None` ratio is disabled and never matched.
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug, Default)]
pub struct ScalingRatios {
    pub rank: Option<f64>,
    /// Rank ratio excluding rank 0
    pub exclusive_rank: Option<f64>,
    /// Per rank problem size ratio
    pub problem: Option<f64>,
    pub ghost: Option<f64>,
    /// Share of the target's cells that are data rather than ghost cells
    pub data_fraction: f64,
}

/// Ratios for comparing `a` against `b`, plus what the formula needs from `b`
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug)]
pub struct ScaleComparison {
    pub ratios: ScalingRatios,
    pub target_ranks: u32,
    pub target_local_problem: f64,
    /// Ghost cells per rank in the target, 0 when unknown
    pub target_ghost_cells: f64,
}

impl ScaleComparison {
    pub fn new(a: &RunScale, b: &RunScale) -> Self {
        let rank = ratio(f64::from(b.ranks), f64::from(a.ranks));
        if rank.is_none() {
            warn!("Baseline has no ranks, rank ratio disabled");
        }

        let exclusive_rank = ratio(f64::from(b.ranks) - 1.0, f64::from(a.ranks) - 1.0);
        if exclusive_rank.is_none() {
            warn!(ranks = a.ranks, "Exclusive rank ratio disabled");
        }

        let problem = if a.ranks == 0 || b.ranks == 0 {
            None
        } else {
            ratio(b.local_problem(), a.local_problem())
        };
        if problem.is_none() {
            warn!("Problem size ratio disabled");
        }

        let mut ghost = None;
        let mut data_fraction = 0.0;
        let mut target_ghost_cells = 0.0;
        if a.decomposition_size() == u64::from(a.ranks)
            && b.decomposition_size() == u64::from(b.ranks)
        {
            let (ghost_a, ghost_b) = (a.local_cells(2.0), b.local_cells(2.0));
            let norm_b = b.local_cells(0.0);
            ghost = ratio(ghost_b, ghost_a);
            if ghost_b > 0.0 {
                data_fraction = norm_b / ghost_b;
            }
            target_ghost_cells = ghost_b - norm_b;
        } else {
            warn!(
                a = ?a.decomposition,
                b = ?b.decomposition,
                "Decompositions do not match the rank counts, ghost ratio disabled"
            );
        }

        let ratios = ScalingRatios {
            rank,
            exclusive_rank,
            problem,
            ghost,
            data_fraction,
        };
        debug!(?ratios, "Derived scaling ratios");
        Self {
            ratios,
            target_ranks: b.ranks,
            target_local_problem: b.local_problem(),
            target_ghost_cells,
        }
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    let r = num / den;
    (den != 0.0 && r.is_finite()).then_some(r)
}

/// How memory at a site grows between the two runs
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum Relationship {
    #[display(fmt = "direct")]
    Direct,
    #[display(fmt = "per core")]
    Core,
    #[display(fmt = "per core excluding rank 0")]
    ExclusiveCore,
    #[display(fmt = "per problem size")]
    Problem,
    #[display(fmt = "ghost cells")]
    Ghost,
    /// Either side was zero
    #[display(fmt = "unmatched")]
    Unmatched,
}

/// Bytes attributed to each relationship for one side
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
#[display(
    fmt = "unmatched {unmatched} direct {direct} core {core} problem {problem} ghost {ghost}"
)]
pub struct Tally {
    pub unmatched: Bytes,
    pub direct: Bytes,
    pub core: Bytes,
    pub problem: Bytes,
    pub ghost: Bytes,
}

/// `Y(C, P) = direct + per_core * C + per_problem * (P / C) [+ per_ghost * G]`
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug)]
pub struct Formula {
    pub direct: f64,
    pub per_core: f64,
    pub per_problem: f64,
    pub per_ghost: Option<f64>,
}

impl Formula {
    /// Predicted bytes per rank for `cores` ranks on a global problem of
    /// `problem` cells with `ghost_cells` ghost cells per rank
    pub fn evaluate(&self, cores: f64, problem: f64, ghost_cells: f64) -> f64 {
        let mut y = self.direct + self.per_core * cores + self.per_problem * (problem / cores);
        if let Some(g) = self.per_ghost {
            y += g * ghost_cells;
        }
        y
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Y(C, P) = {} + {}*C + {}*(P/C)",
            self.direct, self.per_core, self.per_problem
        )?;
        if let Some(g) = self.per_ghost {
            write!(f, " + {g}*G")?;
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct ConsumptionModel {
    ratios: ScalingRatios,
    tolerance: f64,
    baseline: Tally,
    target: Tally,
}

impl ConsumptionModel {
    /// Default band half width, in percent
    pub const DEFAULT_TOLERANCE: f64 = 5.0;

    pub fn new(ratios: ScalingRatios) -> Self {
        Self {
            ratios,
            tolerance: Self::DEFAULT_TOLERANCE,
            baseline: Tally::default(),
            target: Tally::default(),
        }
    }

    pub fn with_tolerance(mut self, percent: f64) -> Self {
        self.tolerance = percent;
        self
    }

    pub fn ratios(&self) -> &ScalingRatios {
        &self.ratios
    }

    pub fn baseline(&self) -> &Tally {
        &self.baseline
    }

    pub fn target(&self) -> &Tally {
        &self.target
    }

    /// Find the first expected ratio within `percent` of `r`
    pub fn classify(&self, r: f64, percent: f64) -> Option<Relationship> {
        let upper = r * (1.0 + percent / 100.0);
        let lower = r * (1.0 - percent / 100.0);
        let within = |t: Option<f64>| t.map_or(false, |t| lower <= t && t <= upper);

        if within(Some(1.0)) {
            Some(Relationship::Direct)
        } else if within(self.ratios.rank) {
            Some(Relationship::Core)
        } else if within(self.ratios.exclusive_rank) {
            Some(Relationship::ExclusiveCore)
        } else if within(self.ratios.problem) {
            Some(Relationship::Problem)
        } else if within(self.ratios.ghost) {
            Some(Relationship::Ghost)
        } else {
            None
        }
    }

    /// Classify `mem_b` against `mem_a` and account it.
    ///
    /// A zero on either side counts the other side as unmatched. `None` when
    /// no band matched, in which case nothing is accounted.
    pub fn hazy_match(&mut self, mem_a: Bytes, mem_b: Bytes, percent: f64) -> Option<Relationship> {
        if mem_a == Bytes::zero() {
            self.target.unmatched += mem_b;
            return Some(Relationship::Unmatched);
        }
        if mem_b == Bytes::zero() {
            self.baseline.unmatched += mem_a;
            return Some(Relationship::Unmatched);
        }

        let r = mem_b.0 as f64 / mem_a.0 as f64;
        let rel = self.classify(r, percent)?;
        match rel {
            Relationship::Direct => self.target.direct += mem_b,
            Relationship::Core | Relationship::ExclusiveCore => self.target.core += mem_b,
            Relationship::Problem => self.target.problem += mem_b,
            Relationship::Ghost => {
                let data = Bytes((mem_b.0 as f64 * self.ratios.data_fraction) as i64);
                self.target.problem += data;
                self.target.ghost += mem_b - data;
            }
            Relationship::Unmatched => (),
        }
        Some(rel)
    }

    pub fn exact_match(&mut self, mem_a: Bytes, mem_b: Bytes) -> Option<Relationship> {
        self.hazy_match(mem_a, mem_b, 0.0)
    }

    /// Compare the individual allocations of a site present in both runs
    pub fn deep_stack_comparison(&mut self, a: &FunctionSiteAllocation, b: &FunctionSiteAllocation) {
        if a.count() == 1 && b.count() == 1 {
            let tolerance = self.tolerance;
            if self.hazy_match(a.bytes, b.bytes, tolerance).is_none() {
                self.baseline.unmatched += a.bytes;
                self.target.unmatched += b.bytes;
            }
            return;
        }

        if a.count() != 0 {
            let count_ratio = b.count() as f64 / a.count() as f64;
            if count_ratio > 0.9 && count_ratio <= 1.1 {
                // The count difference itself is the percentage, 1.1 gives a 0.1 % band
                let percent = (1.0 - count_ratio).abs();
                if self.hazy_match(a.bytes, b.bytes, percent).is_some() {
                    return;
                }
            }
        }

        let mut candidates = b.allocations.clone();
        for size in a.allocations.iter() {
            let found = candidates
                .iter()
                .position(|c| self.classify_exact(*size, *c));
            match found {
                Some(idx) => {
                    let c = candidates.remove(idx);
                    self.exact_match(*size, c);
                }
                None => self.baseline.unmatched += *size,
            }
        }
        for c in candidates {
            self.target.unmatched += c;
        }
    }

    /// Compare one site: whole site exact match first, then its allocations
    pub fn compare_site(
        &mut self,
        a: Option<&FunctionSiteAllocation>,
        b: Option<&FunctionSiteAllocation>,
    ) -> Option<Relationship> {
        let mem_a = a.map(|s| s.bytes).unwrap_or_default();
        let mem_b = b.map(|s| s.bytes).unwrap_or_default();
        let rel = self.exact_match(mem_a, mem_b);
        if rel.is_none() {
            if let (Some(a), Some(b)) = (a, b) {
                self.deep_stack_comparison(a, b);
            }
        }
        rel
    }

    /// Final match of the unmatched remainders, then the formula
    pub fn finish(&mut self, comparison: &ScaleComparison) -> Formula {
        let tolerance = self.tolerance;
        let (rest_a, rest_b) = (self.baseline.unmatched, self.target.unmatched);
        if rest_a != Bytes::zero() || rest_b != Bytes::zero() {
            let rel = self.hazy_match(rest_a, rest_b, tolerance);
            // Matched remainders move out of the unmatched tallies
            if matches!(rel, Some(r) if r != Relationship::Unmatched) {
                self.baseline.unmatched -= rest_a;
                self.target.unmatched -= rest_b;
            } else if rel == Some(Relationship::Unmatched) {
                // Zero on one side, the remainder was counted twice
                if rest_a == Bytes::zero() {
                    self.target.unmatched -= rest_b;
                } else {
                    self.baseline.unmatched -= rest_a;
                }
            }
        }
        debug!(baseline = %self.baseline, target = %self.target, "Model tallies");

        let t = &self.target;
        let ranks = f64::from(comparison.target_ranks.max(1));
        let per_problem = if comparison.target_local_problem > 0.0 {
            t.problem.0 as f64 / comparison.target_local_problem
        } else {
            0.0
        };
        let per_ghost = (comparison.target_ghost_cells > 0.0 && t.ghost > Bytes::zero())
            .then(|| t.ghost.0 as f64 / comparison.target_ghost_cells);
        Formula {
            direct: t.direct.0 as f64,
            per_core: t.core.0 as f64 / ranks,
            per_problem,
            per_ghost,
        }
    }

    fn classify_exact(&self, a: Bytes, b: Bytes) -> bool {
        if a == Bytes::zero() || b == Bytes::zero() {
            return true;
        }
        self.classify(b.0 as f64 / a.0 as f64, 0.0).is_some()
    }
}
