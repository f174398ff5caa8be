use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub type VarId = usize;

const FEASIBILITY_TOL: f64 = 1e-6;
const PIVOT_EPS: f64 = 1e-9;
const MAX_PIVOTS: usize = 200_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Sense {
    Le,
    Eq,
    Ge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearConstraint {
    pub terms: Vec<(VarId, f64)>,
    pub sense: Sense,
    pub rhs: f64,
}

impl LinearConstraint {
    fn lhs(&self, values: &[bool]) -> f64 {
        self.terms
            .iter()
            .filter(|(var, _)| values[*var])
            .map(|(_, coeff)| coeff)
            .sum()
    }

    fn holds(&self, lhs: f64) -> bool {
        match self.sense {
            Sense::Le => lhs <= self.rhs + FEASIBILITY_TOL,
            Sense::Ge => lhs >= self.rhs - FEASIBILITY_TOL,
            Sense::Eq => (lhs - self.rhs).abs() <= FEASIBILITY_TOL,
        }
    }
}

/// Minimisation over 0/1 variables with linear constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BinaryProgram {
    pub objective: Vec<f64>,
    pub constant: f64,
    pub constraints: Vec<LinearConstraint>,
}

impl BinaryProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_var(&mut self, cost: f64) -> VarId {
        self.objective.push(cost);
        self.objective.len() - 1
    }

    pub fn add_constraint(&mut self, terms: Vec<(VarId, f64)>, sense: Sense, rhs: f64) {
        self.constraints.push(LinearConstraint { terms, sense, rhs });
    }

    pub fn var_count(&self) -> usize {
        self.objective.len()
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    pub fn evaluate(&self, values: &[bool]) -> f64 {
        self.constant
            + self
                .objective
                .iter()
                .zip(values)
                .filter(|(_, &on)| on)
                .map(|(cost, _)| cost)
                .sum::<f64>()
    }

    pub fn is_feasible(&self, values: &[bool]) -> bool {
        values.len() == self.var_count()
            && self.constraints.iter().all(|c| c.holds(c.lhs(values)))
    }

    fn check(&self) -> Result<(), SolverError> {
        if let Some(bad) = self.objective.iter().position(|c| !c.is_finite()) {
            return Err(SolverError::InvalidProgram(format!(
                "objective coefficient of variable {bad} is not finite"
            )));
        }
        for (idx, constraint) in self.constraints.iter().enumerate() {
            if !constraint.rhs.is_finite() {
                return Err(SolverError::InvalidProgram(format!(
                    "constraint {idx} has a non-finite right-hand side"
                )));
            }
            for &(var, coeff) in &constraint.terms {
                if var >= self.var_count() || !coeff.is_finite() {
                    return Err(SolverError::InvalidProgram(format!(
                        "constraint {idx} has an invalid term on variable {var}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Solution {
    pub values: Vec<bool>,
    pub objective: f64,
    /// False when a resource limit stopped the search after an incumbent was
    /// found.
    pub optimal: bool,
    pub nodes: usize,
    pub backend: SolverKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("constraint set is infeasible")]
    Infeasible,
    #[error("no solution found: {0}")]
    NoSolution(String),
    #[error("solver backend `{0}` requested but not compiled in")]
    Unavailable(SolverKind),
    #[error("unknown solver backend `{0}`")]
    UnknownBackend(String),
    #[error("invalid program: {0}")]
    InvalidProgram(String),
}

/// Interchangeable binary-program backends.
pub trait IlpSolver: Send + Sync {
    fn kind(&self) -> SolverKind;
    fn solve(&self, program: &BinaryProgram) -> Result<Solution, SolverError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SolverKind {
    #[default]
    BranchAndBound,
    MicroLp,
}

impl SolverKind {
    pub const ALL: [SolverKind; 2] = [SolverKind::BranchAndBound, SolverKind::MicroLp];

    pub fn as_str(&self) -> &'static str {
        match self {
            SolverKind::BranchAndBound => "branch-and-bound",
            SolverKind::MicroLp => "microlp",
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            SolverKind::BranchAndBound => true,
            SolverKind::MicroLp => cfg!(feature = "microlp"),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SolverKind {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "branch-and-bound" | "bnb" => Ok(SolverKind::BranchAndBound),
            "microlp" => Ok(SolverKind::MicroLp),
            other => Err(SolverError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendStatus {
    pub kind: SolverKind,
    pub available: bool,
    pub notes: Option<String>,
}

pub fn available_backends() -> Vec<BackendStatus> {
    SolverKind::ALL
        .iter()
        .map(|&kind| BackendStatus {
            kind,
            available: kind.is_available(),
            notes: match kind {
                SolverKind::BranchAndBound => Some("built in".into()),
                SolverKind::MicroLp if kind.is_available() => Some("feature flag enabled".into()),
                SolverKind::MicroLp => None,
            },
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct SolverOptions {
    pub node_limit: Option<usize>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl SolverOptions {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

pub fn solver_for(kind: SolverKind, options: SolverOptions) -> Result<Box<dyn IlpSolver>, SolverError> {
    match kind {
        SolverKind::BranchAndBound => Ok(Box::new(BranchAndBound::new(options))),
        #[cfg(feature = "microlp")]
        SolverKind::MicroLp => Ok(Box::new(MicroLp::new(options))),
        #[cfg(not(feature = "microlp"))]
        SolverKind::MicroLp => Err(SolverError::Unavailable(kind)),
    }
}

// --- LP relaxation --------------------------------------------------------

/// Dense simplex tableau. Each row stores its right-hand side in the last
/// column; the objective row stores minus the current objective there.
struct Tableau {
    width: usize,
    rows: Vec<Vec<f64>>,
    basis: Vec<usize>,
    objective: Vec<f64>,
}

impl Tableau {
    fn pivot(&mut self, r: usize, c: usize) {
        let p = self.rows[r][c];
        for v in self.rows[r].iter_mut() {
            *v /= p;
        }
        let pivot_row = self.rows[r].clone();
        for (i, row) in self.rows.iter_mut().enumerate() {
            let f = row[c];
            if i != r && f != 0.0 {
                for (v, pv) in row.iter_mut().zip(&pivot_row) {
                    *v -= f * pv;
                }
            }
        }
        let f = self.objective[c];
        if f != 0.0 {
            for (v, pv) in self.objective.iter_mut().zip(&pivot_row) {
                *v -= f * pv;
            }
        }
        self.basis[r] = c;
    }

    fn set_costs(&mut self, costs: &[f64]) {
        self.objective = costs.to_vec();
        self.objective.resize(self.width + 1, 0.0);
        for r in 0..self.rows.len() {
            let cb = self.objective[self.basis[r]];
            if cb != 0.0 {
                for j in 0..=self.width {
                    self.objective[j] -= cb * self.rows[r][j];
                }
            }
        }
    }

    fn value(&self) -> f64 {
        -self.objective[self.width]
    }

    /// Bland's rule: lowest-index improving column, ties in the ratio test
    /// broken by lowest basic index.
    fn optimise(&mut self, allowed: usize, options: &SolverOptions) -> Result<(), SolverError> {
        for _ in 0..MAX_PIVOTS {
            if options.cancelled() {
                return Err(SolverError::NoSolution("cancelled".into()));
            }
            let Some(c) = (0..allowed).find(|&j| self.objective[j] < -PIVOT_EPS) else {
                return Ok(());
            };
            let mut leave: Option<(usize, f64)> = None;
            for r in 0..self.rows.len() {
                let a = self.rows[r][c];
                if a <= PIVOT_EPS {
                    continue;
                }
                let ratio = self.rows[r][self.width] / a;
                let better = match leave {
                    None => true,
                    Some((lr, best)) => {
                        ratio < best - PIVOT_EPS
                            || (ratio <= best + PIVOT_EPS && self.basis[r] < self.basis[lr])
                    }
                };
                if better {
                    leave = Some((r, ratio));
                }
            }
            let Some((r, _)) = leave else {
                return Err(SolverError::NoSolution("relaxation is unbounded".into()));
            };
            self.pivot(r, c);
        }
        Err(SolverError::NoSolution("simplex pivot limit reached".into()))
    }
}

/// Solves the LP relaxation with some variables fixed. Returns `None` when
/// the relaxation is infeasible.
fn solve_relaxation(
    program: &BinaryProgram,
    fixed: &[Option<bool>],
    options: &SolverOptions,
) -> Result<Option<(Vec<f64>, f64)>, SolverError> {
    let free: Vec<VarId> = (0..program.var_count()).filter(|&v| fixed[v].is_none()).collect();
    let mut column = vec![usize::MAX; program.var_count()];
    for (col, &var) in free.iter().enumerate() {
        column[var] = col;
    }

    // (dense coefficients over free columns, sense, rhs) with rhs >= 0
    let mut rows: Vec<(Vec<f64>, Sense, f64)> = Vec::new();
    for constraint in &program.constraints {
        let mut coeffs = vec![0.0; free.len()];
        let mut rhs = constraint.rhs;
        let mut touches_free = false;
        for &(var, coeff) in &constraint.terms {
            match fixed[var] {
                Some(true) => rhs -= coeff,
                Some(false) => {}
                None => {
                    coeffs[column[var]] += coeff;
                    touches_free = true;
                }
            }
        }
        if !touches_free {
            let residual = LinearConstraint {
                terms: Vec::new(),
                sense: constraint.sense,
                rhs,
            };
            if !residual.holds(0.0) {
                return Ok(None);
            }
            continue;
        }
        rows.push((coeffs, constraint.sense, rhs));
    }
    for col in 0..free.len() {
        let mut coeffs = vec![0.0; free.len()];
        coeffs[col] = 1.0;
        rows.push((coeffs, Sense::Le, 1.0));
    }
    for (coeffs, sense, rhs) in &mut rows {
        if *rhs < 0.0 {
            coeffs.iter_mut().for_each(|c| *c = -*c);
            *rhs = -*rhs;
            *sense = match sense {
                Sense::Le => Sense::Ge,
                Sense::Ge => Sense::Le,
                Sense::Eq => Sense::Eq,
            };
        }
    }

    let slack_count = rows.iter().filter(|(_, s, _)| *s != Sense::Eq).count();
    let artificial_count = rows.iter().filter(|(_, s, _)| *s != Sense::Le).count();
    let slack_start = free.len();
    let artificial_start = slack_start + slack_count;
    let width = artificial_start + artificial_count;

    let mut tableau = Tableau {
        width,
        rows: Vec::with_capacity(rows.len()),
        basis: Vec::with_capacity(rows.len()),
        objective: Vec::new(),
    };
    let (mut next_slack, mut next_artificial) = (slack_start, artificial_start);
    for (coeffs, sense, rhs) in rows {
        let mut row = vec![0.0; width + 1];
        row[..coeffs.len()].copy_from_slice(&coeffs);
        row[width] = rhs;
        match sense {
            Sense::Le => {
                row[next_slack] = 1.0;
                tableau.basis.push(next_slack);
                next_slack += 1;
            }
            Sense::Ge => {
                row[next_slack] = -1.0;
                next_slack += 1;
                row[next_artificial] = 1.0;
                tableau.basis.push(next_artificial);
                next_artificial += 1;
            }
            Sense::Eq => {
                row[next_artificial] = 1.0;
                tableau.basis.push(next_artificial);
                next_artificial += 1;
            }
        }
        tableau.rows.push(row);
    }

    if artificial_count > 0 {
        let mut phase_one = vec![0.0; width];
        phase_one[artificial_start..].iter_mut().for_each(|c| *c = 1.0);
        tableau.set_costs(&phase_one);
        tableau.optimise(width, options)?;
        if tableau.value() > FEASIBILITY_TOL {
            return Ok(None);
        }
        for r in 0..tableau.rows.len() {
            if tableau.basis[r] < artificial_start {
                continue;
            }
            if let Some(c) = (0..artificial_start).find(|&j| tableau.rows[r][j].abs() > PIVOT_EPS) {
                tableau.pivot(r, c);
            }
        }
    }

    let mut costs = vec![0.0; width];
    for (col, &var) in free.iter().enumerate() {
        costs[col] = program.objective[var];
    }
    tableau.set_costs(&costs);
    tableau.optimise(artificial_start, options)?;

    let mut values: Vec<f64> = fixed
        .iter()
        .map(|f| if *f == Some(true) { 1.0 } else { 0.0 })
        .collect();
    for (r, &b) in tableau.basis.iter().enumerate() {
        if b < free.len() {
            values[free[b]] = tableau.rows[r][width].clamp(0.0, 1.0);
        }
    }
    let bound = program.constant
        + program
            .objective
            .iter()
            .zip(&values)
            .map(|(c, x)| c * x)
            .sum::<f64>();
    Ok(Some((values, bound)))
}

/// Variable whose relaxed value is closest to one half, if any is
/// fractional.
fn most_fractional(values: &[f64]) -> Option<VarId> {
    values
        .iter()
        .enumerate()
        .map(|(idx, &v)| (idx, v.min(1.0 - v)))
        .filter(|&(_, frac)| frac > FEASIBILITY_TOL)
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(idx, _)| idx)
}

// --- Branch and bound -----------------------------------------------------

/// Depth-first branch and bound over simplex relaxations. Deterministic for
/// a given program.
#[derive(Debug, Clone, Default)]
pub struct BranchAndBound {
    options: SolverOptions,
}

impl BranchAndBound {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl IlpSolver for BranchAndBound {
    fn kind(&self) -> SolverKind {
        SolverKind::BranchAndBound
    }

    fn solve(&self, program: &BinaryProgram) -> Result<Solution, SolverError> {
        program.check()?;
        let n = program.var_count();
        let mut incumbent: Option<(Vec<bool>, f64)> = None;
        let zeros = vec![false; n];
        if program.is_feasible(&zeros) {
            incumbent = Some((zeros.clone(), program.evaluate(&zeros)));
        }

        let mut stack: Vec<Vec<Option<bool>>> = vec![vec![None; n]];
        let mut nodes = 0usize;
        let mut limit_hit = false;
        while let Some(fixed) = stack.pop() {
            if self.options.cancelled() {
                return Err(SolverError::NoSolution("cancelled".into()));
            }
            if self.options.node_limit.is_some_and(|limit| nodes >= limit) {
                limit_hit = true;
                break;
            }
            nodes += 1;
            let Some((relaxed, bound)) = solve_relaxation(program, &fixed, &self.options)? else {
                continue;
            };
            if incumbent
                .as_ref()
                .is_some_and(|(_, best)| bound >= best - FEASIBILITY_TOL)
            {
                continue;
            }
            match most_fractional(&relaxed) {
                None => {
                    let values: Vec<bool> = relaxed.iter().map(|&v| v > 0.5).collect();
                    if program.is_feasible(&values) {
                        let objective = program.evaluate(&values);
                        if incumbent.as_ref().map_or(true, |(_, best)| objective < *best) {
                            debug!(nodes, objective, "new incumbent");
                            incumbent = Some((values, objective));
                        }
                    }
                }
                Some(var) => {
                    let mut up = fixed.clone();
                    up[var] = Some(true);
                    let mut down = fixed;
                    down[var] = Some(false);
                    // explore the side the relaxation leans towards first
                    if relaxed[var] >= 0.5 {
                        stack.push(down);
                        stack.push(up);
                    } else {
                        stack.push(up);
                        stack.push(down);
                    }
                }
            }
        }

        match incumbent {
            Some((values, objective)) => {
                info!(
                    backend = %self.kind(),
                    nodes,
                    objective,
                    optimal = !limit_hit,
                    "binary program solved"
                );
                Ok(Solution {
                    values,
                    objective,
                    optimal: !limit_hit,
                    nodes,
                    backend: self.kind(),
                })
            }
            None if limit_hit => Err(SolverError::NoSolution(format!(
                "node limit of {nodes} reached without a feasible assignment"
            ))),
            None => Err(SolverError::Infeasible),
        }
    }
}

// --- microlp through good_lp ----------------------------------------------

#[cfg(feature = "microlp")]
pub use microlp_backend::MicroLp;

#[cfg(feature = "microlp")]
mod microlp_backend {
    use good_lp::{
        constraint, variable, Expression, ProblemVariables, ResolutionError, Solution as _,
        SolverModel, Variable,
    };
    use tracing::info;

    use super::{BinaryProgram, IlpSolver, Sense, Solution, SolverError, SolverKind, SolverOptions};

    /// Pure-Rust MILP solver driven through the `good_lp` modelling layer.
    /// The solve itself cannot be interrupted; cancellation is checked
    /// before it starts.
    #[derive(Debug, Clone, Default)]
    pub struct MicroLp {
        options: SolverOptions,
    }

    impl MicroLp {
        pub fn new(options: SolverOptions) -> Self {
            Self { options }
        }
    }

    impl IlpSolver for MicroLp {
        fn kind(&self) -> SolverKind {
            SolverKind::MicroLp
        }

        fn solve(&self, program: &BinaryProgram) -> Result<Solution, SolverError> {
            program.check()?;
            if self.options.cancelled() {
                return Err(SolverError::NoSolution("cancelled".into()));
            }
            let mut vars = ProblemVariables::new();
            let xs: Vec<Variable> = (0..program.var_count())
                .map(|_| vars.add(variable().binary()))
                .collect();
            let objective: Expression = program
                .objective
                .iter()
                .zip(&xs)
                .map(|(&cost, &x)| cost * x)
                .sum();
            let mut model = vars
                .minimise(objective)
                .using(good_lp::solvers::microlp::microlp);
            for c in &program.constraints {
                let lhs: Expression = c.terms.iter().map(|&(var, coeff)| coeff * xs[var]).sum();
                model = model.with(match c.sense {
                    Sense::Le => constraint::leq(lhs, c.rhs),
                    Sense::Eq => constraint::eq(lhs, c.rhs),
                    Sense::Ge => constraint::geq(lhs, c.rhs),
                });
            }
            let solved = match model.solve() {
                Ok(solved) => solved,
                Err(ResolutionError::Infeasible) => return Err(SolverError::Infeasible),
                Err(other) => return Err(SolverError::NoSolution(other.to_string())),
            };
            let values: Vec<bool> = xs.iter().map(|&x| solved.value(x) > 0.5).collect();
            if !program.is_feasible(&values) {
                return Err(SolverError::NoSolution(
                    "backend returned an assignment violating the constraints".into(),
                ));
            }
            let objective = program.evaluate(&values);
            info!(backend = %self.kind(), objective, "binary program solved");
            Ok(Solution {
                values,
                objective,
                optimal: true,
                nodes: 0,
                backend: self.kind(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pick at most one of each adjacent pair in a triangle; relaxation sits
    /// at one half everywhere.
    fn triangle() -> BinaryProgram {
        let mut program = BinaryProgram::new();
        let x: Vec<VarId> = (0..3).map(|_| program.add_var(-1.0)).collect();
        for (a, b) in [(0, 1), (1, 2), (0, 2)] {
            program.add_constraint(vec![(x[a], 1.0), (x[b], 1.0)], Sense::Le, 1.0);
        }
        program
    }

    fn bnb() -> Box<dyn IlpSolver> {
        solver_for(SolverKind::BranchAndBound, SolverOptions::default()).expect("built in")
    }

    #[test]
    fn branch_and_bound_finds_integer_optimum() {
        let solution = bnb().solve(&triangle()).expect("solves");
        assert!((solution.objective + 1.0).abs() < 1e-9);
        assert_eq!(solution.values.iter().filter(|&&v| v).count(), 1);
        assert!(solution.optimal);
        assert!(solution.nodes > 1);
    }

    #[test]
    fn parity_constraint_forces_pairs() {
        // x0 + x1 + x2 - 2 y = 0, reward picking x0
        let mut program = BinaryProgram::new();
        let x0 = program.add_var(-3.0);
        let x1 = program.add_var(1.0);
        let x2 = program.add_var(2.0);
        let y = program.add_var(0.0);
        program.add_constraint(
            vec![(x0, 1.0), (x1, 1.0), (x2, 1.0), (y, -2.0)],
            Sense::Eq,
            0.0,
        );
        let solution = bnb().solve(&program).expect("solves");
        assert_eq!(solution.values, vec![true, true, false, true]);
        assert!((solution.objective + 2.0).abs() < 1e-9);
    }

    #[test]
    fn infeasible_program_is_reported() {
        let mut program = BinaryProgram::new();
        let a = program.add_var(1.0);
        let b = program.add_var(1.0);
        program.add_constraint(vec![(a, 1.0), (b, 1.0)], Sense::Ge, 3.0);
        assert_eq!(bnb().solve(&program).unwrap_err(), SolverError::Infeasible);
    }

    #[test]
    fn cancellation_yields_no_solution() {
        let flag = Arc::new(AtomicBool::new(true));
        let solver = BranchAndBound::new(SolverOptions {
            node_limit: None,
            cancel: Some(flag),
        });
        assert!(matches!(
            solver.solve(&triangle()),
            Err(SolverError::NoSolution(_))
        ));
    }

    #[test]
    fn node_limit_without_incumbent_yields_no_solution() {
        let mut program = triangle();
        // forbid the all-zero assignment so no incumbent exists up front
        program.add_constraint(vec![(0, 1.0), (1, 1.0), (2, 1.0)], Sense::Ge, 1.0);
        let solver = BranchAndBound::new(SolverOptions {
            node_limit: Some(1),
            cancel: None,
        });
        assert!(matches!(
            solver.solve(&program),
            Err(SolverError::NoSolution(_))
        ));
    }

    #[test]
    fn invalid_terms_are_rejected() {
        let mut program = BinaryProgram::new();
        program.add_var(1.0);
        program.add_constraint(vec![(5, 1.0)], Sense::Le, 1.0);
        assert!(matches!(
            bnb().solve(&program),
            Err(SolverError::InvalidProgram(_))
        ));
    }

    #[test]
    fn solver_kind_parses_and_displays() {
        assert_eq!("bnb".parse::<SolverKind>().unwrap(), SolverKind::BranchAndBound);
        assert_eq!("MicroLP".parse::<SolverKind>().unwrap(), SolverKind::MicroLp);
        assert!("cplex".parse::<SolverKind>().is_err());
        for kind in SolverKind::ALL {
            assert_eq!(kind.as_str().parse::<SolverKind>().unwrap(), kind);
        }
    }

    #[test]
    fn backend_registry_reflects_feature_flag() {
        let backends = available_backends();
        assert!(backends
            .iter()
            .any(|b| b.kind == SolverKind::BranchAndBound && b.available));
        let micro = backends
            .iter()
            .find(|b| b.kind == SolverKind::MicroLp)
            .expect("listed");
        assert_eq!(micro.available, cfg!(feature = "microlp"));
        assert_eq!(
            solver_for(SolverKind::MicroLp, SolverOptions::default()).is_ok(),
            cfg!(feature = "microlp")
        );
    }

    #[cfg(feature = "microlp")]
    #[test]
    fn microlp_agrees_with_branch_and_bound() {
        let program = triangle();
        let micro = solver_for(SolverKind::MicroLp, SolverOptions::default())
            .expect("compiled in")
            .solve(&program)
            .expect("solves");
        let exact = bnb().solve(&program).expect("solves");
        assert!((micro.objective - exact.objective).abs() < 1e-9);
        assert!(program.is_feasible(&micro.values));
    }
}
