//! Batch assignment solvers.
//!
//! `Exact` runs Kuhn-Munkres over the candidate matrix. The objective is
//! lexicographic: most matched requests, then lowest total cost, then older
//! requests first. `Greedy` walks every candidate pair in ascending cost order
//! and is used once the batch outgrows `max_exact_match_batch_size`.

use std::collections::HashSet;

use pathfinding::kuhn_munkres::{kuhn_munkres, Weights};
use serde::Serialize;

/// Cost resolution fed to the exact solver (thousandths of a minute).
const COST_SCALE: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolverKind {
    Exact,
    Greedy,
}

impl SolverKind {
    pub fn label(&self) -> &'static str {
        match self {
            SolverKind::Exact => "exact",
            SolverKind::Greedy => "greedy",
        }
    }
}

/// One feasible (request, driver) pairing. Request indices are ordered by
/// `requested_at`, so a lower index is an older request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub request: usize,
    pub driver: usize,
    pub cost: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MatchProblem {
    pub requests: usize,
    pub drivers: usize,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub solver: SolverKind,
    /// Indices into `MatchProblem::edges`.
    pub chosen: Vec<usize>,
    /// Set when the batch was too large for the exact solver.
    pub exact_limit_exceeded: Option<(usize, usize)>,
}

struct I64Weights(Vec<Vec<i64>>);

impl Weights<i64> for I64Weights {
    fn rows(&self) -> usize {
        self.0.len()
    }

    fn columns(&self) -> usize {
        self.0.first().map_or(0, |r| r.len())
    }

    fn at(&self, row: usize, col: usize) -> i64 {
        self.0[row][col]
    }

    fn neg(&self) -> Self {
        I64Weights(
            self.0
                .iter()
                .map(|r| r.iter().map(|&x| x.saturating_neg()).collect())
                .collect(),
        )
    }
}

pub fn solve(problem: &MatchProblem, max_exact_batch: usize) -> Solution {
    let batch = problem
        .edges
        .iter()
        .map(|edge| edge.request)
        .collect::<HashSet<_>>()
        .len();

    if batch == 0 {
        return Solution {
            solver: SolverKind::Exact,
            chosen: Vec::new(),
            exact_limit_exceeded: None,
        };
    }

    if batch > max_exact_batch {
        return Solution {
            solver: SolverKind::Greedy,
            chosen: solve_greedy(problem),
            exact_limit_exceeded: Some((batch, max_exact_batch)),
        };
    }

    match solve_exact(problem) {
        Some(chosen) => Solution {
            solver: SolverKind::Exact,
            chosen,
            exact_limit_exceeded: None,
        },
        None => Solution {
            solver: SolverKind::Greedy,
            chosen: solve_greedy(problem),
            exact_limit_exceeded: Some((batch, max_exact_batch)),
        },
    }
}

pub fn solve_greedy(problem: &MatchProblem) -> Vec<usize> {
    let mut order: Vec<usize> = (0..problem.edges.len()).collect();
    order.sort_by(|&a, &b| {
        let (ea, eb) = (&problem.edges[a], &problem.edges[b]);
        ea.cost
            .total_cmp(&eb.cost)
            .then_with(|| ea.request.cmp(&eb.request))
            .then_with(|| ea.driver.cmp(&eb.driver))
    });

    let mut used_requests = HashSet::new();
    let mut used_drivers = HashSet::new();
    let mut chosen = Vec::new();

    for idx in order {
        let edge = &problem.edges[idx];
        if used_requests.contains(&edge.request) || used_drivers.contains(&edge.driver) {
            continue;
        }
        used_requests.insert(edge.request);
        used_drivers.insert(edge.driver);
        chosen.push(idx);
    }

    chosen
}

/// Returns `None` when the scaled weights would not fit in i64.
pub fn solve_exact(problem: &MatchProblem) -> Option<Vec<usize>> {
    if problem.edges.is_empty() {
        return Some(Vec::new());
    }

    let n = problem.requests as i128;
    // Tie bonus per matched request is at most n, so n*n+1 keeps one
    // thousandth of a minute worth more than any tie-break total.
    let tie_scale = n * n + 1;

    let feasible: Vec<i128> = problem
        .edges
        .iter()
        .map(|edge| {
            let scaled = (edge.cost * COST_SCALE).round() as i128;
            -scaled * tie_scale + (n - edge.request as i128)
        })
        .collect();

    let requests_are_rows = problem.requests <= problem.drivers;
    let (rows, cols) = if requests_are_rows {
        (problem.requests, problem.drivers)
    } else {
        (problem.drivers, problem.requests)
    };

    // Feasible totals over any set of rows differ by at most
    // 2 * rows * max_abs, so one infeasible cell must cost more than that for
    // an extra match to always win, whatever the sign of the costs.
    let max_abs = feasible.iter().map(|w| w.abs()).max().unwrap_or(0);
    let infeasible = -(2 * rows as i128 * max_abs + 1);
    let bound = infeasible.abs() * (rows as i128 + 1);
    if bound > i128::from(i64::MAX) {
        return None;
    }
    let infeasible = infeasible as i64;

    let mut matrix = vec![vec![infeasible; cols]; rows];
    let mut edge_at = vec![vec![None; cols]; rows];
    for (idx, (edge, weight)) in problem.edges.iter().zip(&feasible).enumerate() {
        let (row, col) = if requests_are_rows {
            (edge.request, edge.driver)
        } else {
            (edge.driver, edge.request)
        };
        let weight = *weight as i64;
        if edge_at[row][col].is_none() || weight > matrix[row][col] {
            matrix[row][col] = weight;
            edge_at[row][col] = Some(idx);
        }
    }

    let weights = I64Weights(matrix);
    let (_total, assignment) = kuhn_munkres(&weights);

    let chosen = assignment
        .iter()
        .enumerate()
        .filter_map(|(row, &col)| edge_at[row].get(col).copied().flatten())
        .collect();

    Some(chosen)
}

#[cfg(test)]
mod tests {
    use super::{solve, solve_exact, solve_greedy, Edge, MatchProblem, SolverKind};

    fn edge(request: usize, driver: usize, cost: f64) -> Edge {
        Edge {
            request,
            driver,
            cost,
        }
    }

    fn pairs(problem: &MatchProblem, chosen: &[usize]) -> Vec<(usize, usize)> {
        let mut out: Vec<(usize, usize)> = chosen
            .iter()
            .map(|&i| (problem.edges[i].request, problem.edges[i].driver))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn exact_beats_greedy_on_crossing_costs() {
        // Greedy grabs (0,0) at cost 1 and leaves request 1 with cost 10.
        let problem = MatchProblem {
            requests: 2,
            drivers: 2,
            edges: vec![edge(0, 0, 1.0), edge(0, 1, 2.0), edge(1, 0, 2.0), edge(1, 1, 10.0)],
        };

        let exact = solve_exact(&problem).unwrap();
        assert_eq!(pairs(&problem, &exact), vec![(0, 1), (1, 0)]);

        let greedy = solve_greedy(&problem);
        assert_eq!(pairs(&problem, &greedy), vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn exact_prefers_more_matches_over_lower_cost() {
        let problem = MatchProblem {
            requests: 2,
            drivers: 2,
            edges: vec![edge(0, 0, 0.0), edge(0, 1, 50.0), edge(1, 0, 50.0)],
        };

        let chosen = solve_exact(&problem).unwrap();
        assert_eq!(pairs(&problem, &chosen), vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn exact_keeps_full_cardinality_with_mixed_sign_costs() {
        // Negative costs on (0,0) and (1,1) tempt the solver into a two-pair
        // matching that strands request 2.
        let problem = MatchProblem {
            requests: 3,
            drivers: 3,
            edges: vec![
                edge(0, 0, -1.0),
                edge(1, 1, -1.0),
                edge(2, 0, 1.0),
                edge(0, 1, 1.0),
                edge(1, 2, 1.0),
            ],
        };

        let chosen = solve_exact(&problem).unwrap();
        assert_eq!(chosen.len(), 3);
        assert_eq!(pairs(&problem, &chosen), vec![(0, 1), (1, 2), (2, 0)]);
    }

    #[test]
    fn exact_matches_as_many_as_greedy_when_fairness_dominates() {
        // Every cost negative, as with fairness_weight close to 1.
        let problem = MatchProblem {
            requests: 4,
            drivers: 4,
            edges: vec![
                edge(0, 0, -90.0),
                edge(1, 1, -80.0),
                edge(2, 2, -70.0),
                edge(3, 0, -1.0),
                edge(0, 1, -1.0),
                edge(1, 2, -1.0),
                edge(2, 3, -1.0),
            ],
        };

        let chosen = solve_exact(&problem).unwrap();
        assert_eq!(chosen.len(), 4);
        assert!(chosen.len() >= solve_greedy(&problem).len());
    }

    #[test]
    fn ties_go_to_the_oldest_request() {
        let problem = MatchProblem {
            requests: 2,
            drivers: 1,
            edges: vec![edge(1, 0, 3.0), edge(0, 0, 3.0)],
        };

        assert_eq!(pairs(&problem, &solve_exact(&problem).unwrap()), vec![(0, 0)]);
        assert_eq!(pairs(&problem, &solve_greedy(&problem)), vec![(0, 0)]);
    }

    #[test]
    fn more_requests_than_drivers_is_transposed() {
        let problem = MatchProblem {
            requests: 3,
            drivers: 1,
            edges: vec![edge(0, 0, 5.0), edge(1, 0, 1.0), edge(2, 0, 3.0)],
        };

        assert_eq!(pairs(&problem, &solve_exact(&problem).unwrap()), vec![(1, 0)]);
    }

    #[test]
    fn unconnected_rows_are_left_unmatched() {
        let problem = MatchProblem {
            requests: 2,
            drivers: 3,
            edges: vec![edge(0, 2, 4.0)],
        };

        assert_eq!(pairs(&problem, &solve_exact(&problem).unwrap()), vec![(0, 2)]);
    }

    #[test]
    fn oversized_batches_switch_to_greedy() {
        let problem = MatchProblem {
            requests: 3,
            drivers: 3,
            edges: vec![edge(0, 0, 1.0), edge(1, 1, 1.0), edge(2, 2, 1.0)],
        };

        let solution = solve(&problem, 2);
        assert_eq!(solution.solver, SolverKind::Greedy);
        assert_eq!(solution.exact_limit_exceeded, Some((3, 2)));
        assert_eq!(solution.chosen.len(), 3);

        let solution = solve(&problem, 3);
        assert_eq!(solution.solver, SolverKind::Exact);
        assert!(solution.exact_limit_exceeded.is_none());
    }
}
