//! Best-first trajectory search.
//!
//! When an observation runs in search mode, the node does not rewrite the
//! grid step by step; instead it searches the space of rule applications for
//! a trajectory from the present state into the future set, then replays it.
//!
//! The search is cooperative: [`SearchRun::resume`] expands a bounded number
//! of frontier states and either reports progress (the owning node surfaces
//! it as a HALT) or completes with a trajectory. Priority combines the
//! forward and backward pointwise estimates with a depth bias; `limit`
//! bounds the number of stored states.

use super::observation::Observation;
use super::rng::Prng;
use super::rule::{Rule, NO_WRITE};
use std::collections::{BinaryHeap, HashMap};

/// A state node in the search tree.
#[derive(Clone)]
struct Board {
    state: Vec<u8>,
    parent_index: i32,
    depth: i32,
    backward_estimate: i32,
    forward_estimate: i32,
}

impl Board {
    fn new(
        state: Vec<u8>,
        parent_index: i32,
        depth: i32,
        backward_estimate: i32,
        forward_estimate: i32,
    ) -> Self {
        Self {
            state,
            parent_index,
            depth,
            backward_estimate,
            forward_estimate,
        }
    }

    /// Priority for the frontier; lower is expanded first. A negative depth
    /// coefficient prefers deeper states outright.
    fn rank(&self, random: &mut Prng, depth_coefficient: f64) -> f64 {
        let result = if depth_coefficient < 0.0 {
            1000.0 - self.depth as f64
        } else {
            (self.forward_estimate + self.backward_estimate) as f64
                + 2.0 * depth_coefficient * self.depth as f64
        };
        result + 0.0001 * random.next_double()
    }

    /// Walk parent links from `index` back to (but excluding) the root.
    fn trajectory(index: usize, database: &[Board]) -> Vec<Board> {
        let mut result = Vec::new();
        let mut current = &database[index];
        while current.parent_index >= 0 {
            result.push(current.clone());
            current = &database[current.parent_index as usize];
        }
        result
    }
}

/// Min-heap entry (std's heap is a max-heap, so the ordering is reversed).
struct PriorityEntry {
    index: usize,
    priority: f64,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .partial_cmp(&self.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

fn state_hash(state: &[u8]) -> u64 {
    let mut result = 17u64;
    for &b in state {
        result = result.wrapping_mul(29).wrapping_add(b as u64);
    }
    result
}

/// Outcome of one [`SearchRun::resume`] slice.
pub enum SearchStatus {
    /// Budget exhausted; payload is the number of states stored so far
    Pending(i32),
    /// Search finished: a trajectory of grid states from the first
    /// application to the goal (empty when already at the goal), or `None`
    /// when the problem is infeasible or the frontier/limit was exhausted
    Done(Option<Vec<Vec<u8>>>),
}

/// A suspended best-first search over rule applications.
pub struct SearchRun {
    rules: Vec<Rule>,
    future: Vec<i32>,
    mx: usize,
    my: usize,
    mz: usize,
    all: bool,
    limit: i32,
    depth_coefficient: f64,
    bpotentials: Vec<Vec<i32>>,
    fpotentials: Vec<Vec<i32>>,
    database: Vec<Board>,
    visited: HashMap<u64, usize>,
    frontier: BinaryHeap<PriorityEntry>,
    random: Prng,
    outcome: Option<Option<Vec<Vec<u8>>>>,
}

impl SearchRun {
    /// Seed a search from the present state.
    ///
    /// `all` selects All-node expansion semantics (maximal non-overlapping
    /// application sets) instead of single applications; `limit` bounds the
    /// stored states (≤ 0 means unbounded); `seed` decorrelates tie-breaks
    /// between retries.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        present: &[u8],
        future: &[i32],
        rules: &[Rule],
        mx: usize,
        my: usize,
        mz: usize,
        c: usize,
        all: bool,
        limit: i32,
        depth_coefficient: f64,
        seed: u64,
    ) -> Self {
        let grid_size = mx * my * mz;
        let mut bpotentials = vec![vec![-1i32; grid_size]; c];
        let mut fpotentials = vec![vec![-1i32; grid_size]; c];

        Observation::compute_backward_potentials(&mut bpotentials, future, mx, my, mz, rules);
        let root_backward = Observation::backward_pointwise(&bpotentials, present);

        Observation::compute_forward_potentials(&mut fpotentials, present, mx, my, mz, rules);
        let root_forward = Observation::forward_pointwise(&fpotentials, future);

        let mut run = Self {
            rules: rules.to_vec(),
            future: future.to_vec(),
            mx,
            my,
            mz,
            all,
            limit,
            depth_coefficient,
            bpotentials,
            fpotentials,
            database: Vec::new(),
            visited: HashMap::new(),
            frontier: BinaryHeap::new(),
            random: Prng::from_seed(seed),
            outcome: None,
        };

        if root_backward < 0 || root_forward < 0 {
            run.outcome = Some(None);
            return run;
        }
        if root_backward == 0 {
            run.outcome = Some(Some(Vec::new()));
            return run;
        }

        let root = Board::new(present.to_vec(), -1, 0, root_backward, root_forward);
        let priority = root.rank(&mut run.random, depth_coefficient);
        run.database.push(root);
        run.visited.insert(state_hash(present), 0);
        run.frontier.push(PriorityEntry { index: 0, priority });
        run
    }

    /// States stored so far; the HALT progress payload.
    pub fn visited_count(&self) -> i32 {
        self.database.len() as i32
    }

    /// Expand up to `budget` frontier states.
    pub fn resume(&mut self, budget: usize) -> SearchStatus {
        if let Some(outcome) = self.outcome.take() {
            return SearchStatus::Done(outcome);
        }

        for _ in 0..budget {
            if self.frontier.is_empty()
                || (self.limit > 0 && self.database.len() as i32 >= self.limit)
            {
                log::warn!(
                    "search exhausted after {} states without reaching the goal",
                    self.database.len()
                );
                return SearchStatus::Done(None);
            }
            if let Some(trajectory) = self.expand_one() {
                return SearchStatus::Done(Some(trajectory));
            }
        }

        SearchStatus::Pending(self.visited_count())
    }

    /// Pop and expand one state; returns a trajectory when a child reaches
    /// the goal.
    fn expand_one(&mut self) -> Option<Vec<Vec<u8>>> {
        let entry = self.frontier.pop()?;
        let parent_index = entry.index;
        let parent_depth = self.database[parent_index].depth;
        let parent_state = self.database[parent_index].state.clone();

        let children = if self.all {
            all_child_states(&parent_state, self.mx, self.my, &self.rules)
        } else {
            one_child_states(&parent_state, self.mx, self.my, &self.rules)
        };

        for child_state in children {
            let hash = state_hash(&child_state);

            if let Some(&child_index) = self.visited.get(&hash) {
                let board = &mut self.database[child_index];
                if parent_depth + 1 < board.depth {
                    board.depth = parent_depth + 1;
                    board.parent_index = parent_index as i32;
                    if board.backward_estimate >= 0 && board.forward_estimate >= 0 {
                        let priority = board.rank(&mut self.random, self.depth_coefficient);
                        self.frontier.push(PriorityEntry {
                            index: child_index,
                            priority,
                        });
                    }
                }
            } else {
                let child_backward =
                    Observation::backward_pointwise(&self.bpotentials, &child_state);
                Observation::compute_forward_potentials(
                    &mut self.fpotentials,
                    &child_state,
                    self.mx,
                    self.my,
                    self.mz,
                    &self.rules,
                );
                let child_forward =
                    Observation::forward_pointwise(&self.fpotentials, &self.future);

                if child_backward < 0 || child_forward < 0 {
                    continue;
                }

                let child = Board::new(
                    child_state,
                    parent_index as i32,
                    parent_depth + 1,
                    child_backward,
                    child_forward,
                );
                let priority = child.rank(&mut self.random, self.depth_coefficient);
                self.database.push(child);
                let child_index = self.database.len() - 1;
                self.visited.insert(hash, child_index);

                if child_forward == 0 {
                    let mut trajectory = Board::trajectory(child_index, &self.database);
                    trajectory.reverse();
                    return Some(trajectory.into_iter().map(|b| b.state).collect());
                }
                self.frontier.push(PriorityEntry {
                    index: child_index,
                    priority,
                });
            }
        }

        None
    }
}

/// Child states from applying one rule at one anchor (One semantics).
fn one_child_states(state: &[u8], mx: usize, my: usize, rules: &[Rule]) -> Vec<Vec<u8>> {
    let mut result = Vec::new();
    for rule in rules {
        for y in 0..my {
            for x in 0..mx {
                if matches_rule(rule, x, y, state, mx, my) {
                    result.push(apply_rule(rule, x, y, state, mx));
                }
            }
        }
    }
    result
}

/// Child states from every maximal non-overlapping application set
/// (All semantics).
fn all_child_states(state: &[u8], mx: usize, my: usize, rules: &[Rule]) -> Vec<Vec<u8>> {
    let mut list: Vec<(usize, usize)> = Vec::new();
    let mut amounts = vec![0i32; state.len()];

    for i in 0..state.len() {
        let x = i % mx;
        let y = i / mx;
        for (r, rule) in rules.iter().enumerate() {
            if matches_rule(rule, x, y, state, mx, my) {
                list.push((r, i));
                for dy in 0..rule.imy {
                    for dx in 0..rule.imx {
                        amounts[x + dx + (y + dy) * mx] += 1;
                    }
                }
            }
        }
    }

    if list.is_empty() {
        return Vec::new();
    }

    let mut mask = vec![true; list.len()];
    let mut solution: Vec<(usize, usize)> = Vec::new();
    let mut result: Vec<Vec<u8>> = Vec::new();
    enumerate_solutions(
        &mut result,
        &mut solution,
        &list,
        &mut amounts,
        &mut mask,
        state,
        mx,
        rules,
    );
    result
}

/// Recursively enumerate maximal non-overlapping match combinations: pick
/// the most-covered cell, branch on every match covering it.
#[allow(clippy::too_many_arguments)]
fn enumerate_solutions(
    children: &mut Vec<Vec<u8>>,
    solution: &mut Vec<(usize, usize)>,
    tiles: &[(usize, usize)],
    amounts: &mut [i32],
    mask: &mut [bool],
    state: &[u8],
    mx: usize,
    rules: &[Rule],
) {
    let max_idx = max_positive_index(amounts);
    if max_idx < 0 {
        children.push(apply_solution(state, solution, mx, rules));
        return;
    }
    let max_x = (max_idx as usize) % mx;
    let max_y = (max_idx as usize) / mx;

    let cover: Vec<usize> = (0..tiles.len())
        .filter(|&l| {
            let (r, i) = tiles[l];
            mask[l] && is_inside(max_x, max_y, &rules[r], i % mx, i / mx)
        })
        .collect();

    for &l0 in &cover {
        let (r, i) = tiles[l0];
        solution.push((r, i));

        let mut intersecting: Vec<usize> = Vec::new();
        for l in 0..tiles.len() {
            if mask[l] {
                let (r1, i1) = tiles[l];
                if overlaps(&rules[r], i % mx, i / mx, &rules[r1], i1 % mx, i1 / mx) {
                    intersecting.push(l);
                }
            }
        }

        for &l in &intersecting {
            hide(l, false, tiles, amounts, mask, mx, rules);
        }
        enumerate_solutions(children, solution, tiles, amounts, mask, state, mx, rules);
        for &l in &intersecting {
            hide(l, true, tiles, amounts, mask, mx, rules);
        }

        solution.pop();
    }
}

fn max_positive_index(amounts: &[i32]) -> i32 {
    let mut max_val = 0i32;
    let mut max_idx = -1i32;
    for (i, &amt) in amounts.iter().enumerate() {
        if amt > max_val {
            max_val = amt;
            max_idx = i as i32;
        }
    }
    max_idx
}

fn is_inside(px: usize, py: usize, rule: &Rule, x: usize, y: usize) -> bool {
    x <= px && px < x + rule.imx && y <= py && py < y + rule.imy
}

fn overlaps(rule0: &Rule, x0: usize, y0: usize, rule1: &Rule, x1: usize, y1: usize) -> bool {
    for dy in 0..rule0.imy {
        for dx in 0..rule0.imx {
            if is_inside(x0 + dx, y0 + dy, rule1, x1, y1) {
                return true;
            }
        }
    }
    false
}

fn hide(
    l: usize,
    unhide: bool,
    tiles: &[(usize, usize)],
    amounts: &mut [i32],
    mask: &mut [bool],
    mx: usize,
    rules: &[Rule],
) {
    mask[l] = unhide;
    let (r, i) = tiles[l];
    let rule = &rules[r];
    let x = i % mx;
    let y = i / mx;
    let incr = if unhide { 1 } else { -1 };
    for dy in 0..rule.imy {
        for dx in 0..rule.imx {
            amounts[x + dx + (y + dy) * mx] += incr;
        }
    }
}

fn apply_solution(state: &[u8], solution: &[(usize, usize)], mx: usize, rules: &[Rule]) -> Vec<u8> {
    let mut result = state.to_vec();
    for &(r, i) in solution {
        apply_rule_in_place(&rules[r], i % mx, i / mx, &mut result, mx);
    }
    result
}

fn matches_rule(rule: &Rule, x: usize, y: usize, state: &[u8], mx: usize, my: usize) -> bool {
    if x + rule.imx > mx || y + rule.imy > my {
        return false;
    }
    let mut dx = 0;
    let mut dy = 0;
    for &wave in &rule.input {
        if (wave & (1 << state[x + dx + (y + dy) * mx])) == 0 {
            return false;
        }
        dx += 1;
        if dx == rule.imx {
            dx = 0;
            dy += 1;
        }
    }
    true
}

fn apply_rule(rule: &Rule, x: usize, y: usize, state: &[u8], mx: usize) -> Vec<u8> {
    let mut result = state.to_vec();
    apply_rule_in_place(rule, x, y, &mut result, mx);
    result
}

fn apply_rule_in_place(rule: &Rule, x: usize, y: usize, state: &mut [u8], mx: usize) {
    for dy in 0..rule.omy {
        for dx in 0..rule.omx {
            let value = rule.output[dx + dy * rule.omx];
            if value != NO_WRITE {
                state[x + dx + (y + dy) * mx] = value;
            }
        }
    }
}

/// Run a search to completion in one call. Used by tests and callers that
/// don't need cooperative suspension.
#[allow(clippy::too_many_arguments)]
pub fn run_to_completion(
    present: &[u8],
    future: &[i32],
    rules: &[Rule],
    mx: usize,
    my: usize,
    mz: usize,
    c: usize,
    all: bool,
    limit: i32,
    depth_coefficient: f64,
    seed: u64,
) -> Option<Vec<Vec<u8>>> {
    let mut run = SearchRun::new(
        present,
        future,
        rules,
        mx,
        my,
        mz,
        c,
        all,
        limit,
        depth_coefficient,
        seed,
    );
    loop {
        match run.resume(4096) {
            SearchStatus::Pending(_) => continue,
            SearchStatus::Done(result) => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Grid;

    #[test]
    fn matches_and_applies() {
        let grid = Grid::with_alphabet(5, 5, 1, "BW");
        let rule = Rule::parse("BW", "WB", &grid).unwrap();

        let mut state = vec![0u8; 25];
        state[1] = 1;
        assert!(matches_rule(&rule, 0, 0, &state, 5, 5));
        assert!(!matches_rule(&rule, 1, 0, &state, 5, 5));

        let single = Rule::parse("B", "W", &grid).unwrap();
        let new_state = apply_rule(&single, 0, 0, &state, 5);
        assert_eq!(new_state[0], 1);
        assert_eq!(new_state[2], 0);
    }

    #[test]
    fn one_child_states_enumerates_anchors() {
        let grid = Grid::with_alphabet(3, 1, 1, "BW");
        let rules = vec![Rule::parse("B", "W", &grid).unwrap()];
        let children = one_child_states(&[0, 0, 0], 3, 1, &rules);

        assert_eq!(children.len(), 3);
        assert!(children.contains(&vec![1, 0, 0]));
        assert!(children.contains(&vec![0, 1, 0]));
        assert!(children.contains(&vec![0, 0, 1]));
    }

    #[test]
    fn all_child_states_covers_maximal_sets() {
        let grid = Grid::with_alphabet(4, 1, 1, "BW");
        let rules = vec![Rule::parse("BB", "WW", &grid).unwrap()];
        let children = all_child_states(&[0, 0, 0, 0], 4, 1, &rules);

        assert!(!children.is_empty());
        assert!(children.contains(&vec![1, 1, 1, 1]));
    }

    #[test]
    fn finds_simple_solution() {
        let grid = Grid::with_alphabet(3, 1, 1, "BW");
        let rules = vec![Rule::parse("B", "W", &grid).unwrap()];
        let future = vec![2i32; 3];

        let result = run_to_completion(&[0, 0, 0], &future, &rules, 3, 1, 1, 2, false, 0, 0.0, 42);
        let trajectory = result.unwrap();
        assert_eq!(trajectory.len(), 3);
        assert_eq!(trajectory.last().unwrap(), &vec![1u8, 1, 1]);
    }

    #[test]
    fn already_at_goal_yields_empty_trajectory() {
        let grid = Grid::with_alphabet(3, 1, 1, "BW");
        let rules = vec![Rule::parse("B", "W", &grid).unwrap()];
        let future = vec![2i32; 3];

        let result = run_to_completion(&[1, 1, 1], &future, &rules, 3, 1, 1, 2, false, 0, 0.0, 42);
        assert_eq!(result.unwrap().len(), 0);
    }

    #[test]
    fn infeasible_goal_returns_none() {
        let grid = Grid::with_alphabet(3, 1, 1, "BWR");
        let rules = vec![Rule::parse("B", "W", &grid).unwrap()];
        let future = vec![4i32; 3]; // all R, but no rule makes R

        let result = run_to_completion(&[0, 0, 0], &future, &rules, 3, 1, 1, 3, false, 0, 0.0, 42);
        assert!(result.is_none());
    }

    #[test]
    fn limit_bounds_the_search() {
        let grid = Grid::with_alphabet(5, 1, 1, "BW");
        let rules = vec![Rule::parse("B", "W", &grid).unwrap()];
        let future = vec![2i32; 5];

        let result = run_to_completion(&[0; 5], &future, &rules, 5, 1, 1, 2, false, 2, 0.0, 42);
        assert!(result.is_none());
    }

    #[test]
    fn resume_reports_progress_under_tiny_budget() {
        let grid = Grid::with_alphabet(4, 1, 1, "BW");
        let rules = vec![Rule::parse("B", "W", &grid).unwrap()];
        let future = vec![2i32; 4];

        let mut run = SearchRun::new(&[0; 4], &future, &rules, 4, 1, 1, 2, false, 0, 0.0, 7);
        let mut pending_seen = false;
        let trajectory = loop {
            match run.resume(1) {
                SearchStatus::Pending(visited) => {
                    assert!(visited >= 1);
                    pending_seen = true;
                }
                SearchStatus::Done(result) => break result,
            }
        };
        assert!(pending_seen);
        assert_eq!(trajectory.unwrap().last().unwrap(), &vec![1u8, 1, 1, 1]);
    }

    #[test]
    fn state_hash_distinguishes() {
        assert_eq!(state_hash(&[0, 1, 2]), state_hash(&[0, 1, 2]));
        assert_ne!(state_hash(&[0, 1, 2]), state_hash(&[0, 1, 3]));
    }
}
