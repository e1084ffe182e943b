//! Observations: goal constraints on the final grid.
//!
//! An observation says "cells holding `from` must eventually hold some value
//! in `to`". From the observations and the current state the engine derives
//! a per-cell *future set* (wave of acceptable terminal values), and from
//! the future set per-value *potentials*: how many rule applications, at
//! minimum, separate a value at a cell from the goal (backward) or from the
//! present state (forward).

use super::rule::{Rule, NO_WRITE};
use super::Grid;
use std::collections::VecDeque;

/// A goal constraint for one grid value.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Value the observed cells are folded to when the run starts
    pub from: u8,
    /// Wave of acceptable terminal values
    pub to: u32,
}

impl Observation {
    /// Build from symbols against a grid's alphabet. `None` when a symbol is
    /// not declared.
    pub fn new(from: char, to: &str, grid: &Grid) -> Option<Self> {
        let from_value = *grid.values.get(&from)?;
        Some(Self {
            from: from_value,
            to: grid.wave(to),
        })
    }

    /// Compute the future set from the present state.
    ///
    /// For each cell holding an observed value, `future[i]` becomes the
    /// observation's target wave and the cell is folded to its `from` value;
    /// unobserved cells pin their current value. Returns false when some
    /// observed value never occurs on the grid, which makes the observation
    /// infeasible.
    pub fn compute_future_set(
        future: &mut [i32],
        state: &mut [u8],
        observations: &[Option<Observation>],
    ) -> bool {
        let mut seen = vec![false; observations.len()];
        for (k, obs) in observations.iter().enumerate() {
            if obs.is_none() {
                seen[k] = true;
            }
        }

        for i in 0..state.len() {
            let value = state[i] as usize;
            if value >= observations.len() {
                future[i] = 1 << state[i];
                continue;
            }
            seen[value] = true;
            match &observations[value] {
                Some(obs) => {
                    future[i] = obs.to as i32;
                    state[i] = obs.from;
                }
                None => future[i] = 1 << value,
            }
        }

        seen.iter().all(|&s| s)
    }

    /// Potentials of reaching each (value, cell) from the present state:
    /// current values get 0, then rules propagate forward.
    pub fn compute_forward_potentials(
        potentials: &mut [Vec<i32>],
        state: &[u8],
        mx: usize,
        my: usize,
        mz: usize,
        rules: &[Rule],
    ) {
        for p in potentials.iter_mut() {
            p.fill(-1);
        }
        for (i, &value) in state.iter().enumerate() {
            if (value as usize) < potentials.len() {
                potentials[value as usize][i] = 0;
            }
        }
        propagate(potentials, mx, my, mz, rules, false);
    }

    /// Potentials of reaching the future set: values admitted by `future`
    /// get 0, then rules propagate backward (reverse application).
    pub fn compute_backward_potentials(
        potentials: &mut [Vec<i32>],
        future: &[i32],
        mx: usize,
        my: usize,
        mz: usize,
        rules: &[Rule],
    ) {
        for (c, potential) in potentials.iter_mut().enumerate() {
            for i in 0..future.len() {
                potential[i] = if (future[i] & (1 << c)) != 0 { 0 } else { -1 };
            }
        }
        propagate(potentials, mx, my, mz, rules, true);
    }

    /// True when every cell's present value is admitted by its future wave.
    pub fn is_goal_reached(present: &[u8], future: &[i32]) -> bool {
        present
            .iter()
            .zip(future)
            .all(|(&v, &f)| (f & (1 << v)) != 0)
    }

    /// Sum over cells of the minimum potential among the future-admitted
    /// values; -1 when some cell admits no reachable value.
    pub fn forward_pointwise(potentials: &[Vec<i32>], future: &[i32]) -> i32 {
        let mut sum = 0i32;
        for i in 0..future.len() {
            let mut f = future[i];
            let mut min = i32::MAX;
            for potential in potentials {
                if (f & 1) == 1 {
                    let p = potential[i];
                    if p >= 0 && p < min {
                        min = p;
                    }
                }
                f >>= 1;
            }
            if min == i32::MAX {
                return -1;
            }
            sum += min;
        }
        sum
    }

    /// Sum over cells of the potential of the present value; -1 when some
    /// cell's value is unreachable.
    pub fn backward_pointwise(potentials: &[Vec<i32>], present: &[u8]) -> i32 {
        let mut sum = 0i32;
        for (i, &value) in present.iter().enumerate() {
            let p = match potentials.get(value as usize) {
                Some(potential) => potential[i],
                None => return -1,
            };
            if p < 0 {
                return -1;
            }
            sum += p;
        }
        sum
    }
}

/// Fixed-point BFS over (value, cell) pairs through the rule set.
///
/// Forward: a pending pattern is satisfiable at level `t` when every binput
/// cell is reachable at ≤ t; firing stamps the outputs with t+1. Backward
/// swaps the roles of input and output.
fn propagate(
    potentials: &mut [Vec<i32>],
    mx: usize,
    my: usize,
    mz: usize,
    rules: &[Rule],
    backwards: bool,
) {
    let grid_size = mx * my * mz;
    let mut queue: VecDeque<(u8, i32, i32, i32)> = VecDeque::new();

    for (c, potential) in potentials.iter().enumerate() {
        for (i, &p) in potential.iter().enumerate() {
            if p == 0 {
                let x = (i % mx) as i32;
                let y = ((i % (mx * my)) / mx) as i32;
                let z = (i / (mx * my)) as i32;
                queue.push_back((c as u8, x, y, z));
            }
        }
    }

    let mut fired: Vec<Vec<bool>> = vec![vec![false; grid_size]; rules.len()];

    while let Some((value, x, y, z)) = queue.pop_front() {
        let i = x as usize + y as usize * mx + z as usize * mx * my;
        let t = potentials[value as usize][i];

        for (r, rule) in rules.iter().enumerate() {
            let shifts = if backwards { &rule.oshifts } else { &rule.ishifts };
            let Some(shifts) = shifts.get(value as usize) else {
                continue;
            };

            for &(sx, sy, sz) in shifts {
                let ax = x - sx;
                let ay = y - sy;
                let az = z - sz;
                if ax < 0
                    || ay < 0
                    || az < 0
                    || ax as usize + rule.imx > mx
                    || ay as usize + rule.imy > my
                    || az as usize + rule.imz > mz
                {
                    continue;
                }

                let ai = ax as usize + ay as usize * mx + az as usize * mx * my;
                if !fired[r][ai]
                    && pattern_satisfiable(
                        rule,
                        ax as usize,
                        ay as usize,
                        az as usize,
                        potentials,
                        t,
                        mx,
                        my,
                        backwards,
                    )
                {
                    fired[r][ai] = true;
                    stamp_pattern(
                        rule,
                        ax as usize,
                        ay as usize,
                        az as usize,
                        potentials,
                        t,
                        mx,
                        my,
                        &mut queue,
                        backwards,
                    );
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn pattern_satisfiable(
    rule: &Rule,
    x: usize,
    y: usize,
    z: usize,
    potentials: &[Vec<i32>],
    t: i32,
    mx: usize,
    my: usize,
    backwards: bool,
) -> bool {
    let pattern = if backwards { &rule.output } else { &rule.binput };

    let mut dx = 0usize;
    let mut dy = 0usize;
    let mut dz = 0usize;
    for &value in pattern {
        if value != NO_WRITE {
            let idx = (x + dx) + (y + dy) * mx + (z + dz) * mx * my;
            let p = potentials[value as usize][idx];
            if p > t || p == -1 {
                return false;
            }
        }
        dx += 1;
        if dx == rule.imx {
            dx = 0;
            dy += 1;
            if dy == rule.imy {
                dy = 0;
                dz += 1;
            }
        }
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn stamp_pattern(
    rule: &Rule,
    x: usize,
    y: usize,
    z: usize,
    potentials: &mut [Vec<i32>],
    t: i32,
    mx: usize,
    my: usize,
    queue: &mut VecDeque<(u8, i32, i32, i32)>,
    backwards: bool,
) {
    let pattern = if backwards { &rule.binput } else { &rule.output };

    for dz in 0..rule.imz {
        for dy in 0..rule.imy {
            for dx in 0..rule.imx {
                let idx = (x + dx) + (y + dy) * mx + (z + dz) * mx * my;
                let di = dx + dy * rule.imx + dz * rule.imx * rule.imy;
                let o = pattern[di];
                if o != NO_WRITE && potentials[o as usize][idx] == -1 {
                    potentials[o as usize][idx] = t + 1;
                    queue.push_back((o, (x + dx) as i32, (y + dy) as i32, (z + dz) as i32));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_from_symbols() {
        let grid = Grid::with_alphabet(5, 5, 1, "BWR");
        let obs = Observation::new('B', "WR", &grid).unwrap();
        assert_eq!(obs.from, 0);
        assert_eq!(obs.to, 0b110);
        assert!(Observation::new('X', "WR", &grid).is_none());
    }

    #[test]
    fn future_set_folds_and_targets() {
        let grid = Grid::with_alphabet(3, 3, 1, "BWR");
        let obs_b = Observation::new('B', "W", &grid).unwrap();
        let observations = vec![Some(obs_b), None, None];

        let mut state = vec![0u8; 9];
        let mut future = vec![0i32; 9];
        assert!(Observation::compute_future_set(
            &mut future,
            &mut state,
            &observations
        ));
        assert!(future.iter().all(|&f| f == 2));
        assert!(state.iter().all(|&s| s == 0));
    }

    #[test]
    fn future_set_missing_observed_value_is_infeasible() {
        let grid = Grid::with_alphabet(3, 1, 1, "BWR");
        // observe R, but the grid holds no R
        let obs_r = Observation::new('R', "W", &grid).unwrap();
        let observations = vec![None, None, Some(obs_r)];

        let mut state = vec![0u8, 1, 0];
        let mut future = vec![0i32; 3];
        assert!(!Observation::compute_future_set(
            &mut future,
            &mut state,
            &observations
        ));
    }

    #[test]
    fn goal_reached_checks_waves() {
        let future = vec![0b010i32, 0b011i32];
        assert!(Observation::is_goal_reached(&[1, 0], &future));
        assert!(!Observation::is_goal_reached(&[0, 0], &future));
    }

    #[test]
    fn backward_potentials_count_rule_steps() {
        let grid = Grid::with_alphabet(3, 1, 1, "BW");
        let rules = vec![Rule::parse("B", "W", &grid).unwrap()];
        let future = vec![2i32; 3];

        let mut potentials = vec![vec![0i32; 3]; 2];
        Observation::compute_backward_potentials(&mut potentials, &future, 3, 1, 1, &rules);

        assert_eq!(potentials[1], vec![0, 0, 0]);
        assert_eq!(potentials[0], vec![1, 1, 1]);
    }

    #[test]
    fn forward_potentials_count_rule_steps() {
        let grid = Grid::with_alphabet(3, 1, 1, "BW");
        let rules = vec![Rule::parse("B", "W", &grid).unwrap()];
        let state = vec![0u8; 3];

        let mut potentials = vec![vec![0i32; 3]; 2];
        Observation::compute_forward_potentials(&mut potentials, &state, 3, 1, 1, &rules);

        assert_eq!(potentials[0], vec![0, 0, 0]);
        assert_eq!(potentials[1], vec![1, 1, 1]);
    }

    #[test]
    fn two_step_chain_has_potential_two() {
        let grid = Grid::with_alphabet(3, 1, 1, "BWR");
        let rules = vec![
            Rule::parse("B", "W", &grid).unwrap(),
            Rule::parse("W", "R", &grid).unwrap(),
        ];
        let state = vec![0u8; 3];

        let mut potentials = vec![vec![0i32; 3]; 3];
        Observation::compute_forward_potentials(&mut potentials, &state, 3, 1, 1, &rules);

        assert_eq!(potentials[0], vec![0, 0, 0]);
        assert_eq!(potentials[1], vec![1, 1, 1]);
        assert_eq!(potentials[2], vec![2, 2, 2]);
    }

    #[test]
    fn pointwise_estimates() {
        let mut potentials = vec![vec![-1i32; 4]; 2];
        potentials[0][0] = 1;
        potentials[0][1] = 1;
        potentials[1][2] = 2;
        potentials[1][3] = 2;

        let future = vec![0b01i32, 0b01, 0b10, 0b10];
        assert_eq!(Observation::forward_pointwise(&potentials, &future), 6);

        let unreachable_future = vec![0b10i32, 0b01, 0b10, 0b10];
        assert_eq!(
            Observation::forward_pointwise(&potentials, &unreachable_future),
            -1
        );

        let mut bp = vec![vec![0i32; 4]; 2];
        bp[0][0] = 3;
        bp[0][1] = 2;
        bp[1][2] = 1;
        assert_eq!(Observation::backward_pointwise(&bp, &[0, 0, 1, 1]), 6);

        bp[0][0] = -1;
        assert_eq!(Observation::backward_pointwise(&bp, &[0, 0, 1, 1]), -1);
    }
}
