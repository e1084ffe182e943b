//! `All`: apply every non-conflicting match in one step.
//!
//! The match list is shuffled (or ordered by potential when guided), then
//! applied in order; a match whose output footprint touches a cell already
//! written this step is skipped. The grid's scratch mask tracks written
//! cells and is wiped again before the step ends.

use super::field::delta_pointwise;
use super::node::{ExecutionContext, Node, RunState};
use super::rng::shuffle_indices;
use super::rule::{Rule, NO_WRITE};
use super::rule_node::{Prep, RuleNodeData};

pub struct AllNode {
    pub data: RuleNodeData,
}

impl AllNode {
    pub fn new(rules: Vec<Rule>, grid_size: usize) -> Self {
        Self {
            data: RuleNodeData::new(rules, grid_size),
        }
    }

    /// Order match-list indices by potential score, best first. Uses the
    /// same key as `One`'s guided draw so temperature behaves alike.
    fn guided_order(&self, ctx: &mut ExecutionContext) -> Vec<usize> {
        let mx = ctx.grid.mx;
        let my = ctx.grid.my;
        let temperature = self.data.temperature;
        let potentials = self.data.potentials.as_ref().expect("guided order needs potentials");
        let fields = self.data.fields.as_deref();

        let mut first_heuristic = 0.0f64;
        let mut first_computed = false;
        let mut scored: Vec<(usize, f64)> = Vec::new();

        for m in 0..self.data.match_count {
            let (r, x, y, z) = self.data.matches[m];
            let delta = delta_pointwise(
                &ctx.grid.state,
                &self.data.rules[r],
                x,
                y,
                z,
                fields,
                potentials,
                mx,
                my,
            );
            if let Some(h) = delta {
                let h = h as f64;
                if !first_computed {
                    first_heuristic = h;
                    first_computed = true;
                }
                let u = ctx.random.next_double();
                let key = if temperature > 0.0 {
                    u.powf(((h - first_heuristic) / temperature).exp())
                } else {
                    -h + 0.001 * u
                };
                scored.push((m, key));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(m, _)| m).collect()
    }

    /// Apply one match unless its output footprint conflicts with a cell
    /// already written this step.
    fn fit(&mut self, r: usize, x: i32, y: i32, z: i32, ctx: &mut ExecutionContext) {
        let rule = &self.data.rules[r];
        let mx = ctx.grid.mx;
        let my = ctx.grid.my;

        for dz in 0..rule.omz {
            for dy in 0..rule.omy {
                for dx in 0..rule.omx {
                    let value = rule.output[dx + dy * rule.omx + dz * rule.omx * rule.omy];
                    if value != NO_WRITE {
                        let si = (x as usize + dx)
                            + (y as usize + dy) * mx
                            + (z as usize + dz) * mx * my;
                        if ctx.grid.mask[si] {
                            return;
                        }
                    }
                }
            }
        }

        self.data.last[r] = true;
        let rule = &self.data.rules[r];
        for dz in 0..rule.omz {
            for dy in 0..rule.omy {
                for dx in 0..rule.omx {
                    let value = rule.output[dx + dy * rule.omx + dz * rule.omx * rule.omy];
                    if value != NO_WRITE {
                        let sx = x + dx as i32;
                        let sy = y + dy as i32;
                        let sz = z + dz as i32;
                        let si = sx as usize + sy as usize * mx + sz as usize * mx * my;
                        ctx.grid.mask[si] = true;
                        if ctx.grid.state[si] != value {
                            ctx.grid.state[si] = value;
                            ctx.record_change(sx, sy, sz);
                        }
                    }
                }
            }
        }
    }
}

impl Node for AllNode {
    fn run(&mut self, ctx: &mut ExecutionContext) -> RunState {
        match self.data.prepare(ctx, true) {
            Prep::Fail => return RunState::Fail,
            Prep::Halt(progress) => return RunState::Halt(progress),
            Prep::Ready => {}
        }

        self.data.last_matched_turn = ctx.counter as i32;

        if self.data.trajectory.is_some() {
            return if self.data.replay_trajectory(ctx) {
                RunState::Success
            } else {
                RunState::Fail
            };
        }

        if self.data.match_count == 0 {
            return RunState::Fail;
        }

        let mx = ctx.grid.mx;
        let my = ctx.grid.my;

        let ordered = if self.data.potentials.is_some() {
            self.guided_order(ctx)
        } else {
            shuffle_indices(self.data.match_count, ctx.random)
        };

        let changes_start = ctx.changes.len();
        for k in ordered {
            let (r, x, y, z) = self.data.matches[k];
            let i = x as usize + y as usize * mx + z as usize * mx * my;
            self.data.match_mask[r][i] = false;
            if ctx.grid.matches(&self.data.rules[r], x, y, z) {
                self.fit(r, x, y, z, ctx);
            }
        }

        ctx.grid.clear_mask();
        self.data.counter += 1;
        self.data.match_count = 0;

        if ctx.changes.len() > changes_start {
            RunState::Success
        } else {
            RunState::Fail
        }
    }

    fn reset(&mut self) {
        self.data.reset();
        self.data.clear_match_mask();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use crate::rng::Prng;
    use crate::Grid;

    fn step_ok(node: &mut AllNode, ctx: &mut ExecutionContext) -> bool {
        match node.run(ctx) {
            RunState::Success => {
                ctx.counter += 1;
                ctx.first.push(ctx.changes.len());
                true
            }
            RunState::Fail => false,
            RunState::Halt(_) => panic!("unexpected halt"),
        }
    }

    #[test]
    fn single_cell_rule_fills_grid_in_one_step() {
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut node = AllNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert!(ctx.grid.state.iter().all(|&v| v == 1));
    }

    #[test]
    fn overlapping_matches_apply_conflict_free() {
        // BB -> WW on BBBBB: anchors overlap, only two can land; exactly one
        // B survives and no cell is written twice
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        let rule = Rule::parse("BB", "WW", &grid).unwrap();
        let mut node = AllNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert_eq!(ctx.grid.state.iter().filter(|&&v| v == 1).count(), 4);
        assert_eq!(ctx.grid.state.iter().filter(|&&v| v == 0).count(), 1);
    }

    #[test]
    fn no_matches_means_fail() {
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        grid.state.fill(1);
        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut node = AllNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);
        assert!(!step_ok(&mut node, &mut ctx));
    }

    #[test]
    fn mask_is_clean_after_step() {
        let mut grid = Grid::with_alphabet(4, 4, 1, "BW");
        let rule = Rule::parse("BB,BB", "WW,WW", &grid).unwrap();
        let mut node = AllNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert!(ctx.grid.mask.iter().all(|&m| !m));
        // at least two non-overlapping 2x2 placements fit a 4x4
        assert!(ctx.grid.state.iter().filter(|&&v| v == 1).count() >= 8);
    }

    #[test]
    fn guided_order_applies_everything_reachable() {
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        grid.state[4] = 1;

        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut fields: Vec<Option<Field>> = vec![None; 2];
        fields[1] = Some(Field::new(1, 2));

        let mut node = AllNode {
            data: RuleNodeData::with_fields(vec![rule], grid.state.len(), fields, 0.0),
        };

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert!(ctx.grid.state.iter().all(|&v| v == 1));
    }
}
