//! `One`: apply a single match per step.
//!
//! Each step the node refreshes its match list, draws one match — weighted
//! by rule weight, or guided by potentials when fields or observations are
//! configured — and applies it. Matches invalidated by earlier rewrites are
//! discarded lazily as they are drawn.

use super::field::delta_pointwise;
use super::node::{ExecutionContext, Node, RunState};
use super::observation::Observation;
use super::rule::Rule;
use super::rule_node::{apply_rule_at, Match, Prep, RuleNodeData};

pub struct OneNode {
    pub data: RuleNodeData,
}

impl OneNode {
    pub fn new(rules: Vec<Rule>, grid_size: usize) -> Self {
        Self {
            data: RuleNodeData::new(rules, grid_size),
        }
    }

    /// Draw a match weighted by rule weight, discarding stale entries.
    /// The drawn match is removed from tracking; a rescan re-adds it if it
    /// still holds next turn.
    fn weighted_match(&mut self, ctx: &mut ExecutionContext) -> Option<Match> {
        let mx = ctx.grid.mx;
        let my = ctx.grid.my;
        let uniform = self.data.rules.iter().all(|r| r.p == 1.0);

        loop {
            if self.data.match_count == 0 {
                return None;
            }

            let pick = if uniform {
                ctx.random.next_below(self.data.match_count)
            } else {
                let total: f64 = (0..self.data.match_count)
                    .map(|k| self.data.rules[self.data.matches[k].0].p)
                    .sum();
                if total <= 0.0 {
                    return None;
                }
                let mut u = ctx.random.next_double() * total;
                let mut pick = self.data.match_count - 1;
                for k in 0..self.data.match_count {
                    u -= self.data.rules[self.data.matches[k].0].p;
                    if u <= 0.0 {
                        pick = k;
                        break;
                    }
                }
                pick
            };

            let (r, x, y, z) = self.data.matches[pick];
            self.data.swap_remove_match(pick, mx, my);
            if ctx.grid.matches(&self.data.rules[r], x, y, z) {
                return Some((r, x, y, z));
            }
        }
    }

    /// Potential-guided draw. Temperature 0 is greedy on the pointwise
    /// delta with a small random tiebreak; above 0 the draw softens toward
    /// uniform, still weighted by rule weight. The winner stays tracked.
    fn guided_match(&mut self, ctx: &mut ExecutionContext) -> Option<Match> {
        if let Some(future) = self.data.future.as_ref() {
            if Observation::is_goal_reached(&ctx.grid.state, future) {
                self.data.future_computed = false;
                return None;
            }
        }

        let mx = ctx.grid.mx;
        let my = ctx.grid.my;
        let temperature = self.data.temperature;

        let mut max_key = f64::NEG_INFINITY;
        let mut argmax: Option<usize> = None;
        let mut first_heuristic = 0.0f64;
        let mut first_computed = false;

        let mut k = 0;
        while k < self.data.match_count {
            let (r, x, y, z) = self.data.matches[k];
            if !ctx.grid.matches(&self.data.rules[r], x, y, z) {
                self.data.swap_remove_match(k, mx, my);
                continue;
            }

            let delta = {
                let potentials = self.data.potentials.as_ref()?;
                delta_pointwise(
                    &ctx.grid.state,
                    &self.data.rules[r],
                    x,
                    y,
                    z,
                    self.data.fields.as_deref(),
                    potentials,
                    mx,
                    my,
                )
            };

            if let Some(h) = delta {
                let h = h as f64;
                if !first_computed {
                    first_heuristic = h;
                    first_computed = true;
                }
                let u = ctx.random.next_double();
                let key = if temperature > 0.0 {
                    u.powf(((h - first_heuristic) / temperature).exp() / self.data.rules[r].p)
                } else {
                    -h + 0.001 * u
                };
                if key > max_key {
                    max_key = key;
                    argmax = Some(k);
                }
            }

            k += 1;
        }

        argmax.map(|k| self.data.matches[k])
    }

    fn random_match(&mut self, ctx: &mut ExecutionContext) -> Option<Match> {
        if self.data.potentials.is_some() {
            self.guided_match(ctx)
        } else {
            self.weighted_match(ctx)
        }
    }
}

impl Node for OneNode {
    fn run(&mut self, ctx: &mut ExecutionContext) -> RunState {
        match self.data.prepare(ctx, false) {
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

        match self.random_match(ctx) {
            Some((r, x, y, z)) => {
                self.data.last[r] = true;
                let rule = self.data.rules[r].clone();
                apply_rule_at(&rule, x, y, z, ctx);
                self.data.counter += 1;
                RunState::Success
            }
            None => RunState::Fail,
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

    fn step_ok(node: &mut OneNode, ctx: &mut ExecutionContext) -> bool {
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
    fn applies_exactly_one_match() {
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut node = OneNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert_eq!(ctx.grid.state.iter().filter(|&&v| v == 1).count(), 1);
        assert_eq!(ctx.grid.state.iter().filter(|&&v| v == 0).count(), 4);
    }

    #[test]
    fn exhausts_in_cell_count_steps() {
        let mut grid = Grid::with_alphabet(3, 1, 1, "BW");
        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut node = OneNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        let mut steps = 0;
        while step_ok(&mut node, &mut ctx) {
            steps += 1;
            assert!(steps <= 3, "should finish in 3 steps");
        }
        assert_eq!(steps, 3);
        assert!(ctx.grid.state.iter().all(|&v| v == 1));
    }

    #[test]
    fn wide_rule_writes_both_cells() {
        let mut grid = Grid::with_alphabet(4, 1, 1, "BW");
        let rule = Rule::parse("BB", "WW", &grid).unwrap();
        let mut node = OneNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert_eq!(ctx.grid.state.iter().filter(|&&v| v == 1).count(), 2);
    }

    #[test]
    fn step_limit_is_honored() {
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut node = OneNode::new(vec![rule], grid.state.len());
        node.data.steps = 2;

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert!(step_ok(&mut node, &mut ctx));
        assert!(!step_ok(&mut node, &mut ctx));
        assert_eq!(ctx.grid.state.iter().filter(|&&v| v == 1).count(), 2);
    }

    #[test]
    fn field_guides_selection_toward_target() {
        // 5x1 strip, existing W at the right end; with a field toward W and
        // temperature 0 the new W must land adjacent to it
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        grid.state[4] = 1;

        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut fields: Vec<Option<Field>> = vec![None; 2];
        fields[1] = Some(Field::new(1, 2));

        let mut node = OneNode {
            data: RuleNodeData::with_fields(vec![rule], grid.state.len(), fields, 0.0),
        };

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert_eq!(ctx.grid.state[3], 1, "greedy pick lands next to the target");
    }

    #[test]
    fn temperature_softens_guided_selection() {
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        grid.state[4] = 1;

        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut fields: Vec<Option<Field>> = vec![None; 2];
        fields[1] = Some(Field::new(1, 2));

        let mut node = OneNode {
            data: RuleNodeData::with_fields(vec![rule], grid.state.len(), fields, 100.0),
        };

        let mut rng = Prng::from_seed(12345);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert_eq!(ctx.grid.state.iter().filter(|&&v| v == 1).count(), 2);
    }

    #[test]
    fn rule_weights_bias_the_draw() {
        // two rules with weights 1 and 3 competing for the same cells:
        // the heavy rule should fire roughly three times as often
        let mut heavy_hits = 0usize;
        let mut light_hits = 0usize;

        for seed in 0..2000u64 {
            let mut grid = Grid::with_alphabet(3, 1, 1, "BRG");
            let mut light = Rule::parse("B", "R", &grid).unwrap();
            light.p = 1.0;
            let mut heavy = Rule::parse("B", "G", &grid).unwrap();
            heavy.p = 3.0;

            let mut node = OneNode::new(vec![light, heavy], grid.state.len());
            let mut rng = Prng::from_seed(seed);
            let mut ctx = ExecutionContext::new(&mut grid, &mut rng);
            assert!(step_ok(&mut node, &mut ctx));

            if ctx.grid.state.contains(&2) {
                heavy_hits += 1;
            } else {
                light_hits += 1;
            }
        }

        let ratio = heavy_hits as f64 / light_hits as f64;
        assert!(
            (2.6..3.5).contains(&ratio),
            "expected ~3:1, got {}:{} ({:.2})",
            heavy_hits,
            light_hits,
            ratio
        );
    }
}
