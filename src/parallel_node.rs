//! `Prl`: apply every match against the pre-step state.
//!
//! All matches are collected from the current grid, ordered by
//! (rule, z, y, x), and applied through a double buffer: every match reads
//! the unmodified pre-step state, overlapping writes are allowed, and the
//! last writer in the deterministic order wins. Each match is gated by its
//! rule's weight as an independent probability.

use super::node::{ExecutionContext, Node, RunState};
use super::rule::{Rule, NO_WRITE};
use super::rule_node::{Match, RuleNodeData};

pub struct ParallelNode {
    pub data: RuleNodeData,
    /// Write buffer for the simultaneous step
    newstate: Vec<u8>,
}

impl ParallelNode {
    pub fn new(rules: Vec<Rule>, grid_size: usize) -> Self {
        Self {
            data: RuleNodeData::new(rules, grid_size),
            newstate: vec![0; grid_size],
        }
    }

    pub fn with_data(data: RuleNodeData) -> Self {
        let grid_size = data.match_mask.first().map(|m| m.len()).unwrap_or(0);
        Self {
            data,
            newstate: vec![0; grid_size],
        }
    }

    /// Collect every match in the current grid, in (rule, z, y, x) order.
    fn collect_matches(&self, ctx: &ExecutionContext) -> Vec<Match> {
        let (mx, my, mz) = (ctx.grid.mx, ctx.grid.my, ctx.grid.mz);
        let mut pending: Vec<Match> = Vec::new();

        for (r, rule) in self.data.rules.iter().enumerate() {
            let mut z = rule.imz as i32 - 1;
            while z < mz as i32 {
                let mut y = rule.imy as i32 - 1;
                while y < my as i32 {
                    let mut x = rule.imx as i32 - 1;
                    while x < mx as i32 {
                        let grid_idx = x as usize + y as usize * mx + z as usize * mx * my;
                        let value = ctx.grid.state[grid_idx] as usize;

                        if let Some(shifts) = rule.ishifts.get(value) {
                            for &(sx, sy, sz) in shifts {
                                let ax = x - sx;
                                let ay = y - sy;
                                let az = z - sz;

                                let max_x = rule.imx.max(rule.omx) as i32;
                                let max_y = rule.imy.max(rule.omy) as i32;
                                let max_z = rule.imz.max(rule.omz) as i32;
                                if ax < 0
                                    || ay < 0
                                    || az < 0
                                    || ax + max_x > mx as i32
                                    || ay + max_y > my as i32
                                    || az + max_z > mz as i32
                                {
                                    continue;
                                }

                                if ctx.grid.matches(rule, ax, ay, az) {
                                    pending.push((r, ax, ay, az));
                                }
                            }
                        }

                        x += rule.imx as i32;
                    }
                    y += rule.imy as i32;
                }
                z += rule.imz as i32;
            }
        }

        pending.sort_unstable_by_key(|&(r, x, y, z)| (r, z, y, x));
        pending
    }

    /// Stage one match into the write buffer; gated by the rule's weight.
    fn stage_match(&mut self, r: usize, x: i32, y: i32, z: i32, ctx: &mut ExecutionContext) {
        let rule = &self.data.rules[r];
        if rule.p < 1.0 && ctx.random.next_double() > rule.p {
            return;
        }

        self.data.last[r] = true;
        let mx = ctx.grid.mx;
        let my = ctx.grid.my;

        for dz in 0..rule.omz {
            for dy in 0..rule.omy {
                for dx in 0..rule.omx {
                    let value = rule.output[dx + dy * rule.omx + dz * rule.omx * rule.omy];
                    let sx = x + dx as i32;
                    let sy = y + dy as i32;
                    let sz = z + dz as i32;
                    let si = sx as usize + sy as usize * mx + sz as usize * mx * my;

                    if value != NO_WRITE && value != ctx.grid.state[si] {
                        self.newstate[si] = value;
                        ctx.record_change(sx, sy, sz);
                    }
                }
            }
        }
    }
}

impl Node for ParallelNode {
    fn run(&mut self, ctx: &mut ExecutionContext) -> RunState {
        self.data.last.fill(false);

        if self.data.steps > 0 && self.data.counter >= self.data.steps {
            return RunState::Fail;
        }

        let pending = self.collect_matches(ctx);
        let changes_start = ctx.changes.len();

        for (r, x, y, z) in pending {
            self.stage_match(r, x, y, z, ctx);
        }

        // commit the buffer: only recorded cells were staged
        let mx = ctx.grid.mx;
        let my = ctx.grid.my;
        for n in changes_start..ctx.changes.len() {
            let (x, y, z) = ctx.changes[n];
            let i = x as usize + y as usize * mx + z as usize * mx * my;
            ctx.grid.state[i] = self.newstate[i];
        }

        self.data.counter += 1;

        if ctx.changes.len() > changes_start {
            RunState::Success
        } else {
            RunState::Fail
        }
    }

    fn reset(&mut self) {
        self.data.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Prng;
    use crate::Grid;

    fn step_ok(node: &mut ParallelNode, ctx: &mut ExecutionContext) -> bool {
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
    fn applies_every_match_at_once() {
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut node = ParallelNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert!(ctx.grid.state.iter().all(|&v| v == 1));
    }

    #[test]
    fn reads_see_the_pre_step_state() {
        // BWB with rule BW -> WB: only the match at 0 exists against the
        // original state; the result is WBB, not a chain of swaps
        let mut grid = Grid::with_alphabet(3, 1, 1, "BW");
        grid.state[1] = 1;

        let rule = Rule::parse("BW", "WB", &grid).unwrap();
        let mut node = ParallelNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert_eq!(ctx.grid.state, vec![1, 0, 0]);
    }

    #[test]
    fn two_rules_advance_in_lockstep() {
        // R->G and G->B on an all-R grid: first step all G, second all B
        let mut grid = Grid::with_alphabet(3, 3, 1, "RGB");
        let rules = vec![
            Rule::parse("R", "G", &grid).unwrap(),
            Rule::parse("G", "B", &grid).unwrap(),
        ];
        let mut node = ParallelNode::new(rules, grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert!(step_ok(&mut node, &mut ctx));
        assert!(ctx.grid.state.iter().all(|&v| v == 1), "all G after step 1");
        assert!(step_ok(&mut node, &mut ctx));
        assert!(ctx.grid.state.iter().all(|&v| v == 2), "all B after step 2");
        assert!(!step_ok(&mut node, &mut ctx));
    }

    #[test]
    fn no_matches_means_fail() {
        let mut grid = Grid::with_alphabet(5, 1, 1, "BW");
        grid.state.fill(1);
        let rule = Rule::parse("B", "W", &grid).unwrap();
        let mut node = ParallelNode::new(vec![rule], grid.state.len());

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);
        assert!(!step_ok(&mut node, &mut ctx));
    }

    #[test]
    fn probability_gates_matches() {
        // p = 0.5: over many seeds roughly half of the cells convert
        let mut total = 0usize;
        let runs = 400;
        for seed in 0..runs {
            let mut grid = Grid::with_alphabet(10, 1, 1, "BW");
            let mut rule = Rule::parse("B", "W", &grid).unwrap();
            rule.p = 0.5;
            let mut node = ParallelNode::new(vec![rule], grid.state.len());

            let mut rng = Prng::from_seed(seed);
            let mut ctx = ExecutionContext::new(&mut grid, &mut rng);
            node.run(&mut ctx);
            total += ctx.grid.state.iter().filter(|&&v| v == 1).count();
        }
        let mean = total as f64 / runs as f64;
        assert!((4.0..6.0).contains(&mean), "mean {} out of range", mean);
    }
}
