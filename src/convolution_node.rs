//! `Convolution`: neighbour-count automaton.
//!
//! Each step counts, for every cell, how many neighbours of each value sit
//! under the kernel, then rewrites cells whose value and neighbour sum
//! satisfy a rule. Covers cellular automata (Life-likes), cave smoothing and
//! erosion passes.

use super::node::{ExecutionContext, Node, RunState};
use super::rng::Prng;

/// 2D kernels over the 3x3 neighbourhood; the centre entry is always 0.
pub mod kernels_2d {
    /// 4 orthogonal neighbours
    pub const VON_NEUMANN: [i32; 9] = [0, 1, 0, 1, 0, 1, 0, 1, 0];
    /// 8 surrounding neighbours
    pub const MOORE: [i32; 9] = [1, 1, 1, 1, 0, 1, 1, 1, 1];
}

/// 3D kernels over the 3x3x3 neighbourhood, laid out as z-slices.
pub mod kernels_3d {
    /// 6 orthogonal neighbours
    pub const VON_NEUMANN: [i32; 27] = [
        0, 0, 0, 0, 1, 0, 0, 0, 0, //
        0, 1, 0, 1, 0, 1, 0, 1, 0, //
        0, 0, 0, 0, 1, 0, 0, 0, 0,
    ];
    /// 18 neighbours, corners excluded
    pub const NO_CORNERS: [i32; 27] = [
        0, 1, 0, 1, 1, 1, 0, 1, 0, //
        1, 1, 1, 1, 0, 1, 1, 1, 1, //
        0, 1, 0, 1, 1, 1, 0, 1, 0,
    ];
}

/// Largest neighbour sum + 1 under any kernel (27 cells in 3D).
const MAX_SUM: usize = 28;

/// One automaton rule: rewrite `input` to `output` when the count of
/// `values` neighbours falls in the allowed sum set.
#[derive(Debug, Clone)]
pub struct ConvolutionRule {
    pub input: u8,
    pub output: u8,
    /// Values counted in the neighbourhood
    pub values: Vec<u8>,
    /// `sums[s]` = sum `s` allows the rule; `None` means always
    pub sums: Option<Vec<bool>>,
    /// Independent firing probability
    pub p: f64,
}

impl ConvolutionRule {
    pub fn new(input: u8, output: u8) -> Self {
        Self {
            input,
            output,
            values: Vec::new(),
            sums: None,
            p: 1.0,
        }
    }

    pub fn with_sums(input: u8, output: u8, values: Vec<u8>, sums: Vec<bool>) -> Self {
        Self {
            input,
            output,
            values,
            sums: Some(sums),
            p: 1.0,
        }
    }

    /// Parse a sum set like `"3"`, `"5..8"` or `"2,5..7"`.
    pub fn parse_sum_intervals(s: &str) -> Vec<bool> {
        let mut sums = vec![false; MAX_SUM];
        for part in s.split(',') {
            let part = part.trim();
            if let Some((lo, hi)) = part.split_once("..") {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    for i in lo..=hi.min(MAX_SUM - 1) {
                        sums[i] = true;
                    }
                }
            } else if let Ok(v) = part.parse::<usize>() {
                if v < MAX_SUM {
                    sums[v] = true;
                }
            }
        }
        sums
    }
}

pub struct ConvolutionNode {
    /// Rules, checked in order; the first match per cell fires
    pub rules: Vec<ConvolutionRule>,
    /// Neighbourhood kernel: 9 entries in 2D, 27 in 3D
    pub kernel: Vec<i32>,
    /// Toroidal wrap
    pub periodic: bool,
    pub counter: usize,
    /// Step limit; 0 means unlimited
    pub steps: usize,
    /// `sumfield[cell][value]` = weighted neighbour count
    sumfield: Vec<Vec<i32>>,
    num_values: usize,
    is_2d: bool,
}

impl ConvolutionNode {
    pub fn new(
        rules: Vec<ConvolutionRule>,
        kernel: Vec<i32>,
        periodic: bool,
        grid_size: usize,
        num_values: usize,
        is_2d: bool,
    ) -> Self {
        Self {
            rules,
            kernel,
            periodic,
            counter: 0,
            steps: 0,
            sumfield: vec![vec![0i32; num_values]; grid_size],
            num_values,
            is_2d,
        }
    }

    /// Construct with a named kernel; `None` for an unknown name.
    pub fn with_kernel(
        rules: Vec<ConvolutionRule>,
        neighborhood: &str,
        periodic: bool,
        grid_size: usize,
        num_values: usize,
        is_2d: bool,
    ) -> Option<Self> {
        let kernel: Vec<i32> = if is_2d {
            match neighborhood {
                "VonNeumann" => kernels_2d::VON_NEUMANN.to_vec(),
                "Moore" => kernels_2d::MOORE.to_vec(),
                _ => return None,
            }
        } else {
            match neighborhood {
                "VonNeumann" => kernels_3d::VON_NEUMANN.to_vec(),
                "NoCorners" => kernels_3d::NO_CORNERS.to_vec(),
                _ => return None,
            }
        };
        Some(Self::new(rules, kernel, periodic, grid_size, num_values, is_2d))
    }

    fn compute_sumfield(&mut self, ctx: &ExecutionContext) {
        let (mx, my, mz) = (ctx.grid.mx, ctx.grid.my, ctx.grid.mz);
        let state = &ctx.grid.state;

        for sums in &mut self.sumfield {
            sums.fill(0);
        }

        let dz_range = if self.is_2d { 0..=0 } else { -1..=1 };
        for z in 0..mz {
            for y in 0..my {
                for x in 0..mx {
                    let cell = x + y * mx + z * mx * my;
                    let sums = &mut self.sumfield[cell];

                    for dz in dz_range.clone() {
                        for dy in -1i32..=1 {
                            for dx in -1i32..=1 {
                                let kernel_idx = if self.is_2d {
                                    (dx + 1) as usize + (dy + 1) as usize * 3
                                } else {
                                    (dx + 1) as usize
                                        + (dy + 1) as usize * 3
                                        + (dz + 1) as usize * 9
                                };
                                let weight = self.kernel[kernel_idx];
                                if weight == 0 {
                                    continue;
                                }

                                let mut sx = x as i32 + dx;
                                let mut sy = y as i32 + dy;
                                let mut sz = z as i32 + dz;

                                if self.periodic {
                                    sx = sx.rem_euclid(mx as i32);
                                    sy = sy.rem_euclid(my as i32);
                                    sz = sz.rem_euclid(mz as i32);
                                } else if sx < 0
                                    || sy < 0
                                    || sz < 0
                                    || sx >= mx as i32
                                    || sy >= my as i32
                                    || sz >= mz as i32
                                {
                                    continue;
                                }

                                let neighbor =
                                    sx as usize + sy as usize * mx + sz as usize * mx * my;
                                let value = state[neighbor] as usize;
                                if value < self.num_values {
                                    sums[value] += weight;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn rule_fires(&self, rule: &ConvolutionRule, cell: usize, rng: &mut Prng) -> bool {
        if rule.p < 1.0 && rng.next_double() >= rule.p {
            return false;
        }
        if let Some(allowed) = &rule.sums {
            let sums = &self.sumfield[cell];
            let total: i32 = rule
                .values
                .iter()
                .filter_map(|&v| sums.get(v as usize))
                .sum();
            let total = total as usize;
            if total >= allowed.len() || !allowed[total] {
                return false;
            }
        }
        true
    }
}

impl Node for ConvolutionNode {
    fn run(&mut self, ctx: &mut ExecutionContext) -> RunState {
        if self.steps > 0 && self.counter >= self.steps {
            return RunState::Fail;
        }

        self.compute_sumfield(ctx);

        let mx = ctx.grid.mx;
        let my = ctx.grid.my;
        let mut change = false;

        for i in 0..self.sumfield.len() {
            let input = ctx.grid.state[i];
            for r in 0..self.rules.len() {
                let rule = &self.rules[r];
                if input != rule.input || rule.output == input {
                    continue;
                }
                if self.rule_fires(&self.rules[r], i, ctx.random) {
                    ctx.grid.state[i] = self.rules[r].output;
                    let x = (i % mx) as i32;
                    let y = ((i / mx) % my) as i32;
                    let z = (i / (mx * my)) as i32;
                    ctx.record_change(x, y, z);
                    change = true;
                    break;
                }
            }
        }

        self.counter += 1;
        if change {
            RunState::Success
        } else {
            RunState::Fail
        }
    }

    fn reset(&mut self) {
        self.counter = 0;
        for sums in &mut self.sumfield {
            sums.fill(0);
        }
    }
}
