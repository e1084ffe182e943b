//! Potential fields.
//!
//! A field assigns every grid cell an integer potential: the BFS distance
//! from the nearest `zero` cell through `substrate` cells, or -1 where
//! unreachable. Rewrite nodes use the per-value potentials to score
//! candidate applications and steer generation toward (or, inversed, away
//! from) target cells.

use super::rule::{Rule, NO_WRITE};
use super::Grid;
use std::collections::VecDeque;

/// A distance field configuration for one grid value.
#[derive(Debug, Clone)]
pub struct Field {
    /// Recompute the field on every step instead of only the first
    pub recompute: bool,
    /// Maximize distance instead of minimizing it
    pub inversed: bool,
    /// If true, a failed computation fails the owning node
    pub essential: bool,
    /// Wave mask of traversable cells
    pub substrate: u32,
    /// Wave mask of zero-distance cells
    pub zero: u32,
}

impl Field {
    pub fn new(substrate: u32, zero: u32) -> Self {
        Self {
            recompute: false,
            inversed: false,
            essential: false,
            substrate,
            zero,
        }
    }

    /// Fill `potential` with BFS distances from zero cells through substrate
    /// cells; unreachable cells are left at -1. Returns false when the grid
    /// holds no zero cell at all.
    pub fn compute(&self, potential: &mut [i32], grid: &Grid) -> bool {
        let (mx, my, mz) = (grid.mx, grid.my, grid.mz);
        let mut front: VecDeque<(i32, i32, i32, i32)> = VecDeque::new();

        let mut ix = 0i32;
        let mut iy = 0i32;
        let mut iz = 0i32;
        for i in 0..grid.state.len() {
            potential[i] = -1;
            if (self.zero & (1 << grid.state[i])) != 0 {
                potential[i] = 0;
                front.push_back((0, ix, iy, iz));
            }
            ix += 1;
            if ix == mx as i32 {
                ix = 0;
                iy += 1;
                if iy == my as i32 {
                    iy = 0;
                    iz += 1;
                }
            }
        }

        if front.is_empty() {
            return false;
        }

        while let Some((t, x, y, z)) = front.pop_front() {
            for (nx, ny, nz) in neighbors(x, y, z, mx, my, mz) {
                let i = nx as usize + ny as usize * mx + nz as usize * mx * my;
                if potential[i] == -1 && (self.substrate & (1 << grid.state[i])) != 0 {
                    potential[i] = t + 1;
                    front.push_back((t + 1, nx, ny, nz));
                }
            }
        }

        true
    }
}

/// 6-connected neighbors, clipped to the grid.
fn neighbors(x: i32, y: i32, z: i32, mx: usize, my: usize, mz: usize) -> Vec<(i32, i32, i32)> {
    let mut result = Vec::with_capacity(6);
    let (mx, my, mz) = (mx as i32, my as i32, mz as i32);

    if x > 0 {
        result.push((x - 1, y, z));
    }
    if x < mx - 1 {
        result.push((x + 1, y, z));
    }
    if y > 0 {
        result.push((x, y - 1, z));
    }
    if y < my - 1 {
        result.push((x, y + 1, z));
    }
    if z > 0 {
        result.push((x, y, z - 1));
    }
    if z < mz - 1 {
        result.push((x, y, z + 1));
    }

    result
}

/// Potential change from applying `rule` at `(x, y, z)`: the summed
/// difference between each written value's potential and the overwritten
/// value's potential at that cell.
///
/// A written value whose potential at the cell is -1 disqualifies the match
/// (`None`). A value with no potential array at all contributes 0.
#[allow(clippy::too_many_arguments)]
pub fn delta_pointwise(
    state: &[u8],
    rule: &Rule,
    x: i32,
    y: i32,
    z: i32,
    fields: Option<&[Option<Field>]>,
    potentials: &[Vec<i32>],
    mx: usize,
    my: usize,
) -> Option<i32> {
    let mut sum = 0i32;
    let mut dx = 0usize;
    let mut dy = 0usize;
    let mut dz = 0usize;

    for di in 0..rule.input.len() {
        let new_value = rule.output[di];

        // only cells that actually change value contribute
        if new_value != NO_WRITE && (rule.input[di] & (1 << new_value)) == 0 {
            let i = (x + dx as i32) as usize
                + (y + dy as i32) as usize * mx
                + (z + dz as i32) as usize * mx * my;
            let old_value = state[i];

            let new_potential = match potentials.get(new_value as usize) {
                Some(p) => {
                    let np = p[i];
                    if np == -1 {
                        return None;
                    }
                    np
                }
                None => 0,
            };
            let old_potential = potentials
                .get(old_value as usize)
                .map(|p| p[i])
                .unwrap_or(0);
            sum += new_potential - old_potential;

            if let Some(fields) = fields {
                if let Some(Some(old_field)) = fields.get(old_value as usize) {
                    if old_field.inversed {
                        sum += 2 * old_potential;
                    }
                }
                if let Some(Some(new_field)) = fields.get(new_value as usize) {
                    if new_field.inversed {
                        sum -= 2 * new_potential;
                    }
                }
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

    Some(sum)
}
