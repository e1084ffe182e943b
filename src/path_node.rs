//! `Path`: draw a path between cell classes.
//!
//! A BFS from the finish cells through the substrate assigns every reachable
//! cell a generation; a pen then walks from a chosen start cell down the
//! generation gradient, writing the path value as it goes. Used for
//! connectivity: corridors, rivers, cables.

use super::node::{ExecutionContext, Node, RunState};
use super::rng::Prng;
use std::collections::VecDeque;

pub struct PathNode {
    /// Wave of start cells
    pub start: u32,
    /// Wave of finish cells
    pub finish: u32,
    /// Wave of traversable cells
    pub substrate: u32,
    /// Value written along the path
    pub value: u8,
    /// Prefer continuing in the current direction
    pub inertia: bool,
    /// Walk from the farthest start instead of the nearest
    pub longest: bool,
    /// Allow in-plane diagonal moves
    pub edges: bool,
    /// Allow full corner diagonal moves in 3D
    pub vertices: bool,
}

impl PathNode {
    pub fn new(start: u32, finish: u32, substrate: u32, value: u8) -> Self {
        Self {
            start,
            finish,
            substrate,
            value,
            inertia: false,
            longest: false,
            edges: false,
            vertices: false,
        }
    }
}

impl Node for PathNode {
    fn run(&mut self, ctx: &mut ExecutionContext) -> RunState {
        let (mx, my, mz) = (ctx.grid.mx, ctx.grid.my, ctx.grid.mz);
        let grid_size = mx * my * mz;

        let mut frontier: VecDeque<(i32, i32, i32, i32)> = VecDeque::new();
        let mut starts: Vec<(i32, i32, i32)> = Vec::new();
        let mut generations = vec![-1i32; grid_size];

        for z in 0..mz as i32 {
            for y in 0..my as i32 {
                for x in 0..mx as i32 {
                    let i = x as usize + y as usize * mx + z as usize * mx * my;
                    let s = ctx.grid.state[i];
                    if (self.start & (1 << s)) != 0 {
                        starts.push((x, y, z));
                    }
                    if (self.finish & (1 << s)) != 0 {
                        generations[i] = 0;
                        frontier.push_back((0, x, y, z));
                    }
                }
            }
        }

        if starts.is_empty() || frontier.is_empty() {
            return RunState::Fail;
        }

        while let Some((t, x, y, z)) = frontier.pop_front() {
            for (dx, dy, dz) in directions(x, y, z, mx, my, mz, self.edges, self.vertices) {
                let nx = x + dx;
                let ny = y + dy;
                let nz = z + dz;
                let i = nx as usize + ny as usize * mx + nz as usize * mx * my;
                let v = ctx.grid.state[i];

                if generations[i] == -1
                    && ((self.substrate & (1 << v)) != 0 || (self.start & (1 << v)) != 0)
                {
                    if (self.substrate & (1 << v)) != 0 {
                        frontier.push_back((t + 1, nx, ny, nz));
                    }
                    generations[i] = t + 1;
                }
            }
        }

        // pick the closest (or farthest) reachable start, with noise to
        // break ties between equally distant starts
        let mut min_gen = grid_size as f64;
        let mut max_gen = -2.0f64;
        let mut argmin = (-1i32, -1i32, -1i32);
        let mut argmax = (-1i32, -1i32, -1i32);
        let mut any_reachable = false;

        for &(px, py, pz) in &starts {
            let i = px as usize + py as usize * mx + pz as usize * mx * my;
            let g = generations[i];
            if g == -1 {
                continue;
            }
            any_reachable = true;
            let noisy = g as f64 + 0.1 * ctx.random.next_double();
            if noisy < min_gen {
                min_gen = noisy;
                argmin = (px, py, pz);
            }
            if noisy > max_gen {
                max_gen = noisy;
                argmax = (px, py, pz);
            }
        }

        if !any_reachable {
            return RunState::Fail;
        }

        let (mut penx, mut peny, mut penz) = if self.longest { argmax } else { argmin };
        let (mut dirx, mut diry, mut dirz) = descend_direction(
            penx,
            peny,
            penz,
            0,
            0,
            0,
            &generations,
            mx,
            my,
            mz,
            self.inertia,
            self.edges,
            self.vertices,
            ctx.random,
        );
        penx += dirx;
        peny += diry;
        penz += dirz;

        while generations[penx as usize + peny as usize * mx + penz as usize * mx * my] != 0 {
            let i = penx as usize + peny as usize * mx + penz as usize * mx * my;
            if ctx.grid.state[i] != self.value {
                ctx.grid.state[i] = self.value;
                ctx.record_change(penx, peny, penz);
            }
            let (dx, dy, dz) = descend_direction(
                penx,
                peny,
                penz,
                dirx,
                diry,
                dirz,
                &generations,
                mx,
                my,
                mz,
                self.inertia,
                self.edges,
                self.vertices,
                ctx.random,
            );
            dirx = dx;
            diry = dy;
            dirz = dz;
            penx += dirx;
            peny += diry;
            penz += dirz;
        }

        RunState::Success
    }

    fn reset(&mut self) {}
}

/// Legal moves from a cell given the connectivity flags, clipped to bounds.
fn directions(
    x: i32,
    y: i32,
    z: i32,
    mx: usize,
    my: usize,
    mz: usize,
    edges: bool,
    vertices: bool,
) -> Vec<(i32, i32, i32)> {
    let (mx, my, mz) = (mx as i32, my as i32, mz as i32);
    let mut result = Vec::new();

    let push = |dx: i32, dy: i32, dz: i32, result: &mut Vec<(i32, i32, i32)>| {
        let nx = x + dx;
        let ny = y + dy;
        let nz = z + dz;
        if nx >= 0 && nx < mx && ny >= 0 && ny < my && nz >= 0 && nz < mz {
            result.push((dx, dy, dz));
        }
    };

    for d in [(-1, 0, 0), (1, 0, 0), (0, -1, 0), (0, 1, 0)] {
        push(d.0, d.1, d.2, &mut result);
    }
    if mz > 1 {
        push(0, 0, -1, &mut result);
        push(0, 0, 1, &mut result);
    }

    if edges {
        for d in [(-1, -1, 0), (-1, 1, 0), (1, -1, 0), (1, 1, 0)] {
            push(d.0, d.1, d.2, &mut result);
        }
        if mz > 1 {
            for d in [
                (-1, 0, -1),
                (-1, 0, 1),
                (1, 0, -1),
                (1, 0, 1),
                (0, -1, -1),
                (0, -1, 1),
                (0, 1, -1),
                (0, 1, 1),
            ] {
                push(d.0, d.1, d.2, &mut result);
            }
        }
    }

    if vertices && mz > 1 {
        for dx in [-1, 1] {
            for dy in [-1, 1] {
                for dz in [-1, 1] {
                    push(dx, dy, dz, &mut result);
                }
            }
        }
    }

    result
}

/// Next move along the descent: a step to a cell one generation closer to
/// the finish. With inertia, continuing straight is preferred when legal
/// (cardinal case) or scored by direction cosine (diagonal case).
#[allow(clippy::too_many_arguments)]
fn descend_direction(
    x: i32,
    y: i32,
    z: i32,
    dx: i32,
    dy: i32,
    dz: i32,
    generations: &[i32],
    mx: usize,
    my: usize,
    mz: usize,
    inertia: bool,
    edges: bool,
    vertices: bool,
    random: &mut Prng,
) -> (i32, i32, i32) {
    let (mxi, myi, mzi) = (mx as i32, my as i32, mz as i32);
    let g = generations[x as usize + y as usize * mx + z as usize * mx * my];

    let descends = |ddx: i32, ddy: i32, ddz: i32| -> bool {
        let nx = x + ddx;
        let ny = y + ddy;
        let nz = z + ddz;
        nx >= 0
            && nx < mxi
            && ny >= 0
            && ny < myi
            && nz >= 0
            && nz < mzi
            && generations[nx as usize + ny as usize * mx + nz as usize * mx * my] == g - 1
    };

    if !edges && !vertices {
        if inertia && (dx != 0 || dy != 0 || dz != 0) && descends(dx, dy, dz) {
            return (dx, dy, dz);
        }
        let candidates: Vec<(i32, i32, i32)> = directions(x, y, z, mx, my, mz, false, false)
            .into_iter()
            .filter(|&(ddx, ddy, ddz)| descends(ddx, ddy, ddz))
            .collect();
        if candidates.is_empty() {
            return (0, 0, 0);
        }
        return candidates[random.next_below(candidates.len())];
    }

    let candidates: Vec<(i32, i32, i32)> = directions(x, y, z, mx, my, mz, edges, vertices)
        .into_iter()
        .filter(|&(ddx, ddy, ddz)| descends(ddx, ddy, ddz))
        .collect();
    if candidates.is_empty() {
        return (0, 0, 0);
    }

    if inertia && (dx != 0 || dy != 0 || dz != 0) {
        let mut best = candidates[0];
        let mut best_score = f64::NEG_INFINITY;
        for &(cdx, cdy, cdz) in &candidates {
            let noise = 0.1 * random.next_double();
            let dot = (cdx * dx + cdy * dy + cdz * dz) as f64;
            let len_c = ((cdx * cdx + cdy * cdy + cdz * cdz) as f64).sqrt();
            let len_d = ((dx * dx + dy * dy + dz * dz) as f64).sqrt();
            let cos = dot / (len_c * len_d);
            if cos + noise > best_score {
                best_score = cos + noise;
                best = (cdx, cdy, cdz);
            }
        }
        best
    } else {
        candidates[random.next_below(candidates.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Grid;

    #[test]
    fn draws_a_path_between_corners() {
        // B = substrate, S = start, F = finish, P = path value
        let mut grid = Grid::with_alphabet(5, 5, 1, "BSFP");
        grid.state[0] = 1;
        grid.state[4 + 4 * 5] = 2;

        let mut node = PathNode::new(0b0010, 0b0100, 0b0001, 3);
        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert_eq!(node.run(&mut ctx), RunState::Success);
        let p_count = ctx.grid.state.iter().filter(|&&v| v == 3).count();
        assert!((6..=10).contains(&p_count), "path length {}", p_count);
        // endpoints untouched
        assert_eq!(ctx.grid.state[0], 1);
        assert_eq!(ctx.grid.state[4 + 4 * 5], 2);
    }

    #[test]
    fn fails_when_walled_off() {
        let mut grid = Grid::with_alphabet(5, 5, 1, "BSFX");
        grid.state[0] = 1;
        grid.state[4 + 4 * 5] = 2;
        for y in 0..5 {
            grid.state[2 + y * 5] = 3;
        }

        let mut node = PathNode::new(0b0010, 0b0100, 0b0001, 0);
        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        assert_eq!(node.run(&mut ctx), RunState::Fail);
    }

    #[test]
    fn fails_without_endpoints() {
        let mut grid = Grid::with_alphabet(5, 5, 1, "BSF");
        let mut node = PathNode::new(0b010, 0b100, 0b001, 0);
        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);
        assert_eq!(node.run(&mut ctx), RunState::Fail);
    }

    #[test]
    fn inertia_still_reaches_the_finish() {
        let mut grid = Grid::with_alphabet(10, 10, 1, "BSFP");
        grid.state[0] = 1;
        grid.state[9 + 9 * 10] = 2;

        let mut node = PathNode::new(0b0010, 0b0100, 0b0001, 3);
        node.inertia = true;

        let mut rng = Prng::from_seed(42);
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);
        assert_eq!(node.run(&mut ctx), RunState::Success);
        assert!(ctx.grid.state.iter().any(|&v| v == 3));
    }

    #[test]
    fn direction_counts() {
        assert_eq!(directions(2, 2, 0, 5, 5, 1, false, false).len(), 4);
        assert_eq!(directions(2, 2, 0, 5, 5, 1, true, false).len(), 8);
        assert_eq!(directions(0, 0, 0, 5, 5, 1, false, false).len(), 2);
        assert_eq!(directions(1, 1, 1, 3, 3, 3, false, false).len(), 6);
        assert_eq!(directions(1, 1, 1, 3, 3, 3, true, false).len(), 18);
        assert_eq!(directions(1, 1, 1, 3, 3, 3, true, true).len(), 26);
    }
}
