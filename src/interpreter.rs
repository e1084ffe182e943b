//! Program driver.
//!
//! The interpreter owns the grid, the PRNG and the node tree, and advances
//! the tree one step at a time. Each successful step opens a new turn in the
//! change log (so rewrite nodes can rescan incrementally), and the run is
//! exposed as a lazy snapshot producer: one snapshot per applied step, one
//! final snapshot on termination.

use super::node::{ExecutionContext, Node, RunState};
use super::rng::Prng;
use super::Grid;

/// An observable grid state, handed to renderers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Cell values, length `fx * fy * fz`
    pub state: Vec<u8>,
    /// The alphabet, in value order
    pub legend: String,
    pub fx: usize,
    pub fy: usize,
    pub fz: usize,
}

pub struct Interpreter {
    root: Box<dyn Node>,
    grid: Grid,
    random: Prng,
    /// Seed the grid centre with value 1 on reset
    origin: bool,
    changes: Vec<(i32, i32, i32)>,
    first: Vec<usize>,
    counter: usize,
    running: bool,
}

impl Interpreter {
    pub fn new(root: Box<dyn Node>, grid: Grid) -> Self {
        Self {
            root,
            grid,
            random: Prng::from_seed(0),
            origin: false,
            changes: Vec::new(),
            first: vec![0],
            counter: 0,
            running: false,
        }
    }

    /// Like [`Interpreter::new`], but `reset` places value 1 at the grid
    /// centre, for growth programs that start from a seed cell.
    pub fn with_origin(root: Box<dyn Node>, grid: Grid) -> Self {
        let mut ip = Self::new(root, grid);
        ip.origin = true;
        ip
    }

    /// Prepare a fresh run: clear the grid, reseed the PRNG, reset the tree
    /// and the change log.
    pub fn reset(&mut self, seed: u64) {
        self.random = Prng::from_seed(seed);
        self.grid.clear();

        if self.origin {
            let center = self.grid.mx / 2
                + (self.grid.my / 2) * self.grid.mx
                + (self.grid.mz / 2) * self.grid.mx * self.grid.my;
            self.grid.state[center] = 1;
        }

        self.changes.clear();
        self.first.clear();
        self.first.push(0);
        self.root.reset();
        self.counter = 0;
        self.running = true;
    }

    /// Advance the tree by one call.
    ///
    /// SUCCESS opens a new turn in the change log; HALT leaves the turn
    /// bookkeeping untouched (nothing was applied) and should simply be
    /// driven again; FAIL ends the run.
    pub fn step(&mut self) -> RunState {
        if !self.running {
            return RunState::Fail;
        }

        let mut ctx = ExecutionContext {
            grid: &mut self.grid,
            random: &mut self.random,
            changes: std::mem::take(&mut self.changes),
            first: std::mem::take(&mut self.first),
            counter: self.counter,
        };
        let state = self.root.run(&mut ctx);
        self.changes = ctx.changes;
        self.first = ctx.first;

        match state {
            RunState::Success => {
                self.counter += 1;
                self.first.push(self.changes.len());
            }
            RunState::Fail => {
                self.running = false;
            }
            RunState::Halt(_) => {}
        }
        state
    }

    /// Run with a seed, producing snapshots lazily.
    ///
    /// `steps` caps the successful steps; 0 means unbounded. HALTs are
    /// driven through internally, so the iterator only pauses the program
    /// between applied steps.
    pub fn run(&mut self, seed: u64, steps: usize) -> Snapshots<'_> {
        self.reset(seed);
        Snapshots {
            ip: self,
            steps,
            finished: false,
            final_emitted: false,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.grid.state.clone(),
            legend: self.grid.legend(),
            fx: self.grid.mx,
            fy: self.grid.my,
            fz: self.grid.mz,
        }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Successful steps since the last reset.
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn changes(&self) -> &[(i32, i32, i32)] {
        &self.changes
    }

    /// Turn table: changes of step `t` are `changes[first[t]..first[t+1]]`.
    pub fn first(&self) -> &[usize] {
        &self.first
    }
}

/// Lazy snapshot sequence for one run. Yields a snapshot after every
/// applied step and a final snapshot when the program terminates or the
/// step cap is reached.
pub struct Snapshots<'a> {
    ip: &'a mut Interpreter,
    steps: usize,
    finished: bool,
    final_emitted: bool,
}

impl Iterator for Snapshots<'_> {
    type Item = Snapshot;

    fn next(&mut self) -> Option<Snapshot> {
        loop {
            if self.finished {
                if self.final_emitted {
                    return None;
                }
                self.final_emitted = true;
                return Some(self.ip.snapshot());
            }
            if self.steps > 0 && self.ip.counter >= self.steps {
                self.finished = true;
                continue;
            }
            match self.ip.step() {
                RunState::Success => return Some(self.ip.snapshot()),
                RunState::Halt(_) => continue,
                RunState::Fail => {
                    self.finished = true;
                }
            }
        }
    }
}
