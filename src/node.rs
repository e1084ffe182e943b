//! Execution tree: run states, context, and branch nodes.
//!
//! Nodes form a tree walked with an explicit cursor. Each step a node either
//! makes observable progress (`Success`), cannot proceed (`Fail`), or yields
//! control mid-step (`Halt`) to be resumed at the same cursor on the next
//! call.

use super::rng::Prng;
use super::Grid;

/// The result of running a node for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The node made progress (applied at least one rewrite, advanced state)
    Success,
    /// The node cannot proceed: no match, step limit reached, observation
    /// infeasible, or search exhausted
    Fail,
    /// Cooperative yield mid-step; carries a progress payload (for search,
    /// the number of states visited so far). Not an error.
    Halt(i32),
}

/// Shared state passed to every node during a step: the grid, the PRNG, and
/// the change log used for incremental match maintenance.
///
/// `changes` lists the cells written this run; `first[t]` is the index into
/// `changes` where turn `t` began. Within a turn the log is append-only.
pub struct ExecutionContext<'a> {
    /// The grid being rewritten
    pub grid: &'a mut Grid,
    /// The interpreter's seeded generator
    pub random: &'a mut Prng,
    /// Cells `(x, y, z)` modified so far
    pub changes: Vec<(i32, i32, i32)>,
    /// Turn number -> index into `changes` where that turn started
    pub first: Vec<usize>,
    /// Current turn number
    pub counter: usize,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(grid: &'a mut Grid, random: &'a mut Prng) -> Self {
        Self {
            grid,
            random,
            changes: Vec::new(),
            first: vec![0],
            counter: 0,
        }
    }

    /// Append a modified cell to the change log.
    #[inline]
    pub fn record_change(&mut self, x: i32, y: i32, z: i32) {
        self.changes.push((x, y, z));
    }

    /// The changes recorded during a given turn.
    pub fn changes_from_turn(&self, turn: usize) -> &[(i32, i32, i32)] {
        let start = self.first.get(turn).copied().unwrap_or(0);
        let end = self
            .first
            .get(turn + 1)
            .copied()
            .unwrap_or(self.changes.len());
        &self.changes[start..end]
    }
}

/// A node of the execution tree.
pub trait Node {
    /// Run one step.
    fn run(&mut self, ctx: &mut ExecutionContext) -> RunState;

    /// Restore the node (and its children) to the pre-run state.
    fn reset(&mut self);
}

/// Runs its children in order, one child step per call.
///
/// A child's SUCCESS advances the cursor; after the last child succeeds the
/// cursor rewinds so a parent may schedule another pass. Any child FAIL
/// fails the whole sequence and resets it. HALT leaves the cursor in place.
pub struct SequenceNode {
    pub children: Vec<Box<dyn Node>>,
    n: isize,
}

impl SequenceNode {
    pub fn new(children: Vec<Box<dyn Node>>) -> Self {
        Self { children, n: -1 }
    }
}

impl Node for SequenceNode {
    fn run(&mut self, ctx: &mut ExecutionContext) -> RunState {
        if self.children.is_empty() {
            return RunState::Fail;
        }
        if self.n < 0 {
            self.n = 0;
        }
        let idx = self.n as usize;
        match self.children[idx].run(ctx) {
            RunState::Success => {
                self.n += 1;
                if self.n as usize >= self.children.len() {
                    // pass complete; children keep their counters so an
                    // exhausted pass fails instead of looping
                    self.n = -1;
                }
                RunState::Success
            }
            RunState::Fail => {
                self.reset();
                RunState::Fail
            }
            halt @ RunState::Halt(_) => halt,
        }
    }

    fn reset(&mut self) {
        for child in &mut self.children {
            child.reset();
        }
        self.n = -1;
    }
}

/// Runs the first child that succeeds, reconsidering from the top each step.
///
/// A child's FAIL moves on to the next child within the same step; the node
/// fails only when every child fails. HALT pins the cursor so the halted
/// child is resumed first on the next call.
pub struct MarkovNode {
    pub children: Vec<Box<dyn Node>>,
    resume: Option<usize>,
}

impl MarkovNode {
    pub fn new(children: Vec<Box<dyn Node>>) -> Self {
        Self {
            children,
            resume: None,
        }
    }
}

impl Node for MarkovNode {
    fn run(&mut self, ctx: &mut ExecutionContext) -> RunState {
        let mut n = self.resume.take().unwrap_or(0);
        while n < self.children.len() {
            match self.children[n].run(ctx) {
                RunState::Success => return RunState::Success,
                RunState::Fail => n += 1,
                halt @ RunState::Halt(_) => {
                    self.resume = Some(n);
                    return halt;
                }
            }
        }
        self.reset();
        RunState::Fail
    }

    fn reset(&mut self) {
        for child in &mut self.children {
            child.reset();
        }
        self.resume = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Succeeds `count` times, then fails until reset.
    struct CountdownNode {
        initial: usize,
        remaining: usize,
    }

    impl CountdownNode {
        fn new(count: usize) -> Self {
            Self {
                initial: count,
                remaining: count,
            }
        }
    }

    impl Node for CountdownNode {
        fn run(&mut self, _ctx: &mut ExecutionContext) -> RunState {
            if self.remaining > 0 {
                self.remaining -= 1;
                RunState::Success
            } else {
                RunState::Fail
            }
        }

        fn reset(&mut self) {
            self.remaining = self.initial;
        }
    }

    /// Halts `halts` times before each success.
    struct StutterNode {
        halts: usize,
        pending: usize,
        succeeded: bool,
    }

    impl Node for StutterNode {
        fn run(&mut self, _ctx: &mut ExecutionContext) -> RunState {
            if self.succeeded {
                return RunState::Fail;
            }
            if self.pending > 0 {
                self.pending -= 1;
                return RunState::Halt((self.halts - self.pending) as i32);
            }
            self.succeeded = true;
            RunState::Success
        }

        fn reset(&mut self) {
            self.pending = self.halts;
            self.succeeded = false;
        }
    }

    fn ctx_parts() -> (Grid, Prng) {
        (Grid::with_alphabet(1, 1, 1, "BW"), Prng::from_seed(42))
    }

    #[test]
    fn sequence_advances_per_success() {
        let (mut grid, mut rng) = ctx_parts();
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        let mut seq = SequenceNode::new(vec![
            Box::new(CountdownNode::new(1)),
            Box::new(CountdownNode::new(1)),
        ]);

        assert_eq!(seq.run(&mut ctx), RunState::Success); // child 0
        assert_eq!(seq.run(&mut ctx), RunState::Success); // child 1, pass done
        // second pass: child 0 is exhausted, sequence fails
        assert_eq!(seq.run(&mut ctx), RunState::Fail);
    }

    #[test]
    fn sequence_fails_on_child_fail() {
        let (mut grid, mut rng) = ctx_parts();
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        let mut seq = SequenceNode::new(vec![
            Box::new(CountdownNode::new(0)),
            Box::new(CountdownNode::new(5)),
        ]);

        assert_eq!(seq.run(&mut ctx), RunState::Fail);
    }

    #[test]
    fn markov_retries_first_child() {
        let (mut grid, mut rng) = ctx_parts();
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        let mut markov = MarkovNode::new(vec![Box::new(CountdownNode::new(3))]);

        assert_eq!(markov.run(&mut ctx), RunState::Success);
        assert_eq!(markov.run(&mut ctx), RunState::Success);
        assert_eq!(markov.run(&mut ctx), RunState::Success);
        assert_eq!(markov.run(&mut ctx), RunState::Fail);
        // reset on failure: a fresh call starts over
        assert_eq!(markov.run(&mut ctx), RunState::Success);
    }

    #[test]
    fn markov_falls_through_to_next_child() {
        let (mut grid, mut rng) = ctx_parts();
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        let mut markov = MarkovNode::new(vec![
            Box::new(CountdownNode::new(1)),
            Box::new(CountdownNode::new(2)),
        ]);

        // child 0 once, then child 1 twice, then fail
        assert_eq!(markov.run(&mut ctx), RunState::Success);
        assert_eq!(markov.run(&mut ctx), RunState::Success);
        assert_eq!(markov.run(&mut ctx), RunState::Success);
        assert_eq!(markov.run(&mut ctx), RunState::Fail);
    }

    #[test]
    fn halt_propagates_and_resumes_cursor() {
        let (mut grid, mut rng) = ctx_parts();
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        let stutter = StutterNode {
            halts: 2,
            pending: 2,
            succeeded: false,
        };
        let mut markov = MarkovNode::new(vec![
            Box::new(CountdownNode::new(0)),
            Box::new(stutter),
        ]);

        // child 0 fails, child 1 halts twice then succeeds; the cursor must
        // stay on child 1 across the halts
        assert_eq!(markov.run(&mut ctx), RunState::Halt(1));
        assert_eq!(markov.run(&mut ctx), RunState::Halt(2));
        assert_eq!(markov.run(&mut ctx), RunState::Success);
    }

    #[test]
    fn context_change_tracking() {
        let (mut grid, mut rng) = ctx_parts();
        let mut ctx = ExecutionContext::new(&mut grid, &mut rng);

        ctx.record_change(0, 0, 0);
        ctx.record_change(1, 0, 0);
        ctx.counter += 1;
        ctx.first.push(ctx.changes.len());
        ctx.record_change(2, 0, 0);
        ctx.counter += 1;
        ctx.first.push(ctx.changes.len());

        assert_eq!(ctx.changes_from_turn(0), &[(0, 0, 0), (1, 0, 0)]);
        assert_eq!(ctx.changes_from_turn(1), &[(2, 0, 0)]);
    }
}
