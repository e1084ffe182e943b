//! Shared machinery for rewrite nodes.
//!
//! `RuleNodeData` owns what `One`, `All` and `Prl` have in common: the rule
//! set, the match list with its per-rule occupancy mask, the incremental
//! rescan over the grid's change log, and the preparation steps for fields,
//! observations and search.
//!
//! Matches are maintained lazily: rescans only add candidates, and a match
//! is re-verified against the grid when it is about to be consumed. The
//! occupancy mask keeps one entry per (rule, anchor) so rescans never
//! duplicate.

use super::field::Field;
use super::node::ExecutionContext;
use super::observation::Observation;
use super::rule::{Rule, NO_WRITE};
use super::search::{SearchRun, SearchStatus};

/// A match: rule index plus anchor cell.
pub type Match = (usize, i32, i32, i32);

/// Frontier expansions per search resume; bounds the latency between HALTs.
const SEARCH_BUDGET: usize = 256;

/// Outcome of preparing a rewrite node for one step.
pub enum Prep {
    /// Matches are up to date; proceed to selection
    Ready,
    /// Step limit, infeasible observation, failed essential field, or
    /// exhausted search
    Fail,
    /// Search in progress; payload is its visited count
    Halt(i32),
}

/// Shared state of the rewrite nodes.
pub struct RuleNodeData {
    /// The symmetry-expanded rule set
    pub rules: Vec<Rule>,
    /// Applications so far
    pub counter: usize,
    /// Step limit; 0 means unlimited
    pub steps: usize,
    /// Dense match list; entries beyond `match_count` are stale
    pub matches: Vec<Match>,
    /// Live prefix of `matches`
    pub match_count: usize,
    /// Turn of the last rescan; -1 forces a full rescan
    pub last_matched_turn: i32,
    /// `match_mask[r][cell]`: anchor already tracked for rule `r`
    pub match_mask: Vec<Vec<bool>>,
    /// Which rules fired last step
    pub last: Vec<bool>,

    /// Per-value potentials for guided selection
    pub potentials: Option<Vec<Vec<i32>>>,
    /// Field configurations per value
    pub fields: Option<Vec<Option<Field>>>,
    /// 0 = greedy selection; > 0 = softer, more random
    pub temperature: f64,

    /// Goal constraints per value
    pub observations: Option<Vec<Option<Observation>>>,
    /// Per-cell wave of acceptable terminal values
    pub future: Option<Vec<i32>>,
    /// Solve observations by trajectory search instead of guided rewriting
    pub search: bool,
    /// Max states stored by the search; ≤ 0 means unbounded
    pub limit: i32,
    /// Depth bias of the search ranking
    pub depth_coefficient: f64,
    /// Reseeded search attempts; 0 picks the default (1 unbounded, else 20)
    pub tries: usize,
    /// Trajectory found by search, replayed one state per step
    pub trajectory: Option<Vec<Vec<u8>>>,
    /// Whether the future set has been derived this run
    pub future_computed: bool,

    search_run: Option<SearchRun>,
    attempts_left: usize,
}

impl RuleNodeData {
    pub fn new(rules: Vec<Rule>, grid_size: usize) -> Self {
        let num_rules = rules.len();
        Self {
            rules,
            counter: 0,
            steps: 0,
            matches: Vec::new(),
            match_count: 0,
            last_matched_turn: -1,
            match_mask: vec![vec![false; grid_size]; num_rules],
            last: vec![false; num_rules],
            potentials: None,
            fields: None,
            temperature: 0.0,
            observations: None,
            future: None,
            search: false,
            limit: 0,
            depth_coefficient: 0.0,
            tries: 0,
            trajectory: None,
            future_computed: false,
            search_run: None,
            attempts_left: 0,
        }
    }

    /// Construct with per-value fields; potentials are allocated up front.
    pub fn with_fields(
        rules: Vec<Rule>,
        grid_size: usize,
        fields: Vec<Option<Field>>,
        temperature: f64,
    ) -> Self {
        let num_values = fields.len();
        let mut data = Self::new(rules, grid_size);
        data.potentials = Some(vec![vec![0i32; grid_size]; num_values]);
        data.fields = Some(fields);
        data.temperature = temperature;
        data
    }

    /// Attach observations. Outside search mode this also allocates the
    /// potentials that backward propagation fills in.
    pub fn set_observations(
        &mut self,
        observations: Vec<Option<Observation>>,
        grid_size: usize,
        num_values: usize,
    ) {
        self.observations = Some(observations);
        self.future = Some(vec![0; grid_size]);
        if !self.search && self.potentials.is_none() {
            self.potentials = Some(vec![vec![0i32; grid_size]; num_values]);
        }
    }

    /// Configure search mode. Call before [`RuleNodeData::set_observations`]
    /// so no backward-propagation potentials are allocated.
    pub fn set_search(&mut self, limit: i32, depth_coefficient: f64, tries: usize) {
        self.search = true;
        self.limit = limit;
        self.depth_coefficient = depth_coefficient;
        self.tries = tries;
    }

    /// Restore run state for a fresh execution.
    pub fn reset(&mut self) {
        self.last_matched_turn = -1;
        self.counter = 0;
        self.trajectory = None;
        self.future_computed = false;
        self.search_run = None;
        self.attempts_left = 0;
        self.last.fill(false);
    }

    pub fn clear_match_mask(&mut self) {
        for mask in &mut self.match_mask {
            mask.fill(false);
        }
        self.match_count = 0;
    }

    /// Track a match unless its (rule, anchor) pair is already present.
    pub fn add_match(&mut self, r: usize, x: i32, y: i32, z: i32, grid_index: usize) {
        let mask = &mut self.match_mask[r];
        if !mask[grid_index] {
            mask[grid_index] = true;
            let m = (r, x, y, z);
            if self.match_count < self.matches.len() {
                self.matches[self.match_count] = m;
            } else {
                self.matches.push(m);
            }
            self.match_count += 1;
        }
    }

    /// Remove the match at list position `k`, clearing its occupancy bit.
    pub fn swap_remove_match(&mut self, k: usize, mx: usize, my: usize) {
        let (r, x, y, z) = self.matches[k];
        let i = x as usize + y as usize * mx + z as usize * mx * my;
        self.match_mask[r][i] = false;
        self.matches[k] = self.matches[self.match_count - 1];
        self.match_count -= 1;
    }

    /// Full rescan: stride the grid by each rule's input box, using the
    /// trigger table to enumerate candidate anchors from the sampled cell.
    pub fn scan_all_matches(&mut self, ctx: &ExecutionContext) {
        self.match_count = 0;
        for mask in &mut self.match_mask {
            mask.fill(false);
        }

        let (mx, my, mz) = (ctx.grid.mx, ctx.grid.my, ctx.grid.mz);
        for r in 0..self.rules.len() {
            let (imx, imy, imz) = {
                let rule = &self.rules[r];
                (rule.imx as i32, rule.imy as i32, rule.imz as i32)
            };

            let mut z = imz - 1;
            while z < mz as i32 {
                let mut y = imy - 1;
                while y < my as i32 {
                    let mut x = imx - 1;
                    while x < mx as i32 {
                        let grid_idx = x as usize + y as usize * mx + z as usize * mx * my;
                        let value = ctx.grid.state[grid_idx] as usize;
                        self.try_anchors_for(r, value, x, y, z, ctx);
                        x += imx;
                    }
                    y += imy;
                }
                z += imz;
            }
        }
    }

    /// Incremental rescan: only cells changed since the last matched turn
    /// can seed new anchors.
    pub fn scan_incremental_matches(&mut self, ctx: &ExecutionContext) {
        let mx = ctx.grid.mx;
        let my = ctx.grid.my;
        let start = ctx
            .first
            .get(self.last_matched_turn as usize)
            .copied()
            .unwrap_or(0);

        for n in start..ctx.changes.len() {
            let (x, y, z) = ctx.changes[n];
            let grid_idx = x as usize + y as usize * mx + z as usize * mx * my;
            let value = ctx.grid.state[grid_idx] as usize;
            for r in 0..self.rules.len() {
                self.try_anchors_for(r, value, x, y, z, ctx);
            }
        }
    }

    /// For every trigger shift of `value` in rule `r`, verify the anchor
    /// derived from the cell `(x, y, z)` and track it on success.
    fn try_anchors_for(
        &mut self,
        r: usize,
        value: usize,
        x: i32,
        y: i32,
        z: i32,
        ctx: &ExecutionContext,
    ) {
        let (mx, my, mz) = (ctx.grid.mx as i32, ctx.grid.my as i32, ctx.grid.mz as i32);
        let shift_count = match self.rules[r].ishifts.get(value) {
            Some(shifts) => shifts.len(),
            None => return,
        };

        for s in 0..shift_count {
            let rule = &self.rules[r];
            let (sx, sy, sz) = rule.ishifts[value][s];
            let ax = x - sx;
            let ay = y - sy;
            let az = z - sz;

            // the output box must fit too when it extends past the input box
            let max_x = rule.imx.max(rule.omx) as i32;
            let max_y = rule.imy.max(rule.omy) as i32;
            let max_z = rule.imz.max(rule.omz) as i32;
            if ax < 0
                || ay < 0
                || az < 0
                || ax + max_x > mx
                || ay + max_y > my
                || az + max_z > mz
            {
                continue;
            }

            let ai = ax as usize + ay as usize * mx as usize + az as usize * mx as usize * my as usize;
            if !self.match_mask[r][ai] && ctx.grid.matches(&self.rules[r], ax, ay, az) {
                self.add_match(r, ax, ay, az, ai);
            }
        }
    }

    /// Step preparation shared by the rewrite nodes: step limit, observation
    /// initialisation (future set, backward potentials or search), rescan,
    /// and field recomputation.
    pub fn prepare(&mut self, ctx: &mut ExecutionContext, is_all: bool) -> Prep {
        self.last.fill(false);

        if self.steps > 0 && self.counter >= self.steps {
            return Prep::Fail;
        }

        if self.observations.is_some() {
            if !self.future_computed {
                let (future, observations) =
                    match (self.future.as_mut(), self.observations.as_ref()) {
                        (Some(f), Some(o)) => (f, o),
                        _ => return Prep::Fail,
                    };
                if !Observation::compute_future_set(future, &mut ctx.grid.state, observations) {
                    return Prep::Fail;
                }
                self.future_computed = true;

                if self.search {
                    self.trajectory = None;
                    self.attempts_left = if self.tries > 0 {
                        self.tries
                    } else if self.limit <= 0 {
                        1
                    } else {
                        20
                    };
                    self.start_search_attempt(ctx, is_all);
                } else if let Some(potentials) = self.potentials.as_mut() {
                    Observation::compute_backward_potentials(
                        potentials,
                        future,
                        ctx.grid.mx,
                        ctx.grid.my,
                        ctx.grid.mz,
                        &self.rules,
                    );
                }
            }

            if let Some(run) = self.search_run.as_mut() {
                match run.resume(SEARCH_BUDGET) {
                    SearchStatus::Pending(visited) => return Prep::Halt(visited),
                    SearchStatus::Done(Some(trajectory)) => {
                        self.trajectory = Some(trajectory);
                        self.search_run = None;
                    }
                    SearchStatus::Done(None) => {
                        self.attempts_left = self.attempts_left.saturating_sub(1);
                        if self.attempts_left > 0 {
                            let visited = self.start_search_attempt(ctx, is_all);
                            return Prep::Halt(visited);
                        }
                        log::warn!("trajectory search failed; node gives up");
                        self.search_run = None;
                        return Prep::Fail;
                    }
                }
            }
        }

        // trajectory replay bypasses matching entirely
        if self.trajectory.is_some() {
            return Prep::Ready;
        }

        if self.last_matched_turn >= 0 {
            self.scan_incremental_matches(ctx);
        } else {
            self.scan_all_matches(ctx);
        }

        if self.fields.is_some() {
            let counter = self.counter;
            let (potentials, fields) = match (self.potentials.as_mut(), self.fields.as_ref()) {
                (Some(p), Some(f)) => (p, f),
                _ => return Prep::Ready,
            };
            let mut any_success = false;
            let mut any_computation = false;
            for (c, field) in fields.iter().enumerate() {
                if let Some(field) = field {
                    if counter == 0 || field.recompute {
                        let success = field.compute(&mut potentials[c], ctx.grid);
                        if !success && field.essential {
                            return Prep::Fail;
                        }
                        any_success |= success;
                        any_computation = true;
                    }
                }
            }
            if any_computation && !any_success {
                return Prep::Fail;
            }
        }

        Prep::Ready
    }

    fn start_search_attempt(&mut self, ctx: &mut ExecutionContext, is_all: bool) -> i32 {
        let future = self.future.as_ref().expect("future set computed");
        let seed = ctx.random.next_u64();
        let run = SearchRun::new(
            &ctx.grid.state,
            future,
            &self.rules,
            ctx.grid.mx,
            ctx.grid.my,
            ctx.grid.mz,
            ctx.grid.c as usize,
            is_all,
            self.limit,
            self.depth_coefficient,
            seed,
        );
        let visited = run.visited_count();
        self.search_run = Some(run);
        visited
    }

    /// Replay one trajectory state into the grid. Returns false once the
    /// trajectory is exhausted.
    pub fn replay_trajectory(&mut self, ctx: &mut ExecutionContext) -> bool {
        let Some(trajectory) = self.trajectory.as_ref() else {
            return false;
        };
        if self.counter >= trajectory.len() {
            return false;
        }
        ctx.grid.state.copy_from_slice(&trajectory[self.counter]);
        self.counter += 1;
        true
    }
}

/// Write a rule's output at the anchor, recording changed cells.
pub fn apply_rule_at(rule: &Rule, x: i32, y: i32, z: i32, ctx: &mut ExecutionContext) {
    let mx = ctx.grid.mx;
    let my = ctx.grid.my;

    for dz in 0..rule.omz {
        for dy in 0..rule.omy {
            for dx in 0..rule.omx {
                let value = rule.output[dx + dy * rule.omx + dz * rule.omx * rule.omy];
                if value != NO_WRITE {
                    let sx = x + dx as i32;
                    let sy = y + dy as i32;
                    let sz = z + dz as i32;
                    let si = sx as usize + sy as usize * mx + sz as usize * mx * my;
                    if ctx.grid.state[si] != value {
                        ctx.grid.state[si] = value;
                        ctx.record_change(sx, sy, sz);
                    }
                }
            }
        }
    }
}
