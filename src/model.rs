//! High-level facade: load a program, run it, observe snapshots.

use super::interpreter::{Interpreter, Snapshots};
use super::loader::{load_program, LoadError, LoadedProgram};
use super::node::RunState;
use super::Grid;

/// A loaded program bound to an interpreter.
///
/// # Example
///
/// ```
/// use markovgrid::Model;
///
/// let mut model = Model::load_str(r#"<one values="BW" in="B" out="W"/>"#, 5, 5, 1).unwrap();
/// let steps = model.run(42, 0).count();
/// assert!(steps > 0);
/// ```
pub struct Model {
    interpreter: Interpreter,
}

impl Model {
    /// Load a program from XML. Grid dimensions of 0 fall back to defaults.
    pub fn load_str(xml: &str, mx: usize, my: usize, mz: usize) -> Result<Self, LoadError> {
        let LoadedProgram { root, grid, origin } = load_program(xml, mx, my, mz)?;
        let interpreter = if origin {
            Interpreter::with_origin(root, grid)
        } else {
            Interpreter::new(root, grid)
        };
        Ok(Self { interpreter })
    }

    /// Run with a seed, yielding snapshots lazily. `max_steps` of 0 means
    /// run to termination.
    pub fn run(&mut self, seed: u64, max_steps: usize) -> Snapshots<'_> {
        self.interpreter.run(seed, max_steps)
    }

    /// Prepare a fresh run without consuming any steps.
    pub fn reset(&mut self, seed: u64) {
        self.interpreter.reset(seed);
    }

    /// Advance one step; see [`Interpreter::step`].
    pub fn step(&mut self) -> RunState {
        self.interpreter.step()
    }

    pub fn grid(&self) -> &Grid {
        self.interpreter.grid()
    }

    pub fn counter(&self) -> usize {
        self.interpreter.counter()
    }

    pub fn is_running(&self) -> bool {
        self.interpreter.is_running()
    }
}
