use std::sync::OnceLock;

use strum::Display;

use crate::{DistError, Result};

/// Phase of a unit within a training iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display)]
pub enum TrainingState {
    /// Between iterations or between forward and backward.
    #[default]
    Idle,
    /// Inside the unit's forward.
    Forward,
    /// Inside the unit's gradient computation.
    BackwardPre,
    /// The unit's gradients were computed and handed to reduction.
    BackwardPost,
    /// Full parameters are summoned outside of training.
    SummonFullParams,
}

/// Whether a unit drives the iteration, decided once at lazy init.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum RootRole {
    /// Outermost unit, responsible for lazy init and end-of-backward work.
    Root,
    /// Nested unit.
    NonRoot,
}

/// Mutable bookkeeping of one unit.
#[derive(Debug)]
pub(crate) struct UnitState {
    pub training_state: TrainingState,
    pub role: OnceLock<RootRole>,
    pub requires_gradient_sync: bool,
    pub requires_all_reduce: bool,
    pub reshard_after_backward: bool,
}

impl Default for UnitState {
    fn default() -> Self {
        Self {
            training_state: TrainingState::Idle,
            role: OnceLock::new(),
            requires_gradient_sync: true,
            requires_all_reduce: true,
            reshard_after_backward: true,
        }
    }
}

impl UnitState {
    /// Fails unless the unit is in one of `expected`.
    pub fn assert_state(&self, unit: &str, expected: &[TrainingState]) -> Result<()> {
        if expected.contains(&self.training_state) {
            return Ok(());
        }
        let expected: Vec<String> = expected.iter().map(ToString::to_string).collect();
        Err(DistError::InvalidState(format!(
            "expected unit {unit:?} to be in state {} but it is in state {}",
            expected.join(" or "),
            self.training_state
        )))
    }

    /// Moves to `next` after checking the current state is in `expected`.
    pub fn transition(
        &mut self,
        unit: &str,
        expected: &[TrainingState],
        next: TrainingState,
    ) -> Result<()> {
        self.assert_state(unit, expected)?;
        log::debug!("unit {unit:?}: {} -> {next}", self.training_state);
        self.training_state = next;
        Ok(())
    }

    /// Role set at lazy init, `None` before.
    pub fn role(&self) -> Option<RootRole> {
        self.role.get().copied()
    }

    /// Sets the role once. Returns the role that ends up stored.
    pub fn init_role(&self, role: RootRole) -> RootRole {
        *self.role.get_or_init(|| role)
    }

    /// Whether this unit drives the root pre- and post-backward work.
    pub fn is_root(&self) -> bool {
        self.role() == Some(RootRole::Root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_checks_current_state() {
        let mut state = UnitState::default();

        state
            .transition("fc1", &[TrainingState::Idle], TrainingState::Forward)
            .unwrap();
        let err = state
            .transition("fc1", &[TrainingState::BackwardPre], TrainingState::BackwardPost)
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid state: expected unit \"fc1\" to be in state BackwardPre but it is in state Forward"
        );
        assert_eq!(state.training_state, TrainingState::Forward);
    }

    #[test]
    fn test_role_is_set_once() {
        let state = UnitState::default();

        assert_eq!(state.role(), None);
        assert_eq!(state.init_role(RootRole::NonRoot), RootRole::NonRoot);
        assert_eq!(state.init_role(RootRole::Root), RootRole::NonRoot);
        assert!(!state.is_root());
    }
}
