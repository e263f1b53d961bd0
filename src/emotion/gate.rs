use crate::emotion::{FailureKind, PipelineError};
use crate::state::{ScreenState, StateKey, StateStore};

/// Capture gate. Fails closed: a missing or unreadable screen state means off.
pub fn is_screen_on(store: &dyn StateStore) -> bool {
    match store.get(StateKey::ScreenState) {
        Ok(Some(raw)) => ScreenState::parse(&raw) == ScreenState::On,
        Ok(None) => {
            log::warn!(
                "{}",
                PipelineError::new(FailureKind::StateReadFailed, "screen state not set")
            );
            false
        }
        Err(err) => {
            log::warn!(
                "{}",
                PipelineError::new(FailureKind::StateReadFailed, err.to_string())
            );
            false
        }
    }
}
