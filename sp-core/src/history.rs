//! Record of which configuration options each invocation of the trainer
//! explicitly supplied.
//!
//! The history answers exactly one question, "was option X explicitly set in
//! run N", and never re-derives values from it. Resume reconciliation reads
//! this record instead of sniffing "is the value still at its default".

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot override '{field}' when resuming: got {supplied}, past run recorded {stored}")]
    LockedField {
        field: &'static str,
        supplied: String,
        stored: String,
    },
}

/// Append-only list of invocations; each invocation is the set of option
/// names explicitly supplied on that run. The current invocation is always
/// last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandHistory {
    commands: Vec<Vec<String>>,
}

impl CommandHistory {
    /// Start a history containing only the current invocation.
    pub fn from_invocation<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: vec![options.into_iter().map(Into::into).collect()],
        }
    }

    /// Prepend the history recorded in a checkpoint, keeping the current
    /// invocation last.
    pub fn prepend(&mut self, former: &CommandHistory) {
        let mut commands = former.commands.clone();
        commands.append(&mut self.commands);
        self.commands = commands;
    }

    pub fn num_invocations(&self) -> usize {
        self.commands.len()
    }

    /// Was `option` explicitly supplied in any invocation before the current
    /// one?
    pub fn former_commands_contain(&self, option: &str) -> bool {
        let n = self.commands.len();
        if n < 2 {
            return false;
        }
        self.commands[..n - 1]
            .iter()
            .any(|cmd| cmd.iter().any(|o| o == option))
    }

    /// Was `option` explicitly supplied in the current invocation?
    pub fn last_command_contains(&self, option: &str) -> bool {
        self.commands
            .last()
            .is_some_and(|cmd| cmd.iter().any(|o| o == option))
    }

    /// Resolve one field between the value carried on the in-memory resume
    /// object and the value stored in the checkpoint.
    ///
    /// An option set once, ever, sticks across resumptions unless explicitly
    /// supplied again; an option never set anywhere falls back to the resume
    /// object (which carries the compiled-in default).
    pub fn resolve<T: Clone>(&self, option: &str, resume: &T, checkpoint: &T) -> T {
        if self.former_commands_contain(option) && !self.last_command_contains(option) {
            checkpoint.clone()
        } else {
            resume.clone()
        }
    }

    /// Equality check for a locked field: a newly supplied value must match
    /// what the checkpoint stored.
    pub fn check_locked<T: PartialEq + Debug>(
        &self,
        option: &'static str,
        supplied: &T,
        stored: &T,
    ) -> Result<(), MergeError> {
        if self.last_command_contains(option) && supplied != stored {
            return Err(MergeError::LockedField {
                field: option,
                supplied: format!("{supplied:?}"),
                stored: format!("{stored:?}"),
            });
        }
        Ok(())
    }
}

/// Per-group field-wise resume merge, driven by the history's supplied-field
/// record.
pub trait Reconcile: Sized {
    fn reconcile(history: &CommandHistory, resume: &Self, checkpoint: &Self) -> Self;
}
