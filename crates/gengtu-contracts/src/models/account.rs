use serde::{Deserialize, Serialize};

/// A credit-holding identity. Credits are unsigned so a balance can never go
/// below zero; every debit goes through a checked decrement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub credits: u64,
}

impl Account {
    pub fn new(account_id: impl Into<String>, credits: u64) -> Self {
        Self {
            account_id: account_id.into(),
            credits,
        }
    }

    pub fn can_start_job(&self) -> bool {
        self.credits > 0
    }

    /// Removes one credit, returning `false` (and leaving the balance alone)
    /// when the account is already empty.
    pub fn try_debit(&mut self) -> bool {
        match self.credits.checked_sub(1) {
            Some(remaining) => {
                self.credits = remaining;
                true
            }
            None => false,
        }
    }
}
