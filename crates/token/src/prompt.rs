//! Passphrase prompt collaborator.
//!
//! The core never reads a terminal or draws a dialog. It asks a
//! [`PassphraseProvider`], which may decline by returning `None`.

use std::collections::VecDeque;

use tokensign_crypto::Passphrase;

/// Why a passphrase is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPurpose {
    /// Protect a newly created key.
    NewKey,
    /// Unlock the key on a token.
    Unlock { remaining_attempts: u32 },
}

pub trait PassphraseProvider {
    /// `None` means the operator cancelled.
    fn prompt_passphrase(&mut self, purpose: PromptPurpose) -> Option<Passphrase>;
}

/// Always answers with the same passphrase.
#[derive(Debug, Clone)]
pub struct FixedPassphrase(pub Passphrase);

impl PassphraseProvider for FixedPassphrase {
    fn prompt_passphrase(&mut self, _purpose: PromptPurpose) -> Option<Passphrase> {
        Some(self.0.clone())
    }
}

/// Answers from a queue, then cancels.
#[derive(Debug, Default)]
pub struct QueuedPassphrases {
    answers: VecDeque<Option<Passphrase>>,
    asked: Vec<PromptPurpose>,
}

impl QueuedPassphrases {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Passphrase>,
    {
        Self {
            answers: answers.into_iter().map(|a| Some(a.into())).collect(),
            asked: Vec::new(),
        }
    }

    pub fn push_cancel(&mut self) {
        self.answers.push_back(None);
    }

    /// Purposes seen so far, in order.
    pub fn asked(&self) -> &[PromptPurpose] {
        &self.asked
    }
}

impl PassphraseProvider for QueuedPassphrases {
    fn prompt_passphrase(&mut self, purpose: PromptPurpose) -> Option<Passphrase> {
        self.asked.push(purpose);
        self.answers.pop_front().flatten()
    }
}
