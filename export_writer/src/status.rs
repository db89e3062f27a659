use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Which sink a writer feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
pub enum WriterKind {
    Storage,
    DeadLetter,
    NoOp,
}

/// Why a writer stopped sending rows to its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
pub enum AbandonReason {
    General,
    Test,
    NoCommand,
    NoStorage,
    NoDeadLetter,
    WriteError,
    NotApplicable,
    AlreadyComplete,
}

/// Reasons a no-op writer takes from a status code. `NotApplicable` and
/// `AlreadyComplete` are only set by the writer factory.
const NO_OP_REASONS: &[AbandonReason] = &[
    AbandonReason::General,
    AbandonReason::Test,
    AbandonReason::NoCommand,
    AbandonReason::NoStorage,
    AbandonReason::NoDeadLetter,
    AbandonReason::WriteError,
];

impl AbandonReason {
    /// Codes outside the no-op set collapse to `General`.
    pub fn from_code(code: &str) -> Self {
        AbandonReason::from_str(code)
            .ok()
            .filter(|reason| NO_OP_REASONS.contains(reason))
            .unwrap_or(AbandonReason::General)
    }
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Abandoned{}", self.as_ref())
    }
}

/// Status of a writer over its lifetime. A writer is abandoned at most once;
/// the first reason sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStatus {
    pub kind: WriterKind,
    pub abandoned: Option<AbandonReason>,
}

impl WriterStatus {
    pub fn new(kind: WriterKind) -> Self {
        Self {
            kind,
            abandoned: None,
        }
    }

    pub fn abandoned(kind: WriterKind, reason: AbandonReason) -> Self {
        Self {
            kind,
            abandoned: Some(reason),
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_some()
    }

    pub fn is_dead_letter(&self) -> bool {
        self.kind == WriterKind::DeadLetter
    }

    pub fn has_reason(&self, reason: AbandonReason) -> bool {
        self.abandoned == Some(reason)
    }

    pub(crate) fn abandon(&mut self, reason: AbandonReason) {
        if self.abandoned.is_none() {
            self.abandoned = Some(reason);
        }
    }
}

impl fmt::Display for WriterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.abandoned {
            Some(reason) => write!(f, "{}|{}", self.kind.as_ref(), reason),
            None => write!(f, "{}", self.kind.as_ref()),
        }
    }
}
