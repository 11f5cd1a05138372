use rand::Rng;
use std::fmt;

use crate::protocol::{Action, Command, ProtocolError};

/// Exclusive upper bound of generated codes
const CODE_SPACE: u32 = 1_000_000;

/// Short numeric code shown on the listening device.
///
/// Guards against connecting to an unrelated session on the same network;
/// it is not a cryptographic secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingCode(u32);

impl PairingCode {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen_range(0..CODE_SPACE))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PairingCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("connecting peer belongs to a different account")]
    MismatchedUser,

    #[error("pairing code does not match")]
    MismatchedCode,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Source-side check of the first command from the connecting peer
pub struct Pairing {
    user_id: String,
    code: PairingCode,
}

impl Pairing {
    pub fn new(user_id: impl Into<String>, code: PairingCode) -> Self {
        Self {
            user_id: user_id.into(),
            code,
        }
    }

    pub fn code(&self) -> PairingCode {
        self.code
    }

    /// Accept only a `connect` whose account and code both match exactly
    pub fn verify(&self, command: &Command) -> Result<(), PairingError> {
        if command.action != Action::Connect {
            return Err(ProtocolError::UnexpectedCommand(command.action).into());
        }
        if command.user_id.as_deref() != Some(self.user_id.as_str()) {
            return Err(PairingError::MismatchedUser);
        }
        if command.code != Some(self.code.value()) {
            return Err(PairingError::MismatchedCode);
        }
        tracing::info!(
            platform = command.platform.as_deref().unwrap_or("unknown"),
            "pairing accepted"
        );
        Ok(())
    }
}
