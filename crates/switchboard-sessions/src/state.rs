//! Connection state machine for one session.
//!
//! | from                              | transition                 | to           |
//! |-----------------------------------|----------------------------|--------------|
//! | disconnected, error               | connect                    | connecting   |
//! | connecting, qr_pending            | qr issued                  | qr_pending   |
//! | connecting, qr_pending, connected | authenticated              | connected    |
//! | any                               | disconnected (reconnect)   | connecting   |
//! | any                               | disconnected, logged out   | disconnected |
//! | any                               | failed                     | error        |
//!
//! Every transition clears the pairing code except the one that sets it,
//! and the account profile only survives while connected.

use chrono::{DateTime, Utc};
use switchboard_core::{AccountProfile, ConnectionState, CoreError, Result, SessionSnapshot, TenantId};

/// A state change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Explicit connect call.
    Connect,
    /// Transport issued a pairing code.
    QrIssued(String),
    /// Transport confirmed authentication.
    Authenticated(AccountProfile),
    /// Connection dropped or was closed.
    Disconnected {
        /// Transport reconnects by itself.
        will_reconnect: bool,
    },
    /// Device unpaired.
    LoggedOut,
    /// Unrecoverable transport failure.
    Failed,
}

impl Transition {
    /// Short name used in errors and logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::QrIssued(_) => "qr_issued",
            Self::Authenticated(_) => "authenticated",
            Self::Disconnected { .. } => "disconnected",
            Self::LoggedOut => "logged_out",
            Self::Failed => "failed",
        }
    }
}

/// Result of an accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// State before.
    pub from: ConnectionState,
    /// State after.
    pub to: ConnectionState,
}

impl Applied {
    /// Whether the visible state changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Mutable per-session fields, only ever changed through [`SessionState::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    state: ConnectionState,
    qr: Option<String>,
    profile: Option<AccountProfile>,
    updated_at: DateTime<Utc>,
}

impl SessionState {
    /// Creates a disconnected session state.
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { state: ConnectionState::Disconnected, qr: None, profile: None, updated_at: at }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current pairing code.
    pub fn qr(&self) -> Option<&str> {
        self.qr.as_deref()
    }

    /// Authenticated account.
    pub fn profile(&self) -> Option<&AccountProfile> {
        self.profile.as_ref()
    }

    /// Applies `transition`, or leaves the state untouched and returns
    /// [`CoreError::InvalidTransition`].
    pub fn apply(&mut self, transition: Transition, at: DateTime<Utc>) -> Result<Applied> {
        use ConnectionState as S;

        let from = self.state;
        let (to, qr, profile) = match (from, transition) {
            (S::Disconnected | S::Error, Transition::Connect) => (S::Connecting, None, None),
            (S::Connecting | S::QrPending, Transition::QrIssued(code)) => {
                (S::QrPending, Some(code), None)
            },
            (S::Connecting | S::QrPending | S::Connected, Transition::Authenticated(profile)) => {
                (S::Connected, None, Some(profile))
            },
            (_, Transition::Disconnected { will_reconnect: true }) => (S::Connecting, None, None),
            (_, Transition::Disconnected { will_reconnect: false } | Transition::LoggedOut) => {
                (S::Disconnected, None, None)
            },
            (_, Transition::Failed) => (S::Error, None, None),
            (from, transition) => {
                return Err(CoreError::InvalidTransition { from, transition: transition.name() });
            },
        };

        self.state = to;
        self.qr = qr;
        self.profile = profile;
        self.updated_at = at;
        Ok(Applied { from, to })
    }

    /// Consistent snapshot for readers.
    pub fn snapshot(&self, tenant_id: &TenantId, name: &str) -> SessionSnapshot {
        SessionSnapshot {
            tenant_id: tenant_id.clone(),
            name: name.to_string(),
            state: self.state,
            qr: self.qr.clone(),
            profile: self.profile.clone(),
            updated_at: self.updated_at,
        }
    }
}
