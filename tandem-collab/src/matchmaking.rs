//! Matchmaking sub-machine feeding the session.
//!
//! ```text
//!          start()            found            confirm()
//!   Idle ──────────► Searching ─────► Found ─────────────► Confirmed
//!    ▲                   │              │  partner declined    │
//!    └───── error ───────┘              ├──────► Idle          ▼
//!    └───── cancel() / forfeit() ───────┘             ConfirmedMatch
//! ```
//!
//! The pairing algorithm itself is external ([`Matchmaker`]). A room can
//! only be entered with a [`ConfirmedMatch`], which only [`MatchFlow`]
//! hands out.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ServiceError, SessionError};
use crate::protocol::RoomId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Idle,
    Searching,
    Found,
    Confirmed,
}

/// What the user is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRequest {
    pub user_id: String,
    pub topic: String,
    pub difficulty: String,
}

/// A candidate match awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFound {
    pub match_id: String,
    pub partner_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed { match_details: String },
    PartnerDeclined,
}

/// External matchmaking service.
#[async_trait]
pub trait Matchmaker: Send + Sync {
    async fn find(&self, request: &MatchRequest) -> Result<MatchFound, ServiceError>;
    async fn confirm(&self, match_id: &str, user_id: &str) -> Result<ConfirmOutcome, ServiceError>;
    async fn cancel(&self, request: &MatchRequest) -> Result<(), ServiceError>;
}

/// Proof that both participants accepted; the only way into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedMatch {
    room: RoomId,
    user_id: String,
    partner_name: String,
    details: String,
}

impl ConfirmedMatch {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn partner_name(&self) -> &str {
        &self.partner_name
    }

    pub fn details(&self) -> &str {
        &self.details
    }
}

/// Drives one user through matchmaking.
pub struct MatchFlow {
    matchmaker: Arc<dyn Matchmaker>,
    request: MatchRequest,
    state: MatchState,
    found: Option<MatchFound>,
    status: Option<String>,
}

impl MatchFlow {
    pub fn new(matchmaker: Arc<dyn Matchmaker>, request: MatchRequest) -> Self {
        Self {
            matchmaker,
            request,
            state: MatchState::Idle,
            found: None,
            status: None,
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn found(&self) -> Option<&MatchFound> {
        self.found.as_ref()
    }

    /// Last user-facing status message.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Idle → Searching → Found (or back to Idle on error).
    pub async fn start(&mut self) -> Result<&MatchFound, SessionError> {
        self.state = MatchState::Searching;
        self.status = None;
        match self.matchmaker.find(&self.request).await {
            Ok(found) => {
                log::info!(target: "tandem::session", "match {} found", found.match_id);
                self.state = MatchState::Found;
                Ok(self.found.insert(found))
            }
            Err(e) => {
                log::warn!(target: "tandem::session", "find match failed: {e}");
                self.status = Some(e.to_string());
                self.state = MatchState::Idle;
                Err(e.into())
            }
        }
    }

    /// Found → Confirmed. A declining partner sends us back to Idle; a
    /// service error leaves the match pending.
    pub async fn confirm(&mut self) -> Result<ConfirmedMatch, SessionError> {
        let found = match (&self.state, &self.found) {
            (MatchState::Found, Some(found)) => found.clone(),
            _ => return Err(SessionError::MatchNotConfirmed),
        };
        match self
            .matchmaker
            .confirm(&found.match_id, &self.request.user_id)
            .await
        {
            Ok(ConfirmOutcome::Confirmed { match_details }) => {
                self.state = MatchState::Confirmed;
                Ok(ConfirmedMatch {
                    room: RoomId::new(found.match_id),
                    user_id: self.request.user_id.clone(),
                    partner_name: found.partner_name,
                    details: match_details,
                })
            }
            Ok(ConfirmOutcome::PartnerDeclined) => {
                log::info!(target: "tandem::session", "partner failed to accept match {}", found.match_id);
                self.status = Some("Partner failed to accept.".to_string());
                self.reset();
                Err(SessionError::MatchNotConfirmed)
            }
            Err(e) => {
                self.status = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Stop searching. The state returns to Idle whatever the service says.
    pub async fn cancel(&mut self) {
        if let Err(e) = self.matchmaker.cancel(&self.request).await {
            log::warn!(target: "tandem::session", "cancel match failed: {e}");
            self.status = Some(e.to_string());
        }
        self.reset();
    }

    /// Forfeit or acceptance timer expiry.
    pub fn reset(&mut self) {
        self.state = MatchState::Idle;
        self.found = None;
    }
}

// ───────────────────────────────────────────────────────────────────
// Scripted matchmaker
// ───────────────────────────────────────────────────────────────────

/// Matchmaker answering from scripted queues; empty queues mean success.
#[derive(Clone, Default)]
pub struct ScriptedMatchmaker {
    finds: Arc<Mutex<VecDeque<Result<MatchFound, ServiceError>>>>,
    confirms: Arc<Mutex<VecDeque<Result<ConfirmOutcome, ServiceError>>>>,
    cancels: Arc<Mutex<usize>>,
}

impl ScriptedMatchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_find(&self, result: Result<MatchFound, ServiceError>) {
        self.finds.lock().push_back(result);
    }

    pub fn push_confirm(&self, result: Result<ConfirmOutcome, ServiceError>) {
        self.confirms.lock().push_back(result);
    }

    pub fn cancels(&self) -> usize {
        *self.cancels.lock()
    }
}

#[async_trait]
impl Matchmaker for ScriptedMatchmaker {
    async fn find(&self, request: &MatchRequest) -> Result<MatchFound, ServiceError> {
        let scripted = self.finds.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(MatchFound {
                match_id: format!("match-{}", request.user_id),
                partner_name: "Your Partner".to_string(),
            })
        })
    }

    async fn confirm(&self, match_id: &str, _user_id: &str) -> Result<ConfirmOutcome, ServiceError> {
        let scripted = self.confirms.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(ConfirmOutcome::Confirmed {
                match_details: format!("details for {match_id}"),
            })
        })
    }

    async fn cancel(&self, _request: &MatchRequest) -> Result<(), ServiceError> {
        *self.cancels.lock() += 1;
        Ok(())
    }
}

/// Confirm a match through a scripted matchmaker in one go.
pub async fn confirm_scripted(match_id: &str, user_id: &str) -> Result<ConfirmedMatch, SessionError> {
    let matchmaker = ScriptedMatchmaker::new();
    matchmaker.push_find(Ok(MatchFound {
        match_id: match_id.to_string(),
        partner_name: "Your Partner".to_string(),
    }));
    let mut flow = MatchFlow::new(
        Arc::new(matchmaker),
        MatchRequest {
            user_id: user_id.to_string(),
            topic: "arrays".to_string(),
            difficulty: "easy".to_string(),
        },
    );
    flow.start().await?;
    flow.confirm().await
}
