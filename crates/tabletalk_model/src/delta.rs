//! Typed change deltas.

use crate::entity::{Participant, Pick, VoteRecord};
use crate::ids::{ParticipantId, ServerTime, SessionId};
use crate::phase::SessionPhase;
use serde::{Deserialize, Serialize};

/// The kind of entity a delta targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// The session record.
    Session,
    /// A participant.
    Participant,
    /// A participant's vote record.
    Vote,
    /// An item pick.
    Pick,
}

impl EntityKind {
    /// All entity kinds a session subscription covers.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Session,
        EntityKind::Participant,
        EntityKind::Vote,
        EntityKind::Pick,
    ];

    /// Returns the wire name for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Session => "session",
            EntityKind::Participant => "participant",
            EntityKind::Vote => "vote",
            EntityKind::Pick => "pick",
        }
    }
}

/// The operation a delta performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOp {
    /// Add the entity if its identity is absent.
    Insert,
    /// Patch the entity if the delta is not stale.
    Update,
}

/// Which transport produced a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTransport {
    /// The live change-notification channel.
    Push,
    /// The interval-polling fallback.
    Poll,
}

/// The stable identity of the entity a delta targets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    /// The session record.
    Session(SessionId),
    /// A participant, by id.
    Participant(ParticipantId),
    /// A vote record, by voting participant.
    Vote(ParticipantId),
    /// A pick, by participant and round.
    Pick(ParticipantId, u32),
}

/// A field-level patch for the session record.
///
/// Absent fields are left untouched by the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    /// New phase, if it changed.
    pub phase: Option<SessionPhase>,
    /// New round, if it changed.
    pub round: Option<u32>,
}

impl SessionPatch {
    /// Creates a patch that only advances the phase.
    pub fn phase(phase: SessionPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }

    /// Creates a patch that only advances the round.
    pub fn round(round: u32) -> Self {
        Self {
            round: Some(round),
            ..Self::default()
        }
    }
}

/// The typed payload of a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaBody {
    /// A patch to the session record.
    Session(SessionId, SessionPatch),
    /// A full participant record.
    Participant(Participant),
    /// A vote record; topic sets merge by union.
    Vote(VoteRecord),
    /// A pick record.
    Pick(Pick),
}

/// A single typed change record, consumed once by the merge.
///
/// Deltas are transient: both transports produce them, the supervisor
/// gates which transport's deltas reach the merge, and the merge imposes
/// its own total order, so nothing here relies on delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Insert or update.
    pub op: DeltaOp,
    /// The typed payload.
    pub body: DeltaBody,
    /// Server-assigned timestamp of the underlying change.
    pub server_time: ServerTime,
    /// The transport that delivered this delta.
    pub source: SourceTransport,
}

impl Delta {
    /// Creates an insert delta.
    pub fn insert(body: DeltaBody, server_time: ServerTime, source: SourceTransport) -> Self {
        Self {
            op: DeltaOp::Insert,
            body,
            server_time,
            source,
        }
    }

    /// Creates an update delta.
    pub fn update(body: DeltaBody, server_time: ServerTime, source: SourceTransport) -> Self {
        Self {
            op: DeltaOp::Update,
            body,
            server_time,
            source,
        }
    }

    /// Returns the entity kind this delta targets.
    pub fn kind(&self) -> EntityKind {
        match self.body {
            DeltaBody::Session(..) => EntityKind::Session,
            DeltaBody::Participant(_) => EntityKind::Participant,
            DeltaBody::Vote(_) => EntityKind::Vote,
            DeltaBody::Pick(_) => EntityKind::Pick,
        }
    }

    /// Returns the stable identity this delta targets.
    pub fn key(&self) -> EntityKey {
        match &self.body {
            DeltaBody::Session(id, _) => EntityKey::Session(id.clone()),
            DeltaBody::Participant(p) => EntityKey::Participant(p.id.clone()),
            DeltaBody::Vote(v) => EntityKey::Vote(v.participant.clone()),
            DeltaBody::Pick(p) => EntityKey::Pick(p.participant.clone(), p.round),
        }
    }
}
