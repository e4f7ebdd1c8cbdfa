//! Leader election among clients sharing a local store.
//!
//! A pure state machine: events in, new state plus actions out. The
//! driver in `deltasync-client` broadcasts proposals and heartbeats over
//! the same-origin channel and runs the timers; this module only decides
//! transitions, so every path is unit-testable without timing.
//!
//! Protocol: every candidate broadcasts `(tiebreak, client_id)` and
//! collects rival proposals until the election timeout fires; the
//! highest tuple wins. Because all candidates see the same proposals and
//! apply the same max rule, they agree on the winner without a second
//! round. An established leader answers late proposals with an immediate
//! heartbeat, which demotes the newcomer to follower.

use deltasync_types::ClientId;

/// A candidacy announcement.
///
/// Ordered by `(tiebreak, client_id)`; the highest proposal wins the
/// election. The tiebreak is random so leadership does not always land
/// on the same client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Proposal {
    /// Random tiebreak, compared first.
    pub tiebreak: u64,
    /// The proposing client, compared second; unique, so ties are
    /// impossible.
    pub client_id: ClientId,
}

impl Proposal {
    /// Create a proposal with a random tiebreak.
    pub fn random(client_id: ClientId) -> Self {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self {
            tiebreak: u64::from_le_bytes(bytes),
            client_id,
        }
    }
}

/// Election state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Not campaigning; following `leader` if one is known.
    Follower {
        /// The client currently believed to be leader.
        leader: Option<ClientId>,
    },
    /// Campaign in progress; `best` is the highest proposal seen so far
    /// (including our own).
    Campaigning {
        /// Our own proposal.
        own: Proposal,
        /// Best proposal observed, ours included.
        best: Proposal,
    },
    /// This client is the leader.
    Leader,
}

/// Events consumed by the election machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    /// The driver starts (or restarts) a campaign with our proposal.
    CampaignStarted(Proposal),
    /// A rival proposal arrived on the broadcast channel.
    ProposalReceived(Proposal),
    /// The election timer fired.
    ElectionTimeout,
    /// A heartbeat from an established leader arrived.
    HeartbeatReceived(ClientId),
    /// No heartbeat arrived within the heartbeat timeout.
    HeartbeatTimeout,
    /// The leader announced it is going away.
    LeaderResigned(ClientId),
}

/// Actions for the driver to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionAction {
    /// Broadcast our proposal and start the election timer.
    AnnounceCandidacy(Proposal),
    /// We won: open the remote, start heartbeating.
    BecomeLeader,
    /// We lost to `leader`: start the heartbeat watchdog.
    FollowLeader(ClientId),
    /// We are leader and someone is campaigning: heartbeat immediately.
    AssertLeadership,
    /// The leader is gone: the driver should start a fresh campaign.
    StartCampaign,
    /// We stopped being leader (demoted by a live leader's heartbeat).
    StepDown,
}

impl ElectionState {
    /// The initial state: follower with no known leader.
    pub fn new() -> Self {
        Self::Follower { leader: None }
    }

    /// Whether this client currently holds leadership.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    /// The leader this client currently recognizes, if any.
    pub fn leader(&self) -> Option<ClientId> {
        match self {
            Self::Follower { leader } => *leader,
            Self::Campaigning { .. } => None,
            Self::Leader => None,
        }
    }

    /// Process one event. Pure; the caller executes the actions.
    pub fn on_event(self, event: ElectionEvent) -> (Self, Vec<ElectionAction>) {
        match (self, event) {
            (Self::Follower { .. } | Self::Campaigning { .. }, ElectionEvent::CampaignStarted(own)) => (
                Self::Campaigning { own, best: own },
                vec![ElectionAction::AnnounceCandidacy(own)],
            ),

            (Self::Campaigning { own, best }, ElectionEvent::ProposalReceived(rival)) => (
                Self::Campaigning {
                    own,
                    best: best.max(rival),
                },
                vec![],
            ),

            (Self::Campaigning { own, best }, ElectionEvent::ElectionTimeout) => {
                if best == own {
                    (Self::Leader, vec![ElectionAction::BecomeLeader])
                } else {
                    (
                        Self::Follower {
                            leader: Some(best.client_id),
                        },
                        vec![ElectionAction::FollowLeader(best.client_id)],
                    )
                }
            }

            // A live leader trumps any campaign.
            (Self::Campaigning { .. }, ElectionEvent::HeartbeatReceived(leader)) => (
                Self::Follower {
                    leader: Some(leader),
                },
                vec![ElectionAction::FollowLeader(leader)],
            ),

            (Self::Follower { .. }, ElectionEvent::HeartbeatReceived(leader)) => (
                Self::Follower {
                    leader: Some(leader),
                },
                vec![],
            ),

            (Self::Follower { .. }, ElectionEvent::HeartbeatTimeout) => (
                Self::Follower { leader: None },
                vec![ElectionAction::StartCampaign],
            ),

            (Self::Follower { leader: Some(current) }, ElectionEvent::LeaderResigned(gone))
                if current == gone =>
            {
                (
                    Self::Follower { leader: None },
                    vec![ElectionAction::StartCampaign],
                )
            }

            (Self::Leader, ElectionEvent::ProposalReceived(_)) => {
                (Self::Leader, vec![ElectionAction::AssertLeadership])
            }

            // Two leaders should never coexist, but if a rival leader's
            // heartbeat reaches us the higher client id keeps the seat.
            (Self::Leader, ElectionEvent::HeartbeatReceived(rival)) => {
                (
                    Self::Follower {
                        leader: Some(rival),
                    },
                    vec![ElectionAction::StepDown, ElectionAction::FollowLeader(rival)],
                )
            }

            // Everything else: stay put.
            (state, _) => (state, vec![]),
        }
    }
}

impl Default for ElectionState {
    fn default() -> Self {
        Self::new()
    }
}
