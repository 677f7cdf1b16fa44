//! The fused dialog + transaction automaton.
//!
//! One automaton per dialog: dialog-level and transaction-level
//! progress share a single state value, so "enter `Established` and
//! cancel Timer A" is one indivisible step. Transitions are a pure
//! lookup `(state, event) -> (state', actions)`; the dialog task
//! interprets the actions with its owned context (pending requests,
//! stored responses, subscriptions).
//!
//! Late retransmissions and stale timers resolve to [`Outcome::Ignore`];
//! events with no declared edge are protocol violations and never
//! change state.

use crate::timer::TimerKind;
use std::fmt;

/// Dialog states. UAC establishment runs through
/// `Idle → Calling → Proceeding → Ringing → Established`, UAS
/// establishment through `Idle → Incoming → Alerting → Established`.
/// `Failed` keeps absorbing retransmissions until a timer moves it to
/// `Terminated`, the only state a dialog never leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogState {
    Idle,
    Calling,
    Proceeding,
    Ringing,
    Established,
    Terminating,
    Terminated,
    Failed,
    Incoming,
    Alerting,
    Referring,
    Referred,
    ReferPending,
    Replacing,
    Replaced,
}

impl DialogState {
    /// Only `Terminated` is fully dead; `Failed` still absorbs
    /// retransmissions
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// States in which in-dialog requests may be sent
    pub fn is_established(self) -> bool {
        matches!(
            self,
            Self::Established | Self::Referring | Self::Referred | Self::ReferPending
        )
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs of the automaton.
///
/// Message events are pre-classified by the dialog task: a final
/// response is matched against the pending transaction's CSeq before
/// it becomes `Receive2xx`, `ByeCompleted`, `ReferAccepted` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    // UAC INVITE
    SendInvite,
    Receive1xx(u16),
    Receive2xx,
    ReceiveFailure(u16),
    /// Retransmitted 2xx inside the Timer D window
    Duplicate2xx,
    SendCancel,

    // UAS INVITE
    ReceiveInvite,
    /// Retransmission of the initial INVITE
    ReceiveInviteRetransmit,
    Send1xx(u16),
    Accept,
    Reject(u16),
    ReceiveAck,
    ReceiveCancel,

    // in-dialog
    SendBye,
    ReceiveBye,
    /// Final response to our BYE, any class
    ByeCompleted,
    SendReInvite,
    ReceiveReInvite {
        /// True when our own re-INVITE is still in flight (§14.1 glare)
        glare: bool,
    },
    ReInviteAccepted,
    ReInviteFailed(u16),
    /// A 481 to any in-dialog request: the peer no longer knows the
    /// dialog
    PeerGone,

    // REFER (RFC 3515)
    SendRefer,
    ReceiveRefer,
    ReferAccepted,
    ReferFailed,
    /// Transfer finished (final NOTIFY sent or received)
    ReferCompleted,

    // Replaces (RFC 3891)
    ReceiveReplaces,
    ReplaceSuccess,
    ReplaceFailed(u16),

    // timers & errors
    Timer(TimerKind),
    TransactionError,
    Close,
}

/// Instructions for the dialog task, executed in order after the state
/// has been swapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Arm(TimerKind),
    Cancel(TimerKind),
    CancelAllTimers,

    /// Timer A: resend the pending INVITE, interval doubles
    RetransmitInvite,
    /// Timer E: resend the pending non-INVITE request
    RetransmitRequest,
    /// Timer G / INVITE retransmit: resend the stored response
    RetransmitResponse,

    SendAck,
    ResendAck,
    /// Timer D expired, drop the stored ACK
    ForgetAck,

    SendInvite,
    SendBye,
    SendCancel,
    SendRefer,
    SendReInvite,

    /// Respond to the stored initial INVITE
    SendProvisional(u16),
    SendFinal(u16),
    /// Respond to the stored re-INVITE without touching the call
    /// outcome bookkeeping
    RespondReInvite(u16),
    /// Respond to the request being processed right now
    RespondToCurrent(u16),
    /// CANCEL/BYE in early UAS state also terminates the INVITE
    /// transaction with a 487
    Respond487ToInvite,

    OpenReferSubscription,
    CloseReferSubscription,
    NotifyReferTrying,
    /// Send the final sipfrag NOTIFY for the completed transfer
    NotifyReferResult,
    DispatchRefer,

    /// Arm the randomised §14.1 back-off after a 491
    ScheduleGlareRetry,
    RetryReInvite,
    /// Re-INVITE 2xx may carry a new remote target
    UpdateRemoteTarget,

    CompleteInviteOk,
    CompleteInviteErr,
    CompleteRequestOk,
    CompleteRequestErr,

    Teardown,
}

/// A declared edge of the automaton
#[derive(Debug)]
pub(crate) struct Transition {
    pub(crate) next: DialogState,
    pub(crate) actions: Vec<Action>,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Apply(Transition),
    /// Late retransmission or stale timer, drop silently
    Ignore,
    /// No edge declared: protocol error, state unchanged
    Violation,
}

fn apply(next: DialogState, actions: Vec<Action>) -> Outcome {
    Outcome::Apply(Transition { next, actions })
}

/// The transition table.
///
/// Kept as one match so every declared edge is visible in one place;
/// the unit tests below walk the canonical paths.
pub(crate) fn transition(state: DialogState, event: &Event) -> Outcome {
    use Action::*;
    use DialogState::*;
    use TimerKind as TK;

    match (state, event) {
        // ==== UAC INVITE ====
        (Idle, Event::SendInvite) => {
            apply(Calling, vec![SendInvite, Arm(TK::A), Arm(TK::B)])
        }

        (Calling, Event::Receive1xx(code)) if *code >= 180 => {
            apply(Ringing, vec![Cancel(TK::A)])
        }
        (Calling, Event::Receive1xx(_)) => apply(Proceeding, vec![Cancel(TK::A)]),
        (Proceeding, Event::Receive1xx(code)) if *code >= 180 => apply(Ringing, vec![]),
        (Proceeding | Ringing, Event::Receive1xx(_)) => apply(state, vec![]),

        (Calling | Proceeding | Ringing, Event::Receive2xx) => apply(
            Established,
            vec![
                Cancel(TK::A),
                Cancel(TK::B),
                SendAck,
                Arm(TK::D),
                CompleteInviteOk,
            ],
        ),

        (Calling | Proceeding | Ringing, Event::ReceiveFailure(_)) => apply(
            Failed,
            vec![
                Cancel(TK::A),
                Cancel(TK::B),
                SendAck,
                Arm(TK::D),
                CompleteInviteErr,
            ],
        ),

        (Calling, Event::Timer(TK::A)) => {
            apply(Calling, vec![RetransmitInvite, Arm(TK::A)])
        }
        (Calling | Proceeding | Ringing, Event::Timer(TK::B)) => apply(
            Failed,
            vec![CancelAllTimers, Arm(TK::D), CompleteInviteErr],
        ),

        // cancelled before any response: immediately failed, the 487
        // (or a late 2xx) is absorbed in Failed
        (Calling, Event::SendCancel) => apply(
            Failed,
            vec![
                SendCancel,
                Cancel(TK::A),
                Cancel(TK::B),
                Arm(TK::D),
                CompleteInviteErr,
            ],
        ),
        (Proceeding | Ringing, Event::SendCancel) => apply(
            Failed,
            vec![SendCancel, Cancel(TK::B), Arm(TK::D), CompleteInviteErr],
        ),

        (Calling | Proceeding | Ringing, Event::TransactionError) => apply(
            Failed,
            vec![CancelAllTimers, Arm(TK::D), CompleteInviteErr],
        ),

        // ==== UAS INVITE ====
        (Idle, Event::ReceiveInvite) => apply(Incoming, vec![SendProvisional(100)]),
        (Idle, Event::ReceiveReplaces) => apply(Replacing, vec![SendProvisional(100)]),

        (Incoming, Event::Send1xx(code)) => apply(Alerting, vec![SendProvisional(*code)]),
        (Alerting, Event::Send1xx(code)) => apply(Alerting, vec![SendProvisional(*code)]),

        (Incoming | Alerting, Event::Accept) => apply(
            Established,
            vec![SendFinal(200), Arm(TK::G), Arm(TK::H)],
        ),
        (Incoming | Alerting, Event::Reject(code)) => apply(
            Failed,
            vec![SendFinal(*code), Arm(TK::G), Arm(TK::H)],
        ),

        (Incoming | Alerting | Replacing, Event::ReceiveCancel) => apply(
            Terminated,
            vec![
                RespondToCurrent(200),
                Respond487ToInvite,
                CancelAllTimers,
                Teardown,
            ],
        ),
        (Incoming | Alerting, Event::ReceiveBye) => apply(
            Terminated,
            vec![
                RespondToCurrent(200),
                Respond487ToInvite,
                CancelAllTimers,
                Teardown,
            ],
        ),

        (Incoming | Alerting, Event::ReceiveInviteRetransmit) => {
            apply(state, vec![RetransmitResponse])
        }

        // ==== Replaces (RFC 3891) ====
        (Replacing, Event::ReplaceSuccess) => apply(
            Established,
            vec![SendFinal(200), Arm(TK::G), Arm(TK::H)],
        ),
        (Replacing, Event::ReplaceFailed(code)) => apply(
            Failed,
            vec![SendFinal(*code), Arm(TK::G), Arm(TK::H)],
        ),

        // the replaced dialog: ends via BYE
        (Established, Event::ReplaceSuccess) => apply(
            Replaced,
            vec![SendBye, Arm(TK::E), Arm(TK::F)],
        ),
        (Replaced, Event::ByeCompleted) => {
            apply(Terminated, vec![CancelAllTimers, Teardown])
        }
        (Replaced, Event::Timer(TK::E)) => {
            apply(Replaced, vec![RetransmitRequest, Arm(TK::E)])
        }
        (Replaced, Event::Timer(TK::F) | Event::TransactionError) => {
            apply(Terminated, vec![CancelAllTimers, Teardown])
        }

        // ==== established dialog ====
        // the REFER sub-states still are an established session as far
        // as the INVITE transaction machinery is concerned
        (
            Established | Referring | Referred | ReferPending,
            Event::Duplicate2xx,
        ) => apply(state, vec![ResendAck]),
        (
            Established | Referring | Referred | ReferPending,
            Event::Timer(TK::D),
        ) => apply(state, vec![ForgetAck]),

        (
            Established | Referring | Referred | ReferPending,
            Event::ReceiveAck,
        ) => apply(state, vec![Cancel(TK::G), Cancel(TK::H)]),
        (Established, Event::Timer(TK::G)) => {
            apply(Established, vec![RetransmitResponse, Arm(TK::G)])
        }
        // ACK never arrived: drop the session with a BYE
        (Established, Event::Timer(TK::H)) => apply(
            Terminating,
            vec![Cancel(TK::G), SendBye, Arm(TK::E), Arm(TK::F)],
        ),

        (Established, Event::SendBye) => {
            apply(Terminating, vec![SendBye, Arm(TK::E), Arm(TK::F)])
        }
        (
            Established | Referring | Referred | ReferPending,
            Event::ReceiveBye,
        ) => apply(
            Terminated,
            vec![RespondToCurrent(200), CancelAllTimers, Teardown],
        ),

        // re-INVITE
        (Established, Event::SendReInvite) => {
            apply(Established, vec![SendReInvite, Arm(TK::A), Arm(TK::B)])
        }
        (Established, Event::ReceiveReInvite { glare: true }) => apply(
            Established,
            vec![RespondReInvite(491), Arm(TK::G), Arm(TK::H)],
        ),
        (Established, Event::ReceiveReInvite { glare: false }) => apply(
            Established,
            vec![RespondReInvite(200), Arm(TK::G), Arm(TK::H)],
        ),
        (Established, Event::ReInviteAccepted) => apply(
            Established,
            vec![
                Cancel(TK::A),
                Cancel(TK::B),
                UpdateRemoteTarget,
                SendAck,
                CompleteRequestOk,
            ],
        ),
        (Established, Event::ReInviteFailed(491)) => apply(
            Established,
            vec![Cancel(TK::A), Cancel(TK::B), SendAck, ScheduleGlareRetry],
        ),
        (Established, Event::ReInviteFailed(_)) => apply(
            Established,
            vec![Cancel(TK::A), Cancel(TK::B), SendAck, CompleteRequestErr],
        ),
        (Established, Event::Timer(TK::GlareRetry)) => {
            apply(Established, vec![RetryReInvite, Arm(TK::A), Arm(TK::B)])
        }
        (Established, Event::Timer(TK::A)) => {
            // re-INVITE retransmission
            apply(Established, vec![RetransmitInvite, Arm(TK::A)])
        }
        (Established, Event::Timer(TK::B)) => {
            // re-INVITE timed out, session stays up
            apply(Established, vec![CompleteRequestErr])
        }

        // ==== REFER (RFC 3515) ====
        (Established, Event::SendRefer) => {
            apply(Referring, vec![SendRefer, Arm(TK::E), Arm(TK::F)])
        }
        (Referring, Event::ReferAccepted) => apply(
            Established,
            vec![
                Cancel(TK::E),
                Cancel(TK::F),
                OpenReferSubscription,
                CompleteRequestOk,
            ],
        ),
        (Referring, Event::ReferFailed) => apply(
            Established,
            vec![Cancel(TK::E), Cancel(TK::F), CompleteRequestErr],
        ),
        (Referring, Event::Timer(TK::E)) => {
            apply(Referring, vec![RetransmitRequest, Arm(TK::E)])
        }
        (Referring, Event::Timer(TK::F) | Event::TransactionError) => {
            apply(Established, vec![Cancel(TK::E), CompleteRequestErr])
        }

        (Established, Event::ReceiveRefer) => apply(
            Referred,
            vec![
                RespondToCurrent(202),
                OpenReferSubscription,
                NotifyReferTrying,
                DispatchRefer,
            ],
        ),
        // the application started the transfer attempt
        (Referred, Event::ReferAccepted) => apply(ReferPending, vec![]),
        // the application declined the transfer
        (Referred, Event::ReferFailed) => apply(
            Established,
            vec![NotifyReferResult, CloseReferSubscription],
        ),
        (Referred | ReferPending, Event::ReferCompleted) => apply(
            Established,
            vec![NotifyReferResult, CloseReferSubscription],
        ),

        // subscription lifetime ran out; closing an incoming
        // subscription also emits the final terminated NOTIFY
        (
            Established | Referred | ReferPending,
            Event::Timer(TK::ReferExpiry(_)),
        ) => apply(Established, vec![CloseReferSubscription]),

        // transfer progress of an outgoing REFER arrives as NOTIFY and
        // is fully handled by the dialog task; only the final NOTIFY
        // closes the subscription
        (Established, Event::ReferCompleted) => {
            apply(Established, vec![CloseReferSubscription])
        }

        // ==== BYE in flight ====
        (Terminating, Event::ByeCompleted) => apply(
            Terminated,
            vec![CompleteRequestOk, CancelAllTimers, Teardown],
        ),
        (Terminating, Event::Timer(TK::E)) => {
            apply(Terminating, vec![RetransmitRequest, Arm(TK::E)])
        }
        (Terminating, Event::Timer(TK::F) | Event::TransactionError) => apply(
            Terminated,
            vec![CompleteRequestErr, CancelAllTimers, Teardown],
        ),
        (Terminating, Event::ReceiveBye) => apply(
            Terminated,
            vec![RespondToCurrent(200), CompleteRequestOk, CancelAllTimers, Teardown],
        ),

        // ==== Failed: absorb window ====
        // late 2xx to a cancelled/timed-out INVITE: ACK it, then
        // immediately BYE the unwanted session
        (Failed, Event::Receive2xx) => apply(
            Terminating,
            vec![CancelAllTimers, SendAck, SendBye, Arm(TK::E), Arm(TK::F)],
        ),
        (Failed, Event::ReceiveFailure(_)) => apply(Failed, vec![SendAck]),
        (Failed, Event::ReceiveInviteRetransmit) => {
            apply(Failed, vec![RetransmitResponse])
        }
        (Failed, Event::ReceiveAck) => apply(
            Failed,
            vec![Cancel(TK::G), Cancel(TK::H), Arm(TK::I)],
        ),
        (Failed, Event::Timer(TK::G)) => {
            apply(Failed, vec![RetransmitResponse, Arm(TK::G)])
        }
        (Failed, Event::Timer(TK::D | TK::H | TK::I)) => {
            apply(Terminated, vec![CancelAllTimers, Teardown])
        }
        (Failed, Event::ReceiveBye) => apply(
            Terminated,
            vec![RespondToCurrent(200), CancelAllTimers, Teardown],
        ),

        // ==== the peer lost the dialog (481) ====
        (
            Established | Referring | Referred | ReferPending | Terminating | Replaced,
            Event::PeerGone,
        ) => apply(Terminated, vec![CancelAllTimers, Teardown]),

        // ==== local teardown, idempotent ====
        (Terminated, Event::Close) => Outcome::Ignore,
        (_, Event::Close) => apply(Terminated, vec![CancelAllTimers, Teardown]),

        // ==== terminal & stale ====
        (Terminated, _) => Outcome::Ignore,
        // a cancelled timer may already have queued its event
        (_, Event::Timer(_)) => Outcome::Ignore,
        // retransmissions that race state changes
        (_, Event::Duplicate2xx | Event::ReceiveAck | Event::ReceiveInviteRetransmit) => {
            Outcome::Ignore
        }
        (Failed, Event::ReceiveCancel) => Outcome::Ignore,

        _ => Outcome::Violation,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drive(state: DialogState, event: Event) -> Transition {
        match transition(state, &event) {
            Outcome::Apply(transition) => transition,
            other => panic!("expected edge for ({state:?}, {event:?}), got {other:?}"),
        }
    }

    #[test]
    fn canonical_uac_path() {
        use DialogState::*;

        let t = drive(Idle, Event::SendInvite);
        assert_eq!(t.next, Calling);
        assert!(t.actions.contains(&Action::Arm(TimerKind::A)));
        assert!(t.actions.contains(&Action::Arm(TimerKind::B)));

        let t = drive(Calling, Event::Receive1xx(100));
        assert_eq!(t.next, Proceeding);
        assert!(t.actions.contains(&Action::Cancel(TimerKind::A)));

        let t = drive(Proceeding, Event::Receive1xx(180));
        assert_eq!(t.next, Ringing);

        let t = drive(Ringing, Event::Receive2xx);
        assert_eq!(t.next, Established);
        assert!(t.actions.contains(&Action::Cancel(TimerKind::B)));
        assert!(t.actions.contains(&Action::SendAck));

        let t = drive(Established, Event::SendBye);
        assert_eq!(t.next, Terminating);

        let t = drive(Terminating, Event::ByeCompleted);
        assert_eq!(t.next, Terminated);
        assert!(t.actions.contains(&Action::Teardown));
    }

    #[test]
    fn canonical_uas_path() {
        use DialogState::*;

        let t = drive(Idle, Event::ReceiveInvite);
        assert_eq!(t.next, Incoming);

        let t = drive(Incoming, Event::Send1xx(180));
        assert_eq!(t.next, Alerting);

        let t = drive(Alerting, Event::Accept);
        assert_eq!(t.next, Established);
        assert!(t.actions.contains(&Action::Arm(TimerKind::H)));

        let t = drive(Established, Event::ReceiveAck);
        assert_eq!(t.next, Established);
        assert!(t.actions.contains(&Action::Cancel(TimerKind::H)));

        let t = drive(Established, Event::ReceiveBye);
        assert_eq!(t.next, Terminated);
        assert!(t.actions.contains(&Action::RespondToCurrent(200)));
    }

    #[test]
    fn uas_cancel_sends_487() {
        let t = drive(DialogState::Alerting, Event::ReceiveCancel);
        assert_eq!(t.next, DialogState::Terminated);
        assert!(t.actions.contains(&Action::Respond487ToInvite));
        assert!(t.actions.contains(&Action::RespondToCurrent(200)));
    }

    #[test]
    fn timer_b_fails_the_call() {
        let t = drive(DialogState::Calling, Event::Timer(TimerKind::B));
        assert_eq!(t.next, DialogState::Failed);
        assert!(t.actions.contains(&Action::CompleteInviteErr));
    }

    #[test]
    fn late_2xx_after_cancel_is_acked_and_byed() {
        let t = drive(DialogState::Calling, Event::SendCancel);
        assert_eq!(t.next, DialogState::Failed);

        let t = drive(DialogState::Failed, Event::Receive2xx);
        assert_eq!(t.next, DialogState::Terminating);
        assert!(t.actions.contains(&Action::SendAck));
        assert!(t.actions.contains(&Action::SendBye));
    }

    #[test]
    fn glare_gets_491_and_backoff() {
        let t = drive(
            DialogState::Established,
            Event::ReceiveReInvite { glare: true },
        );
        assert_eq!(t.next, DialogState::Established);
        assert!(t.actions.contains(&Action::RespondReInvite(491)));

        let t = drive(DialogState::Established, Event::ReInviteFailed(491));
        assert!(t.actions.contains(&Action::ScheduleGlareRetry));

        let t = drive(
            DialogState::Established,
            Event::Timer(TimerKind::GlareRetry),
        );
        assert!(t.actions.contains(&Action::RetryReInvite));
    }

    #[test]
    fn refer_sender_states() {
        use DialogState::*;

        let t = drive(Established, Event::SendRefer);
        assert_eq!(t.next, Referring);

        let t = drive(Referring, Event::ReferAccepted);
        assert_eq!(t.next, Established);
        assert!(t.actions.contains(&Action::OpenReferSubscription));

        let t = drive(Referring, Event::ReferFailed);
        assert_eq!(t.next, Established);
    }

    #[test]
    fn refer_recipient_states() {
        use DialogState::*;

        let t = drive(Established, Event::ReceiveRefer);
        assert_eq!(t.next, Referred);
        assert!(t.actions.contains(&Action::RespondToCurrent(202)));
        assert!(t.actions.contains(&Action::DispatchRefer));

        let t = drive(Referred, Event::ReferAccepted);
        assert_eq!(t.next, ReferPending);

        let t = drive(ReferPending, Event::ReferCompleted);
        assert_eq!(t.next, Established);
        assert!(t.actions.contains(&Action::CloseReferSubscription));
    }

    #[test]
    fn replaces_path() {
        use DialogState::*;

        let t = drive(Idle, Event::ReceiveReplaces);
        assert_eq!(t.next, Replacing);

        let t = drive(Replacing, Event::ReplaceSuccess);
        assert_eq!(t.next, Established);

        // the replaced dialog leaves via BYE
        let t = drive(Established, Event::ReplaceSuccess);
        assert_eq!(t.next, Replaced);
        assert!(t.actions.contains(&Action::SendBye));

        let t = drive(Replaced, Event::ByeCompleted);
        assert_eq!(t.next, Terminated);
    }

    #[test]
    fn peer_gone_terminates() {
        let t = drive(DialogState::Established, Event::PeerGone);
        assert_eq!(t.next, DialogState::Terminated);
        assert!(t.actions.contains(&Action::CancelAllTimers));
    }

    #[test]
    fn close_is_idempotent() {
        let t = drive(DialogState::Established, Event::Close);
        assert_eq!(t.next, DialogState::Terminated);

        assert!(matches!(
            transition(DialogState::Terminated, &Event::Close),
            Outcome::Ignore
        ));
    }

    #[test]
    fn stale_timers_are_ignored() {
        assert!(matches!(
            transition(DialogState::Established, &Event::Timer(TimerKind::A)),
            Outcome::Apply(_) // re-INVITE retransmit edge exists
        ));

        assert!(matches!(
            transition(DialogState::Ringing, &Event::Timer(TimerKind::A)),
            Outcome::Ignore
        ));

        assert!(matches!(
            transition(DialogState::Terminated, &Event::Timer(TimerKind::B)),
            Outcome::Ignore
        ));
    }

    #[test]
    fn undeclared_edges_are_violations() {
        assert!(matches!(
            transition(DialogState::Idle, &Event::ReceiveBye),
            Outcome::Violation
        ));

        assert!(matches!(
            transition(DialogState::Calling, &Event::SendRefer),
            Outcome::Violation
        ));
    }

    #[test]
    fn duplicate_2xx_resends_ack() {
        let t = drive(DialogState::Established, Event::Duplicate2xx);
        assert_eq!(t.next, DialogState::Established);
        assert_eq!(t.actions, vec![Action::ResendAck]);
    }
}
