//! Basic UAC/UAS call: INVITE, 100/180 provisionals, 200 + ACK, BYE.

mod common;

use common::{TestNet, make_stack, target};
use parking_lot::Mutex;
use softsip_ua::{
    Body, DialogHandle, DialogState, IncomingDialogHandler, IncomingInvite, InviteOptions,
    TerminateReason,
};
use std::sync::Arc;
use std::time::Duration;

struct RingThenAnswer;

#[async_trait::async_trait]
impl IncomingDialogHandler for RingThenAnswer {
    async fn on_incoming_dialog(&self, dialog: DialogHandle, invite: IncomingInvite) {
        assert!(invite.body.is_some(), "INVITE should carry the offer");

        dialog.ring();

        dialog
            .accept(Some(Body::new("application/sdp", "v=0\r\n")))
            .await
            .expect("accept");
    }
}

#[tokio::test(start_paused = true)]
async fn basic_call() {
    let net = TestNet::new();

    let (alice, alice_addr) = make_stack(&net, 5060);
    let (bob, bob_addr) = make_stack(&net, 5062);

    bob.on_incoming_dialog(RingThenAnswer);

    let offer = Body::new(
        "application/sdp",
        "o=- 1 1 IN IP4 127.0.0.1\r\nm=audio 5004 RTP/AVP 0\r\n",
    );

    let dialog = alice
        .invite(
            target("bob", bob_addr),
            InviteOptions {
                body: Some(offer),
                ..Default::default()
            },
        )
        .await
        .expect("invite");

    let states = Arc::new(Mutex::new(Vec::new()));
    let states2 = states.clone();
    dialog.on_state_change(move |_, new| states2.lock().push(new));

    let terminated = Arc::new(Mutex::new(None));
    let terminated2 = terminated.clone();
    dialog.on_terminated(move |reason| *terminated2.lock() = Some(reason));

    dialog.wait_established().await.expect("established");

    assert_eq!(dialog.state(), DialogState::Established);
    assert_eq!(
        states.lock().as_slice(),
        &[
            DialogState::Calling,
            DialogState::Proceeding,
            DialogState::Ringing,
            DialogState::Established,
        ]
    );

    // the dialog key is complete once the 200 arrived
    let key = dialog.key();
    assert!(key.remote_tag.is_some());

    // exactly one INVITE on the wire: Timer A was cancelled by the 100
    let invites = net
        .frames_from(alice_addr)
        .iter()
        .filter(|f| f.first_line().starts_with("INVITE"))
        .count();
    assert_eq!(invites, 1);

    // push time past Timer B and D: nothing may fire, the call stays up
    tokio::time::advance(Duration::from_secs(40)).await;
    tokio::task::yield_now().await;

    assert_eq!(dialog.state(), DialogState::Established);
    assert!(
        !net.frames().iter().any(|f| f.first_line().starts_with("BYE")),
        "no timer-driven BYE may appear while the call is up"
    );

    // hold briefly, then hang up
    tokio::time::sleep(Duration::from_millis(500)).await;
    dialog.bye().await.expect("bye");

    dialog.wait_terminated().await;
    assert_eq!(*terminated.lock(), Some(TerminateReason::LocalBye));

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(alice.active_dialogs(), 0);
    assert_eq!(bob.active_dialogs(), 0);

    let alice_metrics = alice.metrics();
    assert_eq!(alice_metrics.total_invites, 1);
    assert_eq!(alice_metrics.successful_calls, 1);
    assert_eq!(alice_metrics.failed_calls, 0);
    assert_eq!(alice_metrics.total_byes, 1);

    let bob_metrics = bob.metrics();
    assert_eq!(bob_metrics.total_invites, 1);
    assert_eq!(bob_metrics.successful_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn callee_rejects() {
    struct Decline;

    #[async_trait::async_trait]
    impl IncomingDialogHandler for Decline {
        async fn on_incoming_dialog(&self, dialog: DialogHandle, _invite: IncomingInvite) {
            dialog
                .reject(sip_types::StatusCode::BUSY_HERE)
                .await
                .expect("reject");
        }
    }

    let net = TestNet::new();

    let (alice, _) = make_stack(&net, 5060);
    let (bob, bob_addr) = make_stack(&net, 5062);

    bob.on_incoming_dialog(Decline);

    let dialog = alice
        .invite(target("bob", bob_addr), InviteOptions::default())
        .await
        .expect("invite");

    let err = dialog.wait_established().await.expect_err("busy");
    assert!(matches!(err, softsip_ua::Error::DialogTerminated));

    assert_eq!(dialog.state(), DialogState::Failed);
    assert_eq!(alice.metrics().failed_calls, 1);

    // the failure absorb window ends in Terminated and the registry
    // drains
    tokio::time::advance(Duration::from_secs(40)).await;
    tokio::task::yield_now().await;

    assert_eq!(alice.active_dialogs(), 0);
}

#[tokio::test(start_paused = true)]
async fn peer_hangs_up() {
    struct AnswerThenBye;

    #[async_trait::async_trait]
    impl IncomingDialogHandler for AnswerThenBye {
        async fn on_incoming_dialog(&self, dialog: DialogHandle, _invite: IncomingInvite) {
            dialog.accept(None).await.expect("accept");

            tokio::time::sleep(Duration::from_millis(100)).await;
            dialog.bye().await.expect("bye");
        }
    }

    let net = TestNet::new();

    let (alice, _) = make_stack(&net, 5060);
    let (bob, bob_addr) = make_stack(&net, 5062);

    bob.on_incoming_dialog(AnswerThenBye);

    let dialog = alice
        .invite(target("bob", bob_addr), InviteOptions::default())
        .await
        .expect("invite");

    let terminated = Arc::new(Mutex::new(None));
    let terminated2 = terminated.clone();
    dialog.on_terminated(move |reason| *terminated2.lock() = Some(reason));

    dialog.wait_established().await.expect("established");
    dialog.wait_terminated().await;

    assert_eq!(*terminated.lock(), Some(TerminateReason::PeerBye));
    assert_eq!(dialog.state(), DialogState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
    let net = TestNet::new();

    let (alice, _) = make_stack(&net, 5060);

    // nobody listens on the far end, the dialog stays in Calling
    let dialog = alice
        .invite(target("bob", common::addr(5062)), InviteOptions::default())
        .await
        .expect("invite");

    let count = Arc::new(Mutex::new(0));
    let count2 = count.clone();
    dialog.on_terminated(move |_| *count2.lock() += 1);

    dialog.close();
    dialog.close();
    dialog.close();

    dialog.wait_terminated().await;
    tokio::task::yield_now().await;

    // teardown ran exactly once
    assert_eq!(*count.lock(), 1);
    assert_eq!(alice.active_dialogs(), 0);
}
