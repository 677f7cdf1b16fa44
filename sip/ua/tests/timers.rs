//! RFC 3261 timer behaviour under a paused clock: INVITE
//! retransmission (Timer A), transaction timeout (Timer B) and the
//! silence of timers after terminal states.

mod common;

use common::{TestNet, addr, make_stack, target};
use parking_lot::Mutex;
use softsip_ua::{DialogState, Error, InviteOptions};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn timer_b_times_out_the_invite() {
    let net = TestNet::new();

    let (alice, alice_addr) = make_stack(&net, 5060);

    // 5062 is a black hole: frames are sent but nobody answers
    let started = tokio::time::Instant::now();

    let dialog = alice
        .invite(target("bob", addr(5062)), InviteOptions::default())
        .await
        .expect("invite");

    let err = dialog.wait_established().await.expect_err("must time out");
    assert!(matches!(err, Error::TransactionTimeout));

    assert_eq!(dialog.state(), DialogState::Failed);

    // Timer B fires at 64*T1 = 32s
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(31) && elapsed <= Duration::from_secs(34),
        "Timer B fired after {elapsed:?}"
    );

    // Timer A: retransmissions at 0.5, 1.5, 3.5, 7.5, 15.5 and 31.5s
    // on top of the initial send
    let invites = net
        .frames_from(alice_addr)
        .iter()
        .filter(|f| f.first_line().starts_with("INVITE"))
        .count();
    assert_eq!(invites, 7, "initial INVITE plus 6 doubling retransmits");

    assert_eq!(alice.metrics().failed_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn no_timer_fires_after_terminal() {
    let net = TestNet::new();

    let (alice, alice_addr) = make_stack(&net, 5060);

    let dialog = alice
        .invite(target("bob", addr(5062)), InviteOptions::default())
        .await
        .expect("invite");

    dialog.close();
    dialog.wait_terminated().await;

    let frames_at_close = net.frames_from(alice_addr).len();

    // a whole minute of silence: every armed timer must be dead
    tokio::time::advance(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;

    assert_eq!(net.frames_from(alice_addr).len(), frames_at_close);
    assert_eq!(alice.active_dialogs(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_invite_fails_with_cancelled() {
    let net = TestNet::new();

    let (alice, _) = make_stack(&net, 5060);

    let dialog = alice
        .invite(target("bob", addr(5062)), InviteOptions::default())
        .await
        .expect("invite");

    // give the INVITE a moment on the wire, then abandon the call
    tokio::time::sleep(Duration::from_millis(100)).await;
    dialog.cancel().await.expect("cancel");

    let err = dialog.wait_established().await.expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(dialog.state(), DialogState::Failed);

    // the absorb window closes the dialog without outside help
    tokio::time::advance(Duration::from_secs(40)).await;
    tokio::task::yield_now().await;

    assert_eq!(alice.active_dialogs(), 0);
    assert_eq!(dialog.state(), DialogState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_the_registry() {
    use softsip_ua::{Body, DialogHandle, IncomingDialogHandler, IncomingInvite};

    struct Answer;

    #[async_trait::async_trait]
    impl IncomingDialogHandler for Answer {
        async fn on_incoming_dialog(&self, dialog: DialogHandle, _invite: IncomingInvite) {
            dialog
                .accept(Some(Body::new("application/sdp", "v=0\r\n")))
                .await
                .expect("accept");
        }
    }

    let net = TestNet::new();

    let (alice, _) = make_stack(&net, 5060);
    let (bob, bob_addr) = make_stack(&net, 5062);

    bob.on_incoming_dialog(Answer);

    let mut dialogs = Vec::new();
    for _ in 0..4 {
        let dialog = alice
            .invite(target("bob", bob_addr), InviteOptions::default())
            .await
            .expect("invite");
        dialog.wait_established().await.expect("established");
        dialogs.push(dialog);
    }

    assert_eq!(alice.active_dialogs(), 4);
    assert_eq!(bob.active_dialogs(), 4);

    alice.shutdown(Duration::from_secs(5)).await.expect("shutdown");

    assert_eq!(alice.active_dialogs(), 0);

    for dialog in &dialogs {
        assert_eq!(dialog.state(), DialogState::Terminated);
    }

    // bob saw the BYEs
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.active_dialogs(), 0);

    // shutdown is idempotent
    alice.shutdown(Duration::from_secs(1)).await.expect("again");
}
