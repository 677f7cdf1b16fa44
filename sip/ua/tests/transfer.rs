//! Blind transfer via REFER (RFC 3515): 202 acceptance, sipfrag
//! NOTIFY progress, subscription closure on the final result.

mod common;

use common::{TestNet, make_stack, target};
use parking_lot::Mutex;
use sip_types::StatusCode;
use softsip_ua::{
    Body, DialogHandle, DialogState, IncomingDialogHandler, IncomingInvite, IncomingRefer,
    IncomingReferHandler, InviteOptions,
};
use std::sync::Arc;
use std::time::Duration;

struct Answer {
    handle: Arc<Mutex<Option<DialogHandle>>>,
}

#[async_trait::async_trait]
impl IncomingDialogHandler for Answer {
    async fn on_incoming_dialog(&self, dialog: DialogHandle, _invite: IncomingInvite) {
        dialog
            .accept(Some(Body::new("application/sdp", "v=0\r\n")))
            .await
            .expect("accept");

        *self.handle.lock() = Some(dialog);
    }
}

/// Simulates the transferee: accepts the transfer, pretends to call
/// the target and reports the configured outcome
struct Transferee {
    outcome: StatusCode,
}

#[async_trait::async_trait]
impl IncomingReferHandler for Transferee {
    async fn on_incoming_refer(&self, dialog: DialogHandle, refer: IncomingRefer) {
        assert_eq!(refer.target.uri.user.as_deref(), Some("charlie"));

        dialog.accept_refer(refer.subscription_id);

        // the pretend call to the target rings, then resolves
        dialog.refer_progress(refer.subscription_id, StatusCode::RINGING);

        tokio::time::sleep(Duration::from_millis(50)).await;
        dialog.refer_progress(refer.subscription_id, self.outcome);
    }
}

async fn established_pair(
    net: &Arc<TestNet>,
) -> (softsip_ua::Stack, softsip_ua::Stack, DialogHandle) {
    let (alice, _) = make_stack(net, 5060);
    let (bob, bob_addr) = make_stack(net, 5062);

    bob.on_incoming_dialog(Answer {
        handle: Arc::new(Mutex::new(None)),
    });

    let dialog = alice
        .invite(
            target("bob", bob_addr),
            InviteOptions {
                body: Some(Body::new("application/sdp", "v=0\r\n")),
                ..Default::default()
            },
        )
        .await
        .expect("invite");

    dialog.wait_established().await.expect("established");

    (alice, bob, dialog)
}

#[tokio::test(start_paused = true)]
async fn blind_transfer_success() {
    let net = TestNet::new();
    let (alice, bob, dialog) = established_pair(&net).await;

    bob.on_incoming_refer(Transferee {
        outcome: StatusCode::OK,
    });

    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress2 = progress.clone();
    dialog.on_refer_progress(move |p| progress2.lock().push(p.status.into_u16()));

    let states = Arc::new(Mutex::new(Vec::new()));
    let states2 = states.clone();
    dialog.on_state_change(move |_, new| states2.lock().push(new));

    dialog
        .refer(sip_types::uri::NameAddr::new(
            "sip:charlie@example.com".parse().unwrap(),
        ))
        .await
        .expect("202 accepted");

    // the REFER sender leaves and re-enters Established
    assert_eq!(
        states.lock().as_slice(),
        &[DialogState::Referring, DialogState::Established]
    );

    // wait for the transfer outcome notifications
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(progress.lock().as_slice(), &[100, 180, 200]);
    assert_eq!(dialog.state(), DialogState::Established);

    assert_eq!(alice.metrics().total_refers, 1);
    assert!(bob.metrics().total_refers >= 1);
}

#[tokio::test(start_paused = true)]
async fn blind_transfer_target_busy() {
    let net = TestNet::new();
    let (_alice, bob, dialog) = established_pair(&net).await;

    bob.on_incoming_refer(Transferee {
        outcome: StatusCode::BUSY_HERE,
    });

    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress2 = progress.clone();
    dialog.on_refer_progress(move |p| progress2.lock().push(p.status.into_u16()));

    dialog
        .refer(sip_types::uri::NameAddr::new(
            "sip:charlie@example.com".parse().unwrap(),
        ))
        .await
        .expect("202 accepted");

    tokio::time::sleep(Duration::from_millis(200)).await;

    // the failed transfer is reported and the session survives
    assert_eq!(progress.lock().as_slice(), &[100, 180, 486]);
    assert_eq!(dialog.state(), DialogState::Established);

    // both sides still alive: the call can be torn down normally
    dialog.bye().await.expect("bye");
    assert_eq!(dialog.state(), DialogState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn refer_subscription_expires() {
    use common::make_stack_with;
    use softsip_ua::Config;

    let net = TestNet::new();

    let (alice, _) = make_stack(&net, 5060);

    // bob's subscriptions run out well before alice's, so his final
    // NOTIFY arrives while alice still has the subscription open
    let (bob, bob_addr) = make_stack_with(
        &net,
        5062,
        Config {
            refer_subscribe_expiry: Duration::from_secs(2),
            ..Default::default()
        },
    );

    bob.on_incoming_dialog(Answer {
        handle: Arc::new(Mutex::new(None)),
    });

    let dialog = alice
        .invite(target("bob", bob_addr), InviteOptions::default())
        .await
        .expect("invite");
    dialog.wait_established().await.expect("established");

    // the transferee accepts but never reports a result
    struct Silent;

    #[async_trait::async_trait]
    impl IncomingReferHandler for Silent {
        async fn on_incoming_refer(&self, dialog: DialogHandle, refer: IncomingRefer) {
            dialog.accept_refer(refer.subscription_id);
        }
    }

    bob.on_incoming_refer(Silent);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress2 = progress.clone();
    dialog.on_refer_progress(move |p| progress2.lock().push(p.status.into_u16()));

    dialog
        .refer(sip_types::uri::NameAddr::new(
            "sip:charlie@example.com".parse().unwrap(),
        ))
        .await
        .expect("202 accepted");

    tokio::time::advance(Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(
        progress.lock().contains(&408),
        "expiry reports 408, got {:?}",
        progress.lock()
    );
    assert_eq!(dialog.state(), DialogState::Established);
}
