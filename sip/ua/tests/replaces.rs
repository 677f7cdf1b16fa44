//! Call replacement via an INVITE with Replaces (RFC 3891): the new
//! dialog supplants an established one, which leaves via BYE.

mod common;

use common::{TestNet, make_stack, target};
use parking_lot::Mutex;
use sip_types::header::typed::Replaces;
use softsip_ua::{
    Body, DialogHandle, DialogState, Error, IncomingDialogHandler, IncomingInvite, InviteOptions,
    TerminateReason,
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

#[tokio::test(start_paused = true)]
async fn invite_with_replaces_supplants_the_dialog() {
    let net = TestNet::new();

    let (alice, _) = make_stack(&net, 5060);
    let (bob, bob_addr) = make_stack(&net, 5062);
    let (carol, _) = make_stack(&net, 5064);

    let bob_side = Arc::new(Mutex::new(None));
    bob.on_incoming_dialog(Answer {
        handle: bob_side.clone(),
    });

    // D1: alice <-> bob, established
    let d1 = alice
        .invite(target("bob", bob_addr), InviteOptions::default())
        .await
        .expect("invite");
    d1.wait_established().await.expect("established");

    let d1_terminated = Arc::new(Mutex::new(None));
    let d1_terminated2 = d1_terminated.clone();
    d1.on_terminated(move |reason| *d1_terminated2.lock() = Some(reason));

    let bob_dialog = bob_side.lock().clone().expect("bob side of D1");

    // the Replaces triple names D1 from bob's perspective
    let bob_key = bob_dialog.key();
    let replaces = Replaces {
        call_id: bob_key.call_id.clone(),
        to_tag: bob_key.local_tag.clone(),
        from_tag: bob_key.remote_tag.clone().expect("complete key"),
        early_only: false,
    };

    // carol calls bob, replacing D1
    let d2 = carol
        .invite(
            target("bob", bob_addr),
            InviteOptions {
                replaces: Some(replaces),
                ..Default::default()
            },
        )
        .await
        .expect("invite");

    d2.wait_established().await.expect("replacement established");

    // bob tore D1 down with a BYE towards alice
    d1.wait_terminated().await;
    assert_eq!(*d1_terminated.lock(), Some(TerminateReason::PeerBye));

    bob_dialog.wait_terminated().await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(alice.active_dialogs(), 0);
    assert_eq!(carol.active_dialogs(), 1);
    assert_eq!(bob.active_dialogs(), 1, "only the replacement dialog lives");

    assert_eq!(bob.metrics().replace_operations, 1);

    // the replacement behaves like any established dialog
    d2.bye().await.expect("bye");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.active_dialogs(), 0);
    assert_eq!(carol.active_dialogs(), 0);
}

#[tokio::test(start_paused = true)]
async fn replaces_unknown_dialog_is_rejected() {
    let net = TestNet::new();

    let (_bob, bob_addr) = make_stack(&net, 5062);
    let (carol, _) = make_stack(&net, 5064);

    let replaces = Replaces {
        call_id: "nonexistent@softphone".into(),
        to_tag: "aaaa".into(),
        from_tag: "bbbb".into(),
        early_only: false,
    };

    let d2 = carol
        .invite(
            target("bob", bob_addr),
            InviteOptions {
                replaces: Some(replaces),
                ..Default::default()
            },
        )
        .await
        .expect("invite");

    let err = d2.wait_established().await.expect_err("no such dialog");
    assert!(matches!(err, Error::DialogTerminated));
    assert_eq!(d2.state(), DialogState::Failed);
}
