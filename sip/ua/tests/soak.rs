//! Many concurrent dialogs against one UAS: no protocol errors, the
//! registry drains completely, counters stay consistent.

mod common;

use common::{TestNet, make_stack, target};
use softsip_ua::{Body, DialogHandle, IncomingDialogHandler, IncomingInvite, InviteOptions};
use std::time::Duration;

struct AutoAnswer;

#[async_trait::async_trait]
impl IncomingDialogHandler for AutoAnswer {
    async fn on_incoming_dialog(&self, dialog: DialogHandle, _invite: IncomingInvite) {
        dialog
            .accept(Some(Body::new("application/sdp", "v=0\r\n")))
            .await
            .expect("accept");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dialog_soak() {
    const DIALOGS: usize = 100;

    let net = TestNet::new();

    let (alice, _) = make_stack(&net, 5060);
    let (bob, bob_addr) = make_stack(&net, 5062);

    bob.on_incoming_dialog(AutoAnswer);

    // open every dialog and hold them all up concurrently
    let mut tasks = Vec::new();

    for i in 0..DIALOGS {
        let alice = alice.clone();

        tasks.push(tokio::spawn(async move {
            let dialog = alice
                .invite(
                    target(&format!("bob-{i}"), bob_addr),
                    InviteOptions {
                        body: Some(Body::new("application/sdp", "v=0\r\n")),
                        ..Default::default()
                    },
                )
                .await
                .expect("invite");

            dialog.wait_established().await.expect("established");
            dialog
        }));
    }

    let mut dialogs = Vec::new();
    for task in tasks {
        dialogs.push(task.await.expect("task"));
    }

    // peak load: every dialog is live on both sides
    assert_eq!(alice.active_dialogs(), DIALOGS);
    assert_eq!(bob.active_dialogs(), DIALOGS);

    let metrics = alice.metrics();
    assert_eq!(metrics.total_invites as usize, DIALOGS);
    assert_eq!(metrics.successful_calls as usize, DIALOGS);
    assert_eq!(metrics.failed_calls, 0);

    // the identifier pools kept their books straight: one Call-ID and
    // one tag per dialog
    assert_eq!(
        (metrics.id_pool_hits + metrics.id_pool_misses) as usize,
        DIALOGS * 2
    );

    // shards were all used and no shard hoards the load
    let counts = &metrics.shard_dialog_counts;
    assert_eq!(counts.iter().sum::<usize>(), DIALOGS);

    // hold briefly, then tear everything down in parallel
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut teardowns = Vec::new();
    for dialog in dialogs {
        teardowns.push(tokio::spawn(async move {
            dialog.bye().await.expect("bye");
            dialog.wait_terminated().await;
        }));
    }

    for task in teardowns {
        task.await.expect("teardown");
    }

    // both registries drain promptly
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while (alice.active_dialogs() > 0 || bob.active_dialogs() > 0)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(alice.active_dialogs(), 0);
    assert_eq!(bob.active_dialogs(), 0);

    assert_eq!(alice.metrics().total_byes as usize, DIALOGS);
    assert_eq!(alice.metrics().failed_calls, 0);
}
