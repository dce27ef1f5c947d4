//! Epoch-end recovery: safe-end computation, policy gating, and shrink
//! re-publication.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use taglog_engine::interface::{LockReply, TLogRejoinRequest};
use taglog_engine::{CoreState, LogSystemType, Tag, TagPartitionedLogSystem};
use taglog_locality::LocalityData;

mod common;
use common::{cohort, init_tracing, prev_core_state, test_knobs, zone, MockTLog};

type Published = watch::Receiver<Option<Arc<TagPartitionedLogSystem>>>;

struct Recovery {
    published: Published,
    rejoin_tx: mpsc::Sender<TLogRejoinRequest>,
    _task: tokio::task::JoinHandle<()>,
}

fn start_recovery(prev_state: CoreState) -> Recovery {
    let (out_tx, published) = watch::channel(None);
    let (rejoin_tx, rejoin_rx) = mpsc::channel(32);
    let future = TagPartitionedLogSystem::recover_and_end_epoch(
        out_tx,
        Uuid::new_v4(),
        test_knobs(),
        prev_state,
        rejoin_rx,
        LocalityData::new(),
    );
    let task = tokio::spawn(async move {
        let _ = future.await;
    });
    Recovery {
        published,
        rejoin_tx,
        _task: task,
    }
}

async fn rejoin(recovery: &Recovery, tlog: &Arc<MockTLog>, index: usize) -> oneshot::Receiver<bool> {
    let (reply_tx, reply_rx) = oneshot::channel();
    recovery
        .rejoin_tx
        .send(TLogRejoinRequest {
            interface: tlog.handle(format!("tlog-{index}:4000"), zone(index)),
            reply: reply_tx,
        })
        .await
        .expect("rejoin channel open");
    reply_rx
}

/// Wait until the published system's end version matches `end`.
async fn wait_for_end(published: &mut Published, end: u64) -> Arc<TagPartitionedLogSystem> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let current = published.borrow_and_update().clone();
            if let Some(system) = current {
                if system.epoch_end_version() == Some(end) {
                    return system;
                }
            }
            published.changed().await.expect("recovery alive");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no frozen system published at end {end}"))
}

fn lock_reply(end: u64, known_committed_version: u64, tags: &[u32]) -> LockReply {
    LockReply {
        end,
        known_committed_version,
        tags: tags.iter().map(|&t| Tag(t)).collect(),
    }
}

#[tokio::test]
async fn recovery_publishes_the_safe_end_version() {
    init_tracing();
    let tlogs = cohort(5);
    let ends = [1004u64, 1003, 1002, 1001, 1000];
    for (i, tlog) in tlogs.iter().enumerate() {
        tlog.set_lock_reply(lock_reply(ends[i], 900 + i as u64, &[i as u32]));
    }
    let mut recovery = start_recovery(prev_core_state(&tlogs, 3, 0));

    // With three of five zones unresponsive the policy is still satisfiable
    // by the absent set, so nothing may be published yet.
    let _ = rejoin(&recovery, &tlogs[0], 0).await;
    let _ = rejoin(&recovery, &tlogs[1], 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(recovery.published.borrow().is_none());

    // A third responder breaks the unresponsive set's policy; the safe end
    // is the smallest locked end (W = 0).
    let _ = rejoin(&recovery, &tlogs[2], 2).await;
    let system = wait_for_end(&mut recovery.published, 1002).await;
    assert_eq!(system.log_server_count(), 5);
    assert_eq!(system.known_committed_version(), 902);
    let expected: BTreeSet<Tag> = [Tag(0), Tag(1), Tag(2)].into_iter().collect();
    assert_eq!(system.epoch_end_tags(), &expected);

    // Each further responder shrinks the provable end and forces a
    // re-publication at the earlier safe point.
    let _ = rejoin(&recovery, &tlogs[3], 3).await;
    let system = wait_for_end(&mut recovery.published, 1001).await;
    assert_eq!(system.known_committed_version(), 903);

    let _ = rejoin(&recovery, &tlogs[4], 4).await;
    let system = wait_for_end(&mut recovery.published, 1000).await;
    assert_eq!(system.known_committed_version(), 904);
    let all: BTreeSet<Tag> = (0..5).map(Tag).collect();
    assert_eq!(system.epoch_end_tags(), &all);
}

#[tokio::test]
async fn recovery_waits_while_unresponsive_servers_satisfy_the_policy() {
    init_tracing();
    let tlogs = cohort(5);
    for tlog in &tlogs {
        tlog.set_lock_reply(lock_reply(1000, 0, &[0]));
    }
    let recovery = start_recovery(prev_core_state(&tlogs, 3, 0));

    let _ = rejoin(&recovery, &tlogs[0], 0).await;
    let _ = rejoin(&recovery, &tlogs[1], 1).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        recovery.published.borrow().is_none(),
        "three unresponsive zones satisfy Across(zone, 3); publishing would be unsafe"
    );
}

#[tokio::test]
async fn anti_quorum_combinations_gate_publication() {
    init_tracing();
    let tlogs = cohort(4);
    let ends = [100u64, 101, 102, 103];
    for (i, tlog) in tlogs.iter().enumerate() {
        tlog.set_lock_reply(lock_reply(ends[i], 0, &[]));
    }
    let mut state = prev_core_state(&tlogs, 2, 1);
    state.policy = taglog_locality::ReplicationPolicy::across(taglog_locality::keys::ZONE_ID, 2);
    let mut recovery = start_recovery(state);

    // Three of four respond, but the one absent server plus any single
    // possibly-unwritten responder could form a policy-satisfying stale
    // replica set, so recovery must keep waiting.
    for i in 0..3 {
        let _ = rejoin(&recovery, &tlogs[i], i).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(recovery.published.borrow().is_none());

    // With everyone locked the anti-quorum is safe; W = 1 makes the safe
    // end the second-smallest locked end.
    let _ = rejoin(&recovery, &tlogs[3], 3).await;
    let system = wait_for_end(&mut recovery.published, 101).await;
    assert_eq!(system.epoch_end_version(), Some(101));
}

#[tokio::test]
async fn empty_previous_epoch_publishes_an_empty_frozen_system() {
    init_tracing();
    let state = CoreState {
        log_system_type: LogSystemType::TagPartitioned,
        ..CoreState::default()
    };
    let mut recovery = start_recovery(state);

    let system = wait_for_end(&mut recovery.published, 0).await;
    assert_eq!(system.log_server_count(), 0);
    assert_eq!(system.known_committed_version(), 0);
}

#[tokio::test]
async fn superseding_rejoin_marks_the_prior_request_stale() {
    init_tracing();
    let tlogs = cohort(3);
    for tlog in &tlogs {
        tlog.set_lock_reply(lock_reply(100, 0, &[]));
    }
    let recovery = start_recovery(prev_core_state(&tlogs, 3, 0));

    let first = rejoin(&recovery, &tlogs[0], 0).await;
    let _second = rejoin(&recovery, &tlogs[0], 9).await;

    let stale = tokio::time::timeout(Duration::from_secs(1), first)
        .await
        .expect("superseded rejoin must be answered")
        .expect("reply channel intact");
    assert!(stale, "the prior request holder is stale");
}

#[tokio::test]
async fn unknown_rejoin_is_rejected_immediately() {
    init_tracing();
    let tlogs = cohort(3);
    for tlog in &tlogs {
        tlog.set_lock_reply(lock_reply(100, 0, &[]));
    }
    let recovery = start_recovery(prev_core_state(&tlogs, 3, 0));

    let stranger = MockTLog::new();
    let reply = rejoin(&recovery, &stranger, 0).await;
    let stale = tokio::time::timeout(Duration::from_secs(1), reply)
        .await
        .expect("unknown rejoin must be answered")
        .expect("reply channel intact");
    assert!(stale);
}
