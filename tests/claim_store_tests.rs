#![cfg(unix)]


use process_utils::{DEAD_PID, LiveProcess};
use slotguard::{ClaimOutcome, ClaimRecord, SlotClaimStore, WorkerIdentity};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn identity() -> WorkerIdentity {
    WorkerIdentity::new("test/1/0")
}

#[tokio::test]
async fn claim_creates_lock_file_with_pid_and_worker() {
    let dir = tempdir().unwrap();
    let store = SlotClaimStore::new(dir.path().join("slot-claims"));

    let outcome = store.claim(1, &identity()).await.unwrap();
    assert_eq!(outcome, ClaimOutcome::Acquired);

    let content = std::fs::read_to_string(dir.path().join("slot-claims/slot-1.lock")).unwrap();
    assert_eq!(
        content,
        format!("pid={}\nworker=test/1/0\n", std::process::id())
    );
}

#[tokio::test]
async fn claim_held_by_live_process_is_not_taken() {
    let dir = tempdir().unwrap();
    let holder = LiveProcess::sleeper();
    let other = SlotClaimStore::new(dir.path()).with_owner_pid(holder.pid);
    assert!(other.claim(1, &identity()).await.unwrap().is_acquired());

    let store = SlotClaimStore::new(dir.path());
    match store.claim(1, &identity()).await.unwrap() {
        ClaimOutcome::Held { record } => assert_eq!(record.pid, Some(holder.pid)),
        outcome => panic!("expected held claim, got {outcome:?}"),
    }

    // The live holder's claim is untouched.
    let info = store.inspect(1).await.unwrap().unwrap();
    assert_eq!(info.record.pid, Some(holder.pid));
}

#[tokio::test]
async fn claim_naming_dead_pid_is_reclaimed() {
    let dir = tempdir().unwrap();
    let store = SlotClaimStore::new(dir.path());
    std::fs::write(
        store.claim_path(1),
        format!("pid={DEAD_PID}\nworker=crashed\n"),
    )
    .unwrap();

    match store.claim(1, &identity()).await.unwrap() {
        ClaimOutcome::Reclaimed { previous } => {
            assert_eq!(previous, ClaimRecord::new(DEAD_PID, "crashed"));
        }
        outcome => panic!("expected reclaim, got {outcome:?}"),
    }

    let info = store.inspect(1).await.unwrap().unwrap();
    assert_eq!(info.record.pid, Some(std::process::id()));
}

#[tokio::test]
async fn unparseable_fresh_claim_is_treated_as_live() {
    let dir = tempdir().unwrap();
    let store = SlotClaimStore::new(dir.path());
    std::fs::write(store.claim_path(1), "pi").unwrap();

    let outcome = store.claim(1, &identity()).await.unwrap();
    assert_eq!(
        outcome,
        ClaimOutcome::Held {
            record: ClaimRecord::default()
        }
    );
}

#[tokio::test]
async fn unparseable_old_claim_is_reclaimed() {
    let dir = tempdir().unwrap();
    let store = SlotClaimStore::new(dir.path()).stale_after(Duration::from_millis(50));
    std::fs::write(store.claim_path(1), "garbage").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcome = store.claim(1, &identity()).await.unwrap();
    assert!(matches!(outcome, ClaimOutcome::Reclaimed { .. }));
}

#[tokio::test]
async fn release_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = SlotClaimStore::new(dir.path());
    store.claim(2, &identity()).await.unwrap();

    store.release(2).await.unwrap();
    store.release(2).await.unwrap();
    store.release_blocking(2).unwrap();
    assert!(store.inspect(2).await.unwrap().is_none());
}

#[tokio::test]
async fn claimed_slots_lists_lock_files_in_order() {
    let dir = tempdir().unwrap();
    let store = SlotClaimStore::new(dir.path());
    assert!(store.claimed_slots().await.unwrap().is_empty());

    for slot in [3, 1, 10] {
        store.claim(slot, &identity()).await.unwrap();
    }
    std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

    assert_eq!(store.claimed_slots().await.unwrap(), vec![1, 3, 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_on_one_slot_have_a_single_winner() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SlotClaimStore::new(dir.path()));

    let mut handles = Vec::new();
    for n in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim(1, &WorkerIdentity::new(format!("racer-{n}")))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_acquired() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn claim_fails_when_state_dir_cannot_be_created() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, "not a directory").unwrap();

    let store = SlotClaimStore::new(blocker.join("slot-claims"));
    assert!(store.claim(1, &identity()).await.is_err());
}
