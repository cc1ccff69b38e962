//! Orphan detection and recovery: work that was taken but never
//! acknowledged must become visible again without losing its history.

use std::sync::Arc;

use baton_core::{
    InMemoryConfig, InMemoryQueue, ManualClock, Message, OrphanRecoverer, Queue,
};

const THRESHOLD_MS: u64 = 60_000;

fn queue_with_clock() -> (Arc<InMemoryQueue>, ManualClock) {
    let clock = ManualClock::new(1_000_000);
    let queue =
        InMemoryQueue::with_clock(InMemoryConfig::default(), Arc::new(clock.clone())).unwrap();
    (Arc::new(queue), clock)
}

#[tokio::test]
async fn abandoned_take_surfaces_and_requeues() {
    let (queue, clock) = queue_with_clock();
    queue.queue(&Message::with_id(3, b"work".to_vec())).await.unwrap();

    let taken = queue.take().await.unwrap().unwrap();
    assert!(queue.orphan_messages(THRESHOLD_MS).await.unwrap().is_empty());

    // Consumer dies; the threshold elapses.
    clock.advance(THRESHOLD_MS + 1);
    let orphans = queue.orphan_messages(THRESHOLD_MS).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, 3);

    assert!(queue.move_from_ephemeral_to_queue(&orphans[0]).await.unwrap());
    // Already moved: a second recovery attempt loses the race.
    assert!(!queue.move_from_ephemeral_to_queue(&orphans[0]).await.unwrap());

    let redelivered = queue.take().await.unwrap().unwrap();
    assert_eq!(redelivered.id, 3);
    assert_eq!(redelivered.payload, b"work");
    assert_eq!(redelivered.requeue_count, taken.requeue_count, "recovery is silent");
}

#[tokio::test]
async fn finished_work_never_shows_up_as_orphaned() {
    let (queue, clock) = queue_with_clock();
    queue.queue(&Message::with_id(1, vec![])).await.unwrap();
    queue.queue(&Message::with_id(2, vec![])).await.unwrap();

    let done = queue.take().await.unwrap().unwrap();
    let abandoned = queue.take().await.unwrap().unwrap();
    queue.finish(&done).await.unwrap();

    clock.advance(THRESHOLD_MS * 2);
    let orphans = queue.orphan_messages(THRESHOLD_MS).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, abandoned.id);
}

#[tokio::test]
async fn recoverer_cycle_moves_every_orphan_in_the_batch() {
    let (queue, clock) = queue_with_clock();
    for id in 1..=20u64 {
        queue.queue(&Message::with_id(id, vec![])).await.unwrap();
    }
    for _ in 0..20 {
        queue.take().await.unwrap().unwrap();
    }
    assert_eq!(queue.ephemeral_size().await, 20);

    clock.advance(THRESHOLD_MS + 1);
    let recoverer = OrphanRecoverer::new(queue.clone(), THRESHOLD_MS);
    assert_eq!(recoverer.run_once().await.unwrap(), 20);

    assert_eq!(queue.queue_size().await, 20);
    assert_eq!(queue.ephemeral_size().await, 0);
}

#[tokio::test]
async fn orphan_scan_is_capped_per_cycle() {
    let (queue, clock) = queue_with_clock();
    for id in 1..=150u64 {
        queue.queue(&Message::with_id(id, vec![])).await.unwrap();
    }
    for _ in 0..150 {
        queue.take().await.unwrap().unwrap();
    }

    clock.advance(THRESHOLD_MS + 1);
    assert_eq!(queue.orphan_messages(THRESHOLD_MS).await.unwrap().len(), 100);

    // Two recoverer cycles drain the backlog.
    let recoverer = OrphanRecoverer::new(queue.clone(), THRESHOLD_MS);
    assert_eq!(recoverer.run_once().await.unwrap(), 100);
    assert_eq!(recoverer.run_once().await.unwrap(), 50);
    assert_eq!(queue.queue_size().await, 150);
}

#[tokio::test]
async fn store_accounting_across_transitions() {
    let (queue, _clock) = queue_with_clock();
    queue.queue(&Message::with_id(9, vec![])).await.unwrap();
    assert_eq!((queue.queue_size().await, queue.ephemeral_size().await), (1, 0));

    let taken = queue.take().await.unwrap().unwrap();
    assert_eq!((queue.queue_size().await, queue.ephemeral_size().await), (0, 1));

    queue.requeue(&taken).await.unwrap();
    assert_eq!((queue.queue_size().await, queue.ephemeral_size().await), (1, 0));

    let taken = queue.take().await.unwrap().unwrap();
    queue.finish(&taken).await.unwrap();
    assert_eq!((queue.queue_size().await, queue.ephemeral_size().await), (0, 0));
}

#[tokio::test]
async fn ephemeral_cap_backpressure_recovers_after_finish() {
    let clock = ManualClock::new(1_000_000);
    let queue = Arc::new(
        InMemoryQueue::with_clock(
            InMemoryConfig {
                ephemeral_max_size: Some(2),
                ..InMemoryConfig::default()
            },
            Arc::new(clock.clone()),
        )
        .unwrap(),
    );

    for id in 1..=3u64 {
        queue.queue(&Message::with_id(id, vec![])).await.unwrap();
    }
    let first = queue.take().await.unwrap().unwrap();
    let _second = queue.take().await.unwrap().unwrap();

    // Two in flight, cap reached: queued work is withheld.
    assert!(queue.take().await.unwrap().is_none());
    assert_eq!(queue.queue_size().await, 1);

    queue.finish(&first).await.unwrap();
    assert_eq!(queue.take().await.unwrap().unwrap().id, 3);
}
