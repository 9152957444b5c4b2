//! Campaign event scanning and firing.

mod common;

use common::{RunnerMode, campaign_flow_id, flow_uuid, harness};
use taskroom::campaigns::{self, FireCampaignEventTask};
use taskroom::marker::{CAMPAIGN_EVENT_GROUP, MarkerSet};
use taskroom::model::{ContactId, FireResult, Priority};
use taskroom::queue::{BATCH_QUEUE, HANDLER_QUEUE};

fn fire_ids(task: &taskroom::model::TaskEnvelope) -> Vec<i64> {
    let task: FireCampaignEventTask = serde_json::from_value(task.payload.clone()).unwrap();
    task.fire_ids.into_iter().map(|f| f.0).collect()
}

#[tokio::test]
async fn scan_queues_due_fires_once() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    h.store.add_fire(2, 10, 101, 5);
    // not yet due
    h.store.add_fire(3, 10, 102, -60);

    let stats = campaigns::queue_event_fires(&h.rt).await.unwrap();
    assert_eq!((stats.queued, stats.dupes, stats.tasks), (2, 0, 1));

    let second = campaigns::queue_event_fires(&h.rt).await.unwrap();
    assert_eq!((second.queued, second.dupes, second.tasks), (0, 2, 0));

    let tasks = h.pop_all(BATCH_QUEUE).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, FireCampaignEventTask::TYPE);
    assert_eq!(fire_ids(&tasks[0]), vec![1, 2]);
    assert!(h.pop_all(HANDLER_QUEUE).await.is_empty());
}

#[tokio::test]
async fn large_events_are_chunked() {
    let h = harness();
    for i in 1..=110 {
        h.store.add_fire(i, 10, 1000 + i, 5);
    }

    let stats = campaigns::queue_event_fires(&h.rt).await.unwrap();
    assert_eq!((stats.queued, stats.tasks), (110, 2));

    let sizes: Vec<usize> = h
        .pop_all(BATCH_QUEUE)
        .await
        .iter()
        .map(|t| fire_ids(t).len())
        .collect();
    assert_eq!(sizes, vec![100, 10]);
}

#[tokio::test]
async fn fires_are_grouped_by_event() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    h.store.add_fire(2, 20, 100, 5);
    h.store.add_fire(3, 10, 101, 5);

    let stats = campaigns::queue_event_fires(&h.rt).await.unwrap();
    assert_eq!(stats.tasks, 2);

    let tasks = h.pop_all(BATCH_QUEUE).await;
    let by_event: Vec<(i64, Vec<i64>)> = tasks
        .iter()
        .map(|t| {
            let task: FireCampaignEventTask = serde_json::from_value(t.payload.clone()).unwrap();
            (task.event_id.0, task.fire_ids.iter().map(|f| f.0).collect())
        })
        .collect();
    assert_eq!(by_event, vec![(10, vec![1, 3]), (20, vec![2])]);
}

#[tokio::test]
async fn fire_tasks_go_to_the_batch_queue_at_bulk() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    campaigns::queue_event_fires(&h.rt).await.unwrap();

    // a high priority task queued afterwards for the same org comes out first
    taskroom::tasks::queue_task(
        &h.rt,
        BATCH_QUEUE,
        common::ORG,
        &FireCampaignEventTask {
            event_id: taskroom::model::CampaignEventId(99),
            fire_ids: vec![],
        },
        Priority::High,
    )
    .await
    .unwrap();
    let tasks = h.pop_all(BATCH_QUEUE).await;
    assert_eq!(fire_ids(&tasks[0]), Vec::<i64>::new());
    assert_eq!(fire_ids(&tasks[1]), vec![1]);
}

#[tokio::test]
async fn fired_contacts_start_the_event_flow_once() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    h.store.add_fire(2, 10, 101, 5);

    campaigns::queue_event_fires(&h.rt).await.unwrap();
    let results = h.run_queue(BATCH_QUEUE).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());

    let flow = campaign_flow_id(flow_uuid(10));
    for (fire, contact) in [(1, 100), (2, 101)] {
        assert_eq!(h.store.runs_for(flow, ContactId(contact)), 1);
        let fire = h.store.fire(fire).unwrap();
        assert!(fire.fired.is_some());
        assert_eq!(fire.fired_result, Some(FireResult::Fired));
    }

    // fired rows are no longer due, so nothing more is queued
    let stats = campaigns::queue_event_fires(&h.rt).await.unwrap();
    assert_eq!((stats.queued, stats.dupes), (0, 0));
}

#[tokio::test]
async fn started_fires_are_marked_when_the_engine_leaves_them() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    h.store.add_fire(2, 10, 101, 5);
    {
        let mut runner = h.runner.state.lock().unwrap();
        runner.leave_unfired = true;
        runner.skip.insert(ContactId(101));
    }

    campaigns::queue_event_fires(&h.rt).await.unwrap();
    h.run_queue(BATCH_QUEUE).await;

    assert_eq!(h.store.fire(1).unwrap().fired_result, Some(FireResult::Fired));
    // not started, so left for the next scan
    assert!(h.store.fire(2).unwrap().fired.is_none());
    assert!(!h.markers.contains(CAMPAIGN_EVENT_GROUP, "2").await.unwrap());
}

#[tokio::test]
async fn engine_failures_unmark_fires_for_the_next_scan() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    h.runner.set_mode(RunnerMode::Fail);

    campaigns::queue_event_fires(&h.rt).await.unwrap();
    let results = h.run_queue(BATCH_QUEUE).await;
    assert!(results[0].1.is_err());

    assert!(h.store.fire(1).unwrap().fired.is_none());
    assert!(!h.markers.contains(CAMPAIGN_EVENT_GROUP, "1").await.unwrap());

    h.runner.set_mode(RunnerMode::Normal);
    let stats = campaigns::queue_event_fires(&h.rt).await.unwrap();
    assert_eq!(stats.queued, 1);
    h.run_queue(BATCH_QUEUE).await;
    assert!(h.store.fire(1).unwrap().fired.is_some());
}

#[tokio::test]
async fn load_failures_unmark_every_fire() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    h.store.add_fire(2, 10, 101, 5);
    campaigns::queue_event_fires(&h.rt).await.unwrap();

    h.store.state.lock().unwrap().fail_loads = true;
    let results = h.run_queue(BATCH_QUEUE).await;
    assert!(results[0].1.is_err());

    for id in ["1", "2"] {
        assert!(!h.markers.contains(CAMPAIGN_EVENT_GROUP, id).await.unwrap());
    }
}

#[tokio::test]
async fn inactive_events_delete_their_fires() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    h.runner.set_mode(RunnerMode::Inactive);

    campaigns::queue_event_fires(&h.rt).await.unwrap();
    let results = h.run_queue(BATCH_QUEUE).await;
    assert!(results[0].1.is_ok());

    assert!(h.store.fire(1).is_none());
    assert!(!h.markers.contains(CAMPAIGN_EVENT_GROUP, "1").await.unwrap());
}

#[tokio::test]
async fn skipped_contacts_are_unmarked() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    h.store.add_fire(2, 10, 101, 5);
    h.runner.state.lock().unwrap().skip.insert(ContactId(101));

    campaigns::queue_event_fires(&h.rt).await.unwrap();
    h.run_queue(BATCH_QUEUE).await;

    assert!(h.markers.contains(CAMPAIGN_EVENT_GROUP, "1").await.unwrap());
    assert!(!h.markers.contains(CAMPAIGN_EVENT_GROUP, "2").await.unwrap());
    assert_eq!(h.store.fire(2).unwrap().fired_result, Some(FireResult::Skipped));
}

#[tokio::test]
async fn already_fired_deliveries_do_nothing() {
    let h = harness();
    h.store.add_fire(1, 10, 100, 5);
    campaigns::queue_event_fires(&h.rt).await.unwrap();
    let task = h.pop_all(BATCH_QUEUE).await.remove(0);

    // run it twice, as a duplicate delivery would
    taskroom::tasks::perform(&h.rt, &h.registry, &task).await.unwrap();
    taskroom::tasks::perform(&h.rt, &h.registry, &task).await.unwrap();

    assert_eq!(h.runner.state.lock().unwrap().fire_calls, 1);
    assert_eq!(
        h.store
            .runs_for(campaign_flow_id(flow_uuid(10)), ContactId(100)),
        1
    );
}
