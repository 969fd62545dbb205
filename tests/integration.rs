//! Integration tests for the message queue.

use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tailmq::store::{CappedSpec, MemoryCollection, MemoryCounters};
use tailmq::{
    AckMode, MessageQueue, MsgState, PublishRequest, QueueConfig, ResumeFrom, Sequence,
    SubscribeOptions, SubscribeRequest, TargetSelector,
};

/// Instances sharing a collection must also share the counter store, or
/// they would mint colliding sequences.
fn queue_on(
    collection: &Arc<MemoryCollection>,
    counters: &Arc<MemoryCounters>,
    name: &str,
) -> MessageQueue {
    MessageQueue::new(
        Arc::clone(collection) as _,
        Arc::clone(counters) as _,
        QueueConfig::new(name),
    )
    .unwrap()
}

fn replay_options() -> SubscribeOptions {
    SubscribeOptions {
        from: ResumeFrom::Earliest,
        poll_interval: Duration::from_millis(10),
        tail_wait: Duration::from_millis(20),
        ..SubscribeOptions::default()
    }
}

// --- Realistic Workflow Tests ---

#[test]
fn test_work_queue_workflow() {
    let collection = Arc::new(MemoryCollection::new());
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");
    let worker = queue_on(&collection, &counters, "worker");

    producer.send("renders", "run", json!({"frame": 1})).unwrap();
    producer.send("audits", "run", json!({"check": "x"})).unwrap();
    producer.send("renders", "run", json!({"frame": 2})).unwrap();

    let stream = worker
        .subscribe(
            SubscribeRequest::new()
                .topic("renders")
                .options(replay_options()),
        )
        .unwrap();
    let stop = stream.stop_handle();

    let mut frames = Vec::new();
    for item in stream {
        let envelope = item.unwrap();
        assert_eq!(envelope.status.state, MsgState::Received);
        frames.push(envelope.payload["frame"].as_i64().unwrap());
        worker.complete(&envelope, MsgState::Success).unwrap();
        if frames.len() == 2 {
            stop.stop();
        }
    }

    // Only the matching topic, in publish order.
    assert_eq!(frames, vec![1, 2]);

    let depth = producer.stats().depth().unwrap();
    assert_eq!(depth.total, 3);
    assert_eq!(depth.done, 2);
    assert_eq!(depth.pending, 1);
}

#[test]
fn test_instances_on_one_collection_sequence_uniquely() {
    let collection = Arc::new(MemoryCollection::new());
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");
    let worker = queue_on(&collection, &counters, "worker");

    let first = producer.send("jobs", "run", json!(1)).unwrap();
    let second = worker.send("jobs", "run", json!(2)).unwrap();

    assert_eq!(first.track, Sequence(1));
    assert_eq!(second.track, Sequence(2));
}

#[test]
fn test_request_response_workflow() {
    let collection = Arc::new(MemoryCollection::new());
    let counters = Arc::new(MemoryCounters::new());
    let requester = queue_on(&collection, &counters, "requester");
    let worker = queue_on(&collection, &counters, "worker");

    let request = requester
        .publish(
            PublishRequest::new(json!({"a": 2, "b": 3}))
                .topic("math")
                .verb("add")
                .ack(AckMode::Results),
        )
        .unwrap();

    // Worker side: claim, compute, publish the result, complete.
    let stream = worker
        .subscribe(
            SubscribeRequest::new()
                .topic("math")
                .options(replay_options()),
        )
        .unwrap();
    let stop = stream.stop_handle();
    for item in stream {
        let envelope = item.unwrap();
        let sum = envelope.payload["a"].as_i64().unwrap() + envelope.payload["b"].as_i64().unwrap();
        worker
            .publish_result(&envelope, json!({"sum": sum}))
            .unwrap();
        worker.complete(&envelope, MsgState::Success).unwrap();
        stop.stop();
    }

    // Requester side: the result came back targeted at us, linked to the
    // request, with no acknowledgement requested.
    let stream = requester
        .subscribe_raw(
            SubscribeRequest::new()
                .target(TargetSelector::Name)
                .options(replay_options()),
        )
        .unwrap();
    let stop = stream.stop_handle();
    let mut results = Vec::new();
    for item in stream {
        results.push(item.unwrap());
        stop.stop();
    }

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.payload["sum"], 5);
    assert_ne!(result.track, request.track);
    assert_eq!(result.id.parent, Some(request.id.sequence));
    assert_eq!(result.ack, AckMode::None);
    assert_eq!(result.status.sent_by, "worker");
}

#[test]
fn test_interrupted_consumer_resumes_exactly_once() {
    let collection = Arc::new(MemoryCollection::new());
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");
    let worker = queue_on(&collection, &counters, "worker");

    for i in 1..=5 {
        producer.send("jobs", "run", json!(i)).unwrap();
    }

    // First pass: consume two, then "crash".
    let stream = worker
        .subscribe(SubscribeRequest::new().options(replay_options()))
        .unwrap();
    let stop = stream.stop_handle();
    let mut first_pass = Vec::new();
    for item in stream {
        first_pass.push(item.unwrap().payload.as_i64().unwrap());
        if first_pass.len() == 2 {
            stop.stop();
        }
    }
    assert_eq!(first_pass, vec![1, 2]);

    // Second pass replays from the beginning; the claim protocol skips the
    // two already-claimed messages, so nothing is delivered twice.
    let stream = worker
        .subscribe(SubscribeRequest::new().options(replay_options()))
        .unwrap();
    let stop = stream.stop_handle();
    let mut second_pass = Vec::new();
    for item in stream {
        second_pass.push(item.unwrap().payload.as_i64().unwrap());
        if second_pass.len() == 3 {
            stop.stop();
        }
    }
    assert_eq!(second_pass, vec![3, 4, 5]);
}

#[test]
fn test_explicit_checkpoint_resume_is_inclusive() {
    let collection = Arc::new(MemoryCollection::new());
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");
    let observer = queue_on(&collection, &counters, "observer");

    for i in 1..=5 {
        producer.send("jobs", "run", json!(i)).unwrap();
    }

    let options = SubscribeOptions {
        from: ResumeFrom::At(Sequence(3)),
        ..replay_options()
    };
    let stream = observer
        .subscribe_raw(SubscribeRequest::new().options(options))
        .unwrap();
    let stop = stream.stop_handle();

    let mut seen = Vec::new();
    for item in stream {
        seen.push(item.unwrap().track.0);
        if seen.len() == 3 {
            stop.stop();
        }
    }
    assert_eq!(seen, vec![3, 4, 5]);
}

#[test]
fn test_latest_on_empty_collection_delivers_all_publishes() {
    let collection = Arc::new(MemoryCollection::new());
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");
    let observer = queue_on(&collection, &counters, "observer");

    // Nothing to anchor on yet; everything published from here on is new.
    let options = SubscribeOptions {
        from: ResumeFrom::Latest,
        ..replay_options()
    };
    let mut stream = observer
        .subscribe_raw(SubscribeRequest::new().options(options))
        .unwrap();
    let stop = stream.stop_handle();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        for i in 1..=3 {
            producer.send("jobs", "run", json!(i)).unwrap();
        }
    });

    let mut seen = Vec::new();
    while let Some(item) = stream.next() {
        seen.push(item.unwrap().payload.as_i64().unwrap());
        if seen.len() == 3 {
            stop.stop();
        }
    }
    writer.join().unwrap();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[test]
fn test_tailing_from_latest_skips_backlog() {
    let collection = Arc::new(MemoryCollection::capped(CappedSpec::default()));
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");
    let observer = queue_on(&collection, &counters, "observer");

    producer.send("jobs", "run", json!("old")).unwrap();

    let options = SubscribeOptions {
        from: ResumeFrom::Latest,
        ..replay_options()
    };
    let mut stream = observer
        .subscribe_raw(SubscribeRequest::new().options(options))
        .unwrap();
    let stop = stream.stop_handle();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        producer.send("jobs", "run", json!("new-1")).unwrap();
        producer.send("jobs", "run", json!("new-2")).unwrap();
    });

    let first = stream.next().unwrap().unwrap();
    let second = stream.next().unwrap().unwrap();
    writer.join().unwrap();
    stop.stop();

    assert_eq!(first.payload, json!("new-1"));
    assert_eq!(second.payload, json!("new-2"));
}

#[test]
fn test_observer_leaves_delivery_state_alone() {
    let collection = Arc::new(MemoryCollection::new());
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");
    let observer = queue_on(&collection, &counters, "observer");

    producer.send("jobs", "run", json!(1)).unwrap();

    let stream = observer
        .subscribe_raw(SubscribeRequest::new().options(replay_options()))
        .unwrap();
    let stop = stream.stop_handle();
    for item in stream {
        let envelope = item.unwrap();
        assert_eq!(envelope.status.state, MsgState::Sent);
        stop.stop();
    }

    // The stored document was not touched.
    let depth = producer.stats().depth().unwrap();
    assert_eq!(depth.pending, 1);
    assert_eq!(depth.in_flight, 0);
}

#[test]
fn test_message_info_timings() {
    let collection = Arc::new(MemoryCollection::new());
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");
    let worker = queue_on(&collection, &counters, "worker");

    let sent = producer.send("jobs", "run", json!(1)).unwrap();
    let info = producer.info(&sent);
    assert!(info.receive_secs < 0.0);
    assert!(info.complete_secs < 0.0);

    let stream = worker
        .subscribe(SubscribeRequest::new().options(replay_options()))
        .unwrap();
    let stop = stream.stop_handle();
    for item in stream {
        let envelope = item.unwrap();
        let done = worker.complete(&envelope, MsgState::Success).unwrap();
        let info = worker.info(&done);
        assert!(info.receive_secs >= 0.0);
        assert!(info.complete_secs >= info.receive_secs);
        stop.stop();
    }
}

#[test]
fn test_reset_clears_collection_and_sequencing() {
    let collection = Arc::new(MemoryCollection::capped(CappedSpec::default()));
    let counters = Arc::new(MemoryCounters::new());
    let producer = queue_on(&collection, &counters, "producer");

    producer.send("jobs", "run", json!(1)).unwrap();
    producer.reset().unwrap();

    assert_eq!(producer.stats().depth().unwrap().total, 0);
    let next = producer.send("jobs", "run", json!(2)).unwrap();
    assert_eq!(next.id.sequence, Sequence(1));
}
