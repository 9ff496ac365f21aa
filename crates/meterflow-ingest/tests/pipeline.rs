//! Normalize, collect and publish through the in-memory broker

use std::sync::Arc;
use std::time::Duration;

use meterflow_common::MeterflowError;
use meterflow_ingest::schema::{decode_framed, CloudEventsPayload};
use meterflow_ingest::{
    BrokerCollector, BrokerRecord, Collector, EventBroker, EventNormalizer, EventSerializer,
    InMemoryBroker, InMemorySchemaRegistry, Publisher, TopicResolver,
};

struct Pipeline {
    normalizer: EventNormalizer,
    broker: Arc<InMemoryBroker>,
    collector: BrokerCollector,
    publisher: Arc<Publisher>,
}

fn pipeline() -> Pipeline {
    let broker = Arc::new(InMemoryBroker::default());
    let serializer = Arc::new(EventSerializer::new(Arc::new(InMemorySchemaRegistry::new())));
    let publisher = Arc::new(
        Publisher::new(
            broker.clone() as Arc<dyn EventBroker>,
            serializer,
            Duration::from_secs(5),
        )
        .unwrap(),
    );

    Pipeline {
        normalizer: EventNormalizer::new(),
        broker,
        collector: BrokerCollector::new(TopicResolver::default(), publisher.clone()),
        publisher,
    }
}

fn records(broker: &InMemoryBroker, topic: &str) -> Vec<BrokerRecord> {
    let partitions = broker.partitions_for(topic).unwrap_or(0);
    (0..partitions)
        .flat_map(|p| broker.fetch(topic, p, 0, 1_000).unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn test_event_is_published_with_pinned_schema() {
    let p = pipeline();

    let body = br#"{
        "id": "e1",
        "type": "usage",
        "source": "svc",
        "subject": "cust-1",
        "data": { "tokens" :  42 }
    }"#;
    let event = p.normalizer.normalize(body).unwrap();
    let namespace = p.normalizer.resolve_namespace(None).unwrap();
    assert_eq!(namespace, "default");

    p.collector.receive(event, &namespace).await.unwrap();
    p.publisher.close().await;

    let binding = p.publisher.serializer().binding("om_default_events").unwrap();
    let published = records(&p.broker, "om_default_events");
    assert_eq!(published.len(), 1);

    let (schema_id, payload) = decode_framed(&published[0].value).unwrap();
    assert_eq!(schema_id, binding.value_schema_id);

    let payload: CloudEventsPayload = serde_json::from_slice(payload).unwrap();
    assert_eq!(payload.subject, "cust-1");
    assert_eq!(payload.data, r#"{"tokens":42}"#);

    let metrics = p.publisher.metrics().snapshot();
    assert_eq!(metrics.enqueued, 1);
    assert_eq!(metrics.delivered, 1);
}

#[tokio::test]
async fn test_same_subject_lands_in_one_partition() {
    let p = pipeline();

    for i in 0..10 {
        let body = format!(
            r#"{{"id":"e{}","type":"usage","source":"svc","subject":"cust-7","data":{{}}}}"#,
            i
        );
        let event = p.normalizer.normalize(body.as_bytes()).unwrap();
        p.collector.receive(event, "default").await.unwrap();
    }
    p.publisher.close().await;

    let published = records(&p.broker, "om_default_events");
    assert_eq!(published.len(), 10);
    assert!(published.iter().all(|r| r.partition == published[0].partition));
}

#[tokio::test]
async fn test_rebinding_keeps_schema_ids() {
    let p = pipeline();

    let first = p.collector.bind_namespace("default").await.unwrap();
    let second = p.collector.bind_namespace("default").await.unwrap();
    assert_eq!(first, second);

    // Other namespaces share the schema subjects
    let other = p.collector.bind_namespace("team_a").await.unwrap();
    assert_eq!(other.topic, "om_team_a_events");
    assert_eq!(other.value_schema_id, first.value_schema_id);
}

#[tokio::test]
async fn test_non_json_data_is_not_published() {
    let p = pipeline();

    let event = p
        .normalizer
        .normalize(
            br#"{"id":"e1","type":"usage","source":"svc","subject":"a","datacontenttype":"text/plain","data":"plain"}"#,
        )
        .unwrap();
    let err = p.collector.receive(event, "default").await.unwrap_err();
    assert!(matches!(err, MeterflowError::InvalidData(_)));

    p.publisher.close().await;
    assert!(records(&p.broker, "om_default_events").is_empty());
    assert_eq!(p.publisher.metrics().snapshot().enqueued, 0);
}
