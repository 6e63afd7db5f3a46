//! Listing jobs end to end: service, queue, consumer, processor and polling.

use async_trait::async_trait;
use cache_store::InMemoryCacheStore;
use domain_jobs::{
    AuthUser, ChunkPage, ChunkSource, CompanyList, CompanyListParams, CompanySummary, CreateJobRequest, JobError,
    JobResult, JobService, JobStatus, ListingConfig, ListingDomain, ListingProcessor, PageQuery,
};
use queue_worker::{
    ConsumerConfig, DEATH_QUEUE_HEADER, Delivery, Disposition, InMemoryBroker, QueueBroker, QueueClient, QueueDef,
    ResilientConsumer,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn company(i: u64) -> CompanySummary {
    CompanySummary {
        id: format!("c{i}"),
        name: format!("Company {i}"),
        role: "admin".into(),
        member_count: 3,
    }
}

/// Serves `total` companies; fails the first `failures` calls.
struct FlakySource {
    total: u64,
    failures: u32,
    calls: AtomicU32,
}

impl FlakySource {
    fn new(total: u64, failures: u32) -> Self {
        Self {
            total,
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ChunkSource<CompanyList> for FlakySource {
    async fn fetch_chunk(
        &self,
        _user_id: &str,
        _params: &CompanyListParams,
        offset: u64,
        limit: u64,
    ) -> JobResult<ChunkPage<CompanySummary>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(JobError::upstream_transient("502 Bad Gateway"));
        }
        let end = (offset + limit).min(self.total);
        Ok(ChunkPage {
            items: (offset..end).map(company).collect(),
            total: Some(self.total),
        })
    }
}

struct Harness {
    broker: InMemoryBroker,
    service: JobService<CompanyList>,
    consumer: ResilientConsumer<ListingProcessor<CompanyList>>,
}

fn harness(source: FlakySource, retry_max: u32) -> Harness {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryCacheStore::new());
    let client = QueueClient::new(Arc::new(broker.clone()));
    let config = ListingConfig {
        min_chunk_size: 1,
        ..ListingConfig::default()
    };

    let service = JobService::new(store.clone(), client.clone(), config.clone());
    let processor = ListingProcessor::new(store.clone(), &config, Arc::new(source));
    let consumer = ResilientConsumer::new(
        client,
        store,
        Arc::new(processor),
        ConsumerConfig::from_queue_def::<CompanyList>().with_retry_max(retry_max),
    );

    Harness {
        broker,
        service,
        consumer,
    }
}

async fn next(broker: &InMemoryBroker) -> Delivery {
    broker
        .fetch(CompanyList::QUEUE_NAME, 1)
        .await
        .unwrap()
        .pop()
        .expect("a queued message")
}

#[tokio::test]
async fn job_runs_to_completion_and_pages_back_in_order() {
    let h = harness(FlakySource::new(7, 0), 3);
    h.consumer.start().await.unwrap();

    let job = h
        .service
        .create_job(
            &AuthUser::new("user-1"),
            CreateJobRequest::new(CompanyListParams::default()).with_chunk_size(3),
        )
        .await
        .unwrap();
    assert_eq!(job.chunk_size, 3);

    let pending = h.service.get_job("user-1", &job.job_id, PageQuery::default()).await.unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert!(!pending.done);
    assert_eq!(pending.next_cursor, Some(0));

    let disposition = h.consumer.handle_delivery(next(&h.broker).await).await.unwrap();
    assert_eq!(disposition, Disposition::Acked);

    let mut items = Vec::new();
    let mut cursor = 0;
    loop {
        let page = h
            .service
            .get_job("user-1", &job.job_id, PageQuery::new(cursor, 2))
            .await
            .unwrap();
        items.extend(page.items);
        match page.next_cursor {
            Some(next) => cursor = next,
            None => {
                assert!(page.done);
                assert_eq!(page.status, JobStatus::Completed);
                assert_eq!(page.processed, 7);
                assert_eq!(page.total, Some(7));
                break;
            }
        }
    }
    assert_eq!(items, (0..7).map(company).collect::<Vec<_>>());
}

#[tokio::test]
async fn redelivered_job_message_is_skipped() {
    let h = harness(FlakySource::new(2, 0), 3);
    h.consumer.start().await.unwrap();

    h.service
        .create_job(&AuthUser::new("user-1"), CreateJobRequest::new(CompanyListParams::default()))
        .await
        .unwrap();

    // Producer retry publishes the same job twice
    let delivery = next(&h.broker).await;
    h.broker
        .publish(CompanyList::QUEUE_NAME, &delivery.body, &delivery.headers)
        .await
        .unwrap();

    assert_eq!(h.consumer.handle_delivery(delivery).await.unwrap(), Disposition::Acked);
    assert_eq!(
        h.consumer.handle_delivery(next(&h.broker).await).await.unwrap(),
        Disposition::Skipped
    );
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let h = harness(FlakySource::new(4, 2), 3);
    h.consumer.start().await.unwrap();

    let job = h
        .service
        .create_job(&AuthUser::new("user-1"), CreateJobRequest::new(CompanyListParams::default()))
        .await
        .unwrap();

    let first = h.consumer.handle_delivery(next(&h.broker).await).await.unwrap();
    let second = h.consumer.handle_delivery(next(&h.broker).await).await.unwrap();
    let third = h.consumer.handle_delivery(next(&h.broker).await).await.unwrap();

    assert_eq!(first, Disposition::Retried { retry_count: 1 });
    assert_eq!(second, Disposition::Retried { retry_count: 2 });
    assert_eq!(third, Disposition::Acked);

    let page = h.service.get_job("user-1", &job.job_id, PageQuery::default()).await.unwrap();
    assert!(page.done);
    assert_eq!(page.items.len(), 4);
}

#[tokio::test]
async fn exhausted_job_is_dead_lettered_and_marked_failed() {
    let h = harness(FlakySource::new(4, u32::MAX), 2);
    h.consumer.start().await.unwrap();

    let job = h
        .service
        .create_job(&AuthUser::new("user-1"), CreateJobRequest::new(CompanyListParams::default()))
        .await
        .unwrap();

    h.consumer.handle_delivery(next(&h.broker).await).await.unwrap();
    let last = h.consumer.handle_delivery(next(&h.broker).await).await.unwrap();
    assert_eq!(last, Disposition::DeadLettered);

    let dead = h.broker.ready_messages(CompanyList::DLQ_NAME);
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].headers.get(DEATH_QUEUE_HEADER).map(String::as_str),
        Some(CompanyList::QUEUE_NAME)
    );

    let page = h.service.get_job("user-1", &job.job_id, PageQuery::default()).await.unwrap();
    assert_eq!(page.status, JobStatus::Failed);
    assert!(page.error.unwrap().contains("502 Bad Gateway"));
    assert!(!page.done);
}

#[tokio::test]
async fn malformed_job_message_goes_to_dlq() {
    let h = harness(FlakySource::new(1, 0), 3);
    h.consumer.start().await.unwrap();

    h.broker
        .publish(CompanyList::QUEUE_NAME, b"not json", &Default::default())
        .await
        .unwrap();

    let disposition = h.consumer.handle_delivery(next(&h.broker).await).await.unwrap();
    assert_eq!(disposition, Disposition::DeadLettered);
    assert_eq!(h.broker.ready_messages(CompanyList::DLQ_NAME).len(), 1);
    assert_eq!(CompanyList::NAME, "company-list");
}
