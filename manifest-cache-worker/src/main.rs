//! Cache IIIF manifests referenced by inbound documents and republish the documents.
use std::sync::Arc;

use aws_config::BehaviorVersion;
use envconfig::Envconfig;
use manifest_cache_common::blob::{BlobStore, S3BlobStore};
use manifest_cache_common::fetch::HttpFetcher;
use manifest_cache_common::metrics::{serve, setup_metrics_router};
use manifest_cache_common::queue::MessageQueue;
use manifest_cache_common::sqs::SqsQueue;
use manifest_cache_worker::config::Config;
use manifest_cache_worker::error::WorkerError;
use manifest_cache_worker::poller::QueuePoller;
use manifest_cache_worker::reconciler::BatchReconciler;
use manifest_cache_worker::rewriter::DocumentRewriter;
use manifest_cache_worker::worker::{SharedReceiver, Worker};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()?;
    config.log();

    let bind = config.bind();
    let router = setup_metrics_router("manifest cache worker")?;
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {bind}: {e}");
        }
    });

    let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let s3_client = aws_sdk_s3::Client::new(&aws_config);
    let sqs_client = aws_sdk_sqs::Client::new(&aws_config);

    let message_store: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(
        s3_client.clone(),
        config.store_domain.as_str(),
    ));
    let queue: Arc<dyn MessageQueue> = Arc::new(SqsQueue::new(
        sqs_client,
        message_store,
        config.message_bucket_name.as_str(),
    ));

    let inbound = queue
        .queue_handle(config.in_queue_name.as_str())
        .await
        .map_err(WorkerError::Queue)?;
    let outbound = queue
        .queue_handle(config.out_queue_name.as_str())
        .await
        .map_err(WorkerError::Queue)?;

    let (sender, receiver) = mpsc::channel(config.work_queue_size.max(1));
    let receiver = SharedReceiver::new(receiver);

    let mut tasks = JoinSet::new();

    // every worker gets its own http client and store handle
    for id in 1..=config.workers.get() {
        let fetcher = HttpFetcher::new(config.service_timeout.0, config.fetch_retries)
            .map_err(WorkerError::Init)?;
        let store = S3BlobStore::new(s3_client.clone(), config.store_domain.as_str());
        let rewriter = DocumentRewriter::new(
            Arc::new(fetcher),
            Arc::new(store),
            config.cache_bucket_name.as_str(),
        );
        let reconciler = BatchReconciler::new(
            rewriter,
            queue.clone(),
            inbound.clone(),
            outbound.clone(),
            config.cache_policy,
        );
        let worker = Worker::new(id, reconciler, config.idle_flush.0);
        let receiver = receiver.clone();
        tasks.spawn(async move { worker.run(receiver).await });
    }
    drop(receiver);

    let poller = QueuePoller::new(queue.clone(), inbound, config.poll_timeout.0);
    tasks.spawn(async move { poller.run(sender).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, exiting");
        }
        Some(result) = tasks.join_next() => {
            // workers and poller run forever, so any of them returning is the end
            result??;
            warn!("a processing task stopped, exiting");
        }
    }

    Ok(())
}
