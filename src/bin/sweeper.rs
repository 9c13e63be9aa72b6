use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use gatelink::access_log::AccessLog;
use gatelink::config::GateConfig;
use gatelink::store::DynamoStore;
use gatelink::sweep::sweep;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();

    let cfg = GateConfig::from_env()?;
    let store = Arc::new(DynamoStore::connect(&cfg).await);
    let log = AccessLog::new(store.clone());

    lambda_runtime::run(service_fn(move |_event: LambdaEvent<Json>| {
        let store = store.clone();
        let log = log.clone();
        let cfg = cfg.clone();
        async move {
            let report = sweep(&*store, &log, &cfg, chrono::Utc::now()).await?;
            Ok::<Json, Error>(serde_json::to_value(report)?)
        }
    }))
    .await
}
