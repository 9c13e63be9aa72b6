use gatelink::handler::{self, Ctx};
use lambda_http::{run, service_fn, Error, Request};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();

    let ctx = Ctx::new().await?;

    run(service_fn(move |req: Request| {
        // stores and config sit behind Arcs
        let ctx = ctx.clone();
        async move { handler::router(req, &ctx).await }
    }))
    .await
}
