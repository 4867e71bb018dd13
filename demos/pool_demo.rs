use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use weft::{
    Barrier, ClassRegistry, PoolConfig, Target, WorkerClass, WorkerContext, WorkerPool,
};

/// Worker class that transforms strings
#[derive(Default)]
struct TextShop;

#[async_trait]
impl WorkerClass for TextShop {
    fn methods(&self) -> &'static [&'static str] {
        &["uppercase", "reverse"]
    }

    async fn invoke(
        &mut self,
        ctx: &WorkerContext,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let text = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let transformed = match method {
            "uppercase" => text.to_uppercase(),
            _ => text.chars().rev().collect(),
        };
        Ok(json!({
            "transformed": transformed,
            "worker": ctx.worker_id(),
        }))
    }
}

/// Worker class that blocks on a shared barrier until the coordinator
/// releases the whole batch at once
#[derive(Default)]
struct GateKeeper;

#[async_trait]
impl WorkerClass for GateKeeper {
    fn methods(&self) -> &'static [&'static str] {
        &["hold"]
    }

    async fn invoke(
        &mut self,
        ctx: &WorkerContext,
        _method: &str,
        _args: Vec<Value>,
    ) -> Result<Value> {
        let gate = Barrier::create_or_get(ctx.sync(), 1)?;
        gate.wait(Some(Duration::from_secs(10)))?;
        info!("worker {} released", ctx.worker_id());
        Ok(json!(ctx.worker_id()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let classes = ClassRegistry::new();
    classes.register::<TextShop>("TextShop")?;
    classes.register::<GateKeeper>("GateKeeper")?;

    let pool = WorkerPool::initialize(PoolConfig::with_workers(3), classes)?;
    info!("pool online with {} workers", pool.workers_count());

    // Plain RPC through a memoized proxy
    let shop = pool.proxy("TextShop")?;
    let value = shop.invoke("uppercase", vec![json!("hello")]).recv().await?;
    info!("uppercase -> {}", value);
    let value = shop.invoke("reverse", vec![json!("hello")]).recv().await?;
    info!("reverse -> {}", value);

    // Hold every worker on the shared barrier, then release them together
    let held: Vec<_> = (1..=3)
        .map(|id| pool.submit(Target::Worker(id), "GateKeeper", "hold", vec![]))
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    Barrier::create_or_get(pool.sync_context(), 1)?.notify();
    for outcome in join_all(held.into_iter().map(|reply| reply.recv())).await {
        info!("released worker {}", outcome?);
    }

    pool.shutdown().await;
    info!("pool stopped");
    Ok(())
}
