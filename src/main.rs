use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use coalescer::contracts::{FailurePolicy, FieldUpdate, MergePolicy, TargetRef};
use coalescer::dispatcher::{DeadLetter, Dispatcher, DispatcherConfig, LastWriteWins, SumIncrements};
use coalescer::storage::{MemoryStore, MemoryStoreConfig};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn merge_policy_from_env() -> Arc<dyn MergePolicy> {
    match std::env::var("COALESCER_MERGE_POLICY").as_deref() {
        Ok("sum_increments") => Arc::new(SumIncrements),
        _ => Arc::new(LastWriteWins),
    }
}

/// Drives a burst of participant status changes through the dispatcher and
/// reports what reached the store.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("coalescer=info".parse()?))
        .init();

    let callers: usize = env_or("COALESCER_DEMO_CALLERS", 8);
    let updates_per_caller: usize = env_or("COALESCER_DEMO_UPDATES", 200);
    let events: usize = env_or::<usize>("COALESCER_DEMO_EVENTS", 3).max(1);

    let store = Arc::new(MemoryStore::with_config(MemoryStoreConfig::from_env()));
    let dead_letters = Arc::new(DeadLetter::default());
    let dispatcher = Dispatcher::with_policies(
        Arc::clone(&store),
        DispatcherConfig::from_env(),
        merge_policy_from_env(),
        Arc::clone(&dead_letters) as Arc<dyn FailurePolicy>,
    )?;

    tracing::info!(
        callers = callers,
        updates_per_caller = updates_per_caller,
        events = events,
        latency_ms = store.config().latency.as_millis() as u64,
        "Starting dispatch burst"
    );

    let handles: Vec<_> = (0..callers)
        .map(|caller| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let user = format!("user-{}", caller);
                for i in 0..updates_per_caller {
                    let event = TargetRef::doc("events", &format!("e{}", (caller + i) % events));
                    let participant = event.child("participants", &user);
                    let going = i % 2 == 0;

                    dispatcher.dispatch(
                        &participant,
                        "Status",
                        serde_json::Value::from(if going { "going" } else { "applied" }),
                    );
                    dispatcher.dispatch_many(
                        &event,
                        [
                            FieldUpdate::increment("Going", if going { 1 } else { -1 }),
                            FieldUpdate::increment("Applied", if going { -1 } else { 1 }),
                            FieldUpdate::set("LastChangedBy", user.as_str()),
                        ],
                    );
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await?;
    }
    dispatcher.wait_idle().await;

    for e in 0..events {
        let event = TargetRef::doc("events", &format!("e{}", e));
        tracing::info!(
            target_key = %event,
            document = ?store.document(&event),
            store_calls = store.calls_for(&event).len(),
            "Final event document"
        );
    }

    let failed = dead_letters.drain();
    if !failed.is_empty() {
        tracing::warn!(failed = failed.len(), "Some batches were not applied");
    }

    println!("{}", serde_json::to_string_pretty(&dispatcher.stats())?);
    print!("{}", dispatcher.metrics().format_prometheus());

    Ok(())
}
