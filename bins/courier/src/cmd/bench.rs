use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::task::JoinHandle;

use courier_api::MessageEnvelope;
use courier_engine::{ContextId, ContextProducer, ProducerError, ProducerFacade};

use crate::config::{BenchArgs, report};
use crate::error::CliError;

pub async fn run(args: BenchArgs) -> Result<(), CliError> {
    let (broker, facade) = args.broker.connect()?;
    let stop = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let mode = if args.use_async { "async" } else { "sync" };
    tracing::info!(
        workers = args.workers,
        messages = args.messages,
        mode,
        "starting workers, press Ctrl+C to stop early"
    );

    let mut handles = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let producer = facade.bind(ContextId::new());
        let stop = stop.clone();
        let args = args.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            run_worker(worker, &producer, &args, &stop)
        }));
    }

    let mut wait = std::pin::pin!(join_workers(handles, &stop));
    let result = tokio::select! {
        result = &mut wait => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping workers");
            stop.store(true, Ordering::SeqCst);
            wait.await
        }
    };

    // Runs even after a worker failed; the worker error is reported first.
    let teardown = facade.clone();
    let torn_down = tokio::task::spawn_blocking(move || teardown_contexts(&teardown)).await;

    let sent = result?;
    torn_down??;
    let elapsed = started.elapsed();
    tracing::info!(
        sent,
        elapsed_ms = elapsed.as_millis() as u64,
        per_sec = (sent as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        "bench finished"
    );
    report(&broker);
    Ok(())
}

/// Wait for every worker. After the first failure the others are told to
/// stop, but still joined so no context is left in use.
async fn join_workers(
    handles: Vec<JoinHandle<Result<usize, ProducerError>>>,
    stop: &AtomicBool,
) -> Result<usize, CliError> {
    let mut sent = 0;
    let mut first_error = None;
    for handle in handles {
        match handle.await.map_err(CliError::from).and_then(|r| r.map_err(CliError::from)) {
            Ok(n) => sent += n,
            Err(e) => {
                tracing::error!(error = %e, "bench worker failed");
                stop.store(true, Ordering::SeqCst);
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(sent), Err)
}

/// Flush every async producer, then release every context.
///
/// Keeps going after a failure and returns the first one.
fn teardown_contexts(facade: &ProducerFacade) -> Result<(), ProducerError> {
    let mut first_error = facade.shutdown_all().err();
    for ctx in facade.registry().contexts() {
        if let Err(e) = facade.release_context(ctx) {
            tracing::error!(context = %ctx, error = %e, "context release failed");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn run_worker(
    worker: usize,
    producer: &ContextProducer,
    args: &BenchArgs,
    stop: &AtomicBool,
) -> Result<usize, ProducerError> {
    if args.use_async {
        producer.create_async_producer()?;
    }

    let batch_size = args.batch_size.max(1);
    let mut sent = 0;
    while sent < args.messages && !stop.load(Ordering::Relaxed) {
        let n = batch_size.min(args.messages - sent);
        let batch = (sent..sent + n)
            .map(|i| {
                MessageEnvelope::new(args.topic.as_str(), format!("worker-{worker} message-{i}"))
                    .map(|m| m.with_key(format!("worker-{worker}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(ProducerError::InvalidMessage)?;

        if args.use_async {
            producer.async_publish_list(&batch)?;
        } else {
            producer.publish_list(&batch)?;
        }
        sent += n;
    }

    tracing::debug!(worker, context = %producer.context(), sent, "worker finished");
    Ok(sent)
}
