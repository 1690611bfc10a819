use serde::Deserialize;

use courier_api::MessageEnvelope;
use courier_engine::{ContextId, ContextProducer, ProducerError};

use crate::config::{ReplayArgs, report};
use crate::error::CliError;

/// One line of the input file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InputMessage {
    topic: String,
    payload: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    partition_key: Option<String>,
}

pub async fn run(args: ReplayArgs) -> Result<(), CliError> {
    let content = std::fs::read_to_string(&args.input)?;
    let messages = parse_input(&content)?;
    tracing::info!(input = %args.input, messages = messages.len(), "loaded input");

    let (broker, facade) = args.broker.connect()?;
    let producer = facade.bind(ContextId::new());
    let batch_size = args.batch_size.max(1);
    let use_async = args.use_async;

    tokio::task::spawn_blocking(move || replay(producer, &messages, batch_size, use_async)).await??;

    report(&broker);
    Ok(())
}

fn replay(
    producer: ContextProducer,
    messages: &[MessageEnvelope],
    batch_size: usize,
    use_async: bool,
) -> Result<(), ProducerError> {
    if use_async {
        producer.create_async_producer()?;
        for batch in messages.chunks(batch_size) {
            producer.async_publish_list(batch)?;
        }
        producer.async_producer_shutdown()?;
    } else {
        for batch in messages.chunks(batch_size) {
            producer.publish_list(batch)?;
        }
    }
    producer.release()
}

/// Parse JSON lines; blank lines are skipped.
fn parse_input(content: &str) -> Result<Vec<MessageEnvelope>, CliError> {
    let mut messages = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let input_error = |detail: String| CliError::Input { line: idx + 1, detail };

        let input: InputMessage =
            serde_json::from_str(line).map_err(|e| input_error(e.to_string()))?;
        let mut message = MessageEnvelope::new(input.topic, input.payload)
            .map_err(|e| input_error(e.message))?;
        if let Some(key) = input.key {
            message = message.with_key(key);
        }
        if let Some(partition_key) = input.partition_key {
            message = message.with_partition_key(partition_key);
        }
        messages.push(message);
    }
    Ok(messages)
}
