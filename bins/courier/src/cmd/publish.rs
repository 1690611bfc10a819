use courier_api::MessageEnvelope;
use courier_engine::{ContextId, ProducerError};

use crate::config::{PublishArgs, report};
use crate::error::CliError;

pub async fn run(args: PublishArgs) -> Result<(), CliError> {
    let (broker, facade) = args.broker.connect()?;

    let messages = args
        .payloads
        .iter()
        .map(|payload| {
            let message = MessageEnvelope::new(args.topic.as_str(), payload.clone())?;
            Ok(match &args.key {
                Some(key) => message.with_key(key.clone()),
                None => message,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(ProducerError::InvalidMessage)?;

    let count = messages.len();
    let ctx = ContextId::new();
    tokio::task::spawn_blocking(move || facade.publish_list(ctx, &messages)).await??;

    tracing::info!(topic = %args.topic, messages = count, "published");
    report(&broker);
    Ok(())
}
