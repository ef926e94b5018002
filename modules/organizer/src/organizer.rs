//! Keel organizer module for Caryatid
//! Keeps the heaviest known chain from blocks arriving in any order

pub mod block_record;
pub mod chain_organizer;
pub mod organizer_error;
pub mod organizer_hooks;
pub mod orphan_pool;
pub mod stores;

use std::sync::{Arc, PoisonError};

use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use keel_common::{
    messages::{BlockAcceptedMessage, BlockRejectedMessage, ChainReorganizedMessage, Message},
    Block, BlockHash,
};
use tracing::{debug, error, info, info_span, Instrument};

use crate::{
    block_record::{BlockPlacement, BlockRecord, BlockRecordPtr},
    chain_organizer::Organizer,
    organizer_hooks::{ReorganizeObserver, StructuralVerifier},
    orphan_pool::{OrphanPool, DEFAULT_ORPHAN_POOL_CAPACITY},
};

const CONFIG_SUBSCRIBE_BLOCKS_TOPIC: (&str, &str) =
    ("subscribe-blocks-topic", "keel.block.available");
const CONFIG_PUBLISH_ACCEPTED_TOPIC: (&str, &str) =
    ("publish-accepted-topic", "keel.block.accepted");
const CONFIG_PUBLISH_REORGANIZED_TOPIC: (&str, &str) =
    ("publish-reorganized-topic", "keel.chain.reorganized");
const CONFIG_PUBLISH_REJECTED_TOPIC: (&str, &str) =
    ("publish-rejected-topic", "keel.block.rejected");
const CONFIG_ORPHAN_POOL_CAPACITY: (&str, i64) =
    ("orphan-pool-capacity", DEFAULT_ORPHAN_POOL_CAPACITY as i64);
const CONFIG_CHECK_PROOF_OF_WORK: (&str, bool) = ("check-proof-of-work", true);

/// Events emitted by the organizer observer, queued for async publishing.
enum ObserverEvent {
    BlockAccepted {
        height: u64,
        hash: BlockHash,
    },
    ChainReorganized {
        fork_height: u64,
        arrivals: Vec<Block>,
        replaced: Vec<Block>,
    },
    BlockRejected {
        hash: BlockHash,
    },
}

/// Shared event queue between the observer and the main loop.
type EventQueue = Arc<std::sync::Mutex<Vec<ObserverEvent>>>;

/// Observer that queues organizer events for later async publishing.
struct QueueObserver {
    events: EventQueue,
}

impl QueueObserver {
    fn push(&self, event: ObserverEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

impl ReorganizeObserver for QueueObserver {
    fn reorganize_occurred(&self, arrivals: &[BlockRecordPtr], replaced: &[BlockRecordPtr]) {
        // Arrivals are already placed in the chain, the first one just above the fork
        let fork_height = match arrivals.first().map(|record| record.placement()) {
            Some(BlockPlacement::MainChain { height }) => height.saturating_sub(1),
            _ => 0,
        };
        self.push(ObserverEvent::ChainReorganized {
            fork_height,
            arrivals: to_blocks(arrivals),
            replaced: to_blocks(replaced),
        });
    }

    fn block_accepted(&self, height: u64, hash: BlockHash) {
        self.push(ObserverEvent::BlockAccepted { height, hash });
    }

    fn block_rejected(&self, hash: BlockHash) {
        self.push(ObserverEvent::BlockRejected { hash });
    }
}

fn to_blocks(records: &[BlockRecordPtr]) -> Vec<Block> {
    records.iter().map(|record| record.block().clone()).collect()
}

struct BlockOrganizerConfig {
    subscribe_blocks_topic: String,
    publish_accepted_topic: String,
    publish_reorganized_topic: String,
    publish_rejected_topic: String,
    orphan_pool_capacity: usize,
    check_proof_of_work: bool,
}

impl BlockOrganizerConfig {
    fn conf(config: &Config, keydef: (&str, &str)) -> String {
        let actual = config.get_string(keydef.0).unwrap_or(keydef.1.to_string());
        info!("Parameter value '{}' for {}", actual, keydef.0);
        actual
    }

    fn conf_int(config: &Config, keydef: (&str, i64)) -> i64 {
        let actual = config.get_int(keydef.0).unwrap_or(keydef.1);
        info!("Parameter value '{}' for {}", actual, keydef.0);
        actual
    }

    fn conf_bool(config: &Config, keydef: (&str, bool)) -> bool {
        let actual = config.get_bool(keydef.0).unwrap_or(keydef.1);
        info!("Parameter value '{}' for {}", actual, keydef.0);
        actual
    }

    fn new(config: &Config) -> Self {
        Self {
            subscribe_blocks_topic: Self::conf(config, CONFIG_SUBSCRIBE_BLOCKS_TOPIC),
            publish_accepted_topic: Self::conf(config, CONFIG_PUBLISH_ACCEPTED_TOPIC),
            publish_reorganized_topic: Self::conf(config, CONFIG_PUBLISH_REORGANIZED_TOPIC),
            publish_rejected_topic: Self::conf(config, CONFIG_PUBLISH_REJECTED_TOPIC),
            orphan_pool_capacity: Self::conf_int(config, CONFIG_ORPHAN_POOL_CAPACITY).max(0)
                as usize,
            check_proof_of_work: Self::conf_bool(config, CONFIG_CHECK_PROOF_OF_WORK),
        }
    }
}

/// Block organizer module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "organizer",
    description = "Orphan pool and chain reorganization"
)]
pub struct BlockOrganizer;

impl BlockOrganizer {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = BlockOrganizerConfig::new(&config);

        let genesis = stores::genesis_from_config(&config);
        info!(hash = %genesis.hash(), "Genesis block");
        let chain = stores::from_config(config.clone(), genesis)?;

        // Create the organizer with a queue-based observer
        let event_queue: EventQueue = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observer = Box::new(QueueObserver {
            events: event_queue.clone(),
        });
        let verifier = Box::new(StructuralVerifier {
            check_proof_of_work: cfg.check_proof_of_work,
        });
        let mut organizer =
            Organizer::new(OrphanPool::new(cfg.orphan_pool_capacity), chain, verifier, observer);

        info!("Creating blocks subscriber on '{}'", cfg.subscribe_blocks_topic);
        let mut subscription = context.subscribe(&cfg.subscribe_blocks_topic).await?;

        context.clone().run(async move {
            loop {
                let Ok((_, message)) = subscription.read().await else {
                    error!("Block message read failed");
                    return;
                };

                match message.as_ref() {
                    Message::BlockAvailable(available) => {
                        let record = BlockRecord::shared(available.block.clone());
                        let span = info_span!("organizer", hash = %record.hash());

                        let outcome = span.in_scope(|| {
                            organizer.enqueue(record);
                            organizer.start()
                        });

                        // Publish whatever was committed, even if the run failed
                        let events = collect_observer_events(&event_queue, &cfg);
                        publish_messages(&context, events).instrument(span).await;

                        if let Err(e) = outcome {
                            error!("Organizer stopped: {e}");
                            return;
                        }
                    }

                    _ => debug!("Ignoring non-BlockAvailable message on blocks topic"),
                }
            }
        });

        Ok(())
    }
}

/// Drain observer events into publishable messages.
fn collect_observer_events(
    event_queue: &EventQueue,
    cfg: &BlockOrganizerConfig,
) -> Vec<(String, Arc<Message>)> {
    let events: Vec<ObserverEvent> =
        event_queue.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();

    events
        .into_iter()
        .map(|event| match event {
            ObserverEvent::BlockAccepted { height, hash } => (
                cfg.publish_accepted_topic.clone(),
                Arc::new(Message::BlockAccepted(BlockAcceptedMessage { height, hash })),
            ),
            ObserverEvent::ChainReorganized {
                fork_height,
                arrivals,
                replaced,
            } => (
                cfg.publish_reorganized_topic.clone(),
                Arc::new(Message::ChainReorganized(ChainReorganizedMessage {
                    fork_height,
                    arrivals,
                    replaced,
                })),
            ),
            ObserverEvent::BlockRejected { hash } => (
                cfg.publish_rejected_topic.clone(),
                Arc::new(Message::BlockRejected(BlockRejectedMessage { hash })),
            ),
        })
        .collect()
}

/// Publish a batch of collected messages to the bus.
async fn publish_messages(context: &Arc<Context<Message>>, messages: Vec<(String, Arc<Message>)>) {
    for (topic, msg) in messages {
        context
            .message_bus
            .publish(&topic, msg)
            .await
            .unwrap_or_else(|e| error!("Failed to publish to {topic}: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> BlockOrganizerConfig {
        BlockOrganizerConfig::new(&Config::builder().build().unwrap())
    }

    fn placed(nonce: u32, height: u64) -> BlockRecordPtr {
        let record = BlockRecord::shared(Block::genesis(0, 0x207f_ffff, nonce));
        record.set_placement(BlockPlacement::MainChain { height });
        record
    }

    #[test]
    fn config_defaults() {
        let cfg = default_config();
        assert_eq!(cfg.subscribe_blocks_topic, "keel.block.available");
        assert_eq!(cfg.publish_accepted_topic, "keel.block.accepted");
        assert_eq!(cfg.publish_reorganized_topic, "keel.chain.reorganized");
        assert_eq!(cfg.publish_rejected_topic, "keel.block.rejected");
        assert_eq!(cfg.orphan_pool_capacity, 512);
        assert!(cfg.check_proof_of_work);
    }

    #[test]
    fn config_overrides() {
        let config = Config::builder()
            .set_default("orphan-pool-capacity", 8)
            .unwrap()
            .set_default("check-proof-of-work", false)
            .unwrap()
            .set_default("publish-rejected-topic", "test.rejected")
            .unwrap()
            .build()
            .unwrap();
        let cfg = BlockOrganizerConfig::new(&config);
        assert_eq!(cfg.orphan_pool_capacity, 8);
        assert!(!cfg.check_proof_of_work);
        assert_eq!(cfg.publish_rejected_topic, "test.rejected");
    }

    #[test]
    fn observer_events_become_messages_in_order() {
        let cfg = default_config();
        let queue: EventQueue = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observer = QueueObserver {
            events: queue.clone(),
        };

        let arrivals = vec![placed(1, 5), placed(2, 6)];
        let replaced = vec![placed(3, 5)];
        observer.block_accepted(4, arrivals[0].hash());
        observer.reorganize_occurred(&arrivals, &replaced);
        observer.block_rejected(replaced[0].hash());

        let messages = collect_observer_events(&queue, &cfg);
        assert_eq!(messages.len(), 3);
        assert!(queue.lock().unwrap().is_empty());

        assert_eq!(messages[0].0, "keel.block.accepted");
        assert!(matches!(
            messages[0].1.as_ref(),
            Message::BlockAccepted(BlockAcceptedMessage { height: 4, .. })
        ));

        assert_eq!(messages[1].0, "keel.chain.reorganized");
        let Message::ChainReorganized(reorg) = messages[1].1.as_ref() else {
            panic!("expected a reorganization message");
        };
        assert_eq!(reorg.fork_height, 4);
        assert_eq!(reorg.arrivals.len(), 2);
        assert_eq!(reorg.replaced[0].hash(), replaced[0].hash());

        assert_eq!(messages[2].0, "keel.block.rejected");
        assert!(matches!(messages[2].1.as_ref(), Message::BlockRejected(_)));
    }
}
