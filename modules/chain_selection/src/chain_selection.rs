//! Multiverse chain selection module for Caryatid
//! Decides which primary block is canonical as blocks arrive from peers, the
//! local miner and rovers

pub mod multiverse;
pub mod multiverse_error;
pub mod reorg;
pub mod sequence_validator;
pub mod structural;

use anyhow::{bail, Result};
use bc_common::{
    memory_store::MemoryStore,
    messages::{
        BlockAcceptedMessage, Message, RangeRequestMessage, ScheduleMessage,
        SimplexClearedMessage,
    },
    Block, ChainState, ConsensusParams, Hash256, Storage, TxHandler,
};
use bc_module_coinbase_gate::{CoinbaseGate, CoinbaseObserver};
use caryatid_sdk::{module, Context};
use config::Config;
use multiverse::{ExtendResult, Multiverse};
use std::sync::{Arc, PoisonError};
use tracing::{debug, error, info, info_span, Instrument};

const DEFAULT_SUBSCRIBE_BLOCKS_TOPIC: &str = "bc.block.available";
const DEFAULT_SUBSCRIBE_ROVER_TOPIC: &str = "bc.rover.header";
const DEFAULT_SUBSCRIBE_REORG_TOPIC: &str = "bc.block.reorg";
const DEFAULT_PUBLISH_ACCEPTED_TOPIC: &str = "bc.block.accepted";
const DEFAULT_PUBLISH_RANGE_TOPIC: &str = "bc.block.range";
const DEFAULT_PUBLISH_SCHEDULE_TOPIC: &str = "bc.block.schedule";
const DEFAULT_PUBLISH_SIMPLEX_TOPIC: &str = "utxo.simplex.cleared";
const DEFAULT_STORE: &str = "memory";

/// Events emitted by the coinbase gate observer, queued for async publishing.
#[derive(Debug, PartialEq)]
enum ObserverEvent {
    SimplexCleared { height: u64, hash: Hash256 },
}

/// Shared event queue between the observer and the main loop.
type EventQueue = Arc<std::sync::Mutex<Vec<ObserverEvent>>>;

/// Observer that queues gate events for later async publishing.
struct QueueObserver {
    events: EventQueue,
}

impl CoinbaseObserver for QueueObserver {
    fn simplex_cleared(&self, height: u64, hash: Hash256) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ObserverEvent::SimplexCleared { height, hash });
    }
}

/// Topics this module publishes on
#[derive(Clone)]
struct PublishTopics {
    accepted: String,
    range: String,
    schedule: String,
    simplex: String,
}

/// Chain selection module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "chain-selection",
    description = "Multiverse chain selection"
)]
pub struct ChainSelection;

impl ChainSelection {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        // Get configuration
        let subscribe_blocks_topic = config
            .get_string("subscribe-blocks-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_BLOCKS_TOPIC.to_string());
        info!("Creating blocks subscriber on '{subscribe_blocks_topic}'");

        let subscribe_rover_topic = config
            .get_string("subscribe-rover-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_ROVER_TOPIC.to_string());
        info!("Creating rover header subscriber on '{subscribe_rover_topic}'");

        let subscribe_reorg_topic = config
            .get_string("subscribe-reorg-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_REORG_TOPIC.to_string());
        info!("Creating reorg branch subscriber on '{subscribe_reorg_topic}'");

        let topics = PublishTopics {
            accepted: config
                .get_string("publish-accepted-topic")
                .unwrap_or(DEFAULT_PUBLISH_ACCEPTED_TOPIC.to_string()),
            range: config
                .get_string("publish-range-topic")
                .unwrap_or(DEFAULT_PUBLISH_RANGE_TOPIC.to_string()),
            schedule: config
                .get_string("publish-schedule-topic")
                .unwrap_or(DEFAULT_PUBLISH_SCHEDULE_TOPIC.to_string()),
            simplex: config
                .get_string("publish-simplex-topic")
                .unwrap_or(DEFAULT_PUBLISH_SIMPLEX_TOPIC.to_string()),
        };
        info!("Publishing accepted blocks on '{}'", topics.accepted);
        info!("Publishing range requests on '{}'", topics.range);
        info!("Publishing schedules on '{}'", topics.schedule);
        info!("Publishing simplex releases on '{}'", topics.simplex);

        let params = ConsensusParams::from_config(&config);
        info!(
            naive = params.naive_mode,
            candidate_length = params.candidate_length,
            "Consensus parameters loaded"
        );

        let store = config.get_string("store").unwrap_or(DEFAULT_STORE.to_string());
        let memory = match store.as_str() {
            "memory" => Arc::new(MemoryStore::new()),
            other => bail!("Unknown store '{other}'"),
        };
        let storage: Arc<dyn Storage> = memory.clone();
        let chain_state: Arc<dyn ChainState> = memory.clone();
        let tx_handler: Arc<dyn TxHandler> = memory;

        // Subscribe for incoming blocks, rover headers and fetched branches
        let mut block_subscription = context.subscribe(&subscribe_blocks_topic).await?;
        let mut rover_subscription = context.subscribe(&subscribe_rover_topic).await?;
        let mut reorg_subscription = context.subscribe(&subscribe_reorg_topic).await?;

        // Create the gate with a queue-based observer
        let event_queue: EventQueue = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observer = Box::new(QueueObserver {
            events: event_queue.clone(),
        });
        let gate = CoinbaseGate::new(
            storage.clone(),
            chain_state.clone(),
            tx_handler,
            params.clone(),
        )
        .with_observer(observer);
        let mut multiverse = Multiverse::new(storage, chain_state, gate, params);

        context.clone().run(async move {
            loop {
                tokio::select! {
                    result = block_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Block message read failed");
                            return;
                        };

                        match message.as_ref() {
                            Message::BlockAvailable(available) => {
                                let span = info_span!("multiverse", height = available.block.height);
                                async {
                                    match multiverse
                                        .extend(Some(&available.block), available.source.clone(), true)
                                        .await
                                    {
                                        Ok(result) => {
                                            let messages = extend_messages(&topics, &available.block, &result);
                                            publish_messages(&context, messages).await;
                                        }
                                        Err(e) => error!("Chain selection failed: {e}"),
                                    }
                                    publish_messages(&context, collect_observer_events(&event_queue, &topics)).await;
                                }
                                .instrument(span)
                                .await;
                            }

                            _ => debug!("Ignoring non-BlockAvailable message on blocks topic"),
                        }
                    }

                    result = rover_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Rover message read failed");
                            return;
                        };

                        match message.as_ref() {
                            Message::RoverHeader(rover) => {
                                let span = info_span!(
                                    "multiverse-rover",
                                    chain = %rover.header.chain,
                                    height = rover.header.height
                                );
                                async {
                                    match multiverse.compress(&rover.header, &rover.pending).await {
                                        Ok(true) => debug!("Rover header reconciled"),
                                        Ok(false) => debug!("Rover header not reconciled yet"),
                                        Err(e) => error!("Rover header compression failed: {e}"),
                                    }
                                    publish_messages(&context, collect_observer_events(&event_queue, &topics)).await;
                                }
                                .instrument(span)
                                .await;
                            }

                            _ => debug!("Ignoring non-RoverHeader message on rover topic"),
                        }
                    }

                    result = reorg_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Reorg message read failed");
                            return;
                        };

                        match message.as_ref() {
                            Message::ReorgBranch(branch) => {
                                let span = info_span!("multiverse-reorg", blocks = branch.blocks.len());
                                async {
                                    match multiverse.accept_reorg(&branch.blocks).await {
                                        Ok(true) => {
                                            if let Some(tip) = multiverse.candidate().first() {
                                                let msg = Message::BlockAccepted(BlockAcceptedMessage {
                                                    block: tip.clone(),
                                                    spliced: true,
                                                });
                                                publish_messages(&context, vec![(topics.accepted.clone(), Arc::new(msg))]).await;
                                            }
                                        }
                                        Ok(false) => info!("Reorg branch not accepted"),
                                        Err(e) => error!("Reorg failed: {e}"),
                                    }
                                    publish_messages(&context, collect_observer_events(&event_queue, &topics)).await;
                                }
                                .instrument(span)
                                .await;
                            }

                            _ => debug!("Ignoring non-ReorgBranch message on reorg topic"),
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

/// Messages announcing what an `extend` decided
fn extend_messages(
    topics: &PublishTopics,
    block: &Block,
    result: &ExtendResult,
) -> Vec<(String, Arc<Message>)> {
    let mut messages = Vec::new();
    if result.stored {
        let msg = Message::BlockAccepted(BlockAcceptedMessage {
            block: block.clone(),
            spliced: result.spliced,
        });
        messages.push((topics.accepted.clone(), Arc::new(msg)));
    }

    match &result.range_request {
        Some(window) => {
            let msg = Message::RangeRequest(RangeRequestMessage {
                window: window.clone(),
                schedules: result.schedules.clone(),
            });
            messages.push((topics.range.clone(), Arc::new(msg)));
        }
        None if !result.schedules.is_empty() => {
            let msg = Message::Schedule(ScheduleMessage {
                schedules: result.schedules.clone(),
            });
            messages.push((topics.schedule.clone(), Arc::new(msg)));
        }
        None => {}
    }
    messages
}

/// Drain observer events into publishable messages.
fn collect_observer_events(
    event_queue: &EventQueue,
    topics: &PublishTopics,
) -> Vec<(String, Arc<Message>)> {
    let events: Vec<ObserverEvent> =
        event_queue.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
    events
        .into_iter()
        .map(|event| match event {
            ObserverEvent::SimplexCleared { height, hash } => {
                let msg = Message::SimplexCleared(SimplexClearedMessage { height, hash });
                (topics.simplex.clone(), Arc::new(msg))
            }
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
