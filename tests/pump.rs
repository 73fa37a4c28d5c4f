//! Message pump behaviour over an in-memory channel: dispatch, defer and
//! requeue, poison messages, ordering, and the reactor variant.

mod common;

use common::test_helpers::{
    init_tracing, DeferringHandler, MyCommand, MyEvent, Recorder, RecordingHandler,
};
use courier::{
    CommandProcessor, InMemoryChannel, JsonMessageMapper, MapperRegistry, Message, MessageBody,
    MessageHeader, MessageId, MessageMapper, MessagePump, MessageType, PumpConfig, Reactor,
    RequestContext, RoutingKey, SubscriberRegistry,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const COMMANDS: &str = "my-commands";
const EVENTS: &str = "my-events";

fn pump_config() -> PumpConfig {
    PumpConfig {
        receive_timeout: Duration::from_millis(50),
        empty_channel_delay: Duration::from_millis(10),
        channel_failure_delay: Duration::from_millis(10),
        ..PumpConfig::default()
    }
}

fn command_mappers() -> MapperRegistry {
    let mut mappers = MapperRegistry::new();
    mappers.register::<MyCommand, _>(JsonMessageMapper::new(RoutingKey::new(COMMANDS)));
    mappers.register::<MyEvent, _>(JsonMessageMapper::new(RoutingKey::new(EVENTS)));
    mappers
}

fn command_message(id: &str) -> Message {
    JsonMessageMapper::<MyCommand>::new(RoutingKey::new(COMMANDS))
        .map_to_message(&MyCommand::new(id), &RequestContext::new())
        .unwrap()
}

fn event_message(id: &str) -> Message {
    JsonMessageMapper::<MyEvent>::new(RoutingKey::new(EVENTS))
        .map_to_message(&MyEvent::new(id), &RequestContext::new())
        .unwrap()
}

fn poison_message(id: &str) -> Message {
    Message::new(
        MessageHeader::new(MessageId::new(id), RoutingKey::new(COMMANDS), MessageType::Command),
        MessageBody::json(b"{ not json".to_vec()),
    )
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn commands_flow_from_channel_to_handler_in_order() {
    let recorder = Recorder::new();
    let mut subscribers = SubscriberRegistry::new();
    subscribers
        .register_send(RecordingHandler::<MyCommand>::registration("CommandHandler", &recorder))
        .unwrap();
    let processor = CommandProcessor::builder()
        .subscribers(subscribers)
        .mappers(command_mappers())
        .build()
        .unwrap();

    let channel = InMemoryChannel::new(RoutingKey::new(COMMANDS), 16);
    let sender = channel.sender();
    let pump = MessagePump::<MyCommand>::new(processor, pump_config()).unwrap();
    let running = tokio::spawn(pump.run(Box::new(channel)));

    sender.send(command_message("first")).await.unwrap();
    sender.send(command_message("second")).await.unwrap();

    let r = recorder.clone();
    wait_until(|| r.count() >= 2, "both commands to be handled").await;
    assert_eq!(
        recorder.received(),
        vec![
            ("CommandHandler".to_string(), "first".to_string()),
            ("CommandHandler".to_string(), "second".to_string()),
        ]
    );

    sender.quit().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn events_fan_out_through_the_pump() {
    let recorder = Recorder::new();
    let mut subscribers = SubscriberRegistry::new();
    subscribers
        .register_publish(RecordingHandler::<MyEvent>::registration("H1", &recorder))
        .unwrap();
    subscribers
        .register_publish(RecordingHandler::<MyEvent>::registration("H2", &recorder))
        .unwrap();
    let processor = CommandProcessor::builder()
        .subscribers(subscribers)
        .mappers(command_mappers())
        .build()
        .unwrap();

    let channel = InMemoryChannel::new(RoutingKey::new(EVENTS), 16);
    let sender = channel.sender();
    let pump = MessagePump::<MyEvent>::new(processor, pump_config()).unwrap();
    let running = tokio::spawn(pump.run(Box::new(channel)));

    sender.send(event_message("broadcast")).await.unwrap();

    let r = recorder.clone();
    wait_until(|| r.count() >= 2, "both subscribers to see the event").await;
    assert!(recorder.contains("H1", "broadcast"));
    assert!(recorder.contains("H2", "broadcast"));

    sender.quit().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn deferred_messages_requeue_until_the_limit_then_reject() {
    init_tracing();
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let mut subscribers = SubscriberRegistry::new();
    subscribers
        .register_send(DeferringHandler::registration::<MyCommand>("Deferring", &deliveries))
        .unwrap();
    let processor = CommandProcessor::builder()
        .subscribers(subscribers)
        .mappers(command_mappers())
        .build()
        .unwrap();

    let channel = InMemoryChannel::new(RoutingKey::new(COMMANDS), 16);
    let sender = channel.sender();
    let stats = channel.stats();
    let config = PumpConfig { requeue_limit: 3, ..pump_config() };
    let pump = MessagePump::<MyCommand>::new(processor, config).unwrap();
    let running = tokio::spawn(pump.run(Box::new(channel)));

    sender.send(command_message("stubborn")).await.unwrap();

    let watched = stats.clone();
    wait_until(move || watched.rejected() == 1, "the third delivery to be rejected").await;

    // Delivered three times, with the handled count climbing each requeue.
    assert_eq!(*deliveries.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(stats.requeued(), 2);

    sender.quit().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn unmappable_messages_are_acknowledged_until_the_limit_stops_the_pump() {
    let processor =
        CommandProcessor::builder().mappers(command_mappers()).build().unwrap();

    let channel = InMemoryChannel::new(RoutingKey::new(COMMANDS), 16);
    let sender = channel.sender();
    let stats = channel.stats();
    let config = PumpConfig { unacceptable_limit: 2, ..pump_config() };
    let pump = MessagePump::<MyCommand>::new(processor, config).unwrap();
    let running = tokio::spawn(pump.run(Box::new(channel)));

    sender.send(poison_message("bad-1")).await.unwrap();
    sender.send(poison_message("bad-2")).await.unwrap();

    // The pump acks both poison messages, hits the limit, and stops cleanly.
    running.await.unwrap().unwrap();
    assert_eq!(stats.acknowledged(), 2);
    assert_eq!(stats.rejected(), 0);
}

#[tokio::test]
async fn unacceptable_typed_messages_count_against_the_limit() {
    let processor =
        CommandProcessor::builder().mappers(command_mappers()).build().unwrap();

    let channel = InMemoryChannel::new(RoutingKey::new(COMMANDS), 16);
    let sender = channel.sender();
    let stats = channel.stats();
    let config = PumpConfig { unacceptable_limit: 1, ..pump_config() };
    let pump = MessagePump::<MyCommand>::new(processor, config).unwrap();
    let running = tokio::spawn(pump.run(Box::new(channel)));

    let mut unacceptable = command_message("rejected-by-gateway");
    unacceptable.header.message_type = MessageType::Unacceptable;
    sender.send(unacceptable).await.unwrap();

    running.await.unwrap().unwrap();
    assert_eq!(stats.acknowledged(), 1);
}

#[tokio::test]
async fn multiplicity_mismatch_stops_the_pump_with_a_configuration_error() {
    init_tracing();
    // MyCommand registered for fan-out, but the wire says command: the pump
    // must refuse rather than guess.
    let recorder = Recorder::new();
    let mut subscribers = SubscriberRegistry::new();
    subscribers
        .register_publish(RecordingHandler::<MyCommand>::registration("WrongShape", &recorder))
        .unwrap();
    let processor = CommandProcessor::builder()
        .subscribers(subscribers)
        .mappers(command_mappers())
        .build()
        .unwrap();

    let channel = InMemoryChannel::new(RoutingKey::new(COMMANDS), 16);
    let sender = channel.sender();
    let stats = channel.stats();
    let pump = MessagePump::<MyCommand>::new(processor, pump_config()).unwrap();
    let running = tokio::spawn(pump.run(Box::new(channel)));

    sender.send(command_message("mismatched")).await.unwrap();

    let result = running.await.unwrap();
    assert!(result.unwrap_err().is_configuration());
    assert_eq!(stats.rejected(), 1);
    assert_eq!(recorder.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reactor_pump_runs_on_its_own_thread() {
    let recorder = Recorder::new();
    let mut subscribers = SubscriberRegistry::new();
    subscribers
        .register_send(RecordingHandler::<MyCommand>::registration("Threaded", &recorder))
        .unwrap();
    let processor = CommandProcessor::builder()
        .subscribers(subscribers)
        .mappers(command_mappers())
        .build()
        .unwrap();

    let channel = InMemoryChannel::new(RoutingKey::new(COMMANDS), 16);
    let sender = channel.sender();
    let pump = MessagePump::<MyCommand>::new(processor, pump_config()).unwrap();
    let handle = Reactor::spawn(pump, Box::new(channel)).unwrap();

    sender.send(command_message("threaded")).await.unwrap();
    assert!(recorder.wait_for_count(1, Duration::from_secs(5)).await);

    sender.quit().await.unwrap();
    handle.join().unwrap();
}
