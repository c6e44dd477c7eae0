#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Action consumer behaviour against scripted brokers: ordering, connection
//! retries and reconnects while running.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use svckit::{
    ActionConsumer, ActionMessage, Broker, BrokerError, ChannelBroker, ConsumerConfig,
    ConsumerError, ConsumerState, Subscription, handler_fn,
};

#[derive(Debug, Clone, Copy)]
enum Step {
    Msg(&'static str),
    Fail,
    Close,
}

#[derive(Default)]
struct ScriptedBroker {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    subscribes: AtomicU32,
    fail_first: u32,
    offline: AtomicBool,
}

impl ScriptedBroker {
    fn with_scripts(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    fn subscribes(&self) -> u32 {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, BrokerError> {
        let n = self.subscribes.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first || self.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!("connection refused (#{n})")));
        }
        let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedSubscription {
            steps: steps.into(),
        }))
    }
}

struct ScriptedSubscription {
    steps: VecDeque<Step>,
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    async fn recv(&mut self) -> Result<Option<ActionMessage>, BrokerError> {
        match self.steps.pop_front() {
            Some(Step::Msg(action)) => Ok(Some(ActionMessage::new(action, action))),
            Some(Step::Fail) => Err(BrokerError::Receive("connection reset".to_owned())),
            Some(Step::Close) => Ok(None),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.steps.clear();
    }
}

fn config() -> ConsumerConfig {
    ConsumerConfig {
        connect_attempts: 3,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(5),
    }
}

fn recorder(seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn svckit::ActionHandler> {
    Arc::new(handler_fn(move |msg: ActionMessage| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(msg.action_type);
            Ok(())
        }
    }))
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn messages_are_dispatched_in_subscription_order() {
    let broker = ChannelBroker::new(128);
    let publisher = broker.publisher();
    let expected: Vec<String> = (0..100).map(|i| format!("m{i}")).collect();
    for action in &expected {
        publisher
            .publish(ActionMessage::new(action.clone(), ""))
            .await
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = Arc::new(ActionConsumer::new(
        Arc::new(broker),
        recorder(seen.clone()),
        config(),
    ));
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    wait_until(|| consumer.dispatched() == 100).await;
    consumer.stop().await;
    task.await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), expected);
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn connect_gives_up_after_configured_attempts() {
    let broker = Arc::new(ScriptedBroker::default());
    broker.offline.store(true, Ordering::SeqCst);
    let consumer = ActionConsumer::new(
        broker.clone(),
        recorder(Arc::default()),
        config(),
    );

    let err = consumer.run().await.unwrap_err();
    match err {
        ConsumerError::BrokerConnection { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(source.to_string().contains("#3"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.subscribes(), 3);
    assert_eq!(consumer.state(), ConsumerState::Idle);
}

#[tokio::test]
async fn connect_retries_transient_failures() {
    let broker = Arc::new(ScriptedBroker {
        fail_first: 2,
        ..ScriptedBroker::default()
    });
    let consumer = ActionConsumer::new(
        broker.clone(),
        recorder(Arc::default()),
        config(),
    );

    assert!(consumer.connect().await.is_ok());
    assert_eq!(broker.subscribes(), 3);
}

#[tokio::test]
async fn receive_failure_reconnects_and_is_not_a_handler_failure() {
    let broker = Arc::new(ScriptedBroker::with_scripts(vec![
        vec![Step::Msg("m1"), Step::Fail],
        vec![Step::Msg("m2"), Step::Close],
        vec![Step::Msg("m3")],
    ]));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = Arc::new(ActionConsumer::new(
        broker.clone(),
        recorder(seen.clone()),
        config(),
    ));
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    wait_until(|| consumer.dispatched() == 3).await;
    assert_eq!(consumer.state(), ConsumerState::Running);
    assert_eq!(consumer.failed(), 0);
    assert_eq!(broker.subscribes(), 3);

    consumer.stop().await;
    task.await.unwrap().unwrap();
    assert_eq!(*seen.lock().unwrap(), ["m1", "m2", "m3"]);
}

#[tokio::test]
async fn stop_interrupts_reconnect_backoff() {
    let broker = Arc::new(ScriptedBroker::with_scripts(vec![vec![Step::Fail]]));
    let consumer = Arc::new(ActionConsumer::new(
        broker.clone(),
        recorder(Arc::default()),
        config(),
    ));

    let subscription = consumer.connect().await.unwrap();
    broker.offline.store(true, Ordering::SeqCst);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.consume(subscription).await }
    });

    wait_until(|| broker.subscribes() >= 3).await;
    tokio::time::timeout(Duration::from_secs(1), consumer.stop())
        .await
        .expect("stop must not wait for the broker to come back");
    task.await.unwrap().unwrap();
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}
