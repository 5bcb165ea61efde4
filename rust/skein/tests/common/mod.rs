#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use skein::prelude::*;
use skein::{ErrorKind, MultiplexedProcessor};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("skein_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Counts one-way `record` calls seen by a calculator.
#[derive(Clone, Default)]
pub struct Tally(Arc<AtomicUsize>);

impl Tally {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn calculator(tally: &Tally) -> Processor {
    let tally = tally.clone();
    Processor::builder()
        .unary("add", |(a, b): (i32, i32)| async move { Ok(a + b) })
        .unary("divide", |(a, b): (i32, i32)| async move {
            if b == 0 {
                return Err(HandlerError::declared("Cannot divide by 0"));
            }
            Ok(a / b)
        })
        .unary("echo_after", |(ms, value): (u64, u32)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        })
        .unary("explode", |(): ()| async {
            if true {
                panic!("calculator bug");
            }
            Ok(())
        })
        .oneway("record", move |(): ()| {
            let tally = tally.clone();
            async move {
                tally.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap()
}

pub fn calculator_with_workers(tally: &Tally) -> Processor {
    let tally = tally.clone();
    Processor::builder()
        .unary("add", |(a, b): (i32, i32)| async move { Ok(a + b) })
        .blocking("sum_to", |n: u64| {
            std::thread::sleep(Duration::from_millis(5));
            Ok((1..=n).sum::<u64>())
        })
        .oneway("record", move |(): ()| {
            let tally = tally.clone();
            async move {
                tally.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap()
}

pub fn multiplexed(tally: &Tally) -> MultiplexedProcessor {
    let mut processor = MultiplexedProcessor::new();
    processor
        .register("Calculator", calculator(tally))
        .unwrap();
    processor
}

pub async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Everything a calculator client should observe on any transport.
pub async fn exercise_calculator(client: &RpcClient, tally: &Tally) {
    assert_eq!(client.call::<_, i32>("add", &(2, 3)).await.unwrap(), 5);

    // replies come back in the reverse order of the calls
    let calls: Vec<_> = (0..10u32)
        .map(|i| {
            let client = client.clone();
            let delay = u64::from(10 - i) * 15;
            tokio::spawn(async move { client.call::<_, u32>("echo_after", &(delay, i)).await })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), i as u32);
    }

    let err = client.call::<_, i32>("divide", &(1, 0)).await.unwrap_err();
    let app = err.application().expect("declared error");
    assert_eq!(app.kind, ErrorKind::Declared);
    assert_eq!(app.message, "Cannot divide by 0");

    let err = client.call::<_, ()>("fooBar", &()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownMethod);
    assert_eq!(
        err.application().unwrap().message,
        "Invalid method name: 'fooBar'"
    );

    let err = client.call::<_, i32>("add", &()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);

    let err = client.call::<_, ()>("explode", &()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InternalError);
    assert!(!err.to_string().contains("calculator bug"));

    let before = tally.get();
    client.oneway("record", &()).await.unwrap();
    wait_until(|| tally.get() == before + 1).await;

    assert_eq!(client.call::<_, i32>("add", &(40, 2)).await.unwrap(), 42);
    assert_eq!(client.pending_len(), 0);
}

/// A call that outlives its timeout fails, and the late reply is dropped.
pub async fn exercise_timeout(client: &RpcClient) {
    let orphans = client.orphan_replies();
    let err = client
        .call_with_timeout::<_, u32>("echo_after", &(300u64, 1u32), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    wait_until(|| client.orphan_replies() == orphans + 1).await;
    assert_eq!(client.pending_len(), 0);
}
