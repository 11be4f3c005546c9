//! End-to-end runs of the coordinator against in-process worker pools

mod common;

use brokermr::broker::Broker;
use brokermr::computation::{IntegrateExp, SumOfSquares};
use brokermr::config::CoordinatorConfig;
use brokermr::coordinator::PartitionStrategy;
use brokermr::error::ErrorCode;
use brokermr::source::{ArithmeticSource, ArithmeticSpec, SourceFactory, SourceSpec};
use common::*;
use serde_json::Value;
use std::time::Duration;

fn integers(length: u64) -> SourceFactory {
    SourceFactory::derived(SourceSpec::Arithmetic(ArithmeticSpec::integers(length)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sum_of_squares_matches_direct_evaluation() {
    let source = ArithmeticSource::new(ArithmeticSpec::integers(1000)).unwrap();
    let expected = run_directly(&SumOfSquares::default(), &source);
    assert_eq!(expected, (0..1000i64).map(|n| n * n).sum::<i64>());

    for workers in [1u32, 3, 7] {
        let broker = memory_broker();
        let pool = start_pool(&broker, SumOfSquares::default(), workers as usize).await;

        let total = within_timeout(
            coordinator(&broker, workers).run(&SumOfSquares::default(), &integers(1000)),
        )
        .await
        .unwrap();

        assert_eq!(total, expected, "W = {}", workers);
        pool.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inline_dataset_with_exact_ceil() {
    let broker = memory_broker();
    let pool = start_pool(&broker, SumOfSquares::default(), 4).await;
    let coordinator = coordinator_with(
        &broker,
        CoordinatorConfig {
            workers: 4,
            strategy: PartitionStrategy::ExactCeil,
            ..Default::default()
        },
    );

    let factory = SourceFactory::inline((0..1000i64).map(Value::from));
    let total = within_timeout(coordinator.run(&SumOfSquares::default(), &factory))
        .await
        .unwrap();

    assert_eq!(total, (0..1000i64).map(|n| n * n).sum::<i64>());
    let stats = pool.shutdown().await.unwrap();
    assert_eq!(stats.replied, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_integrate_exp() {
    let integrate = IntegrateExp::new(1e-3);
    let broker = memory_broker();
    let pool = start_pool(&broker, integrate, 4).await;

    let factory = integrate.factory(1.0, 10.0);
    let area = within_timeout(coordinator(&broker, 6).run(&integrate, &factory))
        .await
        .unwrap();

    let exact = 10f64.exp() - 1f64.exp();
    assert!(
        ((area - exact) / exact).abs() < 1e-2,
        "area {} too far from {}",
        area,
        exact
    );
    pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_share_workers() {
    let broker = memory_broker();
    let pool = start_pool(&broker, SumOfSquares::default(), 3).await;
    let coordinator = coordinator(&broker, 5);

    let small = integers(100);
    let large = integers(2000);
    let computation = SumOfSquares::default();
    let (a, b) = within_timeout(async {
        tokio::join!(
            coordinator.run(&computation, &small),
            coordinator.run(&computation, &large),
        )
    })
    .await;

    assert_eq!(a.unwrap(), (0..100i64).map(|n| n * n).sum::<i64>());
    assert_eq!(b.unwrap(), (0..2000i64).map(|n| n * n).sum::<i64>());
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deadline_republishes_then_exhausts() {
    let broker = memory_broker();
    let coordinator = coordinator_with(
        &broker,
        CoordinatorConfig {
            workers: 2,
            partition_timeout: Some(Duration::from_millis(50)),
            max_attempts: 2,
            ..Default::default()
        },
    );

    // No workers: every partition times out twice
    let err = within_timeout(coordinator.run(&SumOfSquares::default(), &integers(10)))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::COORD_PARTITION_EXHAUSTED);
    assert_eq!(broker.queue_depth("brokermr.sum_of_squares"), Some(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_republish_recovers_from_hung_worker() {
    let broker = memory_broker();
    let queue = "brokermr.sum_of_squares";
    broker.declare_queue(queue).await.unwrap();

    // Takes one request and never settles it
    let mut hung = broker.consume(queue, 1).await.unwrap();
    let coordinator = coordinator_with(
        &broker,
        CoordinatorConfig {
            workers: 3,
            partition_timeout: Some(Duration::from_millis(200)),
            max_attempts: 3,
            ..Default::default()
        },
    );
    let run = tokio::spawn(async move {
        coordinator
            .run(&SumOfSquares::default(), &integers(300))
            .await
    });
    let held = within_timeout(hung.next()).await.unwrap().unwrap();

    let pool = start_pool(&broker, SumOfSquares::default(), 2).await;
    let total = within_timeout(run).await.unwrap().unwrap();

    assert_eq!(total, (0..300i64).map(|n| n * n).sum::<i64>());
    assert!(!held.redelivered());
    pool.shutdown().await.unwrap();
    drop(hung);
}
