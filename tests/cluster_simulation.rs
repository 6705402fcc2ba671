//! End-to-end scenarios against an in-process mock cluster: discovery, failover,
//! backpressure shedding, speculative execution, and prepared-statement
//! re-preparation.

mod support;

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use cassandra::{
    error::{DbError, ErrorKind},
    options::{ClientOptions, PoolSize},
    policies::{ConstantReconnectionPolicy, RoundRobinPolicy},
    Client,
    Statement,
};

use support::{start_cluster, MockNode, MockTranslator};

fn options_for(nodes: &[&MockNode]) -> ClientOptions {
    ClientOptions::builder()
        .contact_point(nodes[0].endpoint())
        .address_translator(Arc::new(MockTranslator::for_nodes(nodes)))
        .load_balancing(Arc::new(RoundRobinPolicy::new()))
        .reconnection(Arc::new(ConstantReconnectionPolicy {
            delay: Duration::from_millis(100),
        }))
        .connect_timeout(Duration::from_secs(2))
        .read_timeout(Duration::from_secs(5))
        .build()
        .expect("valid options")
}

/// Polls `condition` until it holds, failing the test after `deadline`.
async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn queries_rotate_over_every_discovered_host() {
    let nodes = start_cluster(3, "dc1").await;
    let refs: Vec<&MockNode> = nodes.iter().collect();
    let client = Client::connect_with(options_for(&refs)).await.expect("connect");

    let mut seen = HashSet::new();
    for _ in 0..6 {
        let result = client
            .execute(&Statement::new("SELECT val FROM app.data WHERE id = 1"))
            .await
            .expect("query");
        seen.insert(result.queried_host().clone());
    }
    assert_eq!(seen.len(), 3, "round robin should reach every peer");

    client.shutdown().await;
}

#[tokio::test]
async fn failover_moves_traffic_to_the_surviving_host() {
    let nodes = start_cluster(2, "dc1").await;
    let refs: Vec<&MockNode> = nodes.iter().collect();
    let client = Client::connect_with(options_for(&refs)).await.expect("connect");

    for _ in 0..3 {
        client
            .execute(&Statement::new("SELECT val FROM app.data").idempotent(true))
            .await
            .expect("query before failover");
    }

    nodes[0].kill();
    // The dead socket is noticed on the next send; the retry policy moves the
    // request to the surviving node.
    for _ in 0..4 {
        let result = client
            .execute(&Statement::new("SELECT val FROM app.data").idempotent(true))
            .await
            .expect("query after failover");
        assert_eq!(result.queried_host(), &nodes[1].endpoint());
    }

    // Reviving the first node eventually brings it back into rotation.
    nodes[0].revive();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let mut seen = HashSet::new();
    for _ in 0..6 {
        let result = client
            .execute(&Statement::new("SELECT val FROM app.data").idempotent(true))
            .await
            .expect("query after revive");
        seen.insert(result.queried_host().clone());
    }
    assert!(seen.contains(&nodes[0].endpoint()), "revived node rejoined");

    client.shutdown().await;
}

#[tokio::test]
async fn control_connection_fails_over_and_never_fails_back() {
    let nodes = start_cluster(2, "dc1").await;
    let refs: Vec<&MockNode> = nodes.iter().collect();
    let client = Client::connect_with(options_for(&refs)).await.expect("connect");

    // Only control connections REGISTER for events, so the counts tell us where the
    // control session lives: on the contact point, initially.
    assert_eq!(nodes[0].register_count(), 1);
    assert_eq!(nodes[1].register_count(), 0);

    // Kill the contact point; the control connection reattaches to the survivor
    // within a reconnection cycle.
    nodes[0].kill();
    wait_until(Duration::from_secs(3), || nodes[1].register_count() == 1).await;

    // Restart the original node and wait until a statement pinned to it succeeds,
    // proving the node is genuinely back in the cluster.
    nodes[0].revive();
    let pinned = Statement::new("SELECT val FROM app.data")
        .host(nodes[0].endpoint())
        .idempotent(true);
    let start = Instant::now();
    loop {
        match client.execute(&pinned).await {
            Ok(_) => break,
            Err(_) if start.elapsed() < Duration::from_secs(3) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(error) => panic!("revived node did not come back: {}", error),
        }
    }

    // The control session stays where it landed: no new REGISTER on the revived
    // node, and none elsewhere either.
    assert_eq!(
        nodes[0].register_count(),
        1,
        "control connection must not fail back to the restarted node"
    );
    assert_eq!(nodes[1].register_count(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn saturated_pools_surface_busy_connection_per_host() {
    let nodes = start_cluster(1, "dc1").await;
    let refs: Vec<&MockNode> = nodes.iter().collect();
    let mut options = options_for(&refs);
    options.max_requests_per_connection = 1;
    options.pool_size = PoolSize {
        local: 1,
        remote: 1,
    };
    let client = Client::connect_with(options).await.expect("connect");

    nodes[0].set_query_delay(Duration::from_millis(800));
    let slow_client = client.clone();
    let slow = tokio::spawn(async move {
        slow_client
            .execute(&Statement::new("SELECT slow FROM app.data"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The only stream id is taken by the slow request.
    let err = client
        .execute(&Statement::new("SELECT blocked FROM app.data"))
        .await
        .expect_err("should shed load");
    match err.kind.as_ref() {
        ErrorKind::NoHostAvailable(aggregate) => {
            assert_eq!(aggregate.errors.len(), 1);
            assert!(matches!(
                aggregate.errors[0].1.kind.as_ref(),
                ErrorKind::ConnectionBusy
            ));
        }
        other => panic!("expected NoHostAvailable, got {:?}", other),
    }

    slow.await.expect("join").expect("slow query completes");
    client.shutdown().await;
}

#[tokio::test]
async fn speculative_execution_wins_on_the_faster_host() {
    let nodes = start_cluster(2, "dc1").await;
    let refs: Vec<&MockNode> = nodes.iter().collect();
    let options = ClientOptions::builder()
        .contact_point(nodes[0].endpoint())
        .address_translator(Arc::new(MockTranslator::for_nodes(&refs)))
        .load_balancing(Arc::new(RoundRobinPolicy::new()))
        .reconnection(Arc::new(ConstantReconnectionPolicy {
            delay: Duration::from_millis(100),
        }))
        .constant_speculative_execution(Duration::from_millis(100), 2)
        .build()
        .expect("valid options");
    let client = Client::connect_with(options).await.expect("connect");

    // The contact point is the first host of the first plan, and it is slow.
    nodes[0].set_query_delay(Duration::from_millis(2000));

    let started = Instant::now();
    let result = client
        .execute(&Statement::new("SELECT val FROM app.data").idempotent(true))
        .await
        .expect("query");
    assert_eq!(result.queried_host(), &nodes[1].endpoint());
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "speculative execution should finish before the slow host"
    );

    client.shutdown().await;
}

#[tokio::test]
async fn overloaded_errors_honor_idempotence() {
    let nodes = start_cluster(1, "dc1").await;
    let refs: Vec<&MockNode> = nodes.iter().collect();
    let client = Client::connect_with(options_for(&refs)).await.expect("connect");

    nodes[0].set_overloaded(true);

    // Non-idempotent requests must not be replayed after an overloaded coordinator.
    let err = client
        .execute(&Statement::new("UPDATE app.data SET v = 1"))
        .await
        .expect_err("overloaded");
    match err.kind.as_ref() {
        ErrorKind::Server(server) => assert_eq!(server.code, DbError::Overloaded),
        other => panic!("expected the server error to surface, got {:?}", other),
    }

    // Idempotent requests advance the plan instead; with a single host that means the
    // aggregate error.
    let err = client
        .execute(&Statement::new("SELECT v FROM app.data").idempotent(true))
        .await
        .expect_err("overloaded everywhere");
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::NoHostAvailable(_)
    ));

    client.shutdown().await;
}

#[tokio::test]
async fn rejoining_host_gets_all_statements_re_prepared() {
    let nodes = start_cluster(1, "dc1").await;
    let refs: Vec<&MockNode> = nodes.iter().collect();
    let mut options = options_for(&refs);
    options.pool_size = PoolSize {
        local: 1,
        remote: 1,
    };
    let client = Client::connect_with(options).await.expect("connect");

    let prepared = client
        .prepare("SELECT val FROM app.data WHERE id = ?")
        .await
        .expect("prepare");
    assert_eq!(nodes[0].prepare_count(), 1);

    // Executing on the connection that prepared the statement reuses the binding.
    for _ in 0..5 {
        client
            .execute(&Statement::from(&prepared).bind([1i32.into()]))
            .await
            .expect("execute prepared");
    }
    assert_eq!(nodes[0].prepare_count(), 1);

    nodes[0].kill();
    tokio::time::sleep(Duration::from_millis(300)).await;
    nodes[0].revive();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // The reconnected host was re-prepared before coming back UP.
    assert!(nodes[0].prepare_count() >= 2, "statement was re-prepared");
    client
        .execute(&Statement::from(&prepared).bind([1i32.into()]))
        .await
        .expect("execute after rejoin");

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_rejects_new_requests() {
    let nodes = start_cluster(1, "dc1").await;
    let refs: Vec<&MockNode> = nodes.iter().collect();
    let client = Client::connect_with(options_for(&refs)).await.expect("connect");

    client.shutdown().await;
    client.shutdown().await;

    let err = client
        .execute(&Statement::new("SELECT val FROM app.data"))
        .await
        .expect_err("client is shut down");
    assert!(matches!(err.kind.as_ref(), ErrorKind::Shutdown));
}
