use std::thread;
use std::time::Duration;

use shardpipe_client::{
    ClientConfig, KeyTtl, Mode, Operation, PipelineClient, PipelineError, PoolStats, RedirectKind,
    Reply, SessionState, SetCondition,
};
use shardpipe_devnode::DevCluster;

// Balanced 3-node layout: node 0 owns 0..=5460, node 1 5461..=10921, node 2 the rest.
// Slots: bar 5061, key2 4998, key3 935 (node 0); c 7365, key1 9189 (node 1);
// foo 12182, a 15495 (node 2).

fn start() -> (DevCluster, PipelineClient) {
    let cluster = DevCluster::start(3).unwrap();
    let client = PipelineClient::connect(cluster_config(&cluster)).unwrap();
    (cluster, client)
}

fn cluster_config(cluster: &DevCluster) -> ClientConfig {
    let mut config = ClientConfig::cluster(cluster.addrs());
    config.pool.lease_timeout_ms = 200;
    config.pool.io_timeout_ms = 1_000;
    config
}

fn stats_for(client: &PipelineClient, addr: &str) -> PoolStats {
    client
        .pool_stats()
        .into_iter()
        .find(|stats| stats.addr == addr)
        .unwrap()
}

fn assert_nothing_leased(client: &PipelineClient) {
    for stats in client.pool_stats() {
        assert_eq!(stats.leased, 0, "{} still has a lease", stats.addr);
    }
}

#[test]
fn replies_come_back_in_enqueue_order_across_nodes() {
    let (_cluster, client) = start();
    assert_eq!(client.mode(), Mode::Clustered);
    assert_eq!(client.topology_version(), 1);

    let mut session = client.begin_pipeline();
    session.set("foo", "f").unwrap();
    session.set("bar", "b").unwrap();
    session.set("key1", "k").unwrap();
    let get_foo = session.get("foo").unwrap();
    session.get("bar").unwrap();
    session.enqueue(Operation::incr("c")).unwrap();
    session.get("key1").unwrap();
    session.get("missing").unwrap();
    assert_eq!(session.len(), 8);
    assert_eq!(session.leased_nodes().len(), 3);

    let replies = session.sync_and_collect().unwrap();
    assert_eq!(
        replies,
        vec![
            Reply::Done,
            Reply::Done,
            Reply::Done,
            Reply::Value(Some(b"f".to_vec())),
            Reply::Value(Some(b"b".to_vec())),
            Reply::Count(1),
            Reply::Value(Some(b"k".to_vec())),
            Reply::Value(None),
        ]
    );
    assert_eq!(get_foo.index(), 3);
    assert_eq!(session.state(), SessionState::Closed);
    assert_nothing_leased(&client);
}

#[test]
fn keys_on_one_node_share_one_lease() {
    let (cluster, client) = start();
    let node0 = cluster.addr(0).to_string();

    let mut session = client.begin_pipeline();
    session.set("bar", "1").unwrap();
    session.set("key2", "2").unwrap();
    session.set("key3", "3").unwrap();
    session.set("{bar}.suffix", "4").unwrap();

    assert_eq!(session.leased_nodes(), vec![node0.as_str()]);
    let stats = stats_for(&client, &node0);
    assert_eq!(stats.leased, 1);
    assert_eq!(stats.total, 1);

    session.sync().unwrap();
    let stats = stats_for(&client, &node0);
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.created, 1);
}

#[test]
fn moved_reply_fails_the_sync_and_reloads_once() {
    let (cluster, client) = start();
    // Reshard "foo" onto node 0 behind the client's back.
    let slot = cluster.move_key(b"foo", 0);

    let mut session = client.begin_pipeline();
    session.set("bar", "1").unwrap();
    session.set("c", "2").unwrap();
    session.get("foo").unwrap();
    session.set("a", "4").unwrap();
    session.get("key1").unwrap();

    let err = session.sync_and_collect().unwrap_err();
    match err {
        PipelineError::Redirection(redirect) => {
            assert_eq!(redirect.kind, RedirectKind::Moved);
            assert_eq!(redirect.slot, slot);
            assert_eq!(redirect.address, cluster.addr(0));
        }
        other => panic!("expected a redirection, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(client.topology_version(), 2);
    assert_nothing_leased(&client);
    // Every reply was read, so every connection went back to its pool.
    for stats in client.pool_stats() {
        assert_eq!(stats.evicted, 0, "{} evicted a connection", stats.addr);
    }

    // Operations after the failure were still executed by the nodes.
    assert_eq!(client.get(b"a").unwrap(), Some(b"4".to_vec()));
    assert_eq!(client.get(b"bar").unwrap(), Some(b"1".to_vec()));

    // The reloaded map routes "foo" to its new owner.
    let before = cluster.metrics(0).commands_total;
    let mut session = client.begin_pipeline();
    session.set("foo", "moved").unwrap();
    session.get("foo").unwrap();
    let replies = session.sync_and_collect().unwrap();
    assert_eq!(replies[1], Reply::Value(Some(b"moved".to_vec())));
    assert_eq!(cluster.metrics(0).commands_total, before + 2);
    assert_eq!(client.topology_version(), 2);
}

#[test]
fn exhausted_pool_on_second_node_does_not_leak_the_first() {
    let cluster = DevCluster::start(3).unwrap();
    let mut config = cluster_config(&cluster);
    config.pool.max_total = 1;
    config.pool.lease_timeout_ms = 100;
    let client = PipelineClient::connect(config).unwrap();

    // Hold node 2's only connection.
    let mut holder = client.begin_pipeline();
    holder.get("foo").unwrap();

    let mut session = client.begin_pipeline();
    session.set("bar", "1").unwrap();
    match session.get("a") {
        Err(PipelineError::PoolExhausted { node, timeout }) => {
            assert_eq!(node, cluster.addr(2));
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected pool exhaustion, got {:?}", other),
    }
    assert_eq!(stats_for(&client, cluster.addr(0)).leased, 1);

    session.close();
    let stats = stats_for(&client, cluster.addr(0));
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.evicted, 0);

    holder.sync().unwrap();
    assert_nothing_leased(&client);
}

#[test]
fn close_is_idempotent_and_final() {
    let (_cluster, client) = start();
    let mut session = client.begin_pipeline();
    session.set("bar", "1").unwrap();
    session.set("foo", "2").unwrap();
    assert!(session.is_dirty());

    session.close();
    assert_nothing_leased(&client);
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_nothing_leased(&client);

    assert!(matches!(session.get("bar"), Err(PipelineError::SessionClosed)));
    assert!(matches!(session.sync(), Err(PipelineError::SessionClosed)));

    let mut synced = client.begin_pipeline();
    synced.sync().unwrap();
    assert!(matches!(synced.sync(), Err(PipelineError::SessionClosed)));
}

#[test]
fn dropping_an_open_session_releases_everything() {
    let (_cluster, client) = start();
    {
        let mut session = client.begin_pipeline();
        for key in ["bar", "c", "foo", "a", "key1"] {
            session.set(key, "v").unwrap();
        }
    }
    assert_nothing_leased(&client);
    for stats in client.pool_stats() {
        assert_eq!(stats.evicted, 0);
    }
}

#[test]
fn unowned_slot_is_a_cluster_state_error() {
    let (cluster, client) = start();
    cluster.unassign(12182, 12182);
    client.refresh_topology().unwrap();
    assert_eq!(client.topology_version(), 2);

    let mut session = client.begin_pipeline();
    match session.get("foo") {
        Err(PipelineError::ClusterState { slot }) => assert_eq!(slot, 12182),
        other => panic!("expected a cluster state error, got {:?}", other),
    }
    assert!(session.leased_nodes().is_empty());
    // Neighbouring slots still route.
    session.set("a", "1").unwrap();
    session.sync().unwrap();
}

#[test]
fn server_error_mid_drain_discards_the_rest_cleanly() {
    let (_cluster, client) = start();
    client.set(b"bar", b"not-a-number").unwrap();

    let mut session = client.begin_pipeline();
    session.set("key2", "1").unwrap();
    session.enqueue(Operation::incr("bar")).unwrap();
    session.set("key3", "3").unwrap();
    session.set("foo", "4").unwrap();

    match session.sync_and_collect() {
        Err(PipelineError::Server(message)) => assert!(message.contains("not an integer")),
        other => panic!("expected a server error, got {:?}", other),
    }
    assert_eq!(client.topology_version(), 1);
    assert_nothing_leased(&client);
    for stats in client.pool_stats() {
        assert_eq!(stats.evicted, 0);
    }
    assert_eq!(client.get(b"foo").unwrap(), Some(b"4".to_vec()));
}

#[test]
fn sessions_on_many_threads_share_pools() {
    let (_cluster, client) = start();
    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let client = client.clone();
            thread::spawn(move || {
                for round in 0..20 {
                    let mut session = client.begin_pipeline();
                    let keys: Vec<String> =
                        (0..10).map(|idx| format!("w{}:{}:{}", worker, round, idx)).collect();
                    for key in &keys {
                        session.set(key.as_str(), key.as_str()).unwrap();
                    }
                    for key in &keys {
                        session.get(key.as_str()).unwrap();
                    }
                    let replies = session.sync_and_collect().unwrap();
                    assert_eq!(replies.len(), 20);
                    for (idx, key) in keys.iter().enumerate() {
                        assert_eq!(replies[10 + idx], Reply::Value(Some(key.clone().into_bytes())));
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_nothing_leased(&client);
    for stats in client.pool_stats() {
        assert!(stats.total <= 8);
    }
}

#[test]
fn one_shot_commands_route_by_slot() {
    let (cluster, client) = start();
    client.set(b"foo", b"1").unwrap();
    assert_eq!(client.incr(b"foo").unwrap(), 2);
    assert!(client.exists(b"foo").unwrap());
    assert!(client.delete(b"foo").unwrap());
    assert!(!client.delete(b"foo").unwrap());
    assert_eq!(cluster.metrics(2).redirects_total, 0);
    assert!(cluster.metrics(2).commands_total >= 4);
}

#[test]
fn mget_spans_nodes_in_key_order() {
    let (cluster, client) = start();
    client.set(b"foo", b"2").unwrap();
    client.set(b"bar", b"0").unwrap();
    client.set(b"key1", b"1").unwrap();

    let values = client.mget(&["foo", "missing", "bar", "key1"]).unwrap();
    assert_eq!(
        values,
        vec![Some(b"2".to_vec()), None, Some(b"0".to_vec()), Some(b"1".to_vec())]
    );
    assert!(client.mget::<&str>(&[]).unwrap().is_empty());
    // One-key commands only, so no node saw a cross-slot request.
    for node in 0..3 {
        assert_eq!(cluster.metrics(node).errors_total, 0);
        assert_eq!(cluster.metrics(node).redirects_total, 0);
    }
    assert_nothing_leased(&client);
}

#[test]
fn delete_many_counts_removals_across_nodes() {
    let (_cluster, client) = start();
    for key in ["bar", "c", "foo"] {
        client.set(key.as_bytes(), b"v").unwrap();
    }
    assert_eq!(client.delete_many(&["bar", "c", "foo", "a"]).unwrap(), 3);
    assert_eq!(client.delete_many(&["bar", "c"]).unwrap(), 0);
    assert_eq!(client.mget(&["bar", "c", "foo"]).unwrap(), vec![None, None, None]);
}

#[test]
fn conditional_set_is_put_if_absent() {
    let (_cluster, client) = start();
    assert!(client.set_if_absent(b"foo", b"first", None).unwrap());
    assert!(!client.set_if_absent(b"foo", b"second", None).unwrap());
    assert_eq!(client.get(b"foo").unwrap(), Some(b"first".to_vec()));

    assert!(!client
        .set_with_condition(b"bar", b"x", None, SetCondition::IfPresent)
        .unwrap());
    assert_eq!(client.get(b"bar").unwrap(), None);

    let mut session = client.begin_pipeline();
    session
        .enqueue(Operation::set_if("key1", "v", Some(Duration::from_secs(30)), SetCondition::IfAbsent))
        .unwrap();
    session
        .enqueue(Operation::set_if("key1", "w", None, SetCondition::IfAbsent))
        .unwrap();
    session
        .enqueue(Operation::set_if("foo", "updated", None, SetCondition::IfPresent))
        .unwrap();
    assert_eq!(
        session.sync_and_collect().unwrap(),
        vec![Reply::Flag(true), Reply::Flag(false), Reply::Flag(true)]
    );
    assert_eq!(client.get(b"foo").unwrap(), Some(b"updated".to_vec()));
    assert!(matches!(client.ttl(b"key1").unwrap(), KeyTtl::ExpiresIn(_)));
}

#[test]
fn sub_second_expire_keeps_the_key_alive() {
    let (_cluster, client) = start();
    client.set(b"foo", b"v").unwrap();
    assert!(client.expire(b"foo", Duration::from_millis(500)).unwrap());
    assert_eq!(client.get(b"foo").unwrap(), Some(b"v".to_vec()));

    thread::sleep(Duration::from_millis(700));
    assert_eq!(client.get(b"foo").unwrap(), None);
}
