//! End-to-end scenarios over real TCP: publish/subscribe through one server,
//! subscription filtering, backlog on late attach, inter-server gossip, and
//! deduplication across redundant paths.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use wave::{Client, ClientConfig, Codec, RequestConfig};

use common::{expect_messages, listener, wire1, wire2, TestNet, MAX_MESSAGE_SIZE};

fn wire1_codec() -> Arc<dyn Codec> {
    Arc::new(wire1::Codec)
}

fn wire2_codec() -> Arc<dyn Codec> {
    Arc::new(wire2::Codec)
}

fn client_config(servers: Vec<String>, requests: Vec<RequestConfig>) -> ClientConfig {
    ClientConfig {
        servers,
        max_message_size: MAX_MESSAGE_SIZE,
        requests,
    }
}

#[tokio::test]
async fn single_server_and_client() -> Result<()> {
    let mut net = TestNet::new();
    let (ls, addr) = listener().await;
    let servers = vec![addr];

    let (client, mut recv) = Client::new(client_config(
        servers.clone(),
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg1::default())],
        }],
    ))?;

    net.spawn_client(client.clone());
    net.spawn_server(ls, servers);

    client
        .publish(wire1::Msg1 { value: "test1".into() }, wire1_codec())
        .await?;
    expect_messages(&mut recv, &[r#"wire1::Msg1("test1")"#]).await;

    client
        .publish(wire1::Msg1 { value: "test2".into() }, wire1_codec())
        .await?;
    expect_messages(&mut recv, &[r#"wire1::Msg1("test2")"#]).await;

    net.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn only_requested_messages_are_received() -> Result<()> {
    let mut net = TestNet::new();
    let (ls, addr) = listener().await;
    let servers = vec![addr];

    let (client, mut recv) = Client::new(client_config(
        servers.clone(),
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg2::default())],
        }],
    ))?;

    net.spawn_client(client.clone());
    net.spawn_server(ls, servers);

    client
        .publish(wire1::Msg1 { value: "test".into() }, wire1_codec())
        .await?;
    client
        .publish(wire1::Msg2 { value: 2 }, wire1_codec())
        .await?;

    expect_messages(&mut recv, &["wire1::Msg2(2)"]).await;

    net.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn two_namespaces() -> Result<()> {
    let mut net = TestNet::new();
    let (ls, addr) = listener().await;
    let servers = vec![addr];

    let (client, mut recv) = Client::new(client_config(
        servers.clone(),
        vec![
            RequestConfig {
                codec: wire1_codec(),
                messages: vec![Box::new(wire1::Msg2::default())],
            },
            RequestConfig {
                codec: wire2_codec(),
                messages: vec![Box::new(wire2::Msg2::default())],
            },
        ],
    ))?;

    net.spawn_client(client.clone());
    net.spawn_server(ls, servers);

    client
        .publish(wire1::Msg1 { value: "test1".into() }, wire1_codec())
        .await?;
    client
        .publish(wire1::Msg2 { value: 1 }, wire1_codec())
        .await?;
    client
        .publish(wire2::Msg1 { value: "test2".into() }, wire2_codec())
        .await?;
    client
        .publish(wire2::Msg2 { value: 2 }, wire2_codec())
        .await?;

    expect_messages(&mut recv, &["wire1::Msg2(1)", "wire2::Msg2(2)"]).await;

    net.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn server_sends_backlog_to_new_client() -> Result<()> {
    let mut net = TestNet::new();
    let (ls, addr) = listener().await;
    let servers = vec![addr];

    let requests = || {
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![
                Box::new(wire1::Msg1::default()) as wave::AnyMessage,
                Box::new(wire1::Msg2::default()),
            ],
        }]
    };

    let (client1, mut recv1) = Client::new(client_config(servers.clone(), requests()))?;
    let (client2, mut recv2) = Client::new(client_config(servers.clone(), requests()))?;

    net.spawn_client(client1.clone());
    net.spawn_server(ls, servers);

    client1
        .publish(wire1::Msg1 { value: "test1".into() }, wire1_codec())
        .await?;
    expect_messages(&mut recv1, &[r#"wire1::Msg1("test1")"#]).await;

    // The late subscriber gets the current catalog before any new publish.
    net.spawn_client(client2.clone());
    expect_messages(&mut recv2, &[r#"wire1::Msg1("test1")"#]).await;
    expect_messages(&mut recv1, &[]).await;

    client1
        .publish(wire1::Msg1 { value: "test2".into() }, wire1_codec())
        .await?;
    expect_messages(&mut recv1, &[r#"wire1::Msg1("test2")"#]).await;
    expect_messages(&mut recv2, &[r#"wire1::Msg1("test2")"#]).await;

    net.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn servers_exchange_messages() -> Result<()> {
    let mut net = TestNet::new();
    let (ls1, addr1) = listener().await;
    let (ls2, addr2) = listener().await;
    let servers = vec![addr1.clone(), addr2.clone()];

    let (client1, mut recv1) = Client::new(client_config(
        vec![addr1],
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg2::default())],
        }],
    ))?;
    let (client2, mut recv2) = Client::new(client_config(
        vec![addr2],
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg1::default())],
        }],
    ))?;

    net.spawn_client(client1.clone());
    net.spawn_client(client2.clone());
    net.spawn_server(ls1, servers.clone());
    net.spawn_server(ls2, servers);

    client1
        .publish(wire1::Msg1 { value: "test".into() }, wire1_codec())
        .await?;
    client2
        .publish(wire1::Msg2 { value: 1 }, wire1_codec())
        .await?;

    expect_messages(&mut recv1, &["wire1::Msg2(1)"]).await;
    expect_messages(&mut recv2, &[r#"wire1::Msg1("test")"#]).await;

    net.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn late_server_synchronizes() -> Result<()> {
    let mut net = TestNet::new();
    let (ls1, addr1) = listener().await;
    let (ls2, addr2) = listener().await;
    let servers = vec![addr1.clone(), addr2.clone()];

    let (client1, mut recv1) = Client::new(client_config(
        vec![addr1],
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg2::default())],
        }],
    ))?;
    let (client2, mut recv2) = Client::new(client_config(
        vec![addr2],
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg1::default())],
        }],
    ))?;

    net.spawn_client(client1.clone());
    net.spawn_client(client2.clone());
    net.spawn_server(ls1, servers.clone());

    client1
        .publish(wire1::Msg1 { value: "test".into() }, wire1_codec())
        .await?;
    client2
        .publish(wire1::Msg2 { value: 1 }, wire1_codec())
        .await?;

    // The second server joins only after both publishes happened; gossip
    // carries the catalog across once it is up.
    net.spawn_server(ls2, servers);

    expect_messages(&mut recv1, &["wire1::Msg2(1)"]).await;
    expect_messages(&mut recv2, &[r#"wire1::Msg1("test")"#]).await;

    net.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn only_latest_revision_is_synced() -> Result<()> {
    let mut net = TestNet::new();
    let (ls1, addr1) = listener().await;
    let (ls2, addr2) = listener().await;
    let servers = vec![addr1.clone(), addr2.clone()];

    let (client1, mut recv1) = Client::new(client_config(
        vec![addr1],
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg2::default())],
        }],
    ))?;
    let (client2, mut recv2) = Client::new(client_config(
        vec![addr2],
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg1::default())],
        }],
    ))?;

    net.spawn_client(client1.clone());
    net.spawn_client(client2.clone());
    net.spawn_server(ls1, servers.clone());

    client1
        .publish(wire1::Msg1 { value: "test1".into() }, wire1_codec())
        .await?;
    client1
        .publish(wire1::Msg1 { value: "test2".into() }, wire1_codec())
        .await?;

    // Let both revisions reach the first server before the second one
    // starts syncing; only the latest may cross the mesh.
    tokio::time::sleep(Duration::from_millis(200)).await;
    net.spawn_server(ls2, servers);

    expect_messages(&mut recv2, &[r#"wire1::Msg1("test2")"#]).await;
    expect_messages(&mut recv1, &[]).await;

    net.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn two_sources_are_independent_registers() -> Result<()> {
    let mut net = TestNet::new();
    let (ls, addr) = listener().await;
    let servers = vec![addr];

    let (client1, mut recv1) = Client::new(client_config(servers.clone(), Vec::new()))?;
    let (client2, mut recv2) = Client::new(client_config(servers.clone(), Vec::new()))?;
    let (client3, mut recv3) = Client::new(client_config(
        servers.clone(),
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg1::default())],
        }],
    ))?;

    net.spawn_client(client1.clone());
    net.spawn_client(client2.clone());
    net.spawn_server(ls, servers);

    client1
        .publish(wire1::Msg1 { value: "test1".into() }, wire1_codec())
        .await?;
    client2
        .publish(wire1::Msg1 { value: "test2".into() }, wire1_codec())
        .await?;

    // Same descriptor, two senders: both registers survive and a late
    // subscriber receives both from the backlog.
    tokio::time::sleep(Duration::from_millis(200)).await;
    net.spawn_client(client3.clone());

    expect_messages(&mut recv3, &[r#"wire1::Msg1("test1")"#, r#"wire1::Msg1("test2")"#]).await;
    expect_messages(&mut recv1, &[]).await;
    expect_messages(&mut recv2, &[]).await;

    net.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn redundant_paths_deliver_once() -> Result<()> {
    let mut net = TestNet::new();
    let (ls1, addr1) = listener().await;
    let (ls2, addr2) = listener().await;
    let servers = vec![addr1, addr2];

    let (client1, mut recv1) = Client::new(client_config(servers.clone(), Vec::new()))?;
    let (client2, mut recv2) = Client::new(client_config(
        servers.clone(),
        vec![RequestConfig {
            codec: wire1_codec(),
            messages: vec![Box::new(wire1::Msg1::default())],
        }],
    ))?;

    net.spawn_client(client1.clone());
    net.spawn_server(ls1, servers.clone());
    net.spawn_server(ls2, servers);
    net.spawn_client(client2.clone());

    client1
        .publish(wire1::Msg1 { value: "test".into() }, wire1_codec())
        .await?;

    // The message reaches the subscriber via both servers; revision
    // deduplication lets only the first copy through.
    expect_messages(&mut recv2, &[r#"wire1::Msg1("test")"#]).await;
    expect_messages(&mut recv1, &[]).await;

    net.shutdown().await;
    Ok(())
}
