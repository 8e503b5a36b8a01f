// tests/rpc.rs

//! Correlated request/reply on top of the broker primitives.

mod common;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

use mom_broker::{
    //
    Broker,
    Channel,
    CorrelationId,
    Error,
    Properties,
    Result,
    RpcClient,
    RpcServer,
};

#[derive(Debug, Serialize, Deserialize)]
struct SquareRequest {
    n: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SquareResponse {
    square: i64,
}

async fn square_server(broker: &Broker, queue: &str) -> Result<mom_broker::ConsumerHandle> {
    // ---
    let channel = broker.open_session().into_channel();
    RpcServer::new(channel, queue)
        .serve(|body: Bytes| async move {
            // ---
            let text = std::str::from_utf8(&body).unwrap_or("0");
            let n: i64 = text.trim().parse().unwrap_or(0);
            Ok(Bytes::from((n * n).to_string()))
        })
        .await
}

#[tokio::test]
async fn test_call_round_trip() -> Result<()> {
    // ---
    common::init_logging();

    let broker = Broker::new();
    let _server = square_server(&broker, "rpc.squares").await?;

    let client = RpcClient::new(broker.open_session().into_channel(), "rpc.squares").await?;

    log::info!("requesting square(5)...");
    let reply = client.call(Bytes::from("5")).await?;
    log::info!("requesting square(5)...done");

    assert_eq!(reply, "25");
    assert_eq!(client.outstanding_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_typed_call_round_trip() -> Result<()> {
    // ---
    let broker = Broker::new();

    let server_channel = broker.open_session().into_channel();
    let _server = RpcServer::new(server_channel, "rpc.squares")
        .serve_typed(|req: SquareRequest| async move {
            Ok(SquareResponse {
                square: req.n * req.n,
            })
        })
        .await?;

    let client = RpcClient::new(broker.open_session().into_channel(), "rpc.squares").await?;

    let resp: SquareResponse = client.call_typed(&SquareRequest { n: 12 }).await?;
    assert_eq!(resp.square, 144);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_share_one_reply_queue() {
    // ---
    common::init_logging();

    let broker = Broker::new();
    // Unbounded prefetch so one server instance handles the burst.
    let server_channel = broker.open_session().into_channel();
    let _server = RpcServer::new(server_channel, "rpc.squares")
        .with_prefetch(0)
        .serve(|body: Bytes| async move {
            let n: i64 = std::str::from_utf8(&body).unwrap_or("0").parse().unwrap_or(0);
            Ok(Bytes::from((n * n).to_string()))
        })
        .await
        .unwrap();

    let client = RpcClient::new(broker.open_session().into_channel(), "rpc.squares")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0i64..10 {
        // ---
        let c = client.clone();
        handles.push(tokio::spawn(async move {
            let reply = c.call(Bytes::from(i.to_string())).await.unwrap();
            String::from_utf8(reply.to_vec()).unwrap()
        }));
    }

    for (i, task) in handles.into_iter().enumerate() {
        let reply = task.await.unwrap();
        let i = i as i64;
        assert_eq!(reply, (i * i).to_string());
    }
    assert_eq!(client.outstanding_calls(), 0);
}

#[tokio::test]
async fn test_mismatched_correlation_id_leaves_call_pending() -> Result<()> {
    // ---
    let broker = Broker::new();
    let session = broker.open_session();

    // No server on the request queue; inject a reply with the wrong id
    // straight into the client's reply queue.
    let client = RpcClient::new(session.clone().into_channel(), "rpc.nowhere").await?;
    let reply_queue = client.reply_queue().to_string();

    let injector = session.clone();
    tokio::spawn(async move {
        // ---
        sleep(Duration::from_millis(50)).await;
        let properties = Properties {
            correlation_id: Some(CorrelationId::generate()),
            ..Properties::default()
        };
        let _ = injector
            .publish("", &reply_queue, Bytes::from("impostor"), properties)
            .await;
    });

    let err = client
        .call_with_timeout(Bytes::from("req"), Duration::from_millis(400))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // Timeout cleanup removed the pending entry.
    assert_eq!(client.outstanding_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_late_reply_is_discarded_and_client_recovers() -> Result<()> {
    // ---
    let broker = Broker::new();

    let server_channel = broker.open_session().into_channel();
    let _server = RpcServer::new(server_channel, "rpc.slow")
        .serve(|body: Bytes| async move {
            // ---
            // First request is slow, later ones are instant.
            if body == "slow" {
                sleep(Duration::from_millis(300)).await;
            }
            Ok(body)
        })
        .await?;

    let client = RpcClient::new(broker.open_session().into_channel(), "rpc.slow").await?;

    let err = client
        .call_with_timeout(Bytes::from("slow"), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(client.outstanding_calls(), 0);

    // Let the late reply land; it must be discarded without fuss.
    sleep(Duration::from_millis(400)).await;

    let reply = client
        .call_with_timeout(Bytes::from("quick"), Duration::from_secs(2))
        .await?;
    assert_eq!(reply, "quick");
    Ok(())
}

#[tokio::test]
async fn test_handler_fault_is_acked_without_reply() -> Result<()> {
    // ---
    let broker = Broker::new();

    // A typed server: a request that fails to deserialize is a handler
    // fault, acked with no reply published.
    let server_session = broker.open_session();
    let _server = RpcServer::new(server_session.clone().into_channel(), "rpc.typed")
        .serve_typed(|req: SquareRequest| async move {
            Ok(SquareResponse {
                square: req.n * req.n,
            })
        })
        .await?;

    let client = RpcClient::new(broker.open_session().into_channel(), "rpc.typed").await?;

    let err = client
        .call_with_timeout(Bytes::from("this is not json"), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // The poisoned request was acked, not requeued: the queue drains and
    // a well-formed call still succeeds.
    let resp: SquareResponse = client.call_typed(&SquareRequest { n: 3 }).await?;
    assert_eq!(resp.square, 9);

    let info = server_session
        .declare_queue("rpc.typed", mom_broker::QueueOptions::default())
        .await?;
    assert_eq!(info.message_count, 0);
    Ok(())
}
