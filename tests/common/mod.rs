//! Shared scaffolding for the integration tests: two test message
//! namespaces with hand-rolled codecs, a small harness that spawns servers
//! and clients under one cancellation token, and bag-of-messages assertions
//! on the application receive channel.
#![allow(dead_code)]

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{prelude::*, EnvFilter};

use wave::{run_server, AnyMessage, Client, ServerConfig};

pub const MAX_MESSAGE_SIZE: u64 = 1024;

pub fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

macro_rules! test_wire_namespace {
    ($name:ident) => {
        pub mod $name {
            use std::any::Any;

            use wave::proto::{get_uvarint, put_uvarint, uvarint_len, DecodeError, MessageId};
            use wave::{AnyMessage, CodecError};

            /// String-valued test message.
            #[derive(Debug, Clone, Default, PartialEq, Eq)]
            pub struct Msg1 {
                pub value: String,
            }

            /// Integer-valued test message.
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
            pub struct Msg2 {
                pub value: u64,
            }

            pub struct Codec;

            impl wave::Codec for Codec {
                fn id(&self, message: &(dyn Any + Send + Sync)) -> Result<MessageId, CodecError> {
                    if message.is::<Msg1>() {
                        Ok(MessageId(1))
                    } else if message.is::<Msg2>() {
                        Ok(MessageId(2))
                    } else {
                        Err(CodecError::UnsupportedMessage)
                    }
                }

                fn size(&self, message: &(dyn Any + Send + Sync)) -> Result<u64, CodecError> {
                    if let Some(message) = message.downcast_ref::<Msg1>() {
                        let len = message.value.len() as u64;
                        Ok(uvarint_len(len) as u64 + len)
                    } else if let Some(message) = message.downcast_ref::<Msg2>() {
                        Ok(uvarint_len(message.value) as u64)
                    } else {
                        Err(CodecError::UnsupportedMessage)
                    }
                }

                fn marshal(
                    &self,
                    message: &(dyn Any + Send + Sync),
                    buf: &mut [u8],
                ) -> Result<(MessageId, usize), CodecError> {
                    let mut at = 0;
                    if let Some(message) = message.downcast_ref::<Msg1>() {
                        put_uvarint(buf, &mut at, message.value.len() as u64);
                        buf[at..at + message.value.len()].copy_from_slice(message.value.as_bytes());
                        at += message.value.len();
                        Ok((MessageId(1), at))
                    } else if let Some(message) = message.downcast_ref::<Msg2>() {
                        put_uvarint(buf, &mut at, message.value);
                        Ok((MessageId(2), at))
                    } else {
                        Err(CodecError::UnsupportedMessage)
                    }
                }

                fn unmarshal(&self, id: MessageId, buf: &[u8]) -> Result<(AnyMessage, usize), CodecError> {
                    let mut at = 0;
                    match id {
                        MessageId(1) => {
                            let len = get_uvarint(buf, &mut at)? as usize;
                            let bytes = buf.get(at..at + len).ok_or(DecodeError::UnexpectedEnd)?;
                            at += len;
                            let value = String::from_utf8_lossy(bytes).into_owned();
                            Ok((Box::new(Msg1 { value }), at))
                        }
                        MessageId(2) => {
                            let value = get_uvarint(buf, &mut at)?;
                            Ok((Box::new(Msg2 { value }), at))
                        }
                        _ => Err(CodecError::UnknownMessageId(id)),
                    }
                }
            }
        }
    };
}

test_wire_namespace!(wire1);
test_wire_namespace!(wire2);

/// Renders a received message for bag comparison in assertions.
pub fn describe(message: &AnyMessage) -> String {
    if let Some(message) = message.downcast_ref::<wire1::Msg1>() {
        format!("wire1::Msg1({:?})", message.value)
    } else if let Some(message) = message.downcast_ref::<wire1::Msg2>() {
        format!("wire1::Msg2({})", message.value)
    } else if let Some(message) = message.downcast_ref::<wire2::Msg1>() {
        format!("wire2::Msg1({:?})", message.value)
    } else if let Some(message) = message.downcast_ref::<wire2::Msg2>() {
        format!("wire2::Msg2({})", message.value)
    } else {
        "unexpected message type".to_owned()
    }
}

pub async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Spawned servers and clients of one test, torn down together.
pub struct TestNet {
    pub cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<wave::Result<()>>)>,
}

impl TestNet {
    pub fn new() -> Self {
        setup_logging();
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn spawn_server(&mut self, listener: TcpListener, servers: Vec<String>) {
        let cancel = self.cancel.clone();
        let config = ServerConfig {
            servers,
            max_message_size: MAX_MESSAGE_SIZE,
        };
        self.tasks
            .push(("server", tokio::spawn(run_server(cancel, listener, config))));
    }

    pub fn spawn_client(&mut self, client: Client) {
        let cancel = self.cancel.clone();
        self.tasks.push((
            "client",
            tokio::spawn(async move { client.run(cancel).await }),
        ));
    }

    /// Cancels everything and asserts that every task wound down cleanly.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, task) in self.tasks {
            let result = timeout(Duration::from_secs(5), task)
                .await
                .unwrap_or_else(|_| panic!("{name} did not stop after cancellation"))
                .expect("task panicked");
            if let Err(err) = result {
                panic!("{name} failed: {err}");
            }
        }
    }
}

/// Receives exactly `expected` (as an unordered bag) and then asserts the
/// channel stays quiet.
pub async fn expect_messages(recv: &mut mpsc::Receiver<AnyMessage>, expected: &[&str]) {
    let mut received = Vec::new();
    for _ in 0..expected.len() {
        match timeout(Duration::from_secs(5), recv.recv()).await {
            Ok(Some(message)) => received.push(describe(&message)),
            Ok(None) => panic!("receive channel closed while waiting for {expected:?}"),
            Err(_) => panic!(
                "timed out waiting for {expected:?}, received so far: {received:?}"
            ),
        }
    }
    let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    expected.sort();
    received.sort();
    assert_eq!(received, expected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    match recv.try_recv() {
        Err(mpsc::error::TryRecvError::Empty) => {}
        Ok(message) => panic!("unexpected extra message: {}", describe(&message)),
        Err(mpsc::error::TryRecvError::Disconnected) => panic!("receive channel closed"),
    }
}
