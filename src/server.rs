//! TCP runner for engine connections.
//!
//! Accepts client connections, greets each with a `Welcome`, reads
//! `FromClient` frames and dispatches them to a per-connection engine.
//!
//! Flow control follows the Gabriel token scheme: a client holds `tokens`
//! tokens, spends one per frame and gets it back with that frame's
//! response. Frames sent without a token are answered with `NO_TOKENS`.
//! Engine calls run on the blocking pool, at most `workers` at a time
//! across all connections.

use crate::config::Config;
use crate::engine::{Engine, EngineFactory};
use crate::frame::{read_message, write_message};
use crate::protocol::result_wrapper::Status;
use crate::protocol::{create_result_wrapper, FromClient, InputFrame, ResultWrapper, ToClient};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 1024;

/// Read buffer size
const BUFFER_SIZE: usize = 64 * 1024;

/// State shared by every connection.
struct Shared {
    source: String,
    tokens: usize,
    timeout: Duration,
    max_frame_size: usize,
    factory: EngineFactory,
    workers: Arc<Semaphore>,
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(config: &Config, factory: EngineFactory) -> io::Result<Self> {
        let addr = tokio::net::lookup_host(config.listen.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for '{}'", config.listen),
                )
            })?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;

        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                source: config.source.clone(),
                tokens: config.tokens,
                timeout: config.timeout,
                max_frame_size: config.max_frame_size,
                factory,
                workers: Arc::new(Semaphore::new(config.workers)),
            }),
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!(address = %self.local_addr()?, source = %self.shared.source, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let shared = Arc::clone(&self.shared);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, shared).await {
                            warn!(peer = %addr, error = %e, "Connection error");
                        }
                        debug!(peer = %addr, "Connection closed");
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Bind and serve with the given engine factory.
pub async fn run(config: Config, factory: EngineFactory) -> Result<(), Box<dyn std::error::Error>> {
    Server::bind(&config, factory).await?.run().await
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Handle a single client connection
async fn handle_connection<S>(
    stream: S,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let num_tokens = i32::try_from(shared.tokens).unwrap_or(i32::MAX);
    let welcome = ToClient::welcome(vec![shared.source.clone()], num_tokens);
    write_message(&mut writer, &welcome).await?;

    // Responses from concurrent frames are serialized through one writer task.
    let (tx, mut rx) = mpsc::channel::<ToClient>(shared.tokens.saturating_add(1));
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            write_message(&mut writer, &message).await?;
        }
        writer.shutdown().await
    });

    let engine: Arc<dyn Engine> = Arc::from((shared.factory)());
    let tokens = Arc::new(Semaphore::new(shared.tokens));
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    let read_result = loop {
        let from_client: FromClient =
            match read_message(&mut reader, &mut buffer, shared.max_frame_size).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    trace!("Connection closed by client");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

        let frame_id = from_client.frame_id;
        trace!(frame_id, source = %from_client.source_name, "Received frame");

        if from_client.source_name != shared.source {
            warn!(frame_id, source = %from_client.source_name, "Frame for unknown source");
            let response = reject(&from_client.source_name, frame_id, Status::UnspecifiedError);
            if tx.send(response).await.is_err() {
                break Ok(());
            }
            continue;
        }

        let input_frame = match from_client.input_frame {
            Some(input_frame) => input_frame,
            None => {
                warn!(frame_id, "Frame without input");
                let response = reject(&shared.source, frame_id, Status::WrongInputFormat);
                if tx.send(response).await.is_err() {
                    break Ok(());
                }
                continue;
            }
        };

        let token = match Arc::clone(&tokens).try_acquire_owned() {
            Ok(token) => token,
            Err(_) => {
                debug!(frame_id, "Client sent frame without a token");
                let response = reject(&shared.source, frame_id, Status::NoTokens);
                if tx.send(response).await.is_err() {
                    break Ok(());
                }
                continue;
            }
        };

        let shared = Arc::clone(&shared);
        let engine = Arc::clone(&engine);
        let tx = tx.clone();
        tokio::spawn(async move {
            let wrapper = process_frame(&shared, engine, frame_id, input_frame).await;
            let response = ToClient::response(&shared.source, frame_id, true, wrapper);
            if tx.send(response).await.is_err() {
                debug!(frame_id, "Connection gone before response was sent");
            }
            drop(token);
        });
    };

    // In-flight frames hold their own senders; the writer drains them before exiting.
    drop(tx);
    writer_task.await??;
    read_result?;
    Ok(())
}

/// Run the engine on one frame and turn faults into status codes.
async fn process_frame(
    shared: &Shared,
    engine: Arc<dyn Engine>,
    frame_id: i64,
    input_frame: InputFrame,
) -> ResultWrapper {
    let worker = match Arc::clone(&shared.workers).acquire_owned().await {
        Ok(worker) => worker,
        Err(_) => return create_result_wrapper(Status::ServerDroppedFrame),
    };

    // The worker slot stays taken until the engine returns, even after a timeout.
    let job = tokio::task::spawn_blocking(move || {
        let _worker = worker;
        engine.handle(input_frame)
    });

    match tokio::time::timeout(shared.timeout, job).await {
        Ok(Ok(Ok(wrapper))) => {
            trace!(frame_id, status = ?wrapper.status(), results = wrapper.results.len(), "Frame processed");
            wrapper
        }
        Ok(Ok(Err(e))) => {
            error!(frame_id, error = %e, "Engine fault");
            create_result_wrapper(Status::EngineError)
        }
        Ok(Err(e)) => {
            error!(frame_id, error = %e, "Engine panicked");
            create_result_wrapper(Status::EngineError)
        }
        Err(_) => {
            warn!(frame_id, timeout_ms = shared.timeout.as_millis() as u64, "Engine timed out");
            create_result_wrapper(Status::ServerDroppedFrame)
        }
    }
}

/// Response for a frame that never reached the engine; the token is not returned.
fn reject(source_name: &str, frame_id: i64, status: Status) -> ToClient {
    ToClient::response(source_name, frame_id, false, create_result_wrapper(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CrashEngine, EngineError, RoundTripEngine};
    use crate::engine::test_support::{png_bytes, two_block_image};
    use crate::protocol::to_client::{Response, Welcome, WelcomeOrResponse};
    use crate::protocol::PayloadType;
    use std::time::Instant;
    use tokio::net::TcpStream;

    const MAX_FRAME: usize = 1024 * 1024;

    struct FaultEngine;

    impl Engine for FaultEngine {
        fn handle(&self, _input_frame: InputFrame) -> Result<ResultWrapper, EngineError> {
            Err(EngineError::Deliberate)
        }
    }

    struct PanicEngine;

    impl Engine for PanicEngine {
        fn handle(&self, _input_frame: InputFrame) -> Result<ResultWrapper, EngineError> {
            panic!("engine blew up");
        }
    }

    struct SlowEngine(Duration);

    impl Engine for SlowEngine {
        fn handle(&self, input_frame: InputFrame) -> Result<ResultWrapper, EngineError> {
            std::thread::sleep(self.0);
            RoundTripEngine.handle(input_frame)
        }
    }

    fn engine_factory<E, F>(make: F) -> EngineFactory
    where
        E: Engine + 'static,
        F: Fn() -> E + Send + Sync + 'static,
    {
        Arc::new(move || -> Box<dyn Engine> { Box::new(make()) })
    }

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        }
    }

    async fn start_server(config: Config, factory: EngineFactory) -> SocketAddr {
        let server = Server::bind(&config, factory).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        addr
    }

    async fn start(config: Config, factory: EngineFactory) -> TcpStream {
        let addr = start_server(config, factory).await;
        TcpStream::connect(addr).await.unwrap()
    }

    fn image_frame(frame_id: i64, payload: &[u8]) -> FromClient {
        FromClient {
            frame_id,
            source_name: "roundtrip".to_string(),
            input_frame: Some(InputFrame::new(PayloadType::Image, vec![payload.to_vec()])),
        }
    }

    async fn expect_welcome(stream: &mut TcpStream, buffer: &mut BytesMut) -> Welcome {
        let message: ToClient = read_message(stream, buffer, MAX_FRAME).await.unwrap().unwrap();
        match message.welcome_or_response {
            Some(WelcomeOrResponse::Welcome(welcome)) => welcome,
            other => panic!("expected welcome, got {:?}", other),
        }
    }

    async fn expect_response(stream: &mut TcpStream, buffer: &mut BytesMut) -> Response {
        let message: ToClient = read_message(stream, buffer, MAX_FRAME).await.unwrap().unwrap();
        match message.welcome_or_response {
            Some(WelcomeOrResponse::Response(response)) => response,
            other => panic!("expected response, got {:?}", other),
        }
    }

    fn status_of(response: &Response) -> Status {
        response.result_wrapper.as_ref().unwrap().status()
    }

    #[tokio::test]
    async fn test_welcome_then_round_trip() {
        let mut stream = start(test_config(), engine_factory(|| RoundTripEngine)).await;
        let mut buffer = BytesMut::new();

        let welcome = expect_welcome(&mut stream, &mut buffer).await;
        assert_eq!(welcome.sources_consumed, vec!["roundtrip".to_string()]);
        assert_eq!(welcome.num_tokens_per_source, 2);

        write_message(&mut stream, &image_frame(1, b"jpeg bytes")).await.unwrap();
        let response = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(response.frame_id, 1);
        assert_eq!(response.source_name, "roundtrip");
        assert!(response.return_token);
        assert_eq!(status_of(&response), Status::Success);
        assert_eq!(
            response.result_wrapper.unwrap().results[0].payload,
            b"jpeg bytes"
        );
    }

    #[tokio::test]
    async fn test_engine_fault_reported() {
        let mut stream = start(test_config(), engine_factory(|| FaultEngine)).await;
        let mut buffer = BytesMut::new();
        expect_welcome(&mut stream, &mut buffer).await;

        write_message(&mut stream, &image_frame(7, b"x")).await.unwrap();
        let response = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(response.frame_id, 7);
        assert!(response.return_token);
        assert_eq!(status_of(&response), Status::EngineError);

        // The connection keeps serving after a fault.
        write_message(&mut stream, &image_frame(8, b"y")).await.unwrap();
        let response = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(response.frame_id, 8);
        assert_eq!(status_of(&response), Status::EngineError);
    }

    #[tokio::test]
    async fn test_engine_panic_reported() {
        let mut stream = start(test_config(), engine_factory(|| PanicEngine)).await;
        let mut buffer = BytesMut::new();
        expect_welcome(&mut stream, &mut buffer).await;

        write_message(&mut stream, &image_frame(3, b"x")).await.unwrap();
        let response = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(status_of(&response), Status::EngineError);
    }

    #[tokio::test]
    async fn test_unknown_source_rejected() {
        let mut stream = start(test_config(), engine_factory(|| RoundTripEngine)).await;
        let mut buffer = BytesMut::new();
        expect_welcome(&mut stream, &mut buffer).await;

        let mut frame = image_frame(4, b"x");
        frame.source_name = "elsewhere".to_string();
        write_message(&mut stream, &frame).await.unwrap();

        let response = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(response.frame_id, 4);
        assert_eq!(response.source_name, "elsewhere");
        assert!(!response.return_token);
        assert_eq!(status_of(&response), Status::UnspecifiedError);
    }

    #[tokio::test]
    async fn test_missing_input_frame_rejected() {
        let mut stream = start(test_config(), engine_factory(|| RoundTripEngine)).await;
        let mut buffer = BytesMut::new();
        expect_welcome(&mut stream, &mut buffer).await;

        let mut frame = image_frame(5, b"x");
        frame.input_frame = None;
        write_message(&mut stream, &frame).await.unwrap();

        let response = expect_response(&mut stream, &mut buffer).await;
        assert!(!response.return_token);
        assert_eq!(status_of(&response), Status::WrongInputFormat);
    }

    #[tokio::test]
    async fn test_frame_without_token_rejected() {
        let config = Config {
            tokens: 1,
            ..test_config()
        };
        let slow = Duration::from_millis(300);
        let mut stream = start(config, engine_factory(move || SlowEngine(slow))).await;
        let mut buffer = BytesMut::new();
        expect_welcome(&mut stream, &mut buffer).await;

        write_message(&mut stream, &image_frame(1, b"a")).await.unwrap();
        write_message(&mut stream, &image_frame(2, b"b")).await.unwrap();

        let first = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(first.frame_id, 2);
        assert!(!first.return_token);
        assert_eq!(status_of(&first), Status::NoTokens);

        let second = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(second.frame_id, 1);
        assert!(second.return_token);
        assert_eq!(status_of(&second), Status::Success);
    }

    #[tokio::test]
    async fn test_timeout_drops_frame() {
        let config = Config {
            timeout: Duration::from_millis(50),
            ..test_config()
        };
        let slow = Duration::from_millis(300);
        let mut stream = start(config, engine_factory(move || SlowEngine(slow))).await;
        let mut buffer = BytesMut::new();
        expect_welcome(&mut stream, &mut buffer).await;

        write_message(&mut stream, &image_frame(9, b"a")).await.unwrap();
        let response = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(response.frame_id, 9);
        assert!(response.return_token);
        assert_eq!(status_of(&response), Status::ServerDroppedFrame);
    }

    #[tokio::test]
    async fn test_invalid_header_closes_connection() {
        let config = test_config();
        let shared = Arc::new(Shared {
            source: config.source.clone(),
            tokens: config.tokens,
            timeout: config.timeout,
            max_frame_size: MAX_FRAME,
            factory: engine_factory(|| RoundTripEngine),
            workers: Arc::new(Semaphore::new(config.workers)),
        });
        let (mut client, server_side) = tokio::io::duplex(4096);
        let connection = tokio::spawn(handle_connection(server_side, shared));

        let mut buffer = BytesMut::new();
        let welcome: ToClient = read_message(&mut client, &mut buffer, MAX_FRAME)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            welcome.welcome_or_response,
            Some(WelcomeOrResponse::Welcome(_))
        ));

        client.write_all(b"garbage\r\n").await.unwrap();
        assert!(connection.await.unwrap().is_err());

        let eof: Option<ToClient> = read_message(&mut client, &mut buffer, MAX_FRAME).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_welcome_token_count_fits_int32() {
        let config = Config {
            tokens: i32::MAX as usize + 1,
            ..test_config()
        };
        let mut stream = start(config, engine_factory(|| RoundTripEngine)).await;
        let mut buffer = BytesMut::new();

        let welcome = expect_welcome(&mut stream, &mut buffer).await;
        assert_eq!(welcome.num_tokens_per_source, i32::MAX);
    }

    #[tokio::test]
    async fn test_eof_waits_for_in_flight() {
        let slow = Duration::from_millis(200);
        let mut stream = start(test_config(), engine_factory(move || SlowEngine(slow))).await;
        let mut buffer = BytesMut::new();
        expect_welcome(&mut stream, &mut buffer).await;

        write_message(&mut stream, &image_frame(1, b"late")).await.unwrap();
        stream.shutdown().await.unwrap();

        let response = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(response.frame_id, 1);
        assert_eq!(status_of(&response), Status::Success);

        let eof: Option<ToClient> = read_message(&mut stream, &mut buffer, MAX_FRAME).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_workers_limit_engine_concurrency() {
        let config = Config {
            workers: 1,
            ..test_config()
        };
        let slow = Duration::from_millis(300);
        let addr = start_server(config, engine_factory(move || SlowEngine(slow))).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut first_buffer = BytesMut::new();
        let mut second_buffer = BytesMut::new();
        expect_welcome(&mut first, &mut first_buffer).await;
        expect_welcome(&mut second, &mut second_buffer).await;

        let started = Instant::now();
        write_message(&mut first, &image_frame(1, b"a")).await.unwrap();
        write_message(&mut second, &image_frame(2, b"b")).await.unwrap();

        let (a, b) = tokio::join!(
            expect_response(&mut first, &mut first_buffer),
            expect_response(&mut second, &mut second_buffer)
        );
        let elapsed = started.elapsed();

        assert_eq!(status_of(&a), Status::Success);
        assert_eq!(status_of(&b), Status::Success);
        assert!(elapsed >= slow * 2, "frames overlapped: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_crash_engine_reported_and_dumped() {
        let dir = tempfile::tempdir().unwrap();
        let dump_path = dir.path().join("rotated.jpg");
        let factory_path = dump_path.clone();
        let mut stream = start(
            test_config(),
            engine_factory(move || CrashEngine::new(95, factory_path.clone())),
        )
        .await;
        let mut buffer = BytesMut::new();
        expect_welcome(&mut stream, &mut buffer).await;

        let payload = png_bytes(&two_block_image());
        write_message(&mut stream, &image_frame(11, &payload)).await.unwrap();
        let response = expect_response(&mut stream, &mut buffer).await;
        assert_eq!(response.frame_id, 11);
        assert!(response.return_token);
        assert_eq!(status_of(&response), Status::EngineError);
        assert!(response.result_wrapper.unwrap().results.is_empty());

        let dumped = image::open(&dump_path).unwrap();
        assert_eq!((dumped.width(), dumped.height()), (8, 16));
    }
}
