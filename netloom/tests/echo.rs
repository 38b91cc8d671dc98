//! Integration tests for the engine over real sockets

use netloom::codec::{
    LengthFieldDecoder, LengthFieldEncoder, LengthWidth, LineCodec, StringDecoder, StringEncoder,
};
use netloom::prelude::*;

use bytes::Bytes;
use flume::Sender;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct Echo;

impl ChannelHandler for Echo {
    type Message = String;

    fn on_message(&mut self, channel: &Channel, line: String) -> Result<(), HandlerError> {
        channel.write_and_flush(Box::new(line))?;
        Ok(())
    }
}

struct Forward<T> {
    tx: Sender<T>,
}

impl<T: Send + 'static> ChannelHandler for Forward<T> {
    type Message = T;

    fn on_message(&mut self, _channel: &Channel, msg: T) -> Result<(), HandlerError> {
        let _ = self.tx.send(msg);
        Ok(())
    }
}

fn engine() -> Engine {
    netloom::dev_tracing::init_tracing();
    Engine::start(
        EngineOptions::small()
            .with_boss_threads(2)
            .with_worker_threads(2)
            .with_arena_capacity(4 * 1024 * 1024),
    )
    .unwrap()
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn line_server(engine: &Engine) -> ServerHandle {
    engine
        .bind(loopback(), |pipeline| {
            pipeline
                .add_decoder("framer", LineCodec::Lf.decoder(1024))?
                .add_inbound("text", StringDecoder::new())?
                .add_encoder("text-out", StringEncoder::with_terminator(b"\n"))?
                .add_handler("echo", Echo)?;
            Ok(())
        })
        .unwrap()
}

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_line_echo_over_tcp() {
    let engine = engine();
    let server = line_server(&engine);
    let mut stream = client(server.local_addr());

    // Second line arrives split across two writes.
    stream.write_all(b"hello\nwor").unwrap();
    stream.write_all(b"ld\n").unwrap();

    let mut echoed = [0u8; 12];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello\nworld\n");

    engine.shutdown();
}

#[test]
fn test_peer_eof_closes_the_channel_and_returns_pages() {
    let engine = engine();
    let monitor = engine.monitor();
    let server = line_server(&engine);

    let mut stream = client(server.local_addr());
    stream.write_all(b"ping\n").unwrap();
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(engine.channels().len(), 1);
    drop(stream);

    assert!(matches!(
        monitor.recv_timeout(WAIT).unwrap(),
        EngineEvent::Listening(addr) if addr == server.local_addr()
    ));
    let accepted = match monitor.recv_timeout(WAIT).unwrap() {
        EngineEvent::Accepted { channel, .. } => channel,
        other => panic!("unexpected event {other}"),
    };
    assert_eq!(monitor.recv_timeout(WAIT).unwrap(), EngineEvent::Closed(accepted));

    wait_until(|| engine.channels().is_empty());
    wait_until(|| engine.arena().stats().outstanding == 0);

    engine.shutdown();
}

#[test]
fn test_engine_client_talks_to_engine_server() {
    let engine = engine();
    let server = engine
        .bind(loopback(), |pipeline| {
            pipeline
                .add_decoder("framer", LengthFieldDecoder::new(LengthWidth::U32, 1 << 20))?
                .add_outbound("framer-out", LengthFieldEncoder::new(LengthWidth::U32))?
                .add_handler("echo", EchoBytes)?;
            Ok(())
        })
        .unwrap();

    let (tx, rx) = flume::unbounded::<Bytes>();
    let channel = engine
        .connect(server.local_addr(), move |pipeline| {
            pipeline
                .add_decoder("framer", LengthFieldDecoder::new(LengthWidth::U32, 1 << 20))?
                .add_outbound("framer-out", LengthFieldEncoder::new(LengthWidth::U32))?
                .add_handler("sink", Forward { tx: tx.clone() })?;
            Ok(())
        })
        .unwrap();
    assert_eq!(channel.remote_addr(), Some(server.local_addr()));

    let big = Bytes::from(vec![7u8; 20_000]);
    channel.write_and_flush(Box::new(Bytes::from_static(b"first"))).unwrap();
    channel.write_and_flush(Box::new(big.clone())).unwrap();
    channel.write_and_flush(Box::new(Bytes::new())).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Bytes::from_static(b"first"));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), big);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Bytes::new());

    // Client and accepted server channel.
    assert_eq!(engine.channels().len(), 2);
    channel.close();
    wait_until(|| engine.channels().is_empty());

    engine.shutdown();
}

struct EchoBytes;

impl ChannelHandler for EchoBytes {
    type Message = Bytes;

    fn on_message(&mut self, channel: &Channel, frame: Bytes) -> Result<(), HandlerError> {
        channel.write_and_flush(Box::new(frame))?;
        Ok(())
    }
}

#[test]
fn test_connect_failure_is_reported() {
    let engine = engine();
    let monitor = engine.monitor();
    // Bind and drop to find a port nobody listens on.
    let addr = std::net::TcpListener::bind(loopback())
        .unwrap()
        .local_addr()
        .unwrap();

    let err = engine.connect(addr, |_| Ok(())).unwrap_err();

    assert!(matches!(err, EngineError::Io(_)), "{err}");
    let event = monitor.recv_timeout(WAIT).unwrap();
    assert!(matches!(event, EngineEvent::ConnectFailed { addr: failed, .. } if failed == addr));
    engine.shutdown();
}

#[test]
fn test_initializer_errors_refuse_the_connection() {
    let engine = engine();
    let server = engine
        .bind(loopback(), |pipeline| {
            pipeline
                .add_handler("same", Echo)?
                .add_handler("same", Echo)?;
            Ok(())
        })
        .unwrap();

    let mut stream = client(server.local_addr());
    let mut buf = [0u8; 1];
    // The accepted socket is dropped without a channel.
    assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
    assert!(engine.channels().is_empty());
    engine.shutdown();
}

#[test]
fn test_shutdown_closes_open_connections() {
    let engine = engine();
    let server = line_server(&engine);
    let mut streams: Vec<TcpStream> = (0..4).map(|_| client(server.local_addr())).collect();
    for stream in &mut streams {
        stream.write_all(b"up\n").unwrap();
        let mut echoed = [0u8; 3];
        stream.read_exact(&mut echoed).unwrap();
    }
    assert_eq!(engine.channels().len(), 4);

    engine.shutdown();

    assert!(engine.channels().is_empty());
    for stream in &mut streams {
        let mut buf = [0u8; 8];
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
    }
}
