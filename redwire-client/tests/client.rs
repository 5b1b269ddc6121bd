use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use redwire_client::{
    ClientConfig, ClientError, Command, ConnectionState, RespValue, SyncClient, TimeoutKind,
};
use redwire_common::encode_reply;

struct ServerConn {
    reader: BufReader<TcpStream>,
    stream: TcpStream,
}

impl ServerConn {
    fn expect(&mut self, expected: &[&str]) {
        let args = read_command(&mut self.reader).expect("read command");
        let expected: Vec<Vec<u8>> = expected.iter().map(|arg| arg.as_bytes().to_vec()).collect();
        assert_eq!(args, expected);
    }

    fn reply(&mut self, value: RespValue) {
        let mut out = Vec::new();
        encode_reply(&value, &mut out);
        self.raw(&out);
    }

    fn raw(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes);
        let _ = self.stream.flush();
    }
}

fn spawn_server<F>(script: F) -> (String, thread::JoinHandle<()>)
where
    F: FnOnce(&mut ServerConn) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let reader = BufReader::new(stream.try_clone().expect("clone"));
        let mut conn = ServerConn { reader, stream };
        script(&mut conn);
    });

    (addr, handle)
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn push(parts: &[&str]) -> RespValue {
    RespValue::Array(parts.iter().map(|part| RespValue::from(*part)).collect())
}

fn client_with_addr(addr: String) -> SyncClient {
    let config = ClientConfig::new(addr)
        .with_connect_timeout(Duration::from_secs(1))
        .with_command_timeout(Duration::from_secs(1));
    let mut client = SyncClient::with_config(config).expect("client");
    client.install_error_handler(|_: &ClientError| {});
    client
}

#[test]
fn client_set_get_roundtrip() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["SET", "key", "value"]);
        conn.raw(b"+OK\r\n");
        conn.expect(&["GET", "key"]);
        conn.raw(b"$5\r\nvalue\r\n");
        conn.expect(&["GET", "missing"]);
        conn.raw(b"$-1\r\n");
    });

    let mut client = client_with_addr(addr);
    let ok = client
        .command(Command::new("SET").arg("key").arg("value"))
        .expect("set");
    assert_eq!(ok.to_string_lossy(), "OK");
    let value = client.command(Command::new("GET").arg("key")).expect("get");
    assert_eq!(value.as_bytes(), b"value");
    let missing = client.command(Command::new("GET").arg("missing")).expect("get");
    assert!(missing.is_null());
    server.join().expect("server");
}

#[test]
fn server_error_reply_is_returned_as_value() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["LPUSH", "key", "x"]);
        conn.raw(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n");
        conn.expect(&["PING"]);
        conn.raw(b"+PONG\r\n");
    });

    let mut client = client_with_addr(addr);
    let reply = client
        .command(Command::new("LPUSH").arg("key").arg("x"))
        .expect("lpush");
    assert!(reply.is_error());
    assert!(reply.to_string_lossy().starts_with("WRONGTYPE"));
    assert!(client.is_connected());
    assert_eq!(client.command(Command::new("PING")).expect("ping"), RespValue::from("PONG"));
    server.join().expect("server");
}

#[test]
fn pipelined_replies_split_across_writes() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["SET", "a", "1"]);
        conn.expect(&["INCR", "a"]);
        conn.expect(&["GET", "a"]);
        // One byte at a time to exercise every chunk boundary.
        for byte in b"+OK\r\n:2\r\n$1\r\n2\r\n" {
            conn.raw(&[*byte]);
        }
    });

    let mut client = client_with_addr(addr);
    let reply = client
        .pipelined(vec![
            Command::new("SET").arg("a").arg("1"),
            Command::new("INCR").arg("a"),
            Command::new("GET").arg("a"),
        ])
        .expect("pipeline");
    assert_eq!(
        reply,
        RespValue::Array(vec!["OK".into(), RespValue::Integer(2), "2".into()])
    );
    server.join().expect("server");
}

#[test]
fn subscribe_receives_messages_between_replies() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["SUBSCRIBE", "news"]);
        conn.reply(RespValue::Array(vec!["subscribe".into(), "news".into(), RespValue::Integer(1)]));
        conn.expect(&["PING"]);
        conn.reply(push(&["message", "news", "first"]));
        conn.reply(push(&["message", "other", "ignored"]));
        conn.raw(b"+PONG\r\n");
        conn.reply(push(&["message", "news", "second"]));
        conn.expect(&["UNSUBSCRIBE", "news"]);
        conn.reply(RespValue::Array(vec!["unsubscribe".into(), "news".into(), RespValue::Integer(0)]));
    });

    let mut client = client_with_addr(addr);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = client
        .subscribe("news", move |payload: &[u8]| sink.lock().unwrap().push(payload.to_vec()))
        .expect("subscribe");
    assert_eq!(client.state(), ConnectionState::Subscribed);

    let pong = client.command(Command::new("PING")).expect("ping");
    assert_eq!(pong, RespValue::from("PONG"));
    // "second" may already have arrived in the same read as the PONG.
    assert_eq!(seen.lock().unwrap()[0], b"first".to_vec());

    client.read_messages(Duration::from_millis(200)).expect("read");
    assert_eq!(*seen.lock().unwrap(), vec![b"first".to_vec(), b"second".to_vec()]);

    let ack = client.unsubscribe(&handle).expect("unsubscribe");
    assert_eq!(ack.to_array().len(), 3);
    assert_eq!(client.state(), ConnectionState::Connected);
    server.join().expect("server");
}

#[test]
fn data_command_while_subscribed_is_rejected_locally() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["PSUBSCRIBE", "n*"]);
        conn.reply(RespValue::Array(vec!["psubscribe".into(), "n*".into(), RespValue::Integer(1)]));
        conn.expect(&["PUBLISH", "news", "hello"]);
        conn.raw(b":0\r\n");
    });

    let mut client = client_with_addr(addr);
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    client.install_error_handler(move |err: &ClientError| sink.lock().unwrap().push(err.to_string()));
    client.psubscribe("n*", |_: &[u8]| {}).expect("psubscribe");

    let err = client.command(Command::new("GET").arg("k")).unwrap_err();
    assert!(matches!(
        err,
        ClientError::InvalidState { state: ConnectionState::Subscribed, .. }
    ));
    assert_eq!(reported.lock().unwrap().len(), 1);

    let receivers = client.publish("news", "hello").expect("publish");
    assert_eq!(receivers.to_int(), 0);
    server.join().expect("server");
}

#[test]
fn single_shot_subscription_fires_once() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["SUBSCRIBE", "once"]);
        conn.reply(RespValue::Array(vec!["subscribe".into(), "once".into(), RespValue::Integer(1)]));
        conn.reply(push(&["message", "once", "1"]));
        conn.reply(push(&["message", "once", "2"]));
        conn.expect(&["UNSUBSCRIBE", "once"]);
        conn.reply(RespValue::Array(vec!["unsubscribe".into(), "once".into(), RespValue::Integer(0)]));
        conn.expect(&["PING"]);
        conn.raw(b"+PONG\r\n");
    });

    let mut client = client_with_addr(addr);
    let count = Arc::new(Mutex::new(0));
    let sink = count.clone();
    client
        .single_shot_subscribe("once", move |_: &[u8]| *sink.lock().unwrap() += 1)
        .expect("subscribe");

    client.read_messages(Duration::from_millis(100)).expect("read");
    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.command(Command::new("PING")).expect("ping"), RespValue::from("PONG"));
    server.join().expect("server");
}

#[test]
fn silent_server_times_out_without_closing() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["GET", "slow"]);
        thread::sleep(Duration::from_millis(300));
        conn.raw(b"$4\r\nlate\r\n");
        conn.expect(&["PING"]);
        conn.raw(b"+PONG\r\n");
    });

    let config = ClientConfig::new(addr).with_command_timeout(Duration::from_millis(100));
    let mut client = SyncClient::with_config(config).expect("client");
    client.install_error_handler(|_: &ClientError| {});

    let err = client.command(Command::new("GET").arg("slow")).unwrap_err();
    assert!(matches!(err, ClientError::Timeout(TimeoutKind::Command)));
    assert!(client.is_connected());

    thread::sleep(Duration::from_millis(300));
    assert_eq!(client.command(Command::new("PING")).expect("ping"), RespValue::from("PONG"));
    server.join().expect("server");
}

#[test]
fn server_close_is_io_error_and_closes() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["GET", "k"]);
    });

    let mut client = client_with_addr(addr);
    let err = client.command(Command::new("GET").arg("k")).unwrap_err();
    assert!(matches!(err, ClientError::Io(_)));
    assert_eq!(client.state(), ConnectionState::Closed);
    server.join().expect("server");
}

#[test]
fn malformed_reply_is_protocol_error() {
    let (addr, server) = spawn_server(|conn| {
        conn.expect(&["GET", "k"]);
        conn.raw(b"!garbage\r\n");
    });

    let mut client = client_with_addr(addr);
    let err = client.command(Command::new("GET").arg("k")).unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)));
    assert_eq!(client.state(), ConnectionState::Closed);
    server.join().expect("server");
}

#[test]
fn refused_connect_leaves_client_unconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let mut client = SyncClient::new(
        ClientConfig::new(addr).with_connect_timeout(Duration::from_millis(200)),
    );
    client.install_error_handler(|_: &ClientError| {});
    let err = client.connect().unwrap_err();
    assert!(matches!(err, ClientError::Io(_) | ClientError::Timeout(TimeoutKind::Connect)));
    assert_eq!(client.state(), ConnectionState::Unconnected);
}

#[test]
fn invalid_address_is_rejected() {
    let err = SyncClient::open("not-an-address").err().expect("error");
    assert!(matches!(err, ClientError::InvalidAddress(_)));
}
