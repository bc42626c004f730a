use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use lkv_client::{encode_value, read_reply, Arg, Client, ClientConfig, ClientError, Command, Value};

type Store = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

/// Loopback RESP2 peer with just enough commands for the client tests.
struct FakeServer {
    addr: String,
    accepted: Arc<AtomicUsize>,
}

fn spawn_server() -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let store: Store = Arc::new(Mutex::new(HashMap::new()));

    let counter = accepted.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let store = store.clone();
            thread::spawn(move || serve(stream, store));
        }
    });

    FakeServer { addr, accepted }
}

/// Accepts one connection, reads one request and answers with `reply` verbatim.
fn spawn_raw_server(reply: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut writer = stream.try_clone().expect("clone");
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        if read_request(&mut reader, &mut line).is_some() {
            let _ = writer.write_all(reply);
            let _ = writer.flush();
        }
    });

    addr
}

fn serve(stream: TcpStream, store: Store) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut writer = stream.try_clone().expect("clone");
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut queued: Option<Vec<Vec<Vec<u8>>>> = None;

    while let Some(args) = read_request(&mut reader, &mut line) {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let reply = match (name.as_str(), queued.is_some()) {
            ("MULTI", false) => {
                queued = Some(Vec::new());
                value_bytes(&Value::simple("OK"))
            }
            ("EXEC", true) => {
                let commands = queued.take().unwrap_or_default();
                let mut out = format!("*{}\r\n", commands.len()).into_bytes();
                for command in &commands {
                    out.extend_from_slice(&execute(command, &store));
                }
                out
            }
            ("DISCARD", true) => {
                queued = None;
                value_bytes(&Value::simple("OK"))
            }
            ("MULTI", true) => b"-ERR MULTI calls can not be nested\r\n".to_vec(),
            ("EXEC", false) | ("DISCARD", false) => b"-ERR without MULTI\r\n".to_vec(),
            (_, true) => {
                queued.get_or_insert_with(Vec::new).push(args);
                value_bytes(&Value::simple("QUEUED"))
            }
            (_, false) => execute(&args, &store),
        };
        if writer.write_all(&reply).and_then(|()| writer.flush()).is_err() {
            break;
        }
    }
}

fn execute(args: &[Vec<u8>], store: &Store) -> Vec<u8> {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let mut store = store.lock().expect("store");
    match (name.as_str(), args.len()) {
        ("PING", 1) => value_bytes(&Value::simple("PONG")),
        ("PING", 2) => value_bytes(&Value::bulk(args[1].clone())),
        ("SET", 3) => {
            store.insert(args[1].clone(), args[2].clone());
            value_bytes(&Value::simple("OK"))
        }
        ("GET", 2) => match store.get(&args[1]) {
            Some(value) => value_bytes(&Value::bulk(value.clone())),
            None => value_bytes(&Value::BulkString(None)),
        },
        ("DEL", 2) => {
            let removed = store.remove(&args[1]).is_some() as i64;
            value_bytes(&Value::Integer(removed))
        }
        ("INCR", 2) => {
            let current = store.get(&args[1]).cloned().unwrap_or_else(|| b"0".to_vec());
            match String::from_utf8_lossy(&current).parse::<i64>() {
                Ok(value) => {
                    store.insert(args[1].clone(), (value + 1).to_string().into_bytes());
                    value_bytes(&Value::Integer(value + 1))
                }
                Err(_) => b"-ERR value is not an integer or out of range\r\n".to_vec(),
            }
        }
        _ => format!("-ERR unknown command '{}'\r\n", name).into_bytes(),
    }
}

fn read_request(reader: &mut BufReader<TcpStream>, line: &mut Vec<u8>) -> Option<Vec<Vec<u8>>> {
    let first = reader.fill_buf().ok()?.first().copied()?;
    if first == b'*' {
        return match read_reply(reader, line).ok()? {
            Value::Array(Some(items)) => Some(
                items
                    .iter()
                    .map(|item| item.as_bytes().unwrap_or_default().to_vec())
                    .collect(),
            ),
            _ => None,
        };
    }

    // Inline command.
    line.clear();
    reader.read_until(b'\n', line).ok()?;
    let args: Vec<Vec<u8>> = String::from_utf8_lossy(line)
        .split_whitespace()
        .map(|word| word.as_bytes().to_vec())
        .collect();
    if args.is_empty() {
        None
    } else {
        Some(args)
    }
}

fn value_bytes(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_value(value, &mut buf);
    buf.to_vec()
}

fn client_with_addr(addr: String, capacity: usize) -> Client {
    let config = ClientConfig {
        addr,
        capacity,
        acquire_timeout: Some(Duration::from_secs(5)),
        read_timeout: Some(Duration::from_secs(2)),
        write_timeout: Some(Duration::from_secs(2)),
        connect_timeout: Some(Duration::from_secs(2)),
        ..ClientConfig::default()
    };
    Client::with_config(config).expect("client")
}

#[test]
fn inline_ping() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    assert_eq!(client.send("PING").expect("ping"), Value::simple("PONG"));
}

#[test]
fn set_get_roundtrip() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    assert_eq!(client.send(["SET", "foo", "bar"]).expect("set"), Value::simple("OK"));
    assert_eq!(client.send(["GET", "foo"]).expect("get"), Value::bulk(&b"bar"[..]));
    assert_eq!(client.send(["GET", "missing"]).expect("get"), Value::BulkString(None));
}

#[test]
fn binary_and_integer_arguments() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    let payload: &[u8] = b"line one\r\nline two\x00";

    client
        .send(Command::from(["SET"]).arg("blob").arg(payload))
        .expect("set blob");
    assert_eq!(client.send(["GET", "blob"]).expect("get blob"), Value::bulk(payload));

    client
        .send(Command::from(["SET", "n"]).arg(41i64))
        .expect("set n");
    assert_eq!(client.send(["INCR", "n"]).expect("incr"), Value::Integer(42));

    let key = Command::Args(vec![
        Arg::Text("SET"),
        Arg::Concat(vec![Arg::Text("user:"), Arg::Int(7)]),
        Arg::Text("ada"),
    ]);
    client.send(key).expect("set concat");
    assert_eq!(client.send(["GET", "user:7"]).expect("get"), Value::bulk(&b"ada"[..]));
}

#[test]
fn pipeline_set_get() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    let replies = client
        .pipeline(|p| {
            p.send(["SET", "foo", "baz"])?;
            p.send(["GET", "foo"])
        })
        .expect("pipeline");
    assert_eq!(replies, vec![Value::simple("OK"), Value::bulk(&b"baz"[..])]);
}

#[test]
fn pipeline_of_many_increments() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    let replies = client
        .pipeline(|p| {
            for _ in 0..100 {
                p.send(["INCR", "hits"])?;
            }
            Ok::<(), ClientError>(())
        })
        .expect("pipeline");
    let expected: Vec<Value> = (1..=100).map(Value::Integer).collect();
    assert_eq!(replies, expected);
}

#[test]
fn transaction_set_get() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    let result = client
        .transaction(|tx| {
            tx.send(["SET", "foo", "qux"])?;
            tx.send(["GET", "foo"])
        })
        .expect("transaction");
    assert_eq!(
        result,
        Value::array(vec![Value::simple("OK"), Value::bulk(&b"qux"[..])])
    );
    // The connection is back in normal mode and reusable.
    assert_eq!(client.send(["GET", "foo"]).expect("get"), Value::bulk(&b"qux"[..]));
    assert_eq!(client.pool().size(), 1);
}

#[test]
fn transaction_with_failing_command_reports_error_reply() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    client.send(["SET", "word", "abc"]).expect("set");

    let err = client
        .transaction(|tx| {
            tx.send(["INCR", "word"])?;
            tx.send(["GET", "word"])
        })
        .unwrap_err();
    assert_eq!(err.server_message(), Some("ERR value is not an integer or out of range"));
    // EXEC was fully consumed, so the connection went back to the pool.
    assert_eq!(client.pool().free_count(), 1);
    assert_eq!(client.send("PING").expect("ping"), Value::simple("PONG"));
}

#[test]
fn error_reply_keeps_connection_pooled() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    let err = client.send(["NOPE"]).unwrap_err();
    assert_eq!(err.server_message(), Some("ERR unknown command 'NOPE'"));
    assert_eq!(client.pool().free_count(), 1);
    assert_eq!(client.send("PING").expect("ping"), Value::simple("PONG"));
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
}

#[test]
fn malformed_reply_is_protocol_error() {
    let addr = spawn_raw_server(b"Xgarbage\r\n");
    let client = client_with_addr(addr, 1);
    let err = client.send("PING").unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)));
    // Broken connections are dropped rather than pooled.
    assert_eq!(client.pool().size(), 0);
}

#[test]
fn server_hangup_is_connection_closed() {
    let addr = spawn_raw_server(b"");
    let client = client_with_addr(addr, 1);
    let err = client.send(["GET", "k"]).unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed));
    assert_eq!(client.pool().size(), 0);
}

#[test]
fn acquire_timeout_applies_to_facade_calls() {
    let server = spawn_server();
    let client = Client::with_config(ClientConfig {
        addr: server.addr,
        capacity: 1,
        acquire_timeout: Some(Duration::from_millis(50)),
        ..ClientConfig::default()
    })
    .expect("client");

    let held = client.pool().acquire(None).expect("lease");
    let err = client.send("PING").unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    drop(held);
    assert_eq!(client.send("PING").expect("ping"), Value::simple("PONG"));
}

#[test]
fn concurrent_callers_share_bounded_connections() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 2);

    let handles: Vec<_> = (0..6)
        .map(|worker| {
            let client = client.clone();
            thread::spawn(move || {
                for idx in 0..20 {
                    let key = format!("k{}-{}", worker, idx);
                    let value = format!("v{}", idx);
                    client.send(["SET", key.as_str(), value.as_str()]).expect("set");
                    let got = client.send(["GET", key.as_str()]).expect("get");
                    assert_eq!(got.as_bytes(), Some(value.as_bytes()));
                    assert!(client.pool().leased_count() <= 2);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker");
    }
    assert!(client.pool().size() <= 2);
    assert!(server.accepted.load(Ordering::SeqCst) <= 2);
}

#[test]
fn scoped_connection_runs_several_commands() {
    let server = spawn_server();
    let client = client_with_addr(server.addr, 1);
    let id = client
        .with_connection(|conn| {
            conn.send(["SET", "a", "1"])?;
            let replies = conn.pipeline(|p| {
                p.send(["INCR", "a"])?;
                p.send(["GET", "a"])
            })?;
            assert_eq!(replies, vec![Value::Integer(2), Value::bulk(&b"2"[..])]);
            Ok::<_, ClientError>(conn.id())
        })
        .expect("scoped");
    assert_eq!(client.pool().acquire(None).expect("lease").id(), id);
}
