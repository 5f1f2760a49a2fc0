//! End-to-end tests against a running server over TCP.

use fastcgi_responder::protocol::{
    encode_param, encode_record, BeginRequest, Decode, EndRequest, Header, ProtocolStatus,
    RecordType, HEADER_LEN, ROLE_RESPONDER,
};
use fastcgi_responder::{Config, Request, Server};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

fn config(workers: usize) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers,
        params: vec!["KEY".to_string(), "REQUEST_URI".to_string()],
        ..Config::default()
    }
}

fn echo_handler(request: &Request) {
    let key = request.param_str("KEY").unwrap_or("").to_string();
    request
        .transaction(|r| {
            r.write_header("Content-Type", "text/plain")?;
            r.write_header("X-Key", &key)?;
            r.write_body(request.body())?;
            r.end()
        })
        .unwrap();
}

fn record(record_type: RecordType, request_id: u16, content: &[u8], padding: u8) -> Vec<u8> {
    encode_record(record_type, request_id, content, padding).unwrap()
}

fn request_bytes(request_id: u16, params: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut kv = Vec::new();
    for (k, v) in params {
        assert!(encode_param(&mut kv, k.as_bytes(), v.as_bytes()));
    }
    let begin = BeginRequest::new(ROLE_RESPONDER, 0).encode();
    [
        record(RecordType::BeginRequest, request_id, &begin, 0),
        record(RecordType::Params, request_id, &kv, 0),
        record(RecordType::Params, request_id, b"", 0),
        record(RecordType::Stdin, request_id, body, 0),
        record(RecordType::Stdin, request_id, b"", 0),
    ]
    .concat()
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

/// Read records until END_REQUEST, returning the joined STDOUT content.
fn read_response(stream: &mut TcpStream) -> (Vec<u8>, EndRequest) {
    let mut stdout = Vec::new();
    loop {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).unwrap();
        let header = Header::decode(&header);

        let mut content = vec![0u8; header.record_len() - HEADER_LEN];
        stream.read_exact(&mut content).unwrap();
        content.truncate(usize::from(header.content_length()));

        match RecordType::try_from(header.record_type).unwrap() {
            RecordType::Stdout => stdout.extend_from_slice(&content),
            RecordType::EndRequest => return (stdout, EndRequest::decode(&content)),
            other => panic!("unexpected {other:?} record"),
        }
    }
}

fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, read {n} bytes"),
        Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
    }
}

#[test]
fn test_request_round_trip() {
    let server = Server::new(config(2), echo_handler).unwrap();
    let addr = server.local_addr();

    let report = thread::scope(|s| {
        let serving = s.spawn(|| server.serve());

        let mut stream = connect(addr);
        stream
            .write_all(&request_bytes(1, &[("KEY", "VAL"), ("OTHER", "x")], b"hello"))
            .unwrap();
        let (stdout, end) = read_response(&mut stream);
        assert_eq!(
            stdout,
            b"Content-Type: text/plain\nX-Key: VAL\n\nhello".to_vec()
        );
        assert_eq!(end.app_status(), 0);
        assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete as u8);

        // the connection stays usable, with no state carried over
        stream.write_all(&request_bytes(2, &[], b"")).unwrap();
        let (stdout, _) = read_response(&mut stream);
        assert_eq!(stdout, b"Content-Type: text/plain\nX-Key: \n\n".to_vec());

        server.shutdown();
        serving.join().unwrap().unwrap()
    });

    assert_eq!(report.workers, 2);
    assert_eq!(report.connections, 1);
    assert_eq!(report.requests, 2);
}

#[test]
fn test_large_response_split_into_records() {
    let body = vec![b'z'; 100_000];
    let server = Server::new(config(1), move |request: &Request| {
        request.write_body(&body).unwrap();
        request.end().unwrap();
    })
    .unwrap();
    let addr = server.local_addr();

    thread::scope(|s| {
        let serving = s.spawn(|| server.serve());

        let mut stream = connect(addr);
        stream.write_all(&request_bytes(7, &[], b"")).unwrap();
        let (stdout, _) = read_response(&mut stream);
        assert_eq!(stdout.len(), 100_001);
        assert_eq!(stdout[0], b'\n');
        assert!(stdout[1..].iter().all(|&b| b == b'z'));

        server.shutdown();
        serving.join().unwrap().unwrap();
    });
}

#[test]
fn test_slow_reader_receives_whole_response() {
    let body = vec![b'q'; 4 * 1024 * 1024];
    let server = Server::new(config(1), move |request: &Request| {
        request.write_body(&body).unwrap();
        request.end().unwrap();
    })
    .unwrap();
    let addr = server.local_addr();

    let report = thread::scope(|s| {
        let serving = s.spawn(|| server.serve());

        let mut stream = connect(addr);
        stream.write_all(&request_bytes(3, &[], b"")).unwrap();
        // let the socket buffers fill before reading anything
        thread::sleep(Duration::from_millis(300));
        let (stdout, end) = read_response(&mut stream);
        assert_eq!(stdout.len(), 4 * 1024 * 1024 + 1);
        assert!(stdout[1..].iter().all(|&b| b == b'q'));
        assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete as u8);

        // still in sync for the next request
        stream.write_all(&request_bytes(4, &[], b"")).unwrap();
        let (stdout, _) = read_response(&mut stream);
        assert_eq!(stdout.len(), 4 * 1024 * 1024 + 1);

        server.shutdown();
        serving.join().unwrap().unwrap()
    });

    assert_eq!(report.requests, 2);
}

#[test]
fn test_protocol_error_closes_only_that_connection() {
    let server = Server::new(config(1), echo_handler).unwrap();
    let addr = server.local_addr();

    let report = thread::scope(|s| {
        let serving = s.spawn(|| server.serve());

        let mut good = connect(addr);
        let mut bad = connect(addr);

        let mut record = request_bytes(1, &[], b"");
        record[0] = 9;
        bad.write_all(&record).unwrap();
        assert_closed(&mut bad);

        good.write_all(&request_bytes(1, &[("KEY", "k")], b"ok"))
            .unwrap();
        let (stdout, _) = read_response(&mut good);
        assert!(stdout.ends_with(b"\n\nok"));

        server.shutdown();
        serving.join().unwrap().unwrap()
    });

    assert_eq!(report.connections, 2);
    assert_eq!(report.requests, 1);
}

#[test]
fn test_shutdown_drains_live_connections() {
    let server = Server::new(config(2), echo_handler).unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();

    let (report, mut streams) = thread::scope(|s| {
        let serving = s.spawn(|| server.serve());

        let streams: Vec<_> = (0..4u16)
            .map(|i| {
                let mut stream = connect(addr);
                stream.write_all(&request_bytes(i + 1, &[], b"x")).unwrap();
                read_response(&mut stream);
                stream
            })
            .collect();

        thread::spawn(move || handle.shutdown()).join().unwrap();
        (serving.join().unwrap().unwrap(), streams)
    });

    assert_eq!(report.connections, 4);
    assert_eq!(report.requests, 4);
    for stream in &mut streams {
        assert_closed(stream);
    }
}
