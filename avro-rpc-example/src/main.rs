//! Runnable demonstration of the Echo protocol end to end: a server with
//! one registered message handler, and a client that handshakes and
//! calls it over HTTP.

use std::net::SocketAddr;
use std::time::Duration;

use apache_avro::types::Value;
use async_trait::async_trait;
use tokio::net::TcpListener;

use avro_rpc_core::{CallResult, HandlerOutcome, HttpTransceiver, MessageHandler, Protocol, Requestor, Responder};

const ECHO_PROTOCOL: &str = r#"{
    "protocol": "Echo",
    "namespace": "org.example.echo",
    "messages": {
        "echo": {
            "request": [{"name": "message", "type": "string"}],
            "response": "string"
        },
        "divide": {
            "request": [{"name": "numerator", "type": "int"}, {"name": "denominator", "type": "int"}],
            "response": "int",
            "errors": ["DivByZero"]
        }
    },
    "types": [
        {"type": "record", "name": "DivByZero", "fields": [{"name": "message", "type": "string"}]}
    ]
}"#;

struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn invoke(&self, request: Value) -> Result<Value, HandlerOutcome> {
        match request {
            Value::Record(fields) => {
                Ok(fields.into_iter().find(|(name, _)| name == "message").map(|(_, v)| v).unwrap_or(Value::Null))
            }
            _ => Err(HandlerOutcome::Application("echo request was not a record".into())),
        }
    }
}

struct DivideHandler;

#[async_trait]
impl MessageHandler for DivideHandler {
    async fn invoke(&self, request: Value) -> Result<Value, HandlerOutcome> {
        let fields = match request {
            Value::Record(fields) => fields,
            _ => return Err(HandlerOutcome::Application("divide request was not a record".into())),
        };
        let field = |name: &str| fields.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone());
        let numerator = match field("numerator") {
            Some(Value::Int(n)) => n,
            _ => return Err(HandlerOutcome::Application("missing numerator".into())),
        };
        let denominator = match field("denominator") {
            Some(Value::Int(n)) => n,
            _ => return Err(HandlerOutcome::Application("missing denominator".into())),
        };
        if denominator == 0 {
            let declared = Value::Union(
                1,
                Box::new(Value::Record(vec![("message".into(), Value::String("division by zero".into()))])),
            );
            return Err(HandlerOutcome::Declared(declared));
        }
        Ok(Value::Int(numerator / denominator))
    }
}

async fn spawn_server() -> SocketAddr {
    let protocol = Protocol::parse(ECHO_PROTOCOL).expect("echo protocol parses");
    let mut responder = Responder::new(protocol);
    responder.register("echo", Box::new(EchoHandler));
    responder.register("divide", Box::new(DivideHandler));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("listener has a local address");

    // The demo binds its own listener so it can print the ephemeral port;
    // `avro_rpc_core::RpcServer` owns bind-and-serve for a fixed address.
    tokio::spawn(async move {
        let responder = std::sync::Arc::new(responder);
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let responder = responder.clone();
            tokio::spawn(async move {
                let _ = serve_one(&responder, stream).await;
            });
        }
    });

    addr
}

async fn serve_one(responder: &Responder, stream: tokio::net::TcpStream) -> avro_rpc_core::Result<()> {
    use avro_rpc_core::connection::split_connection;
    use avro_rpc_core::frame::{frame_decode, frame_encode};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    let (reader, mut writer) = split_connection(stream);
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    let call_request = frame_decode(&body)?;
    let call_response = responder.respond(&call_request).await?;
    let framed_response = frame_encode(&call_response);

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: avro/binary\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        framed_response.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&framed_response).await?;
    writer.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let addr = spawn_server().await;
    println!("avro-rpc-example: server listening on {addr}");

    let protocol = Protocol::parse(ECHO_PROTOCOL).expect("echo protocol parses");
    let transceiver = HttpTransceiver::new("127.0.0.1", addr.port(), "/");
    let mut requestor = Requestor::new(protocol, transceiver);

    let echoed = requestor
        .request("echo", Value::Record(vec![("message".into(), Value::String("hello, avro".into()))]))
        .await
        .expect("echo call succeeds");
    match echoed {
        CallResult::Response(Value::String(s)) => println!("echo(\"hello, avro\") = {s:?}"),
        _ => println!("echo call returned something unexpected"),
    }

    let divided = requestor
        .request("divide", Value::Record(vec![("numerator".into(), Value::Int(10)), ("denominator".into(), Value::Int(2))]))
        .await
        .expect("divide call succeeds");
    match divided {
        CallResult::Response(Value::Int(n)) => println!("divide(10, 2) = {n}"),
        _ => println!("divide call returned something unexpected"),
    }

    let divide_by_zero = requestor
        .request("divide", Value::Record(vec![("numerator".into(), Value::Int(1)), ("denominator".into(), Value::Int(0))]))
        .await
        .expect("divide(1, 0) completes with a declared error, not a transport failure");
    match divide_by_zero {
        CallResult::RemoteError(value) => println!("divide(1, 0) raised a declared error: {value:?}"),
        CallResult::Response(_) => println!("divide(1, 0) unexpectedly succeeded"),
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
}
