//! Line-oriented JSON-RPC echo server.
//!
//! Speaks the wire protocol over stdio and exists for the integration
//! tests and manual smoke testing. Supported methods beyond the
//! handshake: `ping`, `echo` (returns its params), `sleep` (responds
//! after `ms` milliseconds, enabling out-of-order completion), `exit`
//! (terminates without responding), `tools/list`, and `tools/call`.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;
use tracing::debug;

use toolbus::protocol::{
    ErrorResponse, Message, PROTOCOL_VERSION, Request, Response, RpcError, methods,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let message = match Message::parse(&line) {
            Ok(message) => message,
            Err(e) => {
                debug!("ignoring undecodable line: {}", e);
                continue;
            }
        };
        match message {
            Message::Request(request) => handle_request(&stdout, request).await,
            Message::Notification(notification) => {
                debug!("notification: {}", notification.method);
            }
            _ => {}
        }
    }
}

async fn handle_request(stdout: &Arc<Mutex<Stdout>>, request: Request) {
    match request.method.as_str() {
        methods::INITIALIZE => {
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": false },
                },
                "serverInfo": {
                    "name": "toolbus-echo",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            respond(stdout, Response::success(request.id, result)).await;
        }
        methods::PING => {
            respond(stdout, Response::success(request.id, json!({}))).await;
        }
        "echo" => {
            let result = request.params.unwrap_or(Value::Null);
            respond(stdout, Response::success(request.id, result)).await;
        }
        "sleep" => {
            // Respond from a spawned task so later requests can complete
            // first.
            let ms = request
                .params
                .as_ref()
                .and_then(|p| p.get("ms"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let result = request.params.clone().unwrap_or(Value::Null);
            let stdout = Arc::clone(stdout);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                respond(&stdout, Response::success(request.id, result)).await;
            });
        }
        "exit" => {
            std::process::exit(0);
        }
        methods::TOOLS_LIST => {
            let result = json!({
                "tools": [{
                    "name": "echo",
                    "description": "Echo the arguments back as text",
                    "inputSchema": { "type": "object" },
                }],
            });
            respond(stdout, Response::success(request.id, result)).await;
        }
        methods::TOOLS_CALL => {
            let arguments = request
                .params
                .as_ref()
                .and_then(|p| p.get("arguments"))
                .cloned()
                .unwrap_or(Value::Null);
            let result = json!({
                "content": [{ "type": "text", "text": arguments.to_string() }],
                "isError": false,
            });
            respond(stdout, Response::success(request.id, result)).await;
        }
        _ => {
            let error = ErrorResponse::new(Some(request.id), RpcError::method_not_found());
            write_message(stdout, Message::Error(error)).await;
        }
    }
}

async fn respond(stdout: &Arc<Mutex<Stdout>>, response: Response) {
    write_message(stdout, Message::Response(response)).await;
}

async fn write_message(stdout: &Arc<Mutex<Stdout>>, message: Message) {
    let Ok(line) = message.to_line() else { return };
    let mut stdout = stdout.lock().await;
    let _ = stdout.write_all(line.as_bytes()).await;
    let _ = stdout.flush().await;
}
