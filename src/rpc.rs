//! Control RPC: a raw TCP server for the companion client, independent of
//! the mailbox scheduler thread. One JSON request in, one JSON response
//! out, per connection. Framing is heuristic (no length prefix): read
//! 4KiB chunks until a short chunk, EOF, or a read timeout with data
//! already buffered.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use socket2::{Domain, Socket, Type};

use crate::config::Configuration;
use crate::context::ServiceContext;
use crate::logs::LogType;
use crate::models::RetryQueueEntry;

const READ_CHUNK: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(200);
const BACKLOG: i32 = 5;

/// Bind and serve the control RPC until `shutdown` is set.
pub fn run(ctx: ServiceContext, port: u16, shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    let listener = bind(port)?;
    listener.set_nonblocking(true)?;
    ctx.logs.log_trace(true, &format!("control RPC listening on port {port}"));

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let ctx = ctx.clone();
                thread::spawn(move || handle_connection(ctx, stream));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                ctx.logs.log_error(&format!("control RPC accept failed: {e}"));
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    Ok(())
}

fn bind(port: u16) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid socket address");
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

fn handle_connection(ctx: ServiceContext, mut stream: TcpStream) {
    let response = match read_request(&mut stream) {
        Ok(raw) => match serde_json::from_slice::<Value>(&raw) {
            Ok(request) => dispatch(&ctx, &request),
            Err(e) => json!({"status": "error", "message": format!("invalid JSON request: {e}")}),
        },
        Err(e) => json!({"status": "error", "message": format!("failed to read request: {e}")}),
    };

    let encoded = match serde_json::to_vec(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            ctx.logs.log_error(&format!("control RPC failed to encode response: {e}"));
            return;
        }
    };
    let _ = stream.write_all(&encoded);
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if n < READ_CHUNK {
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if buffer.is_empty() {
                    return Err(e);
                }
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(buffer)
}

fn dispatch(ctx: &ServiceContext, request: &Value) -> Value {
    match request.get("command").and_then(Value::as_str) {
        Some("get_config") => get_config(ctx),
        Some("set_config") => set_config(ctx, request),
        Some("get_logs") => get_logs(ctx, request),
        Some("get_retry_queue") => get_retry_queue(ctx),
        Some("test_connection") => test_connection(ctx, request),
        _ => json!({"status": "error", "message": "Comando desconocido"}),
    }
}

fn get_config(ctx: &ServiceContext) -> Value {
    match ctx.config.lock() {
        Ok(config) => json!({"status": "ok", "data": &*config}),
        Err(e) => json!({"status": "error", "message": format!("poisoned configuration lock: {e}")}),
    }
}

fn set_config(ctx: &ServiceContext, request: &Value) -> Value {
    let Some(raw) = request.get("config") else {
        return json!({"status": "error", "message": "missing 'config' field"});
    };
    let new_config: Configuration = match serde_json::from_value(raw.clone()) {
        Ok(c) => c,
        Err(e) => return json!({"status": "error", "message": format!("invalid configuration: {e}")}),
    };

    match ctx.config.lock() {
        Ok(mut config) => *config = new_config,
        Err(e) => return json!({"status": "error", "message": format!("poisoned configuration lock: {e}")}),
    }

    match ctx.save_config() {
        Ok(()) => json!({"status": "ok", "message": "Configuracion guardada"}),
        Err(e) => json!({"status": "error", "message": format!("failed to save configuration: {e}")}),
    }
}

fn get_logs(ctx: &ServiceContext, request: &Value) -> Value {
    let log_type = LogType::from_wire(request.get("log_type").and_then(Value::as_str));
    match ctx.logs.read_lines(log_type) {
        Ok(lines) => json!({"status": "ok", "data": lines}),
        Err(e) => json!({"status": "error", "message": format!("failed to read logs: {e}")}),
    }
}

fn get_retry_queue(ctx: &ServiceContext) -> Value {
    match ctx.retry_queue.lock() {
        Ok(queue) => {
            let entries: Vec<RetryQueueEntry> = queue.items().iter().map(RetryQueueEntry::from).collect();
            json!({"status": "ok", "data": entries})
        }
        Err(e) => json!({"status": "error", "message": format!("poisoned retry queue lock: {e}")}),
    }
}

/// Connect and log in to the account at the given (zero-based) array index,
/// then immediately log out. `cuenta_id` indexes the current in-memory
/// account list — it is not a stable account identifier.
fn test_connection(ctx: &ServiceContext, request: &Value) -> Value {
    let Some(index) = request.get("cuenta_id").and_then(Value::as_u64) else {
        return json!({"status": "error", "message": "missing 'cuenta_id' field"});
    };

    let account = match ctx.config.lock() {
        Ok(config) => config.accounts.get(index as usize).cloned(),
        Err(e) => return json!({"status": "error", "message": format!("poisoned configuration lock: {e}")}),
    };

    let Some(account) = account else {
        return json!({"status": "error", "message": format!("no account at index {index}")});
    };

    match crate::mailbox::test_login(&account) {
        Ok(()) => json!({"status": "ok", "message": "Conexion exitosa"}),
        Err(e) => json!({"status": "error", "message": e.to_string()}),
    }
}
