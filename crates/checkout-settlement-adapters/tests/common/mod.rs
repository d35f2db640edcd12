#![allow(dead_code)]

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;

use alloy::primitives::{Address, B256};
use serde_json::{json, Value};
use tiny_http::{Method, Response, Server, StatusCode};

use checkout_settlement_core::{ChargeAmount, CheckoutContext, PortError};

pub const MOCK_TX_HASH: &str =
    "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
/// Hash the mock RPC never has a receipt for.
pub const UNMINED_TX_HASH: &str =
    "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub const BACKEND_TOKEN: &str = "test-token";

/// Serves JSON-RPC on `POST /` and the order backend on `/orders`.
///
/// Each handled request is recorded in `calls` as `"<METHOD> <path>"`, or `"rpc <method>"` for
/// JSON-RPC bodies.
pub fn spawn_mock_server(
    calls: Arc<Mutex<Vec<String>>>,
) -> (String, thread::JoinHandle<Result<(), PortError>>) {
    let server = Server::http("127.0.0.1:0").expect("start server");
    let addr = format!("http://{}", server.server_addr());

    let join = thread::spawn(move || {
        for _ in 0..32 {
            let mut req = match server.recv() {
                Ok(r) => r,
                Err(_) => break,
            };
            let method = req.method().clone();
            let path = req.url().to_owned();
            let authorized = req.headers().iter().any(|h| {
                h.field.equiv("Authorization")
                    && h.value.as_str() == format!("Bearer {BACKEND_TOKEN}")
            });
            let mut body = String::new();
            let _ = req.as_reader().read_to_string(&mut body);
            let rpc: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

            let label = match (&method, rpc.get("method").and_then(Value::as_str)) {
                (Method::Post, Some(rpc_method)) if path == "/" => format!("rpc {rpc_method}"),
                _ => format!("{method} {path}"),
            };
            if let Ok(mut g) = calls.lock() {
                g.push(label);
            }

            let (code, payload) = match (method, path.as_str()) {
                (Method::Post, "/") => (200, rpc_response(&rpc)),
                (Method::Post, "/orders") if !authorized => {
                    (401, json!({"error": "unauthorized"}))
                }
                (Method::Post, "/orders") => (201, json!({"orderId": "ord_http_1"})),
                (Method::Get, "/orders/ord_http_1") if authorized => {
                    (200, json!({"status": "settled"}))
                }
                (Method::Get, "/orders/ord_pending") => (200, json!({"status": "processing"})),
                (Method::Get, "/orders/ord_failed") => (
                    200,
                    json!({"status": "failed", "reason": "amount mismatch"}),
                ),
                _ => (404, json!({"error": "not found"})),
            };

            let response =
                Response::from_string(payload.to_string()).with_status_code(StatusCode(code));
            let _ = req.respond(response);
        }
        Ok(())
    });

    (addr, join)
}

fn rpc_response(request: &Value) -> Value {
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let result = match request.get("method").and_then(Value::as_str) {
        Some("eth_requestAccounts") => json!([buyer()]),
        Some("eth_chainId") => json!("0x38"),
        Some("wallet_switchEthereumChain") => {
            match params[0].get("chainId").and_then(Value::as_str) {
                Some("0x61") => return rpc_error(4902, "Unrecognized chain ID \"0x61\"."),
                Some("0x1") => return rpc_error(4001, "User rejected the request."),
                _ => Value::Null,
            }
        }
        Some("wallet_addEthereumChain") => Value::Null,
        Some("eth_sendTransaction") => json!(MOCK_TX_HASH),
        Some("eth_getTransactionReceipt") => {
            if params[0].as_str() == Some(UNMINED_TX_HASH) {
                Value::Null
            } else {
                json!({"status": "0x1", "blockNumber": "0x2a"})
            }
        }
        _ => return rpc_error(-32601, "method not found"),
    };
    json!({"jsonrpc": "2.0", "id": 1, "result": result})
}

fn rpc_error(code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": 1, "error": {"code": code, "message": message}})
}

pub fn recorded(calls: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    calls.lock().expect("calls lock").clone()
}

pub fn buyer() -> Address {
    "0x1000000000000000000000000000000000000001"
        .parse()
        .expect("valid buyer address")
}

pub fn merchant() -> Address {
    "0x000000000000000000000000000000000000BEEF"
        .parse()
        .expect("valid merchant address")
}

pub fn mock_tx_hash() -> B256 {
    MOCK_TX_HASH.parse().expect("valid mock hash")
}

pub fn checkout() -> CheckoutContext {
    CheckoutContext {
        agent_id: "agent-7".to_owned(),
        user_id: "user-42".to_owned(),
        cart: json!({"items": [{"sku": "plan-pro", "qty": 1}]}),
    }
}

pub fn charge() -> ChargeAmount {
    ChargeAmount::new(1250, 2, "USDT")
}
