//! Static method catalog and per-method call parameters.
//!
//! The probed set deliberately leaves out stateful flows (filter lifecycle,
//! subscriptions) and anything that would mutate chain state.

use serde_json::{json, Value};

/// Dedicated probe used to label an endpoint, independent of the catalog.
pub const IDENTITY_METHOD: &str = "web3_clientVersion";

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Read-only methods probed by default.
pub const DEFAULT_METHODS: &[&str] = &[
    "eth_accounts",
    "eth_blockNumber",
    "eth_getBlockByNumber",
    "eth_getBlockByHash",
    "eth_getBlockTransactionCountByNumber",
    "eth_getBlockTransactionCountByHash",
    "eth_getTransactionByHash",
    "eth_getTransactionCount",
    "eth_getTransactionReceipt",
    "eth_getBlockReceipts",
    "eth_getTransactionByBlockHashAndIndex",
    "eth_getTransactionByBlockNumberAndIndex",
    "eth_getCode",
    "eth_getStorageAt",
    "eth_chainId",
    "eth_syncing",
    "eth_feeHistory",
    "eth_protocolVersion",
    "eth_maxPriorityFeePerGas",
    "eth_estimateGas",
    "eth_call",
    "eth_getLogs",
    "eth_getBalance",
    "eth_gasPrice",
    "trace_block",
    "trace_replayBlockTransactions",
    "trace_transaction",
    "trace_filter",
    "net_version",
    "net_listening",
];

/// A method name paired with the fixed parameters it is called with.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub method: String,
    pub params: Vec<Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>) -> Self {
        let method = method.into();
        let params = params_for(&method);
        MethodCall { method, params }
    }
}

/// Fixed parameters for methods that cannot be called with an empty list.
/// Methods absent from this table take no parameters.
pub fn params_for(method: &str) -> Vec<Value> {
    match method {
        "eth_getBlockByNumber" => vec![json!("latest"), json!(false)],
        "eth_getBlockTransactionCountByNumber" => vec![json!("latest")],
        "eth_getBlockReceipts" => vec![json!("latest")],
        "eth_getBalance" => vec![json!(ZERO_ADDRESS), json!("latest")],
        "eth_getTransactionCount" => vec![json!(ZERO_ADDRESS), json!("latest")],
        "eth_getCode" => vec![json!(ZERO_ADDRESS), json!("latest")],
        "eth_getStorageAt" => vec![json!(ZERO_ADDRESS), json!("0x0"), json!("latest")],
        "eth_feeHistory" => vec![json!("0x1"), json!("latest"), json!([])],
        "eth_estimateGas" => vec![json!({ "to": ZERO_ADDRESS })],
        "eth_call" => vec![json!({ "to": ZERO_ADDRESS }), json!("latest")],
        "eth_getLogs" => vec![json!({ "fromBlock": "latest", "toBlock": "latest" })],
        "trace_block" => vec![json!("latest")],
        "trace_filter" => vec![json!({ "fromBlock": "latest", "toBlock": "latest" })],
        _ => Vec::new(),
    }
}

/// Build calls for an explicit method list, applying the parameter table.
pub fn calls_for(methods: &[String]) -> Vec<MethodCall> {
    methods.iter().map(MethodCall::new).collect()
}

pub fn default_catalog() -> Vec<MethodCall> {
    DEFAULT_METHODS.iter().map(|m| MethodCall::new(*m)).collect()
}
