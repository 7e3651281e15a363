pub mod engine;
pub mod utils;

use serde_json::Value;

use utils::RpcErr;

/// One JSON-RPC method: stateless parse of the params, then execution.
pub trait RpcHandler: Sized {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr>;

    fn call(req: &Option<Vec<Value>>) -> Result<Value, RpcErr> {
        let request = Self::parse(req)?;
        request.handle()
    }

    fn handle(&self) -> Result<Value, RpcErr>;
}
