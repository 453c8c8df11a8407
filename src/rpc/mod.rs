//! RPC fabric (SPEC_FULL §4.3/§4.4): the JSON-RPC 2.0 envelope, the
//! ArcSwap-backed MethodRegistry, the fluent ServiceProxy, and the
//! server-side RpcDispatcher.

pub mod dispatcher;
pub mod envelope;
pub mod proxy;
pub mod registry;

pub use dispatcher::RpcDispatcher;
pub use envelope::{RpcError, RpcRequest, RpcResponse};
pub use proxy::{Service, ServiceProxy, Target};
pub use registry::{Handler, MethodEntry, MethodRegistry};
