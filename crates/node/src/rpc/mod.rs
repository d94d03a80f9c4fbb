//! HTTP-hosted replica RPC: one POST route per message kind plus a debug
//! introspection path.

mod client;
mod server;

pub use client::{RpcClient, RpcError};
pub use server::{serve, Ingress, IngressReceivers};
