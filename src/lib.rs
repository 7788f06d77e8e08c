//! Run pre-configured SQL queries by alias from chat slash-commands.

pub mod config;
pub mod context;
pub mod dispatch;
mod error;
pub mod inbound;
pub mod message;
pub mod metrics;
pub mod mysql;
pub mod publisher;
pub mod receiver;
pub mod registry;
pub mod retry;
pub mod table;
pub mod testing;
pub mod worker;

pub use error::{Error, Result, WithContext};
pub use dispatch::{Dispatcher, ExecutionRequest};
pub use receiver::{CommandReceiver, ReceiverResponse};
pub use registry::{AliasRegistry, Credential, QueryDefinition};
pub use worker::QueryWorker;

pub mod prelude {
    pub use crate::{
        AliasRegistry, CommandReceiver, Dispatcher, ExecutionRequest, QueryWorker, Result,
    };
}
