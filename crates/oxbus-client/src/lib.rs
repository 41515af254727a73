//! Asynchronous Modbus client transaction engine.
//!
//! The engine accepts many concurrent application requests, serializes
//! them onto one carrier per remote device (Modbus/TCP or RTU serial),
//! correlates responses back to their originating requests by transaction
//! identity, enforces a bounded per-request response deadline through a
//! ring-structured timeout wheel, and delivers a completion to the caller
//! exactly once.
//!
//! Everything lives behind one [`Engine`] handle with explicit `new` and
//! `shutdown`; several engines can coexist in a process. The design is
//! deliberately coroutine-free: native threads, readiness waits with
//! timeouts, message queues and a condvar-backed priority queue.

mod completion;
mod config;
mod context;
mod dispatch;
mod engine;
mod queue;
mod reactor;
mod registry;
mod serial;
mod tcp;
mod thread;
mod timing;
mod wheel;

pub use completion::{
    Completion, CompletionRecord, DeviceIdCallback, Endpoint, GenericCallback,
    ReadFileRecordCallback, Timestamps, WriteFileRecordCallback,
};
pub use config::{Parity, SerialParams, StackConfig};
pub use context::ContextId;
pub use engine::Engine;
pub use oxbus::{ErrorKind, ExceptionStatus};
pub use thread::{SchedPolicy, ThreadPriority};
pub use timing::Nanos;
