//! AVL Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seams that let the AVL engine run
//! both **live** (tokio, system clock) and in **replay** (virtual clock):
//!
//! - Time (`now()`, `epoch_millis()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Outbound record handoff (`Sink::try_deliver()`)
//!
//! Replaying recorded AVL data through the same code paths requires that
//! nothing in the engine reads the wall clock directly.
//!
//! # Example
//!
//! ```ignore
//! use avl_env::{AvlContext, Sink};
//!
//! async fn supervisor_loop<Ctx: AvlContext>(ctx: &Ctx) {
//!     loop {
//!         sweep(ctx.epoch_millis());
//!         ctx.sleep(Duration::from_secs(30)).await;
//!     }
//! }
//! ```

mod context;
mod error;
mod sink;
mod tokio_impl;

pub use context::AvlContext;
pub use error::EnvError;
pub use sink::{ChannelSink, CollectingSink, NullSink, Sink};
pub use tokio_impl::TokioContext;
