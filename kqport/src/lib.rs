//! # kqport
//!
//! **kqport** is the readiness layer of the **Nebula** ecosystem: an event
//! port and a selector built on a BSD-style kernel event queue (kqueue).
//!
//! - [`Port`] multiplexes readiness for many descriptors across a pool of
//!   worker threads. One worker at a time blocks in the kernel queue and
//!   fans the ready events out to the others. Registrations are one-shot:
//!   a channel hears about each armed filter once and re-registers for more.
//!   The port also runs arbitrary tasks on its threads.
//! - [`Selector`] answers synchronous "what is ready now, or within `T`"
//!   queries for a set of [`SelectionKey`]s, with cross-thread interest
//!   updates and a coalescing [`wakeup`](Selector::wakeup).
//!
//! Both are generic over [`KernelQueue`]. On the BSD family the real
//! [`queue::Kqueue`] backend is available; [`LabQueue`] is an instrumented
//! in-process queue used to drive either component deterministically.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kqport::{Channel, Interest, PortBuilder, Ready};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Channel for Echo {
//!     fn on_event(&self, ready: Ready, _on_pool_thread: bool) {
//!         println!("ready: {ready:?}");
//!     }
//! }
//!
//! let port = PortBuilder::new().worker_threads(2).build_kqueue()?;
//! port.attach(fd, Arc::new(Echo))?;
//! port.register_channel(fd, Interest::READ)?;
//! ```

mod error;
mod sys;

pub mod event;
pub mod port;
pub mod queue;
pub mod selector;

pub use error::{Error, Result};
pub use event::{EventFlags, Filter, Interest, PollArray, RawEvent, Ready};
pub use port::{Channel, Port, PortBuilder, PortHandle, PortStats, Task};
pub use queue::{KernelQueue, LabQueue};
pub use selector::{Ops, SelectionKey, Selector, SelectorStats};
