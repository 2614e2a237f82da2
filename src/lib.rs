//! # Conduit
//!
//! A zero-copy dataflow transport and worker scheduler over shared-memory
//! endpoints.
//!
//! Workers exchange fixed-size buffers through ports. Each port's buffers
//! and flow-control state live in an endpoint's shared memory; producers
//! and consumers synchronize purely through state words written with
//! release/acquire ordering, so neither side ever blocks the other.
//!
//! ## Layers
//!
//! - **Memory**: mapped segments and the bounds-checked [`memory::SharedRegion`]
//! - **Endpoints**: URI-addressed memory participants ([`endpoint`])
//! - **Transfer**: drivers, the per-pair template cache and requests
//!   ([`transfer::TransportContext`])
//! - **Ports and circuits**: buffer rings, the descriptor handshake and the
//!   four transfer-controller variants ([`circuit::Circuit`])
//! - **Scheduling**: workers with run conditions driven by a
//!   [`container::Container`]
//!
//! ## Quick Start
//!
//! ```rust
//! use conduit::prelude::*;
//!
//! # fn main() -> conduit::Result<()> {
//! let ctx = TransportContext::with_pio(TransportConfig::default());
//! let mut container = Container::new("quickstart", ctx)?;
//!
//! let mut sent = false;
//! let producer = container.add_worker(
//!     WorkerSpec::new("producer").with_port(PortDecl::output("out")),
//!     move |ctx: &mut RunContext<'_>, _: bool| {
//!         if sent {
//!             return RunResult::Done;
//!         }
//!         let Some(buf) = ctx.output(0) else { return RunResult::Ok };
//!         buf[..2].copy_from_slice(b"hi");
//!         ctx.set_output(0, 2, 0);
//!         sent = true;
//!         RunResult::Advance
//!     },
//! )?;
//! let consumer = container.add_worker(
//!     WorkerSpec::new("consumer").with_port(PortDecl::input("in")),
//!     |ctx: &mut RunContext<'_>, _: bool| {
//!         assert_eq!(ctx.input(0), Some(&b"hi"[..]));
//!         RunResult::Done
//!     },
//! )?;
//! container.connect(producer, 0, consumer, 0, &ConnectOptions::default())?;
//! container.run_until_idle(10)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod circuit;
pub mod config;
pub mod container;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod observability;
pub mod port;
pub mod process;
pub mod transfer;
pub mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::circuit::{
        BufferHandle, Circuit, CircuitId, CircuitSpec, Distribution, PortSetSpec, ProduceOutcome,
    };
    pub use crate::config::{SchedulerConfig, TransportConfig};
    pub use crate::container::{ConnectOptions, Container, WorkerId, WorkerState};
    pub use crate::error::{Error, Result};
    pub use crate::port::BufferMetaData;
    pub use crate::transfer::TransportContext;
    pub use crate::worker::{PortDecl, RunCondition, RunContext, RunResult, Worker, WorkerSpec};
}

pub use error::{Error, Result};
