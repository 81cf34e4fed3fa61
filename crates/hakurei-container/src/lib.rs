//! hakurei-container: namespaced container runtime
//!
//! Builds a root filesystem inside fresh user, mount, PID, IPC, UTS and
//! cgroup namespaces (plus network unless allowed) and runs a payload in it
//! under a seccomp filter with capabilities dropped.
//!
//! - **params** - [`Params`], the serialized description of one container
//! - **ops** - Ordered filesystem setup operations
//! - **container** - Caller side: start, serve, wait
//! - **init** - Pid 1 inside the container: pivots, ops, reaper
//!
//! ## Quick Start
//!
//! ```ignore
//! use hakurei_container::{Container, Ops, Params, BindFlags};
//!
//! let mut ops = Ops::new();
//! ops.proc("/proc").tmpfs("/tmp", 0, 0o755).bind("/bin", "/bin", BindFlags::empty());
//! let mut c = Container::new(Params {
//!     path: "/bin/true".into(),
//!     args: vec!["true".into()],
//!     ops,
//!     ..Params::default()
//! });
//! c.start()?;
//! c.serve()?;
//! assert_eq!(c.wait()?, 0);
//! ```
//!
//! The running binary must dispatch to [`init::main`] when started with
//! `argv[0]` equal to [`INIT_ARG0`].

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod container;
pub mod init;
pub mod mount;
pub mod ops;
pub mod params;
pub mod path;
pub mod setup;

pub use container::{Container, ContainerError, ENV_SETUP, INIT_ARG0};
pub use ops::{BindFlags, Op, OpError, Ops};
pub use params::{HardeningFlags, InitParams, Params};
pub use setup::SetupError;
