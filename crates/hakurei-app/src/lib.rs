//! hakurei-app: everything between the invoking user and the container.
//!
//! - **config** - [`AppConfig`], what to run and which host services to expose
//! - **seal** - Turns a config into container params and host operations
//! - **system** - Reversible host operations, committed and reverted per instance
//! - **mediator** - Wayland, PulseAudio and D-Bus plumbing
//! - **monitor** - Runs the shim through hsu and cleans up after it
//! - **shim** - Target-uid process that owns the container
//! - **state** - Records of running instances
//! - **identity** - uid arithmetic and the hsu contract
//!
//! ## Quick Start
//!
//! ```ignore
//! use hakurei_app::{AppConfig, Enablements, identity::Hsu, log::SuspendableWriter};
//!
//! let config = AppConfig::new(9, "/var/lib/hakurei/u0/a9")
//!     .id("org.example.App")
//!     .enable(Enablements::WAYLAND)
//!     .command(["foot"]);
//! let outcome = hakurei_app::run(config, &Hsu::default(), None, &SuspendableWriter::new(), false)?;
//! std::process::exit(outcome.exit_code());
//! ```

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod config;
pub mod error;
pub mod identity;
pub mod log;
pub mod mediator;
pub mod monitor;
pub mod seal;
pub mod shim;
pub mod state;
pub mod system;

use std::os::fd::OwnedFd;

pub use config::{AppConfig, BindSpec, Enablements};
pub use error::AppError;
pub use monitor::Outcome;
pub use seal::{Environment, Paths, Sealed};
pub use state::{InstanceId, State, Store};

use identity::Hsu;
use log::SuspendableWriter;

/// Seal `config` for the invoking user and run it to completion.
pub fn run(
    config: AppConfig,
    hsu: &Hsu,
    cancel: Option<OwnedFd>,
    log: &SuspendableWriter,
    verbose: bool,
) -> Result<Outcome, AppError> {
    let fid = hsu.fid()?;
    let env = Environment::capture();
    let sealed = seal::seal(config, &env, fid, InstanceId::random(), verbose)?;
    let store = Store::new(&sealed.paths.run_dir);
    Ok(monitor::run(sealed, hsu.path(), &store, cancel, log))
}

/// Every recorded instance of the invoking user, by identity.
pub fn instances(env: &Environment) -> Result<Vec<State>, AppError> {
    let store = Store::new(&Paths::new(env).run_dir);
    let mut states = Vec::new();
    for aid in store.list()? {
        states.extend(store.do_with(aid, |c| c.load())??);
    }
    Ok(states)
}
