//! hakurei - run desktop applications in an unprivileged sandbox.
//!
//! Multi-call binary: started with `argv[0]` equal to `init` it runs as pid 1
//! of a container, otherwise it parses the command line below.

use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hakurei_app::identity::{Hsu, parse_identity};
use hakurei_app::log::{self, SuspendableWriter};
use hakurei_app::mediator::dbus::Config as BusConfig;
use hakurei_app::{AppConfig, BindSpec, Enablements, Environment, shim};
use hakurei_container::{HardeningFlags, INIT_ARG0};
use hakurei_sys::seccomp::{self, ExportFlag, FilterPreset};
use hakurei_sys::signal::SignalFd;
use tracing::{debug, error, warn};

#[derive(Parser)]
#[command(name = "hakurei")]
#[command(author, version, about = "Unprivileged Linux application sandbox")]
struct Cli {
    /// Print debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command under an application identity
    Run(Box<RunArgs>),

    /// Internal: started by hsu as the target user
    #[command(hide = true)]
    Shim,

    /// Write a compiled syscall filter to stdout
    ExportSeccomp {
        /// Presets to compile in
        #[arg(short, long, value_enum, value_delimiter = ',', default_value = "strict")]
        presets: Vec<Preset>,

        /// Extra toggles
        #[arg(short, long, value_enum, value_delimiter = ',')]
        flags: Vec<Flag>,

        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List running instances
    Ps {
        /// Print the full configuration of each instance
        #[arg(long)]
        long: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Application identity (0-9999)
    #[arg(short = 'a', long, default_value = "0", value_parser = parse_aid)]
    identity: u32,

    /// Reverse-DNS application id
    #[arg(long)]
    id: Option<String>,

    /// Supplementary group, by name or number
    #[arg(short = 'g', long = "group")]
    groups: Vec<String>,

    /// Expose the compositor through a security context
    #[arg(long)]
    wayland: bool,

    /// Expose the compositor socket directly
    #[arg(long)]
    direct_wayland: bool,

    /// Expose the PulseAudio server
    #[arg(long)]
    pulse: bool,

    /// Proxy the session bus
    #[arg(long)]
    dbus: bool,

    /// Session bus name the application may talk to
    #[arg(long = "talk", requires = "dbus")]
    talk: Vec<String>,

    /// Session bus name the application may own
    #[arg(long = "own", requires = "dbus")]
    own: Vec<String>,

    /// Allow owning the MPRIS name of the application id
    #[arg(long, requires = "dbus")]
    mpris: bool,

    /// Log filtered bus traffic
    #[arg(long, requires = "dbus")]
    dbus_log: bool,

    /// Also proxy the system bus
    #[arg(long, requires = "dbus")]
    system_bus: bool,

    /// System bus name the application may talk to
    #[arg(long = "system-talk", requires = "system_bus")]
    system_talk: Vec<String>,

    /// Allow ptrace, perf and personality changes
    #[arg(long)]
    allow_devel: bool,

    /// Allow nested user namespaces
    #[arg(long)]
    allow_userns: bool,

    /// Allow terminal input injection
    #[arg(long)]
    allow_tty: bool,

    /// Share the host network namespace
    #[arg(long)]
    allow_net: bool,

    /// Skip the extended syscall rules
    #[arg(long)]
    syscall_compat: bool,

    /// Allow 32-bit syscalls
    #[arg(long)]
    multiarch: bool,

    /// Keep CAP_SYS_ADMIN inside the container
    #[arg(long)]
    privileged: bool,

    /// Map the target user to the invoking user's uid inside the container
    #[arg(long)]
    map_real_uid: bool,

    /// Extra bind: SRC[:DST][:rw,dev,opt]
    #[arg(short = 'b', long = "bind", value_name = "SPEC")]
    binds: Vec<BindSpec>,

    /// Home directory on the host [default: /var/lib/hakurei/u<fid>/a<aid>]
    #[arg(short = 'd', long)]
    data: Option<PathBuf>,

    /// Home directory inside the container [default: same as --data]
    #[arg(long)]
    home: Option<PathBuf>,

    /// User name inside the container
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Login shell inside the container
    #[arg(short = 's', long)]
    shell: Option<PathBuf>,

    /// Hostname inside the container
    #[arg(long)]
    hostname: Option<String>,

    /// Environment variable KEY=VALUE
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Seconds between the interrupt and SIGKILL
    #[arg(long, value_name = "SECS", value_parser = parse_secs)]
    wait_delay: Option<Duration>,

    /// Command and arguments [default: the login shell]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Ext,
    DenyNs,
    DenyTty,
    DenyDevel,
    Linux32,
    Strict,
}

impl From<Preset> for FilterPreset {
    fn from(p: Preset) -> Self {
        match p {
            Preset::Ext => Self::EXT,
            Preset::DenyNs => Self::DENY_NS,
            Preset::DenyTty => Self::DENY_TTY,
            Preset::DenyDevel => Self::DENY_DEVEL,
            Preset::Linux32 => Self::LINUX32,
            Preset::Strict => Self::STRICT,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Flag {
    Multiarch,
    Can,
    Bluetooth,
}

impl From<Flag> for ExportFlag {
    fn from(f: Flag) -> Self {
        match f {
            Flag::Multiarch => Self::ALLOW_MULTIARCH,
            Flag::Can => Self::ALLOW_CAN,
            Flag::Bluetooth => Self::ALLOW_BLUETOOTH,
        }
    }
}

fn parse_aid(s: &str) -> Result<u32, String> {
    parse_identity(s).map_err(|e| e.to_string())
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}

impl RunArgs {
    fn config(self, fid: u32) -> AppConfig {
        let data = self
            .data
            .unwrap_or_else(|| PathBuf::from(format!("/var/lib/hakurei/u{fid}/a{}", self.identity)));
        let mut c = AppConfig::new(self.identity, data).command(self.command);
        if let Some(id) = self.id {
            c = c.id(id);
        }
        for g in self.groups {
            c = c.group(g);
        }
        for b in self.binds {
            c = c.bind(b);
        }
        for (k, v) in self.env {
            c = c.env(k, v);
        }
        if let Some(home) = self.home {
            c = c.home(home);
        }
        if let Some(name) = self.username {
            c = c.username(name);
        }
        if let Some(shell) = self.shell {
            c = c.shell(shell);
        }
        if let Some(delay) = self.wait_delay {
            c = c.wait_delay(delay);
        }

        let mut e = Enablements::empty();
        e.set(Enablements::WAYLAND, self.wayland || self.direct_wayland);
        e.set(Enablements::PULSE, self.pulse);
        e.set(Enablements::DBUS, self.dbus);
        c = c.enable(e);
        c.direct_wayland = self.direct_wayland;

        if self.dbus {
            let mut session = BusConfig::new(&c.id, true, self.mpris);
            session.talk.extend(self.talk);
            session.own.extend(self.own);
            session.log = self.dbus_log;
            c = c.session_bus(session);
            if self.system_bus {
                let mut system = BusConfig::new(&c.id, false, false);
                system.talk.extend(self.system_talk);
                system.log = self.dbus_log;
                c = c.system_bus(system);
            }
        }

        let mut flags = HardeningFlags::empty();
        flags.set(HardeningFlags::ALLOW_DEVEL, self.allow_devel);
        flags.set(HardeningFlags::ALLOW_USERNS, self.allow_userns);
        flags.set(HardeningFlags::ALLOW_TTY, self.allow_tty);
        flags.set(HardeningFlags::ALLOW_NET, self.allow_net);
        flags.set(HardeningFlags::SYSCALL_COMPAT, self.syscall_compat);
        c = c.flags(flags);
        c.multiarch = self.multiarch;
        c.privileged = self.privileged;
        c.map_real_uid = self.map_real_uid;
        if let Some(hostname) = self.hostname {
            c.hostname = hostname;
        }
        c
    }
}

fn init_log(verbose: bool) {
    log::init(verbose, SuspendableWriter::new());
}

fn main() {
    let arg0 = std::env::args_os().next();
    if arg0.as_deref().map(Path::new).and_then(Path::file_name) == Some(OsStr::new(INIT_ARG0)) {
        hakurei_container::init::main(init_log);
    }

    let cli = Cli::parse();
    let verbose = cli.verbose;
    let writer = SuspendableWriter::new();
    let start_log = || log::init(verbose, writer.clone());
    let result = match cli.command {
        Commands::Shim => shim::main(init_log),
        Commands::Run(args) => {
            start_log();
            run_app(*args, verbose, &writer)
        }
        Commands::ExportSeccomp {
            presets,
            flags,
            output,
        } => {
            start_log();
            let presets = presets
                .into_iter()
                .fold(FilterPreset::empty(), |acc, p| acc | p.into());
            let flags = flags
                .into_iter()
                .fold(ExportFlag::empty(), |acc, f| acc | f.into());
            export_seccomp(presets, flags, output.as_deref()).map(|()| 0)
        }
        Commands::Ps { long } => {
            start_log();
            ps(long).map(|()| 0)
        }
    };
    let code = result.unwrap_or_else(|e| {
        error!("{e:#}");
        1
    });
    std::process::exit(code)
}

fn run_app(args: RunArgs, verbose: bool, writer: &SuspendableWriter) -> anyhow::Result<i32> {
    if let Err(e) = hakurei_sys::check() {
        bail!("this system cannot run the sandbox: {e}");
    }

    // SIGINT and SIGTERM stay blocked from here on; hsu starts with an empty mask
    let interrupt = SignalFd::interrupt().context("cannot set up interrupt handling")?;

    let hsu = Hsu::default();
    let fid = hsu.fid()?;
    let config = args.config(fid);
    debug!(aid = config.identity, enablements = %config.enablements, "running application");

    let outcome = hakurei_app::run(
        config,
        &hsu,
        Some(OwnedFd::from(interrupt)),
        writer,
        verbose,
    )?;
    if let Some(e) = &outcome.revert {
        warn!("cannot revert host changes: {e}");
    }
    if let Some(e) = &outcome.error {
        error!("{e}");
    }
    Ok(outcome.exit_code())
}

fn export_seccomp(
    presets: FilterPreset,
    flags: ExportFlag,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let mut exporter = seccomp::Exporter::new(presets, flags)?;
    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(
            std::fs::File::create(path).with_context(|| format!("cannot create {path:?}"))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let n = io::copy(exporter.reader(), &mut out).context("cannot write filter")?;
    out.flush()?;
    exporter.wait()?;
    debug!("wrote {n} bytes of filter");
    Ok(())
}

fn ps(long: bool) -> anyhow::Result<()> {
    let env = Environment::capture();
    let states = hakurei_app::instances(&env)?;
    let mut out = io::stdout().lock();
    if long {
        for s in &states {
            writeln!(out, "{}\t{:#?}", s.id, s.config)?;
        }
        return Ok(());
    }

    writeln!(out, "{:<8}  {:>4}  {:>8}  {:<19}  {:<24}  COMMAND", "INSTANCE", "AID", "PID", "STARTED", "ENABLEMENTS")?;
    for s in &states {
        let id = s.id.to_string();
        writeln!(
            out,
            "{:<8}  {:>4}  {:>8}  {:<19}  {:<24}  {}",
            &id[..8],
            s.config.identity,
            s.pid,
            s.time.format("%Y-%m-%d %H:%M:%S"),
            s.config.enablements.to_string(),
            s.config.args.join(" "),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(std::iter::once("hakurei").chain(argv.iter().copied())).unwrap();
        match cli.command {
            Commands::Run(args) => *args,
            _ => panic!("not a run command"),
        }
    }

    #[test]
    fn cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_config() {
        let c = run_args(&[
            "run", "-a", "9", "--id", "org.example.App", "--wayland", "--dbus", "--mpris",
            "--talk", "org.example.Other", "--allow-net", "-b", "/dev/dri:dev,opt", "-e",
            "LANG=C.UTF-8", "--", "foot", "-e", "htop",
        ])
        .config(2);
        assert_eq!(c.identity, 9);
        assert_eq!(c.data, Path::new("/var/lib/hakurei/u2/a9"));
        assert_eq!(c.enablements, Enablements::WAYLAND | Enablements::DBUS);
        assert!(!c.direct_wayland);
        assert_eq!(c.args, ["foot", "-e", "htop"]);
        assert_eq!(c.env["LANG"], "C.UTF-8");
        assert!(c.flags.contains(HardeningFlags::ALLOW_NET));
        assert_eq!(c.binds.len(), 1);
        let session = c.session_bus.as_ref().unwrap();
        assert!(session.talk.iter().any(|t| t == "org.example.Other"));
        assert!(session.own.iter().any(|o| o == "org.mpris.MediaPlayer2.org.example.App.*"));
        assert!(c.system_bus.is_none());
        c.validate().unwrap();
    }

    #[test]
    fn run_rejects_bad_input() {
        for argv in [
            &["hakurei", "run", "-a", "10000"][..],
            &["hakurei", "run", "-e", "NOVALUE"],
            &["hakurei", "run", "-b", "relative"],
        ] {
            assert!(Cli::try_parse_from(argv).is_err(), "{argv:?}");
        }
    }

    #[test]
    fn direct_wayland_implies_wayland() {
        let c = run_args(&["run", "--direct-wayland", "-d", "/home/app"]).config(0);
        assert!(c.enablements.contains(Enablements::WAYLAND));
        assert!(c.direct_wayland);
        assert_eq!(c.data, Path::new("/home/app"));
    }

    #[test]
    fn export_flags() {
        let cli = Cli::try_parse_from(["hakurei", "export-seccomp", "-p", "ext,deny-ns", "-f", "multiarch"])
            .unwrap();
        let Commands::ExportSeccomp { presets, flags, .. } = cli.command else {
            panic!("not export-seccomp");
        };
        let presets = presets
            .into_iter()
            .fold(FilterPreset::empty(), |acc, p| acc | FilterPreset::from(p));
        assert_eq!(presets, FilterPreset::EXT | FilterPreset::DENY_NS);
        assert_eq!(flags.len(), 1);
    }
}
