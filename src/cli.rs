mod check;
mod introspect_sample;

use {
    crate::logger::Logger,
    ::log::Level,
    clap::{Args, Parser, Subcommand, ValueEnum},
    std::path::PathBuf,
};

/// Typed D-Bus proxies for integration tests.
#[derive(Parser, Debug)]
#[command(version)]
struct Busprobe {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// The log level.
    #[arg(value_enum, long, global = true, default_value_t)]
    pub log_level: CliLogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Load interface descriptions and print the generated proxy surfaces.
    Check(CheckArgs),
    /// Print the description of the standard introspection interface.
    IntrospectSample,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Introspection XML files with exactly one interface each.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(ValueEnum, Debug, Copy, Clone, Hash, Default)]
pub enum CliLogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Trace => Level::Trace,
            CliLogLevel::Debug => Level::Debug,
            CliLogLevel::Info => Level::Info,
            CliLogLevel::Warn => Level::Warn,
            CliLogLevel::Error => Level::Error,
        }
    }
}

pub fn main() {
    let cli = Busprobe::parse();
    Logger::install_stderr(cli.global.log_level.into());
    match cli.command {
        Cmd::Check(a) => check::main(cli.global, a),
        Cmd::IntrospectSample => introspect_sample::main(cli.global),
    }
}
