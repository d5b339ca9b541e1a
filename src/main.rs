use clap::Parser;
use minixcompat::supervisor::Outcome;

/// Run a MINIX 1.5 user-mode executable on a modern POSIX host.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the MINIX a.out executable to run.
    tool_path: Option<String>,

    /// Arguments to pass to the executable.
    tool_args: Vec<String>,

    /// Log unimplemented syscalls and other diagnostics.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.debug && std::env::var("RUST_LOG").is_err() {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let Some(tool_path) = cli.tool_path else {
        eprintln!("usage: minixcompat <tool-path> [args...]");
        std::process::exit(64);
    };

    match minixcompat::run_tool(&tool_path, &cli.tool_args, cli.debug) {
        Outcome::GuestExit(status) => std::process::exit(status),
        Outcome::OsError => std::process::exit(71),
    }
}
