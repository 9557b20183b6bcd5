use anyhow::{Context as _, Result};
use clap::{error::ErrorKind, Parser};
use std::{fs::File, io::BufReader, path::PathBuf, process};
use tracing_subscriber::EnvFilter;
use wasmdebug::{
    binary::{
        parser::{ModuleParser, DEFAULT_CHUNK_SIZE},
        source::ReaderSource,
    },
    debug::DebugInfoReader,
};

/// Dumps the debug information embedded in a WebAssembly module.
#[derive(Parser, Debug)]
#[command(name = "wasmdebug")]
#[command(version)]
struct Cli {
    /// Path to the module
    path: PathBuf,
    /// Also reconstruct and print branch and call sites from the code section
    #[arg(long, default_value_t = false)]
    control_flow: bool,
    /// Largest read made from the file at once, in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            process::exit(1);
        }
    };
    init_logging();

    let file =
        File::open(&cli.path).with_context(|| format!("cannot open {}", cli.path.display()))?;
    let reader = DebugInfoReader::new().with_control_flow(cli.control_flow);
    let mut parser = ModuleParser::new(reader).with_chunk_size(cli.chunk_size.max(1));
    parser
        .parse(&mut ReaderSource::new(BufReader::new(file)))
        .with_context(|| format!("failed to decode {}", cli.path.display()))?;
    let info = parser.into_consumer().finish();

    if !info.has_debug_sections() {
        println!("No debug information found");
    }
    if info.has_debug_sections() || info.control_flow.is_some() {
        print!("{}", info);
    }
    Ok(())
}
