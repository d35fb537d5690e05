//! qspi-aes-demo - encrypted QSPI flash program/verify against an emulated device.

use clap::{Parser, ValueEnum};

use qspi_aes_flash::emulator::{EmulatedConfig, EmulatedFlash};
use qspi_aes_flash::{Command, Flash, LogFault, ProgramVerify, SoftAes, DEFAULT_MAX_BUSY_POLLS};

#[derive(Parser, Debug)]
#[command(name = "qspi-aes-demo", version, about)]
struct Cli {
    /// Page address to program (decimal or 0x-prefixed hex)
    #[arg(short, long, default_value = "0", value_parser = parse_address)]
    address: u32,

    /// Status reads the emulated device reports busy after each erase or program
    #[arg(long, default_value_t = 3)]
    busy_polls: usize,

    /// Maximum status reads before giving up on a busy device
    #[arg(long, default_value_t = DEFAULT_MAX_BUSY_POLLS, conflicts_with = "unbounded")]
    max_polls: usize,

    /// Poll the status register until ready, however long it takes
    #[arg(long)]
    unbounded: bool,

    /// Inject a bus failure on the first use of this command
    #[arg(long, value_enum)]
    fail_on: Option<CliCommand>,

    /// Block-protect the target sector so erase and program are ignored
    #[arg(long)]
    protect: bool,

    /// Draw a progress bar instead of relying on log output alone
    #[arg(long)]
    progress: bool,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CliCommand {
    ReadStatus,
    WriteEnable,
    SectorErase,
    QuadPageProgram,
    QuadIoRead,
}

impl From<CliCommand> for Command {
    fn from(c: CliCommand) -> Self {
        match c {
            CliCommand::ReadStatus => Command::ReadStatus,
            CliCommand::WriteEnable => Command::WriteEnable,
            CliCommand::SectorErase => Command::SectorErase,
            CliCommand::QuadPageProgram => Command::QuadPageProgram,
            CliCommand::QuadIoRead => Command::QuadIoRead,
        }
    }
}

fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

/// Default log filter for the given number of `-v` flags; `RUST_LOG` overrides it.
fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter(cli.verbose))).init();

    log::info!("****************** Running QSPI memory read/write demo ******************");
    log::info!("Erase, write and read are executed on the QSPI memory with AES encryption and decryption.");

    let mut emu = EmulatedFlash::new(EmulatedConfig { busy_polls: cli.busy_polls, ..Default::default() });
    if let Some(command) = cli.fail_on {
        emu.fail_on(command.into());
    }
    if cli.protect {
        emu.protect_sector(cli.address);
    }

    let mut flash = Flash::new(emu);
    if cli.unbounded {
        log::warn!("Busy polling is unbounded; a stuck device will hang the demo");
        flash.set_max_busy_polls(None);
    } else {
        flash.set_max_busy_polls(Some(cli.max_polls));
    }

    let mut demo = ProgramVerify::new(flash, SoftAes::new(), cli.address);
    let result = if cli.progress { demo.run_progress() } else { demo.run() };

    if let Err(failure) = result {
        failure.report(&mut LogFault);
        std::process::exit(1);
    }
}

#[test]
fn test_verbose_raises_log_filter() {
    assert_eq!(log_filter(0), "info");
    assert_eq!(log_filter(1), "debug");
    assert_eq!(log_filter(2), "trace");
    assert_eq!(log_filter(5), "trace");

    let cli = Cli::try_parse_from(["qspi-aes-demo", "-vv"]).unwrap();
    assert_eq!(log_filter(cli.verbose), "trace");
    let cli = Cli::try_parse_from(["qspi-aes-demo"]).unwrap();
    assert_eq!(log_filter(cli.verbose), "info");
}
