#[cfg(test)]
#[macro_use]
extern crate assert_matches;
extern crate clap;
extern crate rusb;
extern crate u2f_usb_bridge;

use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::time::Duration;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;
use tracing::{error, info, Level};
use u2f_usb_bridge::{BridgeConfig, BridgeSession, Framing};

use crate::rusb_host::{DeviceFilter, RusbHost};

mod rusb_host;

const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const VERSION: &str = env!("CARGO_PKG_VERSION");
const REQUEST_ARG: &str = "request";
const CONFIG_ARG: &str = "config";
const TIMEOUT_ARG: &str = "timeout";
const ENFORCE_FIDO_USAGE_ARG: &str = "enforce_fido_usage";
const FRAMING_ARG: &str = "framing";
const DEVICE_ARG: &str = "device";
const VERBOSE_ARG: &str = "verbose";

#[derive(Debug, Error)]
enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Config file {path:?} not found")]
    ConfigNotFound { path: PathBuf },

    #[error("Bridge worker panicked")]
    WorkerPanicked,

    #[error("No response")]
    NoResponse,
}

fn main() {
    let args = Command::new("U2F USB Bridge")
        .version(VERSION)
        .author(AUTHORS)
        .about(DESCRIPTION)
        .arg(
            Arg::new(REQUEST_ARG)
                .num_args(1)
                .help("Request envelope, read from standard input when omitted"),
        )
        .arg(
            Arg::new(CONFIG_ARG)
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new(TIMEOUT_ARG)
                .short('t')
                .long("timeout")
                .num_args(1)
                .value_parser(value_parser!(u64))
                .help("Cancel the request after this many seconds"),
        )
        .arg(
            Arg::new(ENFORCE_FIDO_USAGE_ARG)
                .long("enforce-fido-usage")
                .action(ArgAction::SetTrue)
                .help("Only use interfaces whose report descriptor declares the FIDO usage page"),
        )
        .arg(
            Arg::new(FRAMING_ARG)
                .long("framing")
                .num_args(1)
                .value_parser(["u2f-hid", "raw"])
                .help("How APDUs are carried over the HID interface"),
        )
        .arg(
            Arg::new(DEVICE_ARG)
                .short('d')
                .long("device")
                .num_args(1)
                .value_parser(DeviceFilter::parse)
                .help("Only use the device with this vendor:product id, in hex"),
        )
        .arg(
            Arg::new(VERBOSE_ARG)
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Log more detail to standard error, repeat for more"),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(log_level(args.get_count(VERBOSE_ARG)))
        .init();

    info!(version = VERSION, "Starting U2F USB bridge");

    match run(&args) {
        Ok(response) => println!("{}", response),
        Err(err) => {
            error!(error = %err, "Finished without a response");
            process::exit(1);
        }
    }
}

fn log_level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn run(args: &ArgMatches) -> Result<String, Error> {
    let envelope = match args.get_one::<String>(REQUEST_ARG) {
        Some(envelope) => envelope.clone(),
        None => {
            let mut envelope = String::new();
            io::stdin().read_to_string(&mut envelope)?;
            envelope
        }
    };

    let config = configure(args)?;
    let host = RusbHost::new(args.get_one::<DeviceFilter>(DEVICE_ARG).copied())?;
    let session = BridgeSession::new(host, config);

    let (sender, receiver) = mpsc::channel();
    let handle = session.spawn(&envelope, move |result| {
        // The receiver only goes away once we stopped waiting
        let _ = sender.send(result);
    });

    let result = match args.get_one::<u64>(TIMEOUT_ARG) {
        Some(seconds) => match receiver.recv_timeout(Duration::from_secs(*seconds)) {
            Ok(result) => result,
            Err(_) => {
                info!(seconds, "Timed out, cancelling");
                handle.cancel();
                receiver.recv().ok().flatten()
            }
        },
        None => receiver.recv().ok().flatten(),
    };
    handle.join().map_err(|_| Error::WorkerPanicked)?;

    result.ok_or(Error::NoResponse)
}

fn configure(args: &ArgMatches) -> Result<BridgeConfig, Error> {
    let mut config = match args.get_one::<PathBuf>(CONFIG_ARG) {
        Some(path) => BridgeConfig::load(path)?.ok_or_else(|| Error::ConfigNotFound {
            path: path.clone(),
        })?,
        None => BridgeConfig::default(),
    };
    if args.get_flag(ENFORCE_FIDO_USAGE_ARG) {
        config.enforce_fido_usage = true;
    }
    if let Some(framing) = args.get_one::<String>(FRAMING_ARG) {
        config.framing = match framing.as_str() {
            "raw" => Framing::Raw,
            _ => Framing::U2fHid,
        };
    }
    Ok(config)
}
