use std::path::Path;

use clap::{Parser, Subcommand};
use jit_options::{parse_jit_options, OptionWarning};
use rhojit::JitConfig;
use tracing_subscriber::layer::SubscriberExt;
use upcall_thunk::{generate_thunk, sig::Signature, thunk_size, Abi};
use util::{env_flag, hex_dump, make_log_file, parse_address, EmptyWriter};

mod formatter;
mod util;

pub const ENV_LOG_CONSOLE: &str = "RHOJIT_LOG_CONSOLE";
pub const ENV_LOG_FILE: &str = "RHOJIT_LOG_FILE";
const LOG_FILE: &str = "./rhojit.log";

#[derive(Debug, Parser)]
#[clap(name = "RhoJIT (Frontend)")]
#[clap(version = "0.1.0")]
#[clap(about = "Inspect the runtime pieces of the jit")]
#[clap(propagate_version = true)]
struct CliArgs {
    #[clap(subcommand)]
    command: CliCommands,
}

#[derive(Debug, Subcommand)]
enum CliCommands {
    /// Generate an upcall thunk and dump its code
    Thunk {
        /// Signature such as `(i,d,{16:all-dp},p)j`
        #[clap(value_name = "SIGNATURE")]
        signature: String,
        /// Calling convention, defaults to the one of this machine
        #[clap(long)]
        abi: Option<String>,
        /// Address of the metadata record, in hex
        #[clap(long, default_value = "0")]
        metadata: String,
    },
    /// Parse an option string and print the configuration it results in
    Options {
        /// Option string such as `-Xjit:enableRATPurging,classExtendRatSize=3079`
        #[clap(value_name = "OPTIONS", default_value = "")]
        options: String,
    },
    /// List the calling conventions that thunks can be generated for
    Abis,
}

fn init_logging(conf: &JitConfig) {
    let should_log_console = env_flag(ENV_LOG_CONSOLE, true);
    let should_log_file = env_flag(ENV_LOG_FILE, false);

    let console_layer = if should_log_console {
        Some(
            tracing_subscriber::fmt::Layer::default()
                .with_writer(std::io::stderr)
                .without_time()
                .event_format(formatter::Formatter),
        )
    } else {
        None
    };
    let file_layer = if should_log_file {
        match make_log_file(Path::new(LOG_FILE)) {
            Ok(file) => Some(
                tracing_subscriber::fmt::Layer::default()
                    .with_writer(file)
                    .without_time()
                    .event_format(formatter::Formatter),
            ),
            Err(err) => {
                eprintln!("Failed to open log file {}: {}", LOG_FILE, err);
                None
            }
        }
    } else {
        None
    };

    let t_subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(conf.tracing_level)
        .without_time()
        .event_format(formatter::Formatter)
        .with_writer(|| EmptyWriter)
        .finish()
        .with(console_layer)
        .with(file_layer);

    if tracing::subscriber::set_global_default(t_subscriber).is_err() {
        eprintln!("A global tracing subscriber was already set");
    }
}

fn main() {
    // Note that clap autoexits if it didn't get a thing to do
    let args = CliArgs::parse();

    init_logging(&JitConfig::new());

    let result = match &args.command {
        CliCommands::Thunk {
            signature,
            abi,
            metadata,
        } => dump_thunk(signature, abi.as_deref(), metadata),
        CliCommands::Options { options } => print_options(options),
        CliCommands::Abis => {
            let host = Abi::host();
            for abi in Abi::ALL {
                let marker = if Some(abi) == host { " (host)" } else { "" };
                println!("{}{}", abi.name(), marker);
            }
            Ok(())
        }
    };

    if let Err(err) = result {
        tracing::error!("{}", err);
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn dump_thunk(signature: &str, abi: Option<&str>, metadata: &str) -> Result<(), String> {
    let abi = match abi {
        Some(name) => Abi::from_name(name).ok_or_else(|| {
            let known: Vec<&str> = Abi::ALL.iter().map(|abi| abi.name()).collect();
            format!("unknown abi '{}', expected one of {}", name, known.join(", "))
        })?,
        None => Abi::host().ok_or("this machine has no supported abi, pass --abi")?,
    };
    let signature: Signature = signature
        .parse()
        .map_err(|err| format!("bad signature: {:?}", err))?;
    let metadata =
        parse_address(metadata).map_err(|err| format!("bad metadata address: {}", err))?;

    let size = thunk_size(abi, &signature).map_err(|err| format!("{:?}", err))?;
    let code = generate_thunk(abi, &signature, metadata).map_err(|err| format!("{:?}", err))?;
    tracing::info!("Generated thunk for {} on {}", signature, abi.name());

    println!("{} {}: {} bytes", abi.name(), signature, size);
    print!("{}", hex_dump(&code));
    Ok(())
}

fn print_options(text: &str) -> Result<(), String> {
    let options = parse_jit_options(text, |warning| match warning {
        OptionWarning::DuplicateOption(name) => {
            tracing::warn!("Option '{}' was given more than once, using the last", name);
        }
    })
    .map_err(|err| format!("bad option string: {:?}", err))?;

    let config = JitConfig::from_options(&options).map_err(|err| format!("{:?}", err))?;
    println!("{:#?}", config);
    println!("unloaded address ranges: {}", config.unloaded_address_ranges());
    Ok(())
}

