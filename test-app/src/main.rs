// atgsm test application -- CLI tool for exercising a GSM modem (or the
// mock transport) from the command line.
//
// Usage:
//   atgsm-test-app --port /dev/ttyUSB2 info
//   atgsm-test-app --port /dev/ttyUSB2 --detect signal
//   atgsm-test-app --port /dev/ttyUSB2 storage --name SM
//   atgsm-test-app --port /dev/ttyUSB2 list --status all
//   atgsm-test-app --port /dev/ttyUSB2 ussd "*888#,1"
//   atgsm-test-app --port /dev/ttyUSB2 at "AT+COPS?"
//   atgsm-test-app --port /dev/ttyUSB2 --country-code 62 monitor --duration 600
//   atgsm-test-app --mock signal
//
// Sending and reading messages needs a PDU codec. The serial build has none,
// so those commands report "not supported" unless --mock is used, which
// wires in the readable test codec.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use atgsm::io::Command as AtCommand;
use atgsm::modem::{GsmModem, GsmModemBuilder, ModemOptions};
use atgsm::transport::FlowControl;
use atgsm::{DriverSet, MessageStatus, ModemEvent};
use atgsm_test_harness::{MockCodec, MockTransport};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// atgsm test application -- exercises a GSM modem from the command line.
#[derive(Parser)]
#[command(name = "atgsm-test-app", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyUSB2, COM3).
    /// Required unless --mock is used.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Use RTS/CTS hardware flow control.
    #[arg(long)]
    rtscts: bool,

    /// Identify the modem with ATI before starting and pick a matching
    /// driver.
    #[arg(long)]
    detect: bool,

    /// Country calling code for local numbers (e.g. 62).
    #[arg(long)]
    country_code: Option<String>,

    /// File holding the multi-part message reference counter.
    #[arg(long)]
    msgref_file: Option<String>,

    /// Delete messages from storage once they are read.
    #[arg(long)]
    delete_on_read: bool,

    /// Empty a storage when the modem reports it full.
    #[arg(long)]
    empty_when_full: bool,

    /// Per-command timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Use a mock transport instead of a real serial port.
    /// Query commands get canned replies; useful for verifying CLI parsing
    /// and builder wiring without hardware.
    #[arg(long)]
    mock: bool,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the modem and print its identity and properties.
    Info,

    /// Read the signal strength.
    Signal,

    /// Read the service centre address.
    Smsc,

    /// Read the registered operator.
    Network,

    /// Scan for available operators (slow).
    Networks,

    /// Character set operations.
    Charset {
        #[command(subcommand)]
        action: CharsetAction,
    },

    /// Show storage occupancy.
    Storage {
        /// Storage to select first (e.g. SM, ME, SR).
        #[arg(long)]
        name: Option<String>,
    },

    /// List messages in the selected storage.
    List {
        #[arg(long, default_value = "all", value_enum)]
        status: StatusArg,

        /// Storage to select first.
        #[arg(long)]
        storage: Option<String>,
    },

    /// Read one message.
    Read {
        storage: String,
        index: u32,
    },

    /// Delete one message.
    Delete {
        storage: String,
        index: u32,
    },

    /// Delete every message in a storage.
    Empty {
        storage: String,
    },

    /// Send a text message.
    Send {
        /// Destination number.
        to: String,
        /// Message text; long texts are split into several PDUs.
        text: String,
    },

    /// Dial a number.
    Dial {
        number: String,
    },

    /// Answer an incoming call.
    Answer,

    /// Hang up.
    Hangup,

    /// Run a USSD session (comma separated codes for menu steps).
    Ussd {
        codes: String,
    },

    /// Send a raw AT command and print the decoded updates.
    At {
        command: String,
    },

    /// Print modem events and busy/idle transitions as they happen.
    Monitor {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },
}

#[derive(Subcommand)]
enum CharsetAction {
    /// Read the current character set.
    Get,
    /// List supported character sets.
    List,
    /// Select a character set.
    Set { charset: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Unread,
    Read,
    Unsent,
    Sent,
    All,
}

impl From<StatusArg> for MessageStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Unread => MessageStatus::ReceivedUnread,
            StatusArg::Read => MessageStatus::ReceivedRead,
            StatusArg::Unsent => MessageStatus::StoredUnsent,
            StatusArg::Sent => MessageStatus::StoredSent,
            StatusArg::All => MessageStatus::All,
        }
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A mock transport with canned replies for the single-query commands.
fn mock_transport(command: &Command) -> MockTransport {
    let mut mock = MockTransport::new();
    match command {
        Command::Signal => mock.expect(b"AT+CSQ\r\n", b"\r\n+CSQ: 21,99\r\n\r\nOK\r\n"),
        Command::Smsc => mock.expect(b"AT+CSCA?\r\n", b"\r\n+CSCA: \"+62816124\",145\r\n\r\nOK\r\n"),
        Command::Network => mock.expect(b"AT+COPS?\r\n", b"\r\n+COPS: 0,0,\"MOCKTEL\"\r\n\r\nOK\r\n"),
        Command::Storage { name: None } => mock.expect(
            b"AT+CPMS?\r\n",
            b"\r\n+CPMS: \"SM\",3,40,\"SM\",3,40,\"SM\",3,40\r\n\r\nOK\r\n",
        ),
        Command::Ussd { codes } if !codes.contains(',') => mock.expect(
            format!("AT+CUSD=1,{codes},15\r\n").as_bytes(),
            b"\r\n+CUSD: 0,\"Mock balance: 0\",15\r\n\r\nOK\r\n",
        ),
        _ => {}
    }
    mock
}

async fn create_modem(cli: &Cli) -> Result<GsmModem> {
    let flow_control = if cli.rtscts {
        FlowControl::Hardware
    } else {
        FlowControl::None
    };
    let mut builder = GsmModemBuilder::new()
        .baud_rate(cli.baud)
        .flow_control(flow_control)
        .command_timeout(Duration::from_millis(cli.timeout_ms))
        .options(ModemOptions {
            delete_message_on_read: cli.delete_on_read,
            empty_when_full: cli.empty_when_full,
            ..Default::default()
        });
    if let Some(code) = &cli.country_code {
        builder = builder.country_code(code);
    }
    if let Some(path) = &cli.msgref_file {
        builder = builder.message_reference_file(path);
    }
    if cli.detect {
        builder = builder.detect_driver(DriverSet::new());
    }

    if cli.mock {
        let modem = builder
            .name("mock")
            .codec(Arc::new(MockCodec::new()))
            .build_with_transport(Box::new(mock_transport(&cli.command)))
            .await
            .context("failed to build modem with mock transport")?;
        println!("Connected (mock transport)");
        return Ok(modem);
    }

    let port = cli
        .port
        .as_deref()
        .context("--port is required when not using --mock")?;
    let modem = builder
        .name(port)
        .serial_port(port)
        .build()
        .await
        .with_context(|| format!("failed to open modem on {port}"))?;
    println!("Connected -- {port} at {} baud, driver {}", cli.baud, modem.driver().name());
    Ok(modem)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn show<T: std::fmt::Debug>(label: &str, value: Option<T>) {
    match value {
        Some(v) => println!("  {label:<16}{v:?}"),
        None => println!("  {label:<16}-"),
    }
}

async fn cmd_info(modem: &GsmModem) -> Result<()> {
    modem.initialize().await.context("initialization failed")?;
    let info = modem.info().await;
    let state = modem.state();

    println!("Modem Information");
    show("Name:", info.friendly_name);
    show("Manufacturer:", info.manufacturer);
    show("Model:", info.model);
    show("Version:", info.version);
    show("IMEI:", info.serial);
    show("IMSI:", info.imsi);
    println!();
    println!("Capabilities");
    println!("  {:<16}{}", "Calls:", info.has_call);
    println!("  {:<16}{}", "SMS:", info.has_sms);
    println!("  {:<16}{}", "USSD:", info.has_ussd);
    println!();
    println!("State");
    show("SMSC:", state.smsc);
    show("Operator:", state.network.and_then(|n| n.operator));
    show("Charset:", state.charset);
    println!("  {:<16}{}", "Charsets:", state.charsets.join(", "));
    show("SMS mode:", state.sms_mode);
    show("Storage:", state.storage);
    for slot in state.storages.values() {
        println!("  {:<16}{}/{}", format!("{}:", slot.storage), slot.used, slot.total);
    }
    Ok(())
}

async fn cmd_storage(modem: &GsmModem, name: Option<&str>) -> Result<()> {
    match modem.get_storage(name).await? {
        Some(report) => {
            for info in &report.storages {
                let marker = if info.storage == report.primary.storage { "*" } else { " " };
                let full = if info.is_full() { " (full)" } else { "" };
                println!("{marker} {:<4} {}/{}{full}", info.storage, info.used, info.total);
            }
        }
        None => println!("No storage report."),
    }
    Ok(())
}

async fn cmd_list(modem: &GsmModem, status: StatusArg, storage: Option<&str>) -> Result<()> {
    if let Some(storage) = storage {
        modem.set_storage(storage).await?;
    }
    let messages = modem.list_messages(status.into()).await?;
    if messages.is_empty() {
        println!("No messages.");
    }
    for env in messages {
        let slot = env
            .slot()
            .map(|(s, i)| format!("{s}:{i}"))
            .unwrap_or_else(|| "-".into());
        println!("[{slot}] {:?}", env.pdu);
    }
    Ok(())
}

async fn cmd_at(modem: &GsmModem, command: &str) -> Result<()> {
    let updates = modem.query(AtCommand::new(command)).await?;
    if updates.is_empty() {
        println!("OK");
    }
    for update in updates {
        println!("{update:?}");
    }
    Ok(())
}

async fn cmd_monitor(modem: &GsmModem, duration_secs: u64) -> Result<()> {
    let mut events = modem.subscribe();
    let mut states = modem.subscribe_state();

    println!("Monitoring modem events (Ctrl-C to stop)...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Monitor duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            event = events.recv() => match event {
                Ok(ModemEvent::Message(m)) => println!("[sms] {} {}: {}", m.time, m.address, m.text),
                Ok(ModemEvent::MultipartMessage(m)) => {
                    println!("[sms] {} {} ({} parts): {}", m.time, m.address, m.parts.len(), m.text)
                }
                Ok(event) => println!("[event] {event:?}"),
                Err(RecvError::Lagged(n)) => println!("[warning] missed {n} events (consumer too slow)"),
                Err(RecvError::Closed) => {
                    println!("Event channel closed.");
                    break;
                }
            },
            change = states.recv() => if let Ok(change) = change {
                let label = if change.idle { "idle" } else { "busy" };
                println!("[state] {label} {:?}", change.active);
            },
            _ = tokio::time::sleep(timeout) => {
                if deadline.is_some() {
                    println!("Monitor duration elapsed.");
                }
                break;
            }
        }
    }

    Ok(())
}

async fn run(modem: &GsmModem, command: &Command) -> Result<()> {
    match command {
        Command::Info => cmd_info(modem).await,
        Command::Signal => {
            match modem.signal().await? {
                Some(99) | None => println!("Signal: unknown"),
                Some(rssi) => println!("Signal: {rssi}/31"),
            }
            Ok(())
        }
        Command::Smsc => {
            println!("SMSC: {}", modem.smsc().await?.unwrap_or_else(|| "-".into()));
            Ok(())
        }
        Command::Network => {
            let network = modem.network().await?;
            println!(
                "Operator: {}",
                network.and_then(|n| n.operator).unwrap_or_else(|| "-".into())
            );
            Ok(())
        }
        Command::Networks => {
            for entry in modem.networks().await? {
                println!(
                    "{:<3} {:<24} {:<12} {}",
                    entry.status.as_deref().unwrap_or("-"),
                    entry.long_name.as_deref().unwrap_or("-"),
                    entry.short_name.as_deref().unwrap_or("-"),
                    entry.numeric.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        Command::Charset { action } => {
            match action {
                CharsetAction::Get => println!("Charset: {:?}", modem.charset().await?),
                CharsetAction::List => println!("Charsets: {}", modem.charsets().await?.join(", ")),
                CharsetAction::Set { charset } => {
                    modem.set_charset(charset).await?;
                    println!("Charset set to {charset}");
                }
            }
            Ok(())
        }
        Command::Storage { name } => cmd_storage(modem, name.as_deref()).await,
        Command::List { status, storage } => cmd_list(modem, *status, storage.as_deref()).await,
        Command::Read { storage, index } => {
            match modem.read_storage(storage, *index).await? {
                Some(env) => println!("{:?}", env.pdu),
                None => println!("Slot {storage}:{index} is empty."),
            }
            Ok(())
        }
        Command::Delete { storage, index } => {
            modem.delete_storage(storage, *index).await?;
            println!("Deleted {storage}:{index}");
            Ok(())
        }
        Command::Empty { storage } => {
            let deleted = modem.empty_storage(storage).await?;
            println!("Deleted {deleted} messages from {storage}");
            Ok(())
        }
        Command::Send { to, text } => {
            let references = modem
                .send_message(to, text)
                .await
                .with_context(|| format!("sending to {to} failed"))?;
            println!("Sent to {to}, references {references:?}");
            Ok(())
        }
        Command::Dial { number } => {
            modem.dial(number).await?;
            println!("Dialing {number}");
            Ok(())
        }
        Command::Answer => modem.answer().await.map_err(Into::into),
        Command::Hangup => modem.hangup().await.map_err(Into::into),
        Command::Ussd { codes } => {
            for (i, response) in modem.ussd(codes).await?.iter().enumerate() {
                println!(
                    "[{}] ({}) {}",
                    i + 1,
                    response.code,
                    response.message.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Command::At { command } => cmd_at(modem, command).await,
        Command::Monitor { duration } => cmd_monitor(modem, *duration).await,
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let modem = create_modem(&cli).await?;
    let result = run(&modem, &cli.command).await;
    modem.disconnect().await.ok();
    result
}
