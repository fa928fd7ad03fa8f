use clap::error::ErrorKind;
use clap::Parser;
use gelf_broker::{Broker, Config};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

#[derive(Parser, Debug)]
#[command(name = "gelf-broker")]
#[command(version)]
#[command(about = "Ship GELF records from a local Unix socket to Graylog")]
struct Args {
    /// Log broker events to stderr at this level (error|warn|info|debug|trace)
    #[arg(long, value_name = "LEVEL")]
    log: Option<String>,

    /// Print received records to stdout instead of forwarding them
    #[arg(long)]
    fake: bool,

    /// Path of the Unix intake socket (overrides the config file)
    #[arg(long, value_name = "PATH")]
    listen: Option<PathBuf>,

    /// Upstream endpoint host[:port] (overrides the config file)
    #[arg(long, value_name = "HOST:PORT")]
    graylog: Option<String>,

    /// YAML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

// Exit codes: 0 normal, 1 usage error (help shown), 2 bad argument values
// or client-library mismatch, 3 fatal startup or runtime error.
#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if e.kind() == ErrorKind::DisplayHelp || e.kind() == ErrorKind::DisplayVersion =>
        {
            print!("{}", e);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprint!("{}", e);
            return ExitCode::from(1);
        }
    };

    if gelf_client::PROTOCOL_VERSION != gelf_broker::REQUIRED_CLIENT_PROTOCOL {
        eprintln!(
            "gelf-broker: client library speaks protocol {} but this broker requires {}",
            gelf_client::PROTOCOL_VERSION,
            gelf_broker::REQUIRED_CLIENT_PROTOCOL
        );
        return ExitCode::from(2);
    }

    if let Some(level) = &args.log {
        let level = match parse_log_level(level) {
            Some(level) => level,
            None => {
                eprintln!("gelf-broker: unknown log level {:?}", level);
                return ExitCode::from(2);
            }
        };
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .event_format(BrokerLineFormat)
            .init();
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("gelf-broker: {}", message);
            return ExitCode::from(2);
        }
    };

    let (broker, _handle) = match Broker::new(config, args.config.clone(), args.fake) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("gelf-broker: {}", e);
            return ExitCode::from(3);
        }
    };

    match broker.run().await {
        Ok(()) => {
            info!("exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("gelf-broker: {}", e);
            ExitCode::from(3)
        }
    }
}

fn load_config(args: &Args) -> Result<Config, String> {
    match &args.config {
        Some(path) => {
            let mut config = Config::load(path).map_err(|e| e.to_string())?;
            config.apply_overrides(args.listen.clone(), args.graylog.clone());
            Ok(config)
        }
        None => {
            let socket = args
                .listen
                .clone()
                .ok_or("either --config or --listen is required")?;
            // --fake never connects, so the endpoint may be omitted there
            let graylog = match (args.graylog.clone(), args.fake) {
                (Some(graylog), _) => graylog,
                (None, true) => "localhost".to_string(),
                (None, false) => return Err("either --config or --graylog is required".into()),
            };
            Ok(Config::from_flags(socket, graylog))
        }
    }
}

/// One stderr line per event: `<UTC ts> [broker:<category>] <LEVEL>: <msg>`.
/// The category is the emitting module, e.g. `[broker:upstream]`.
struct BrokerLineFormat;

impl<S, N> FormatEvent<S, N> for BrokerLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let category = meta.target().rsplit("::").next().unwrap_or("broker");
        write!(
            writer,
            "{} [broker:{}] {}: ",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            category,
            meta.level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn parse_log_level(level: &str) -> Option<tracing::Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}
