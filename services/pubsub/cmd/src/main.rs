//! Pubsub command line tools.
//!
//! Encodes and decodes connection headers, and runs a local loopback demo of
//! a topic publisher feeding several flow-controlled subscribers.

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use pubsub_flow::{
    FlowMetrics, MetricsLogger, SubscriberContext, TopicHandler, TopicPublisher, TopicSubscriber,
};
use pubsub_wire::{read_header, write_header, ConnectionHeader, Field, MessageType, TopicName};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::PubSubConfig;
use logging::PubSubLogFormatter;

const DEMO_TYPE: &str = "std_msgs/String";
const DEMO_MD5SUM: &str = "992ce8a1687cec8c8bd883ec73ca41d1";
const DEMO_DEFINITION: &str = "string data\n";

/// Topic publishing tools
#[derive(Parser, Debug)]
#[command(name = "pubsub", version, about = "Connection header codec and topic publishing demo")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "pubsub.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode a connection header and print it as hex
    Encode(EncodeArgs),
    /// Decode a hex encoded connection header and print it as JSON
    Decode {
        /// Header bytes in hex
        hex: String,
    },
    /// Run a local publisher with collecting subscribers
    Demo(DemoArgs),
}

#[derive(ClapArgs, Debug)]
struct EncodeArgs {
    /// Caller id (defaults to the configured one)
    #[arg(long)]
    caller_id: Option<String>,

    /// Topic name
    #[arg(long)]
    topic: Option<String>,

    /// Message type name, e.g. std_msgs/String
    #[arg(long = "type")]
    type_name: Option<String>,

    /// Message type checksum
    #[arg(long)]
    md5sum: Option<String>,

    /// Full message definition text
    #[arg(long)]
    definition: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct DemoArgs {
    /// Number of subscribers
    #[arg(long, default_value_t = 2)]
    subscribers: usize,

    /// Number of messages to publish
    #[arg(long, default_value_t = 111)]
    messages: u64,

    /// Topic to publish on
    #[arg(long, default_value = "/chatter")]
    topic: String,

    /// Metrics logging interval, e.g. 1s
    #[arg(long, default_value = "1s")]
    metrics_interval: humantime::Duration,

    /// Drain deadline for close, overriding the configuration, e.g. 5s
    #[arg(long)]
    close_timeout: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = match std::env::var("RUST_LOG") {
        Ok(filter) => EnvFilter::new(filter),
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("pubsub={}", args.log_level).parse()?)
            .add_directive(format!("pubsub_flow={}", args.log_level).parse()?)
            .add_directive(format!("pubsub_wire={}", args.log_level).parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(PubSubLogFormatter::new("pubsub"))
        .init();

    debug!("Starting pubsub v{}", env!("CARGO_PKG_VERSION"));
    let config = PubSubConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Encode(encode) => {
            let header = build_header(&config, encode);
            let bytes = header.to_bytes().context("connection header too large")?;
            println!("{}", to_hex(&bytes));
        }
        Command::Decode { hex } => {
            let bytes = from_hex(&hex)?;
            let (header, consumed) =
                ConnectionHeader::decode_prefix(&bytes).context("malformed connection header")?;
            if consumed < bytes.len() {
                warn!("Ignoring {} bytes after the header", bytes.len() - consumed);
            }
            println!("{}", serde_json::to_string_pretty(&header)?);
        }
        Command::Demo(demo) => {
            let report = run_demo(&config, demo).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn build_header(config: &PubSubConfig, args: EncodeArgs) -> ConnectionHeader {
    let mut header = ConnectionHeader::new()
        .with_caller_id(args.caller_id.unwrap_or_else(|| config.caller_id.clone()));
    if let Some(topic) = args.topic {
        header = header.with_topic(TopicName::new(topic).to_string());
    }
    if let Some(type_name) = args.type_name {
        header = header.with_type(type_name);
    }
    if let Some(definition) = args.definition {
        header = header.with_message_definition(definition);
    }
    if let Some(md5sum) = args.md5sum {
        header = header.with_md5sum(md5sum);
    }
    header
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(input: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        bail!("hex input has an odd number of digits");
    }

    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair)?;
            u8::from_str_radix(text, 16).with_context(|| format!("invalid hex byte '{}'", text))
        })
        .collect()
}

/// Exchange connection headers over an in-memory pipe, the way a subscriber
/// and a publisher do when a topic connection opens.
async fn negotiate(
    subscriber_id: &str,
    publisher_id: &str,
    topic: &TopicName,
    message_type: &MessageType,
) -> Result<ConnectionHeader> {
    let (mut subscriber_end, mut publisher_end) = tokio::io::duplex(64 * 1024);

    let request = ConnectionHeader::for_topic(subscriber_id, topic, message_type);
    write_header(&mut subscriber_end, &request).await?;

    let seen = read_header(&mut publisher_end).await?;
    if seen.get(Field::Topic) != Some(topic.as_str()) {
        bail!("subscriber {} asked for topic {:?}", subscriber_id, seen.get(Field::Topic));
    }
    if seen.get(Field::Md5Sum) != message_type.md5sum.as_deref() {
        bail!("subscriber {} has a different message type checksum", subscriber_id);
    }

    let reply = ConnectionHeader::for_topic(publisher_id, topic, message_type);
    write_header(&mut publisher_end, &reply).await?;
    let accepted = read_header(&mut subscriber_end).await?;
    trace!("Handshake for {} complete: {:?}", subscriber_id, accepted);
    Ok(accepted)
}

/// Counts messages and keeps one message of demand outstanding
struct CountingHandler {
    name: String,
    received: Arc<AtomicU64>,
}

impl TopicHandler<String> for CountingHandler {
    fn on_next(&mut self, ctx: &mut SubscriberContext, item: String) -> Result<()> {
        trace!("{} received '{}'", self.name, item);
        self.received.fetch_add(1, Ordering::Relaxed);
        ctx.request(1)?;
        Ok(())
    }

    fn on_complete(&mut self, ctx: &mut SubscriberContext) {
        info!(component = "demo", "{} completed after {} messages", self.name, ctx.received());
    }
}

#[derive(Debug, serde::Serialize)]
struct SubscriberReport {
    caller_id: String,
    received: u64,
}

#[derive(Debug, serde::Serialize)]
struct DemoReport {
    topic: String,
    submitted: u64,
    subscribers: Vec<SubscriberReport>,
    metrics: std::collections::BTreeMap<String, pubsub_flow::TopicMetrics>,
}

async fn run_demo(config: &PubSubConfig, args: DemoArgs) -> Result<DemoReport> {
    let topic = TopicName::new(&args.topic);
    let message_type = MessageType::new(DEMO_TYPE)
        .with_md5sum(DEMO_MD5SUM)
        .with_definition(DEMO_DEFINITION);

    let mut publisher_config = config.publisher.clone();
    if let Some(timeout) = args.close_timeout {
        publisher_config = publisher_config.with_close_timeout(Some(Duration::from(timeout)));
    }

    let metrics = Arc::new(FlowMetrics::new());
    let logger = MetricsLogger::new(metrics.clone())
        .with_interval(Duration::from(args.metrics_interval))
        .start();

    let publisher = TopicPublisher::<String>::builder(topic.clone(), message_type.clone())
        .config(publisher_config)
        .metrics(metrics.clone())
        .build()?;
    info!(component = "demo", "Publishing {} messages on {} to {} subscribers", args.messages, topic, args.subscribers);

    let mut counters = Vec::with_capacity(args.subscribers);
    for i in 0..args.subscribers {
        let caller_id = format!("{}_listener_{}", config.caller_id, i);
        negotiate(&caller_id, &config.caller_id, &topic, &message_type).await?;

        let received = Arc::new(AtomicU64::new(0));
        let subscriber = TopicSubscriber::new(
            topic.clone(),
            message_type.clone(),
            CountingHandler {
                name: caller_id.clone(),
                received: received.clone(),
            },
        )
        .with_config(&config.subscriber)
        .with_metrics(metrics.clone());
        publisher.subscribe(subscriber)?;
        counters.push((caller_id, received));
    }

    for i in 0..args.messages {
        publisher.submit(format!("hello world {}", i)).await?;
    }
    let closed = publisher.close().await;
    logger.abort();
    closed?;

    Ok(DemoReport {
        topic: topic.to_string(),
        submitted: args.messages,
        subscribers: counters
            .into_iter()
            .map(|(caller_id, received)| SubscriberReport {
                caller_id,
                received: received.load(Ordering::Relaxed),
            })
            .collect(),
        metrics: metrics.snapshot(),
    })
}
