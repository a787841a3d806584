//! tinymq command line client.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mqtt::QualityOfService;
use std::time::Duration;
use tinymq::{Client, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(
    name = "tinymq-cli",
    version,
    about = "An MQTT 3.1.1 publish/subscribe client"
)]
struct Cli {
    #[clap(subcommand)]
    command: TinymqSubcommand,
    /// Broker address.
    #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    addr: String,
    /// Client identifier presented in CONNECT.
    #[arg(long, default_value = "tinymq-cli")]
    id: String,
}

#[derive(Debug, Subcommand)]
enum TinymqSubcommand {
    /// Publish a single message to a topic.
    Publish {
        /// Topic to publish to.
        topic: String,
        /// Message payload.
        message: String,
        /// Publish at QoS 1 and wait for the acknowledgement.
        #[arg(long)]
        qos1: bool,
    },
    /// Subscribe to topics and print every delivery.
    Subscribe {
        /// Topics to subscribe to.
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut client = Client::connect(&cli.addr, &cli.id)
        .await
        .with_context(|| format!("failed to connect to {}", cli.addr))?;

    match cli.command {
        TinymqSubcommand::Publish {
            topic,
            message,
            qos1,
        } => {
            if qos1 {
                client.publish_qos1(&topic, message.into_bytes()).await?;
            } else {
                client.publish(&topic, message.into_bytes()).await?;
            }
            client.disconnect().await?;
        }
        TinymqSubcommand::Subscribe { topics } => {
            let filters: Vec<&str> = topics.iter().map(String::as_str).collect();
            client
                .subscribe(&filters, QualityOfService::Level0)
                .await?;

            loop {
                // The broker severs peers that stay silent past its read
                // deadline, so ping whenever no delivery shows up in time.
                match tokio::time::timeout(Duration::from_secs(5), client.next_publish()).await {
                    Ok(Ok(Some(publish))) => {
                        println!(
                            "{} {}",
                            publish.topic_name(),
                            String::from_utf8_lossy(publish.payload())
                        );
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(err)) => return Err(err.into()),
                    Err(_) => client.ping().await?,
                }
            }
        }
    }

    Ok(())
}
