//! blipmq-client – interactive shell around a failsafe client.
//
//  $ blipmq-client shell --config blipmq-client.toml
//  > pub chat hello
//  > down
//  > pub chat queued-while-offline
//  > up
//  > stats
//
// The shell talks to an in-process loopback broker, `down` and `up` switch
// it off and on to watch queuing, polling and replay.
use std::sync::Arc;

use blipmq_client::core::dlq::DeadLetterQueue;
use blipmq_client::logging::init_logging;
use blipmq_client::{
    ClientConfig, ConnectQos, ConnectionContext, ConnectionListener, ConnectionState,
    DisconnectQos, FailsafeClient, LoopbackTransport, MessageUnit, MsgQos, Priority,
};

use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};

#[derive(Debug, Parser)]
#[command(name = "blipmq-client", version, about = "BlipMQ failsafe client shell")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start an interactive shell against a loopback broker.
    Shell {
        /// Path to config TOML (env BLIPMQ_CLIENT_CONFIG overrides when absent)
        #[arg(short, long)]
        config: Option<String>,
        /// Login name used to connect
        #[arg(short, long, default_value = "shell")]
        login: String,
    },
    /// Print the effective configuration and exit.
    CheckConfig {
        #[arg(short, long)]
        config: Option<String>,
    },
}

struct PrintingListener;

impl ConnectionListener for PrintingListener {
    fn reached_alive(&self, old: ConnectionState, ctx: &ConnectionContext<'_>) -> bool {
        println!("~ {old} -> ALIVE ({} queued)", ctx.queue().len());
        true
    }

    fn reached_polling(&self, old: ConnectionState, _ctx: &ConnectionContext<'_>) {
        println!("~ {old} -> POLLING");
    }

    fn reached_dead(&self, old: ConnectionState, ctx: &ConnectionContext<'_>) {
        println!("~ {old} -> DEAD ({} queued)", ctx.queue().len());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Shell { config, login } => {
            let cfg = ClientConfig::load(config.as_deref())?;
            repl(cfg, login).await?;
        }
        Command::CheckConfig { config } => {
            let cfg = ClientConfig::load(config.as_deref())?;
            println!("{cfg:#?}");
        }
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────
async fn repl(cfg: ClientConfig, login: String) -> anyhow::Result<()> {
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;

    let broker = Arc::new(LoopbackTransport::new());
    let client = FailsafeClient::builder(login.clone())
        .config(cfg)
        .transport(broker.clone())
        .listener(Arc::new(PrintingListener))
        .build()?;

    let ret = client.connect(ConnectQos::new(login)).await?;
    println!(
        "Connected as {}. Type `help` for commands.",
        ret.session_name.as_deref().unwrap_or("<queued>")
    );

    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["help"] => println!(
                "pub <topic> <msg> | pubp <prio> <topic> <msg> | sub <topic> | get <topic> | \
                 down | up | flush | state | queue | dlq | stats | exit"
            ),
            ["exit" | "quit"] => break,

            ["pub", topic, rest @ ..] => {
                let unit = MessageUnit::new(*topic, rest.join(" "), MsgQos::new());
                report(client.publish(unit).await);
            }

            ["pubp", prio, topic, rest @ ..] => {
                let Ok(level) = prio.parse::<u8>() else {
                    println!("priority must be 0-9");
                    continue;
                };
                match Priority::new(level) {
                    Ok(p) => {
                        let qos = MsgQos::new().with_priority(p);
                        let unit = MessageUnit::new(*topic, rest.join(" "), qos);
                        report(client.publish(unit).await);
                    }
                    Err(e) => println!("❌ {e}"),
                }
            }

            ["sub", topic] => report(client.subscribe(*topic, MsgQos::new()).await),
            ["unsub", topic] => report(client.unsubscribe(*topic, MsgQos::new()).await),

            ["get", topic] => match client.get(topic, MsgQos::new()).await {
                Ok(units) if units.is_empty() => println!("(nothing)"),
                Ok(units) => {
                    for u in units {
                        println!("{} {}", u.key, String::from_utf8_lossy(&u.content));
                    }
                }
                Err(e) => println!("❌ {e}"),
            },

            ["down"] => {
                broker.set_available(false);
                println!("loopback broker is down");
            }
            ["up"] => {
                broker.set_available(true);
                println!("loopback broker is up");
            }
            ["flush"] => client.flush_queue(),
            ["state"] => println!("{}", client.state()),
            ["queue"] => {
                let size = client.queue().size();
                println!("{} entries, {} bytes", size.entries, size.bytes);
            }
            ["dlq"] => print_dead_letters(client.dead_letters()),
            ["stats"] => print!("{}", client.metrics().render()),

            _ => println!("Unknown cmd. Type `help`."),
        }
    }

    if let Err(e) = client.disconnect(DisconnectQos::default()).await {
        println!("❌ disconnect: {e}");
    }
    client.shutdown().await;
    Ok(())
}

fn report(result: blipmq_client::ClientResult<blipmq_client::ReturnQos>) {
    match result {
        Ok(ret) => match ret.subscription_id {
            Some(id) => println!("{:?} {} {id}", ret.state, ret.key),
            None => println!("{:?} {}", ret.state, ret.key),
        },
        Err(e) => println!("❌ {e}"),
    }
}

fn print_dead_letters(dlq: &DeadLetterQueue) {
    let letters = dlq.drain();
    if letters.is_empty() {
        println!("(empty)");
        return;
    }
    for letter in letters {
        println!(
            "{} {} [{}]",
            letter.entry.method(),
            letter.entry.key(),
            letter.reason
        );
    }
}
