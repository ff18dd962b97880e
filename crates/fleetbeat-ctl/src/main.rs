//! fleetbeat-ctl: command-line interface for the fleetbeat collector.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 7071;

fn print_usage() {
    println!("fleetbeat-ctl: fleetbeat collector control");
    println!();
    println!("Usage: fleetbeat-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                          Show collector status");
    println!("  nodes                           List known nodes");
    println!("  node <id>                       Inspect a node and its latest samples");
    println!("  config <id> <field=ms>...       Push config changes to a node");
    println!("  command <id> <command>          Send a command (e.g. flush) to a node");
    println!("  shutdown                        Stop the collector");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["nodes"] => cmd::nodes::cmd_nodes(port).await,
        ["node", id] => cmd::nodes::cmd_node_inspect(port, id).await,
        ["config", id, pairs @ ..] => cmd::nodes::cmd_node_config(port, id, pairs).await,
        ["command", id, command] => cmd::nodes::cmd_node_command(port, id, command).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
