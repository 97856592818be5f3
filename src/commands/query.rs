//! `meshmon query` — query a meshmon daemon via its REST API.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use crate::client::MeshmonClient;
use crate::domain::events::{Audience, Notification};
use crate::domain::node::Node;
use crate::domain::registry::NodeLookup;

#[derive(Subcommand)]
pub enum QueryCommands {
    /// Daemon health check
    Health,
    /// Mesh-wide status summary
    Status,
    /// Look up a node by hostname substring
    Nodeinfo {
        /// Hostname or hostname fragment
        name: String,
    },
    /// Highscore records
    Highscores,
    /// Recent notifications
    Events,
}

pub fn run(url: Option<&str>, format: &str, command: &QueryCommands) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(url, format, command))
}

async fn run_async(url: Option<&str>, format: &str, command: &QueryCommands) -> Result<()> {
    let client = MeshmonClient::new(url)?;
    let json = format == "json";

    match command {
        QueryCommands::Health => {
            let data = client.health().await?;
            if json {
                return print_json(&data);
            }
            println!("daemon {}, version {}", data.status.green(), data.version);
        }
        QueryCommands::Status => {
            let data = client.status().await?;
            if json {
                return print_json(&data);
            }
            println!(
                "Online: {} nodes with {} clients on {} gateways",
                data.nodes_online.to_string().bold(),
                data.clients_online.to_string().bold(),
                data.gateways_online.to_string().bold()
            );
            println!(
                "Known: {} nodes total, {} seen within 14 days",
                data.nodes_total, data.nodes_seen_14d
            );
            for (source, count) in &data.nodes_by_source {
                println!("  {}: {} nodes", source, count);
            }
        }
        QueryCommands::Nodeinfo { name } => {
            let data = client.node(name).await?;
            if json {
                return print_json(&data);
            }
            match data {
                NodeLookup::Matches { nodes } => {
                    for node in &nodes {
                        print_node(node);
                    }
                }
                NodeLookup::Ambiguous { count } => {
                    println!(
                        "{} nodes match '{}', please be more specific",
                        count.to_string().yellow(),
                        name
                    );
                }
            }
        }
        QueryCommands::Highscores => {
            let data = client.highscores().await?;
            if json {
                return print_json(&data);
            }
            for score in &data {
                match score.date {
                    Some(date) => println!(
                        "{} {} ({})",
                        score.value.to_string().bold(),
                        score.name,
                        date.format("%Y-%m-%d %H:%M")
                    ),
                    None => println!("{} {}", score.value.to_string().bold(), score.name),
                }
            }
        }
        QueryCommands::Events => {
            let data = client.events().await?;
            if json {
                return print_json(&data);
            }
            for event in &data {
                print_event(event);
            }
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(data: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

fn print_node(node: &Node) {
    let presence = if node.online {
        "online".green()
    } else {
        "offline".red()
    };
    println!("{} ({})", node.name().bold(), presence);
    if let Some(hardware) = &node.hardware {
        println!("  hardware:  {}", hardware);
    }
    if let (Some(base), Some(release)) = (&node.firmware_base, &node.firmware_release) {
        println!("  firmware:  {}/{}", base, release);
    }
    if let Some(contact) = &node.contact {
        println!("  contact:   {}", contact);
    }
    if let (Some(lat), Some(lon)) = (node.lat, node.lon) {
        println!("  position:  {}, {}", lat, lon);
    }
    println!("  clients:   {}", node.clientcount);
    if let Some(autoupdate) = node.autoupdate {
        match &node.branch {
            Some(branch) => println!("  autoupdate: {} ({})", autoupdate, branch),
            None => println!("  autoupdate: {}", autoupdate),
        }
    }
    if let Some(firstseen) = node.firstseen {
        println!("  firstseen: {}", firstseen.format("%Y-%m-%d %H:%M"));
    }
    if let Some(lastseen) = node.lastseen {
        println!("  lastseen:  {}", lastseen.format("%Y-%m-%d %H:%M"));
    }
    println!("  source:    {}", node.source);
}

fn print_event(event: &Notification) {
    let audience = match event.audience {
        Audience::Channel => "channel".cyan(),
        Audience::ChangeTarget => "changes".magenta(),
    };
    println!(
        "{} [{}] {}",
        event.at.format("%Y-%m-%d %H:%M:%S"),
        audience,
        event.text
    );
}
