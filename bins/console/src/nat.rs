//! NAT traversal probes.

use clap::{Args, Subcommand};
use magpie::Result;
use magpie::nat::{MappingCallback, NatController, NatStatus, NetworkDiscoverer, PortProto, stun::STUN_PORT};
use std::sync::Arc;
use std::time::Duration;

#[derive(Args)]
pub struct NatArgs {
    /// STUN server to consult
    #[arg(long)]
    pub stun: Option<String>,

    #[command(subcommand)]
    pub command: NatCommand,
}

#[derive(Subcommand)]
pub enum NatCommand {
    /// Run discovery and print what was found
    Discover,

    /// Map a port on the gateway
    Map {
        /// External port to map
        port: u16,
        /// Use TCP instead of UDP
        #[arg(long)]
        tcp: bool,
    },

    /// Remove a port mapping
    Unmap {
        /// External port to unmap
        port: u16,
        /// Use TCP instead of UDP
        #[arg(long)]
        tcp: bool,
    },
}

pub async fn run(args: NatArgs, json: bool) -> Result<()> {
    let controller = Arc::new(NatController::new(Arc::new(NetworkDiscoverer {
        stun_server: args.stun.clone().map(|s| (s, STUN_PORT)),
    })));

    controller.discover();
    while controller.status() == NatStatus::Discovering {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    match args.command {
        NatCommand::Discover => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": format!("{:?}", controller.status()),
                        "public_ip": controller.public_ip().map(|ip| ip.to_string()),
                        "internal_ip": controller.internal_ip(),
                        "control_url": controller.control_url(),
                    })
                );
            } else {
                println!("status:      {:?}", controller.status());
                println!("public ip:   {}", display(controller.public_ip().map(|ip| ip.to_string())));
                println!("internal ip: {}", display(controller.internal_ip()));
                println!("control url: {}", display(controller.control_url()));
            }
        }
        NatCommand::Map { port, tcp } => {
            let outcome = mapping(&controller, port, tcp, true).await;
            println!("map {port}: {}", if outcome { "ok" } else { "failed" });
        }
        NatCommand::Unmap { port, tcp } => {
            let outcome = mapping(&controller, port, tcp, false).await;
            println!("unmap {port}: {}", if outcome { "ok" } else { "failed" });
        }
    }
    Ok(())
}

async fn mapping(controller: &Arc<NatController>, port: u16, tcp: bool, add: bool) -> bool {
    let proto = if tcp { PortProto::Tcp } else { PortProto::Udp };
    let (tx, rx) = tokio::sync::oneshot::channel();
    let callback: MappingCallback = Box::new(move |ok| {
        let _ = tx.send(ok);
    });
    if add {
        controller.add_port_mapping(port, proto, Some(callback));
    } else {
        controller.remove_port_mapping(port, proto, Some(callback));
    }
    rx.await.unwrap_or(false)
}

fn display(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_owned())
}
