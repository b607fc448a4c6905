use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::path::Path;

use rill::messages::{ConnectRequest, PortSelector};
use rill::port::{DisconnectMode, PortDirection};
use rill::registry::{IndexKey, RegistryOp, RegistryReply};
use rill::{ActorSpec, DeployRequest};
use rill_client::{ControlCommand, ControlResponse, RillConnection};

use crate::args::{Commands, ConnectArgs, DisconnectArgs, StorageCommands};

pub async fn execute(address: SocketAddr, command: Commands) -> Result<()> {
    let mut conn = RillConnection::new(address);

    let control = match command {
        Commands::Serve(_) => unreachable!("serve is handled before dispatch"),
        Commands::NodeInfo => ControlCommand::NodeInfo,
        Commands::ListNodes => ControlCommand::ListNodes,
        Commands::PeerSetup { uris } => ControlCommand::PeerSetup { uris },
        Commands::NewActor { spec } => {
            let spec: ActorSpec = load_descriptor(&spec)?;
            ControlCommand::NewActor { spec }
        }
        Commands::DestroyActor { actor_id } => ControlCommand::DestroyActor { actor_id },
        Commands::ListActors => ControlCommand::ListActors,
        Commands::Report { actor_id } => ControlCommand::ActorReport { actor_id },
        Commands::Enable { actor_id } => ControlCommand::EnableActor { actor_id },
        Commands::Disable { actor_id } => ControlCommand::DisableActor { actor_id },
        Commands::Migrate {
            actor_id,
            dest_node_id,
        } => ControlCommand::MigrateActor {
            actor_id,
            dest_node_id,
        },
        Commands::Connect(args) => ControlCommand::ConnectPorts {
            request: connect_request(args)?,
        },
        Commands::Disconnect(args) => {
            let DisconnectArgs { actor, port, mode } = args;
            ControlCommand::DisconnectPorts {
                selector: PortSelector {
                    actor_id: actor,
                    port_name: port,
                    port_id: None,
                },
                mode: parse_mode(&mode)?,
            }
        }
        Commands::PortState {
            actor_id,
            port_name,
        } => ControlCommand::GetPortState {
            selector: PortSelector {
                actor_id: Some(actor_id),
                port_name: Some(port_name),
                port_id: None,
            },
        },
        Commands::SetPort {
            actor_id,
            port_name,
            property,
            value,
        } => ControlCommand::SetPortProperty {
            selector: PortSelector {
                actor_id: Some(actor_id),
                port_name: Some(port_name),
                port_id: None,
            },
            property,
            value: serde_json::from_str(&value)?,
        },
        Commands::Deploy { file } => {
            let request: DeployRequest = load_descriptor(&file)?;
            ControlCommand::Deploy { request }
        }
        Commands::DestroyApp { app_id } => ControlCommand::DestroyApplication { app_id },
        Commands::ListApps => ControlCommand::ListApplications,
        Commands::GetApp { app_id } => ControlCommand::GetApplication { app_id },
        Commands::RegisterReplication {
            replication_id,
            master,
        } => ControlCommand::RegisterReplication {
            replication_id,
            master,
        },
        Commands::Replicate {
            replication_id,
            peer,
            dereplicate,
        } => ControlCommand::Replicate {
            replication_id,
            peer_node_id: peer,
            dereplicate,
        },
        Commands::Storage(op) => ControlCommand::Storage {
            op: storage_op(op)?,
        },
        Commands::Events => {
            conn.send(ControlCommand::SubscribeTunnelEvents).await?;
            loop {
                match conn.receive().await? {
                    ControlResponse::TunnelEvent { event } => {
                        println!("{}", serde_json::to_string(&event)?)
                    }
                    other => return Err(anyhow!("Unexpected response: {:?}", other)),
                }
            }
        }
        Commands::Shutdown => ControlCommand::Shutdown,
    };

    let response = conn.request(control).await?;
    print_response(response)
}

fn connect_request(args: ConnectArgs) -> Result<ConnectRequest> {
    Ok(ConnectRequest {
        actor_id: args.actor_id,
        port_name: args.port_name,
        port_dir: parse_direction(&args.dir)?,
        peer_node_id: args.peer_node,
        peer_actor_id: args.peer_actor_id,
        peer_port_name: args.peer_port_name,
    })
}

fn parse_direction(s: &str) -> Result<PortDirection> {
    match s {
        "in" => Ok(PortDirection::In),
        "out" => Ok(PortDirection::Out),
        other => Err(anyhow!("Invalid port direction '{}', use in or out", other)),
    }
}

fn parse_mode(s: &str) -> Result<DisconnectMode> {
    match s {
        "temporary" => Ok(DisconnectMode::Temporary),
        "terminate" => Ok(DisconnectMode::Terminate),
        "exhaust" => Ok(DisconnectMode::Exhaust),
        other => Err(anyhow!(
            "Invalid disconnect mode '{}', use temporary, terminate, or exhaust",
            other
        )),
    }
}

fn storage_op(op: StorageCommands) -> Result<RegistryOp> {
    Ok(match op {
        StorageCommands::Get { key } => RegistryOp::Get { key },
        StorageCommands::Set { key, value } => RegistryOp::Set {
            key,
            value: serde_json::from_str(&value)?,
        },
        StorageCommands::Delete { key } => RegistryOp::Delete { key },
        StorageCommands::Index { levels } => RegistryOp::GetIndex {
            index: IndexKey::new(levels),
        },
    })
}

/// Load a descriptor file, picking the format from its extension.
fn load_descriptor<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(toml::from_str(&content)?),
        _ => Ok(serde_json::from_str(&content)?),
    }
}

fn print_response(response: ControlResponse) -> Result<()> {
    match response {
        ControlResponse::NodeInfo { info } => {
            println!("{}", serde_json::to_string_pretty(&info)?)
        }
        ControlResponse::Nodes { nodes } => {
            for node in nodes {
                println!("{}", node);
            }
        }
        ControlResponse::Status { status } => println!("{:?}", status),
        ControlResponse::ActorCreated { actor_id } => println!("{}", actor_id),
        ControlResponse::Actors { actors } => {
            for actor in actors {
                println!("{}", actor);
            }
        }
        ControlResponse::Report { report } => {
            println!("{}", serde_json::to_string_pretty(&report)?)
        }
        ControlResponse::Connected { status, port_id } => match port_id {
            Some(port_id) => println!("{:?} {}", status, port_id),
            None => println!("{:?}", status),
        },
        ControlResponse::PortState { state } => {
            println!("{}", serde_json::to_string_pretty(&state)?)
        }
        ControlResponse::Deployed { result } => {
            println!("{}", serde_json::to_string_pretty(&result)?)
        }
        ControlResponse::Applications { apps } => {
            for app in apps {
                println!("{}", app);
            }
        }
        ControlResponse::Application { name, actors } => {
            println!("{}", name);
            for actor in actors {
                println!("  {}", actor);
            }
        }
        ControlResponse::Storage { status, reply } => match reply {
            RegistryReply::Value(Some(value)) => println!("{}", serde_json::to_string(&value)?),
            RegistryReply::Value(None) => println!("{:?}", status),
            RegistryReply::Values(values) => {
                for value in values {
                    println!("{}", value);
                }
            }
            RegistryReply::Done => println!("{:?}", status),
        },
        ControlResponse::TunnelEvent { event } => {
            println!("{}", serde_json::to_string(&event)?)
        }
        ControlResponse::ShuttingDown => println!("Shutting down"),
        ControlResponse::Error { message } => return Err(anyhow!(message)),
    }
    Ok(())
}
