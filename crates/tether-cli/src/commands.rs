//! Command handlers for the Tether CLI

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use tether_core::{BleEvent, Connection, DeviceId, HandshakeMessage, UserId};

use crate::app::{self, TetherApp};
use crate::cli::Commands;
use crate::config::CliAppConfig;
use crate::error::{CliError, Result};

/// How long accept/reject wait for the requester to come into range
const DELIVERY_WAIT: Duration = Duration::from_secs(10);

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(command: Commands, mut config: CliAppConfig) -> Result<()> {
        if let Commands::ExampleConfig = command {
            print!("{}", CliAppConfig::example_config());
            return Ok(());
        }
        if let Commands::Run { manual: true } = command {
            config.ble.handshake.auto_accept = false;
        }

        let app = TetherApp::open(config)?;
        match command {
            Commands::Identity => Self::handle_identity(&app),
            Commands::Scan { seconds } => Self::handle_scan(&app, seconds).await,
            Commands::Run { .. } => Self::handle_run(&app).await,
            Commands::Follow { device_id, wait } => {
                Self::handle_follow(&app, DeviceId::new(device_id), wait).await
            }
            Commands::Accept { user_id } => Self::handle_accept(&app, UserId::new(user_id)).await,
            Commands::Reject { user_id } => Self::handle_reject(&app, UserId::new(user_id)).await,
            Commands::Unfollow { user_id } => Self::handle_unfollow(&app, UserId::new(user_id)),
            Commands::Connections => Self::handle_connections(&app),
            Commands::ExampleConfig => Ok(()),
        }
    }

    fn handle_identity(app: &TetherApp) -> Result<()> {
        let profile = app.profile();
        let advertisement = app.current_advertisement();
        println!("User id:       {}", profile.user_id);
        println!("Display name:  {}", profile.display_name);
        println!("Public key:    {}", profile.public_key.to_base64());
        println!("User hash:     {}", advertisement.user_hash);
        println!("Follow token:  {}", advertisement.follow_token);
        println!("Advertised as: {}", advertisement.to_name_string());
        Ok(())
    }

    async fn handle_scan(app: &TetherApp, seconds: u64) -> Result<()> {
        let node = app.start_node().await?;
        let mut events = node.subscribe();
        info!("Scanning for {} seconds...", seconds);

        let mut seen = HashSet::new();
        let deadline = tokio::time::sleep(Duration::from_secs(seconds));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(BleEvent::DeviceDiscovered { device_id, rssi, payload }) => {
                        if seen.insert(device_id.clone()) {
                            let name = payload.display_name.as_deref().unwrap_or("<unknown>");
                            println!("+ {device_id}  {rssi} dBm  {name}");
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let nearby = node.nearby().await?;
        println!("\n{} device(s) in range:", nearby.len());
        for device in nearby {
            let name = device.payload.display_name.as_deref().unwrap_or("<unknown>");
            if device.payload.is_known() {
                println!(
                    "  {}  {} dBm  {}  user hash {}",
                    device.device_id, device.rssi, name, device.payload.user_hash
                );
            } else {
                println!("  {}  {} dBm  {}", device.device_id, device.rssi, name);
            }
        }
        node.shutdown().await;
        Ok(())
    }

    async fn handle_run(app: &TetherApp) -> Result<()> {
        let node = app.start_node().await?;
        let mut events = node.subscribe();
        println!(
            "Running as {} ({}). Press Ctrl+C to stop",
            app.config().identity.display_name,
            app.user_id()
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event display lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("Shutting down...");
        node.shutdown().await;
        Ok(())
    }

    async fn handle_follow(app: &TetherApp, device_id: DeviceId, wait: u64) -> Result<()> {
        let node = app.start_node().await?;
        let result = async {
            app::wait_for_device(&node, &device_id, Duration::from_secs(wait)).await?;
            Ok::<_, CliError>(node.follow(&device_id).await?)
        }
        .await;
        node.shutdown().await;

        match result? {
            Some(connection) => print_connection(&connection),
            None => println!("Follow request to {device_id} was rejected"),
        }
        Ok(())
    }

    async fn handle_accept(app: &TetherApp, user_id: UserId) -> Result<()> {
        let node = app.start_node().await?;
        if app::wait_for_user(&node, user_id.user_hash(), DELIVERY_WAIT)
            .await
            .is_none()
        {
            warn!(user_id = %user_id, "Requester not in range; they will sync on re-discovery");
        }
        let result = node.accept(&user_id).await;
        node.shutdown().await;
        print_connection(&result?);
        Ok(())
    }

    async fn handle_reject(app: &TetherApp, user_id: UserId) -> Result<()> {
        let node = app.start_node().await?;
        if app::wait_for_user(&node, user_id.user_hash(), DELIVERY_WAIT)
            .await
            .is_none()
        {
            warn!(user_id = %user_id, "Requester not in range; rejection recorded locally");
        }
        let result = node.reject(&user_id).await;
        node.shutdown().await;
        result?;
        println!("Rejected {user_id}");
        Ok(())
    }

    fn handle_unfollow(app: &TetherApp, user_id: UserId) -> Result<()> {
        if app.forget(&user_id)? {
            println!("Unfollowed {user_id}");
            Ok(())
        } else {
            Err(CliError::PeerNotFound(user_id.to_string()))
        }
    }

    fn handle_connections(app: &TetherApp) -> Result<()> {
        let connections = app.connections()?;
        if connections.is_empty() {
            println!("No connections");
        }
        for connection in &connections {
            print_connection(connection);
        }
        Ok(())
    }
}

fn print_connection(connection: &Connection) {
    println!(
        "{}  {:<16}  {}  since {}",
        connection.user_id,
        connection.display_name,
        connection.status,
        connection.connected_at.format("%Y-%m-%d %H:%M")
    );
}

fn print_event(event: &BleEvent) {
    match event {
        BleEvent::DeviceDiscovered {
            device_id,
            rssi,
            payload,
        } if payload.is_known() => {
            let name = payload.display_name.as_deref().unwrap_or("<unnamed>");
            println!("~ {name} nearby ({device_id}, {rssi} dBm)");
        }
        BleEvent::FollowRequestReceived {
            from_device_id,
            payload: HandshakeMessage::Request(request),
        } => {
            println!(
                "? follow request from {} ({}) via {}",
                request.display_name, request.user_id, from_device_id
            );
        }
        BleEvent::FollowRequestReceived {
            payload: HandshakeMessage::Response(response),
            ..
        } => {
            println!("! {} answered: {:?}", response.display_name, response.status);
        }
        BleEvent::Error { message, code } => match code {
            Some(code) => println!("x {message} ({code:?})"),
            None => println!("x {message}"),
        },
        _ => {}
    }
}
