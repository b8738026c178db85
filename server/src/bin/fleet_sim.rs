use bincode::{deserialize, serialize};
use clap::Parser;
use rand::Rng;
use shared::{GameKey, GameUpdate, LoadReport, MemberState, Packet, RemoveReason, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Simulates one fleet member: registers, replays its games, reports random
/// load for a while, closes its games and leaves.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory address
    #[clap(short, long, default_value = "127.0.0.1:4530")]
    directory: SocketAddr,
    /// Server id announced at registration
    #[clap(short, long, default_value = "sim-1")]
    server_id: String,
    /// Ports advertised by the simulated member
    #[clap(long, default_value = "5055")]
    ports: Vec<u16>,
    /// Lobby the simulated games are created in
    #[clap(long, default_value = "default")]
    lobby: String,
    /// Number of games to replicate
    #[clap(short, long, default_value = "3")]
    games: u32,
    /// Number of load reports to send before leaving
    #[clap(short, long, default_value = "10")]
    reports: u32,
}

async fn send(socket: &UdpSocket, addr: SocketAddr, packet: &Packet) -> std::io::Result<()> {
    let data = serialize(packet).map_err(std::io::Error::other)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Simulated member bound to {}", socket.local_addr()?);

    send(
        &socket,
        args.directory,
        &Packet::RegisterMember {
            version: PROTOCOL_VERSION,
            ports: args.ports.clone(),
            server_id: args.server_id.clone(),
            capabilities: vec!["udp".to_string()],
            state: MemberState::Normal.code(),
            priority: 1,
            load: LoadReport::default(),
        },
    )
    .await?;

    let mut buf = [0u8; 4096];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await??;
    match deserialize::<Packet>(&buf[..len])? {
        Packet::Registered { reused } => println!("Registered (reused: {})", reused),
        Packet::Rejected { reason } => {
            println!("Registration rejected: {}", reason);
            return Ok(());
        }
        other => {
            println!("Expected Registered but got: {:?}", other);
            return Ok(());
        }
    }

    send(&socket, args.directory, &Packet::ExpectedGames { count: args.games }).await?;

    let keys: Vec<GameKey> = (0..args.games)
        .map(|i| GameKey::new(args.lobby.clone(), format!("{}-game-{}", args.server_id, i)))
        .collect();

    for key in &keys {
        send(
            &socket,
            args.directory,
            &Packet::GameCreated {
                key: key.clone(),
                max_players: 8,
                preserve: false,
            },
        )
        .await?;

        let mut update = GameUpdate::new(key.clone());
        update.replication = true;
        update.is_open = Some(true);
        update.is_visible = Some(true);
        send(&socket, args.directory, &Packet::GameUpdated(update)).await?;
        println!("Replicated {}", key);
    }

    let mut rng = rand::thread_rng();
    for _ in 0..args.reports {
        let load = LoadReport {
            raw_level: rng.gen_range(0..=9),
            peer_count: rng.gen_range(0..400),
            game_count: args.games,
        };

        for key in &keys {
            let mut update = GameUpdate::new(key.clone());
            update.player_count = Some(rng.gen_range(0..=8));
            send(&socket, args.directory, &Packet::GameUpdated(update)).await?;
        }

        println!("Reporting load {:?}", load);
        send(&socket, args.directory, &Packet::UpdateMember { state: None, load }).await?;
        send(&socket, args.directory, &Packet::MemberHeartbeat).await?;

        sleep(Duration::from_secs(1)).await;
    }

    for key in keys {
        send(
            &socket,
            args.directory,
            &Packet::GameRemoved {
                key,
                reason: RemoveReason::Closed,
            },
        )
        .await?;
    }

    send(&socket, args.directory, &Packet::LeaveMember).await?;
    println!("Simulated member finished");

    Ok(())
}
