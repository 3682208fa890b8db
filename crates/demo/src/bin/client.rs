use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::info;

use demo::{ActorState, ChatEvent, build_registry};
use tickwire::{Client, RoomConfig, UdpTransport};

#[derive(Parser)]
#[command(name = "demo-client")]
#[command(about = "Headless tickwire demo client")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:27100")]
    server: SocketAddr,

    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    #[arg(short, long, default_value_t = demo::DEFAULT_TICK_RATE)]
    tick_rate: u32,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let transport = UdpTransport::bind(args.bind.as_str(), args.server)?;
    info!("{} -> {}", transport.local_addr()?, args.server);

    let registry = build_registry();
    let config = RoomConfig {
        tick_duration: 1.0 / args.tick_rate as f32,
        ..RoomConfig::default()
    };
    let mut client = Client::new(registry, config);
    client.set_peer(Box::new(transport));
    client.start_room();

    let tick_duration = Duration::from_secs_f32(1.0 / args.tick_rate as f32);
    let mut next_tick = Instant::now();
    let mut last_report = Instant::now();
    let mut greeted = false;

    loop {
        client.update();

        let room = client.room_mut().expect("room started");
        for event in room.take_events() {
            if let Some(chat) = event.get::<ChatEvent>() {
                info!("[chat] {}: {}", chat.sender, chat.message);
            }
        }
        if !greeted && !room.entity_ids().is_empty() {
            greeted = true;
            room.raise_event(
                ChatEvent {
                    sender: "client".into(),
                    message: "hello from the other side".into(),
                },
                10,
            );
        }

        if last_report.elapsed() >= Duration::from_secs(2) {
            last_report = Instant::now();
            for id in room.entity_ids() {
                if let Some(state) = room.state::<ActorState>(id) {
                    let role = if room.is_controlled(id) {
                        "mine"
                    } else if room.is_frozen(id) {
                        "frozen"
                    } else {
                        "proxy"
                    };
                    info!(
                        "{} {:>10} [{}] at ({:7.1}, {:7.1})",
                        id, state.callsign, role, state.x, state.y
                    );
                }
            }
        }

        next_tick += tick_duration;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }
}
