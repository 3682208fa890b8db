use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::info;

use demo::{ActorLogic, ActorState, ChatEvent, ServerSocket, build_registry};
use tickwire::{RoomConfig, Server};

#[derive(Parser)]
#[command(name = "demo-server")]
#[command(about = "Headless tickwire demo server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = demo::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = demo::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(long, default_value_t = 2, help = "Idle actors to spawn at startup")]
    bots: u32,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut socket = ServerSocket::bind((args.bind.as_str(), args.port))?;
    info!("listening on {}", socket.local_addr()?);

    let registry = build_registry();
    let config = RoomConfig {
        tick_duration: 1.0 / args.tick_rate as f32,
        ..RoomConfig::default()
    };
    let mut server = Server::new(registry, config);
    let room = server.start_room();
    for index in 0..args.bots {
        let id = room.add_entity::<ActorLogic>();
        let state = room.state_mut::<ActorState>(id).expect("actor just spawned");
        state.x = -100.0 * (index as f32 + 1.0);
        state.palette = index;
        state.callsign = format!("bot-{index}");
    }

    let tick_duration = Duration::from_secs_f32(1.0 / args.tick_rate as f32);
    let mut next_tick = Instant::now();
    let mut last_report = Instant::now();

    loop {
        for (addr, channel) in socket.poll()? {
            let client_id = server.add_client(Box::new(channel), &addr.to_string());
            let room = server.room_mut().expect("room started");
            let id = room.add_entity::<ActorLogic>();
            {
                let state = room.state_mut::<ActorState>(id).expect("actor just spawned");
                state.stamina = 100;
                state.palette = 100 + id.raw() as u32;
                state.callsign = format!("player-{client_id}");
            }
            room.grant_control(id, client_id);
            room.broadcast_event(
                ChatEvent {
                    sender: "server".into(),
                    message: format!("{addr} joined as {id}"),
                },
                10,
            );
            info!("{} joined, controlling entity {}", addr, id);
        }

        server.update();

        if last_report.elapsed() >= Duration::from_secs(2) {
            last_report = Instant::now();
            let room = server.room().expect("room started");
            for id in room.entity_ids() {
                if let Some(state) = room.state::<ActorState>(id) {
                    info!(
                        "{} {:>10} at ({:7.1}, {:7.1})",
                        id, state.callsign, state.x, state.y
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
