use std::cell::Cell;
use std::rc::Rc;

use tickwire::{
    BitBuffer, Client, ClientId, Command, CommandData, DecodeError, EntityLogic, EventData,
    IntCompressor, LoopbackTransport, LossHandle, Registry, RoomConfig, Server, StateData,
};

thread_local! {
    static INPUT: Cell<(i64, i64)> = const { Cell::new((0, 0)) };
    static FROZEN_COUNT: Cell<u32> = const { Cell::new(0) };
    static UNFROZEN_COUNT: Cell<u32> = const { Cell::new(0) };
}

const COORD: IntCompressor = IntCompressor::new(-100_000, 100_000);
const ENERGY: IntCompressor = IntCompressor::new(0, 1000);

#[derive(Debug, Clone, Default, PartialEq)]
struct CubeState {
    x: i64,
    y: i64,
    energy: i64,
    palette: u32,
}

const FLAG_X: u32 = 1 << 0;
const FLAG_Y: u32 = 1 << 1;

impl StateData for CubeState {
    const FLAG_COUNT: u32 = 2;

    fn compare_mutable(&self, basis: &Self) -> u32 {
        let mut flags = 0;
        if self.x != basis.x {
            flags |= FLAG_X;
        }
        if self.y != basis.y {
            flags |= FLAG_Y;
        }
        flags
    }

    fn apply_mutable(&mut self, source: &Self, flags: u32) {
        if flags & FLAG_X != 0 {
            self.x = source.x;
        }
        if flags & FLAG_Y != 0 {
            self.y = source.y;
        }
    }

    fn apply_controller(&mut self, source: &Self) {
        self.energy = source.energy;
    }

    fn apply_immutable(&mut self, source: &Self) {
        self.palette = source.palette;
    }

    fn encode_mutable(&self, flags: u32, buf: &mut BitBuffer) {
        if flags & FLAG_X != 0 {
            COORD.write(buf, self.x);
        }
        if flags & FLAG_Y != 0 {
            COORD.write(buf, self.y);
        }
    }

    fn decode_mutable(&mut self, flags: u32, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        if flags & FLAG_X != 0 {
            self.x = COORD.read(buf)?;
        }
        if flags & FLAG_Y != 0 {
            self.y = COORD.read(buf)?;
        }
        Ok(())
    }

    fn encode_controller(&self, buf: &mut BitBuffer) {
        ENERGY.write(buf, self.energy);
    }

    fn decode_controller(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        self.energy = ENERGY.read(buf)?;
        Ok(())
    }

    fn encode_immutable(&self, buf: &mut BitBuffer) {
        buf.write_varint(self.palette);
    }

    fn decode_immutable(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        self.palette = buf.read_varint()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct MoveCommand {
    dx: i64,
    dy: i64,
}

impl CommandData for MoveCommand {
    fn encode(&self, buf: &mut BitBuffer) {
        buf.write_varint_signed(self.dx as i32);
        buf.write_varint_signed(self.dy as i32);
    }

    fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError> {
        Ok(MoveCommand {
            dx: i64::from(buf.read_varint_signed()?),
            dy: i64::from(buf.read_varint_signed()?),
        })
    }
}

#[derive(Default)]
struct CubeLogic;

impl EntityLogic<MoveCommand> for CubeLogic {
    type State = CubeState;

    fn apply_control(&mut self, state: &mut CubeState, command: &Command<MoveCommand>) {
        state.x += command.data.dx;
        state.y += command.data.dy;
    }

    fn update_control(&mut self, _state: &CubeState, command: &mut MoveCommand) {
        let (dx, dy) = INPUT.get();
        command.dx = dx;
        command.dy = dy;
    }

    fn on_frozen(&mut self, _state: &CubeState) {
        FROZEN_COUNT.set(FROZEN_COUNT.get() + 1);
    }

    fn on_unfrozen(&mut self, _state: &CubeState) {
        UNFROZEN_COUNT.set(UNFROZEN_COUNT.get() + 1);
    }
}

/// A schema whose delta can be inflated past the per-entity byte cap.
#[derive(Debug, Clone, Default, PartialEq)]
struct BannerState {
    pixels: Vec<u8>,
}

impl StateData for BannerState {
    const FLAG_COUNT: u32 = 1;

    fn compare_mutable(&self, basis: &Self) -> u32 {
        (self.pixels != basis.pixels) as u32
    }

    fn apply_mutable(&mut self, source: &Self, flags: u32) {
        if flags & 1 != 0 {
            self.pixels = source.pixels.clone();
        }
    }

    fn apply_controller(&mut self, _source: &Self) {}

    fn apply_immutable(&mut self, _source: &Self) {}

    fn encode_mutable(&self, flags: u32, buf: &mut BitBuffer) {
        if flags & 1 != 0 {
            buf.write_varint(self.pixels.len() as u32);
            for &byte in &self.pixels {
                buf.write(8, u32::from(byte));
            }
        }
    }

    fn decode_mutable(&mut self, flags: u32, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        if flags & 1 != 0 {
            let length = buf.read_varint()? as usize;
            self.pixels.clear();
            for _ in 0..length {
                self.pixels.push(buf.read(8)? as u8);
            }
        }
        Ok(())
    }

    fn encode_controller(&self, _buf: &mut BitBuffer) {}

    fn decode_controller(&mut self, _buf: &mut BitBuffer) -> Result<(), DecodeError> {
        Ok(())
    }

    fn encode_immutable(&self, _buf: &mut BitBuffer) {}

    fn decode_immutable(&mut self, _buf: &mut BitBuffer) -> Result<(), DecodeError> {
        Ok(())
    }
}

#[derive(Default)]
struct BannerLogic;

impl EntityLogic<MoveCommand> for BannerLogic {
    type State = BannerState;
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ChatEvent {
    message: String,
}

impl EventData for ChatEvent {
    fn encode(&self, buf: &mut BitBuffer) {
        buf.write_string(&self.message);
    }

    fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError> {
        Ok(ChatEvent {
            message: buf.read_string()?,
        })
    }
}

fn registry() -> Rc<Registry<MoveCommand>> {
    let mut registry = Registry::new();
    registry.add_entity_type::<CubeLogic>();
    registry.add_entity_type::<BannerLogic>();
    registry.add_event_type::<ChatEvent>();
    Rc::new(registry)
}

struct Session {
    server: Server<MoveCommand>,
    client: Client<MoveCommand>,
    client_id: ClientId,
    server_loss: LossHandle,
    client_loss: LossHandle,
}

fn session() -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = registry();
    let (server_side, client_side) = LoopbackTransport::pair();
    let server_loss = server_side.loss_handle();
    let client_loss = client_side.loss_handle();

    let mut server = Server::new(Rc::clone(&registry), RoomConfig::default());
    server.start_room();
    let client_id = server.add_client(Box::new(server_side), "tester");

    let mut client = Client::new(registry, RoomConfig::default());
    client.set_peer(Box::new(client_side));
    client.start_room();

    INPUT.set((0, 0));
    FROZEN_COUNT.set(0);
    UNFROZEN_COUNT.set(0);

    Session {
        server,
        client,
        client_id,
        server_loss,
        client_loss,
    }
}

fn run_ticks(session: &mut Session, count: u32) {
    for _ in 0..count {
        session.server.update();
        session.client.update();
    }
}

#[test]
fn entity_reaches_the_client() {
    let mut session = session();
    let id = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    session
        .server
        .room_mut()
        .unwrap()
        .state_mut::<CubeState>(id)
        .unwrap()
        .palette = 5;

    run_ticks(&mut session, 5);

    let room = session.client.room().unwrap();
    assert_eq!(room.entity_ids(), vec![id]);
    let state = room.state::<CubeState>(id).unwrap();
    assert_eq!(state.x, 0);
    assert_eq!(state.y, 0);
    assert_eq!(state.palette, 5);
}

#[test]
fn position_changes_replicate() {
    let mut session = session();
    let id = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    run_ticks(&mut session, 5);

    {
        let state = session
            .server
            .room_mut()
            .unwrap()
            .state_mut::<CubeState>(id)
            .unwrap();
        state.x = 42;
        state.y = 106;
    }
    run_ticks(&mut session, 4);

    let state = session.client.room().unwrap().state::<CubeState>(id).unwrap();
    assert_eq!((state.x, state.y), (42, 106));
    let server_state = session.server.room().unwrap().state::<CubeState>(id).unwrap();
    assert_eq!((server_state.x, server_state.y), (42, 106));
}

#[test]
fn control_grant_reaches_the_client() {
    let mut session = session();
    let id = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    session
        .server
        .room_mut()
        .unwrap()
        .grant_control(id, session.client_id);

    run_ticks(&mut session, 5);

    assert!(session.client.room().unwrap().is_controlled(id));
}

#[test]
fn prediction_survives_a_delta_blackout() {
    let mut session = session();
    let id = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    session
        .server
        .room_mut()
        .unwrap()
        .grant_control(id, session.client_id);
    run_ticks(&mut session, 5);
    assert!(session.client.room().unwrap().is_controlled(id));

    // Drive while every server packet is lost: commands pile up unacked
    // and prediction runs on local data alone.
    INPUT.set((1, 0));
    session.server_loss.set_drop_all(true);
    run_ticks(&mut session, 20);
    let stranded = session.client.room().unwrap().pending_commands(id);
    assert!(stranded >= 18, "only {stranded} commands pending");
    assert!(session.client.room().unwrap().state::<CubeState>(id).unwrap().x > 0);

    // Service returns: the next authoritative delta acknowledges the
    // consumed commands and the queue shrinks to the tail.
    session.server_loss.set_drop_all(false);
    INPUT.set((0, 0));
    run_ticks(&mut session, 4);
    let pending = session.client.room().unwrap().pending_commands(id);
    assert!(pending < stranded, "queue never reconciled: {pending}");

    // With input idle both sides settle on the same position.
    run_ticks(&mut session, 60);
    let client_x = session.client.room().unwrap().state::<CubeState>(id).unwrap().x;
    let server_x = session.server.room().unwrap().state::<CubeState>(id).unwrap().x;
    assert_eq!(client_x, server_x);
    assert!(client_x > 0);
}

#[test]
fn freeze_and_unfreeze_fire_once_each() {
    let mut session = session();
    let id = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    run_ticks(&mut session, 5);
    assert!(!session.client.room().unwrap().is_frozen(id));

    // Push the entity out of the client's area of interest.
    session
        .server
        .set_scope_filter(session.client_id, Box::new(|_, _| false));
    run_ticks(&mut session, 6);
    assert!(session.client.room().unwrap().is_frozen(id));
    assert_eq!(FROZEN_COUNT.get(), 1);
    assert_eq!(UNFROZEN_COUNT.get(), 0);

    // Back in scope; a state change forces the live delta out.
    session
        .server
        .set_scope_filter(session.client_id, Box::new(|_, _| true));
    session
        .server
        .room_mut()
        .unwrap()
        .state_mut::<CubeState>(id)
        .unwrap()
        .x = 7;
    run_ticks(&mut session, 6);
    assert!(!session.client.room().unwrap().is_frozen(id));
    assert_eq!(FROZEN_COUNT.get(), 1);
    assert_eq!(UNFROZEN_COUNT.get(), 1);
}

#[test]
fn removal_waits_for_a_lagging_client() {
    let mut session = session();
    let id = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    run_ticks(&mut session, 5);
    assert!(session.client.room().unwrap().contains(id));

    // The client goes deaf, then the entity is removed.
    session.server_loss.set_drop_all(true);
    session.server.room_mut().unwrap().mark_for_removal(id);
    run_ticks(&mut session, 30);
    assert!(!session.server.room().unwrap().contains(id));
    assert_eq!(session.server.room().unwrap().removed_count(), 1);
    assert!(session.client.room().unwrap().contains(id));

    // Hearing again: the removal delta lands, the client acks, and the
    // server lets go.
    session.server_loss.set_drop_all(false);
    run_ticks(&mut session, 8);
    assert!(!session.client.room().unwrap().contains(id));
    assert_eq!(session.server.room().unwrap().removed_count(), 0);
}

#[test]
fn removal_notifies_the_client_once() {
    let mut session = session();
    let removed = Rc::new(Cell::new(0u32));
    let observed = Rc::clone(&removed);
    session
        .client
        .room_mut()
        .unwrap()
        .on_entity_removed(move |_| observed.set(observed.get() + 1));

    let id = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    run_ticks(&mut session, 5);
    session.server.room_mut().unwrap().mark_for_removal(id);
    run_ticks(&mut session, 12);

    assert!(!session.client.room().unwrap().contains(id));
    assert_eq!(removed.get(), 1);
}

#[test]
fn oversized_delta_is_skipped_not_fatal() {
    let mut session = session();
    let cube = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    let banner = session.server.room_mut().unwrap().add_entity::<BannerLogic>();
    session
        .server
        .room_mut()
        .unwrap()
        .state_mut::<BannerState>(banner)
        .unwrap()
        .pixels = vec![0xAB; 150];

    run_ticks(&mut session, 5);

    // The small entity ships; the bloated one is withheld.
    let room = session.client.room().unwrap();
    assert!(room.contains(cube));
    assert!(!room.contains(banner));

    // Once it fits again the next send tick picks it up.
    session
        .server
        .room_mut()
        .unwrap()
        .state_mut::<BannerState>(banner)
        .unwrap()
        .pixels = vec![0xAB; 20];
    run_ticks(&mut session, 4);
    let room = session.client.room().unwrap();
    assert!(room.contains(banner));
    assert_eq!(room.state::<BannerState>(banner).unwrap().pixels.len(), 20);
}

#[test]
fn events_deliver_despite_loss() {
    let mut session = session();
    run_ticks(&mut session, 2);

    // Three client packets die on the wire; the event retries through.
    session.client_loss.drop_next(3);
    session
        .client
        .room_mut()
        .unwrap()
        .raise_event(ChatEvent { message: "hello".into() }, 10);
    run_ticks(&mut session, 12);

    let events = session.server.room_mut().unwrap().take_events();
    assert_eq!(events.len(), 1);
    let (from, event) = &events[0];
    assert_eq!(*from, session.client_id);
    assert_eq!(event.get::<ChatEvent>().unwrap().message, "hello");

    // And duplicates never surface a second time.
    run_ticks(&mut session, 10);
    assert!(session.server.room_mut().unwrap().take_events().is_empty());
}

#[test]
fn broadcast_events_reach_the_client() {
    let mut session = session();
    run_ticks(&mut session, 2);

    session
        .server
        .room_mut()
        .unwrap()
        .broadcast_event(ChatEvent { message: "round start".into() }, 10);
    run_ticks(&mut session, 6);

    let events = session.client.room_mut().unwrap().take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].get::<ChatEvent>().unwrap().message, "round start");
}

#[test]
fn controller_data_stays_private_in_spirit() {
    // Controller-only fields only arrive once control is granted.
    let mut session = session();
    let id = session.server.room_mut().unwrap().add_entity::<CubeLogic>();
    session
        .server
        .room_mut()
        .unwrap()
        .state_mut::<CubeState>(id)
        .unwrap()
        .energy = 250;
    run_ticks(&mut session, 5);
    assert_eq!(session.client.room().unwrap().state::<CubeState>(id).unwrap().energy, 0);

    session
        .server
        .room_mut()
        .unwrap()
        .grant_control(id, session.client_id);
    run_ticks(&mut session, 5);
    assert_eq!(session.client.room().unwrap().state::<CubeState>(id).unwrap().energy, 250);
}
