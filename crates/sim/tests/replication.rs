use std::any::Any;
use std::sync::Arc;

use tether::{
    BasicEntityFactory, ClientSimulator, Command, CommandFlags, CommandTypeId, EntityBehavior,
    EntityFlags, EntityId, EntityTypeId, Frame, LoopbackHub, MAX_UNCONFIRMED_COMMANDS,
    NO_ENTITY_ID, PacketReader, PacketWriter, PooledFactory, PredictedMeta, RemoveMode,
    SET_ROOT_COMMAND, ServerSimulator, SetRootCommand, SimError, SimulatorConfig, TableBuilder,
    TickEffects, User, Var, VariableFlags, VariableTable, WireError, make_type_id,
};

const MOVER_TYPE: EntityTypeId = 1;
const MOVE_COMMAND: CommandTypeId = make_type_id(1, 0);

fn mover_table() -> (Arc<VariableTable>, Var<f32>) {
    let mut builder = TableBuilder::new();
    let position = builder.float(
        1,
        VariableFlags::PREDICTED | VariableFlags::INTERPOLATED,
        0,
    );
    (builder.build().unwrap(), position)
}

#[derive(Debug, Default)]
struct MoveCommand {
    meta: PredictedMeta,
    target: EntityId,
    amount: f32,
}

impl Command for MoveCommand {
    fn type_id(&self) -> CommandTypeId {
        MOVE_COMMAND
    }

    fn target(&self) -> EntityId {
        self.target
    }

    fn set_target(&mut self, target: EntityId) {
        self.target = target;
    }

    fn write(&self, writer: &mut PacketWriter, _time_base: f64) {
        writer.write_entity_id(self.target);
        writer.write_f32(self.amount);
    }

    fn read(&mut self, reader: &mut PacketReader<'_>, _time_base: f64) -> Result<(), WireError> {
        self.target = reader.read_entity_id()?;
        self.amount = reader.read_f32()?;
        Ok(())
    }

    fn predicted(&self) -> Option<&PredictedMeta> {
        Some(&self.meta)
    }

    fn predicted_mut(&mut self) -> Option<&mut PredictedMeta> {
        Some(&mut self.meta)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct MoverBehavior {
    position: Var<f32>,
}

impl EntityBehavior for MoverBehavior {
    fn update(
        &mut self,
        _state: &mut tether::EntityState,
        _frame: &Frame,
        _effects: &mut TickEffects,
    ) {
    }

    fn execute_command(
        &mut self,
        state: &mut tether::EntityState,
        command: &dyn Command,
        _effects: &mut TickEffects,
    ) {
        if let Some(movement) = command.as_any().downcast_ref::<MoveCommand>() {
            state.set(self.position, state.get(self.position) + movement.amount);
        }
    }
}

fn register(sim: &mut tether::Simulator, table: Arc<VariableTable>, position: Var<f32>) {
    sim.register_entity_type(
        MOVER_TYPE,
        Box::new(BasicEntityFactory::new(
            EntityFlags::PREDICTED | EntityFlags::INTERPOLATED,
            table,
            move || Box::new(MoverBehavior { position }),
        )),
    );
    sim.register_command_factory(Box::new(PooledFactory::<MoveCommand>::new(
        MOVE_COMMAND,
        CommandFlags::empty(),
    )));
}

fn pair() -> (ServerSimulator, ClientSimulator, Var<f32>) {
    let hub = LoopbackHub::new();
    let (table, position) = mover_table();

    let mut server = ServerSimulator::new(SimulatorConfig::default(), Box::new(hub.server_end()));
    register(server.sim_mut(), table.clone(), position);
    server.add_user(User::new(1, "session-1"));

    let config = SimulatorConfig {
        send_interval: 0.0,
        ..SimulatorConfig::default()
    };
    let mut client =
        ClientSimulator::new(config, Box::new(hub.client_end(1)), User::new(1, "session-1"));
    register(client.sim_mut(), table, position);

    (server, client, position)
}

fn step(server: &mut ServerSimulator, client: &mut ClientSimulator, time: &mut f64) {
    let dt = 0.05;
    *time += dt;
    server.sim_mut().clock_mut().step_game_time(dt);
    let frame = Frame::new(*time, dt);
    server.update(&frame);
    client.update(&frame);
}

#[test]
fn test_entity_replication_to_client() {
    let (mut server, mut client, position) = pair();
    let mut time = 0.0;

    let id = server.sim_mut().create_entity(MOVER_TYPE, Some(1)).unwrap();
    server
        .sim_mut()
        .entity_mut(id)
        .unwrap()
        .authoritative_state_mut()
        .set(position, 2.5);

    step(&mut server, &mut client, &mut time);

    let entity = client.sim().entity(id).expect("entity replicated");
    assert_eq!(entity.authoritative_state().get(position), 2.5);
    // Owned by this user, so the predicted flag survives.
    assert!(entity.flags().contains(EntityFlags::PREDICTED));
    assert_eq!(client.sim().entity_count(), 1);
}

#[test]
fn test_predicted_flag_cleared_for_foreign_entities() {
    let (mut server, mut client, _position) = pair();
    let mut time = 0.0;

    let id = server.sim_mut().create_entity(MOVER_TYPE, Some(9)).unwrap();
    step(&mut server, &mut client, &mut time);

    let entity = client.sim().entity(id).expect("entity replicated");
    assert!(!entity.flags().contains(EntityFlags::PREDICTED));
    assert!(entity.flags().contains(EntityFlags::INTERPOLATED));
}

#[test]
fn test_prediction_replay_and_confirmation() {
    let (mut server, mut client, position) = pair();
    let mut time = 0.0;

    let id = server.sim_mut().create_entity(MOVER_TYPE, Some(1)).unwrap();
    step(&mut server, &mut client, &mut time);

    for _ in 0..3 {
        let mut command = client.create_command(MOVE_COMMAND, id).unwrap();
        command
            .as_any_mut()
            .downcast_mut::<MoveCommand>()
            .unwrap()
            .amount = 1.0;
        client.add_command(command);
    }

    // Local tick: commands predicted into the view, flushed to the server.
    client.update(&Frame::new(time, 0.05));
    let entity = client.sim().entity(id).unwrap();
    assert_eq!(entity.state().get(position), 3.0);
    assert_eq!(entity.authoritative_state().get(position), 0.0);
    assert_eq!(client.unconfirmed_commands(), 3);

    // Server applies and acknowledges; the client converges and releases.
    step(&mut server, &mut client, &mut time);
    assert_eq!(
        server
            .sim()
            .entity(id)
            .unwrap()
            .authoritative_state()
            .get(position),
        3.0
    );
    assert_eq!(client.unconfirmed_commands(), 0);

    let entity = client.sim().entity(id).unwrap();
    assert_eq!(entity.authoritative_state().get(position), 3.0);
    assert_eq!(entity.state().get(position), 3.0);
}

#[test]
fn test_create_records_resolve_parents_out_of_order() {
    let (mut server, mut client, _position) = pair();
    let mut time = 0.0;

    // The child's create record precedes its parent's in the same packet.
    let child = server.sim_mut().create_entity(MOVER_TYPE, None).unwrap();
    let parent = server.sim_mut().create_entity(MOVER_TYPE, None).unwrap();
    server.sim_mut().set_parent(child, Some(parent), true);

    step(&mut server, &mut client, &mut time);

    let child_entity = client.sim().entity(child).expect("child replicated");
    assert_eq!(child_entity.parent(), Some(parent));
    assert!(client.sim().entity(parent).unwrap().has_child(child));
}

#[test]
fn test_unknown_parent_rejects_packet() {
    let (_server, mut client, _position) = pair();

    // Handcrafted sync packet: one create whose parent never arrives.
    let mut packet = PacketWriter::new();
    packet.write_u8(tether::PACKET_SYNC_SIMULATION);
    packet.write_varint(0); // time base
    packet.write_varint(0); // confirmed sequence
    packet.write_varint(1); // creates
    packet.write_varint(0); // updates
    packet.write_varint(0); // deletes
    packet.write_varint(0); // commands
    packet.write_entity_id(6);
    packet.write_varint(MOVER_TYPE as u64);
    packet.write_varint(0); // flags
    packet.write_varint(0); // owner
    packet.write_varint(4); // parent id, never created
    packet.write_f32(0.0); // the single float variable

    assert!(matches!(
        client.handle_packet(packet.bytes()),
        Err(SimError::UnknownParent(4))
    ));
}

#[test]
fn test_reparent_command_relinks_client_tree() {
    let (mut server, mut client, _position) = pair();
    let mut time = 0.0;

    let child = server.sim_mut().create_entity(MOVER_TYPE, None).unwrap();
    let parent = server.sim_mut().create_entity(MOVER_TYPE, None).unwrap();
    step(&mut server, &mut client, &mut time);
    assert_eq!(client.sim().entity(child).unwrap().parent(), None);

    server.sim_mut().set_parent(child, Some(parent), false);
    step(&mut server, &mut client, &mut time);
    assert_eq!(client.sim().entity(child).unwrap().parent(), Some(parent));

    server.sim_mut().set_parent(child, None, false);
    step(&mut server, &mut client, &mut time);
    assert_eq!(client.sim().entity(child).unwrap().parent(), None);
    assert!(!client.sim().entity(parent).unwrap().has_child(child));
}

#[test]
fn test_set_root_entity_updates_both_sides() {
    let (mut server, mut client, _position) = pair();
    let mut time = 0.0;

    let id = server.sim_mut().create_entity(MOVER_TYPE, None).unwrap();
    let mut command = server
        .sim_mut()
        .create_command(SET_ROOT_COMMAND, NO_ENTITY_ID)
        .unwrap();
    command
        .as_any_mut()
        .downcast_mut::<SetRootCommand>()
        .unwrap()
        .entity_id = id;
    server.submit_command(command);
    assert_eq!(server.sim().root(), id);

    step(&mut server, &mut client, &mut time);
    assert_eq!(client.sim().root(), id);
}

#[test]
fn test_server_delete_propagates_shallow() {
    let (mut server, mut client, _position) = pair();
    let mut time = 0.0;

    let parent = server.sim_mut().create_entity(MOVER_TYPE, None).unwrap();
    let child = server.sim_mut().create_entity(MOVER_TYPE, None).unwrap();
    server.sim_mut().set_parent(child, Some(parent), true);
    step(&mut server, &mut client, &mut time);
    assert_eq!(client.sim().entity_count(), 2);

    // Recursive on the server turns into per-entity delete records.
    server.sim_mut().remove_entity(parent, RemoveMode::Recursive);
    step(&mut server, &mut client, &mut time);
    assert_eq!(server.sim().entity_count(), 0);
    assert_eq!(client.sim().entity_count(), 0);
}

#[test]
fn test_late_joiner_receives_existing_entities() {
    let hub = LoopbackHub::new();
    let (table, position) = mover_table();

    let mut server = ServerSimulator::new(SimulatorConfig::default(), Box::new(hub.server_end()));
    register(server.sim_mut(), table.clone(), position);

    let id = server.sim_mut().create_entity(MOVER_TYPE, None).unwrap();
    let mut time = 0.0;
    server.sim_mut().clock_mut().step_game_time(0.05);
    time += 0.05;
    server.update(&Frame::new(time, 0.05));

    // Attach a user after the entity already exists and has clean state.
    let config = SimulatorConfig {
        send_interval: 0.0,
        ..SimulatorConfig::default()
    };
    let mut client =
        ClientSimulator::new(config, Box::new(hub.client_end(7)), User::new(7, "late"));
    register(client.sim_mut(), table, position);
    server.add_user(User::new(7, "late"));

    step(&mut server, &mut client, &mut time);
    assert!(client.sim().entity(id).is_some());
}

#[test]
fn test_unacknowledged_flood_surfaces_desync() {
    let hub = LoopbackHub::new();
    let (table, position) = mover_table();

    // No server on the other end: nothing ever confirms.
    let config = SimulatorConfig {
        send_interval: 0.0,
        ..SimulatorConfig::default()
    };
    let mut client =
        ClientSimulator::new(config, Box::new(hub.client_end(1)), User::new(1, "doomed"));
    register(client.sim_mut(), table, position);

    for _ in 0..=MAX_UNCONFIRMED_COMMANDS {
        let mut command = client.create_command(MOVE_COMMAND, 2).unwrap();
        command
            .as_any_mut()
            .downcast_mut::<MoveCommand>()
            .unwrap()
            .amount = 1.0;
        client.add_command(command);
    }
    assert!(!client.is_desynced());

    client.update(&Frame::new(0.05, 0.05));
    assert!(client.is_desynced());
}
