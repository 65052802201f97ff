//! Loopback exercise of the replication loop: one authoritative server,
//! a handful of predicted clients, no sockets.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use glam::Vec3;

use tether::{
    BasicEntityFactory, ClientSimulator, Command, CommandFlags, CommandTypeId, EntityBehavior,
    EntityFlags, EntityId, EntityState, EntityTypeId, Frame, LoopbackHub, PacketReader,
    PacketWriter, PooledFactory, PredictedMeta, ServerSimulator, Simulator, SimulatorConfig,
    TableBuilder, TickEffects, Ticker, User, Var, VariableFlags, VariableTable, WireError,
    make_type_id,
};

const ORB_TYPE: EntityTypeId = 1;
const STEER_COMMAND: CommandTypeId = make_type_id(1, 0);

#[derive(Parser)]
#[command(name = "tether-demo")]
#[command(about = "Replicated simulation demo over an in-process loopback")]
struct Args {
    #[arg(short, long, default_value_t = 2)]
    clients: u32,

    #[arg(short, long, default_value_t = 300)]
    ticks: u32,

    #[arg(long, default_value_t = 60)]
    tick_rate: u32,
}

#[derive(Clone, Copy)]
struct OrbVars {
    position: Var<Vec3>,
    velocity: Var<Vec3>,
    tint: Var<u32>,
}

fn orb_table() -> (Arc<VariableTable>, OrbVars) {
    let mut builder = TableBuilder::new();
    let position = builder.vec3(
        1,
        VariableFlags::PREDICTED | VariableFlags::INTERPOLATED | VariableFlags::UPDATED_FREQUENTLY,
        0,
    );
    let velocity = builder.vec3(2, VariableFlags::PREDICTED, 0);
    let tint = builder.color(3, VariableFlags::INTERPOLATED, 10);
    let vars = OrbVars {
        position,
        velocity,
        tint,
    };
    (builder.build().unwrap(), vars)
}

#[derive(Debug, Default)]
struct SteerCommand {
    meta: PredictedMeta,
    target: EntityId,
    direction: Vec3,
}

impl Command for SteerCommand {
    fn type_id(&self) -> CommandTypeId {
        STEER_COMMAND
    }

    fn target(&self) -> EntityId {
        self.target
    }

    fn set_target(&mut self, target: EntityId) {
        self.target = target;
    }

    fn write(&self, writer: &mut PacketWriter, _time_base: f64) {
        writer.write_entity_id(self.target);
        writer.write_f32(self.direction.x);
        writer.write_f32(self.direction.y);
        writer.write_f32(self.direction.z);
    }

    fn read(&mut self, reader: &mut PacketReader<'_>, _time_base: f64) -> Result<(), WireError> {
        self.target = reader.read_entity_id()?;
        self.direction = Vec3::new(
            reader.read_f32()?,
            reader.read_f32()?,
            reader.read_f32()?,
        );
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

struct OrbBehavior {
    vars: OrbVars,
}

impl EntityBehavior for OrbBehavior {
    fn update(&mut self, state: &mut EntityState, frame: &Frame, _effects: &mut TickEffects) {
        let velocity = state.get(self.vars.velocity);
        if velocity != Vec3::ZERO {
            let position = state.get(self.vars.position);
            state.set(
                self.vars.position,
                position + velocity * frame.time_delta as f32,
            );
        }
    }

    fn execute_command(
        &mut self,
        state: &mut EntityState,
        command: &dyn Command,
        _effects: &mut TickEffects,
    ) {
        if let Some(steer) = command.as_any().downcast_ref::<SteerCommand>() {
            let position = state.get(self.vars.position);
            state.set(self.vars.position, position + steer.direction);
        }
    }
}

fn register(sim: &mut Simulator, table: Arc<VariableTable>, vars: OrbVars) {
    sim.register_entity_type(
        ORB_TYPE,
        Box::new(BasicEntityFactory::new(
            EntityFlags::PREDICTED | EntityFlags::INTERPOLATED | EntityFlags::UPDATED_FREQUENTLY,
            table,
            move || Box::new(OrbBehavior { vars }),
        )),
    );
    sim.register_command_factory(Box::new(PooledFactory::<SteerCommand>::new(
        STEER_COMMAND,
        CommandFlags::empty(),
    )));
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let hub = LoopbackHub::new();
    let (table, vars) = orb_table();

    let mut server = ServerSimulator::new(SimulatorConfig::default(), Box::new(hub.server_end()));
    register(server.sim_mut(), table.clone(), vars);

    let mut clients = Vec::new();
    let mut orbs = Vec::new();
    for index in 0..args.clients {
        let wire_id = index + 1;
        let user = User::new(wire_id, format!("session-{wire_id}"));
        server.add_user(user.clone());

        // The loop runs far faster than wall time, so let every tick flush
        // instead of pacing against the real clock.
        let client_config = SimulatorConfig {
            send_interval: 0.0,
            ..SimulatorConfig::default()
        };
        let mut client = ClientSimulator::new(
            client_config,
            Box::new(hub.client_end(wire_id)),
            user,
        );
        register(client.sim_mut(), table.clone(), vars);
        clients.push(client);

        let orb = server
            .sim_mut()
            .create_entity(ORB_TYPE, Some(wire_id))
            .expect("orb type registered");
        server
            .sim_mut()
            .entity_mut(orb)
            .unwrap()
            .authoritative_state_mut()
            .set(vars.tint, 0xff00_00ff | (wire_id << 8));
        orbs.push(orb);
        log::info!("user {wire_id} attached, steering orb {orb}");
    }

    let mut ticker = Ticker::new(args.tick_rate);
    let dt = ticker.interval();

    for tick in 0..args.ticks {
        ticker.advance(dt);
        while let Some(frame) = ticker.next_frame(server.sim_mut().clock_mut()) {
            for (index, client) in clients.iter_mut().enumerate() {
                // Every client keeps nudging its own orb eastward.
                if tick % 3 == 0 {
                    if let Some(mut command) = client.create_command(STEER_COMMAND, orbs[index]) {
                        command
                            .as_any_mut()
                            .downcast_mut::<SteerCommand>()
                            .unwrap()
                            .direction = Vec3::new(0.1, 0.0, 0.0);
                        client.add_command(command);
                    }
                }
                client.update(&frame);
            }
            server.update(&frame);
        }
    }

    for orb in &orbs {
        let server_position = server
            .sim()
            .entity(*orb)
            .unwrap()
            .authoritative_state()
            .get(vars.position);
        log::info!("orb {orb}: server position {server_position}");
        for (client_index, client) in clients.iter().enumerate() {
            if let Some(entity) = client.sim().entity(*orb) {
                log::info!(
                    "  client {}: view {} confirmed {}",
                    client_index + 1,
                    entity.state().get(vars.position),
                    entity.authoritative_state().get(vars.position),
                );
            }
        }
    }

    let stats = server.stats();
    log::info!(
        "server sent {} packets / {} bytes ({} creates, {} updates, {} commands in)",
        stats.packets_sent,
        stats.bytes_sent,
        stats.entity_creates_sent,
        stats.entity_updates_sent,
        stats.commands_received,
    );
    for (index, client) in clients.iter().enumerate() {
        let stats = client.stats();
        log::info!(
            "client {} sent {} packets / {} bytes, received {} packets, desynced: {}",
            index + 1,
            stats.packets_sent,
            stats.bytes_sent,
            stats.packets_received,
            client.is_desynced(),
        );
    }

    Ok(())
}
