//! Performance benchmarks for the hot paths of a server tick
//!
//! Each benchmark times a fixed amount of work and asserts a generous upper
//! bound, so a large regression fails the suite without flaking on slow CI.

use glam::Vec3;
use shared::protocol::{decode, encode, ChunkData, EntitySnapshot, Snapshot};
use shared::{
    Chunk, ChunkPosition, ClientCommand, CommandDispatcher, Entity, InputFlags, VoxelPosition,
    VoxelRegistry,
};
use std::time::Instant;

/// Benchmarks run-length encoding and decoding of generated terrain
#[test]
fn benchmark_chunk_encoding() {
    let mut world = server::world::ServerWorld::new(VoxelRegistry::with_default_voxels(), 1);
    let position = ChunkPosition::new(0, 1, 0);
    let data = world.chunk_data(position).unwrap();
    let chunk = world.chunk(position).unwrap().clone();

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let runs = chunk.encode_runs();
        let decoded = Chunk::from_runs(position, data.version, &runs).unwrap();
        assert_eq!(decoded.position(), position);
    }

    let duration = start.elapsed();
    println!(
        "Chunk encoding: {} iterations in {:?} ({:.2} μs/iter, {} runs)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64,
        data.runs.len()
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks encoding a full chunk payload for the wire
#[test]
fn benchmark_chunk_payload_serialization() {
    let mut chunk = Chunk::new(ChunkPosition::default());
    // Checkerboard, the worst case for run-length encoding.
    for x in 0..16 {
        for y in 0..16 {
            for z in 0..16 {
                chunk.set(VoxelPosition::new(x, y, z), ((x + y + z) % 2) as u16);
            }
        }
    }
    let payload = ChunkData {
        position: chunk.position(),
        version: chunk.version(),
        runs: chunk.encode_runs(),
    };

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = encode(&payload).unwrap();
        let _decoded: ChunkData = decode(&bytes).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Chunk payload serialization: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(encode(&payload).unwrap().len() < shared::protocol::MAX_PACKET_SIZE);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks snapshot serialization for a full server
#[test]
fn benchmark_snapshot_serialization() {
    let snapshot = Snapshot {
        tick: 12345,
        entities: (0..255)
            .map(|i| EntitySnapshot {
                client_id: i as u8,
                position: Vec3::new(i as f32, 30.0, -(i as f32)),
                rotation: Vec3::new(0.0, i as f32, 0.0),
            })
            .collect(),
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = encode(&snapshot).unwrap();
        let _decoded: Snapshot = decode(&bytes).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Snapshot serialization: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

#[derive(Default)]
struct Counter {
    inputs: usize,
}

impl Counter {
    fn on_input(&mut self, _: (), _: shared::protocol::PlayerInput) {
        self.inputs += 1;
    }
}

/// Stress tests command dispatch with a flood of input packets
#[test]
fn stress_test_dispatch() {
    let dispatcher = CommandDispatcher::<Counter, ClientCommand>::new().register(Counter::on_input);
    let packets: Vec<Vec<u8>> = (0..1000)
        .map(|i| {
            encode(&shared::protocol::PlayerInput {
                client_id: (i % 16) as u8,
                input: InputFlags::FORWARD,
                rotation_x: 0.0,
                rotation_y: i as f32,
            })
            .unwrap()
        })
        .collect();

    let mut counter = Counter::default();
    let start = Instant::now();

    for _ in 0..100 {
        for packet in &packets {
            dispatcher.dispatch(&mut counter, (), packet).unwrap();
        }
    }

    let duration = start.elapsed();
    println!("Dispatched {} packets in {:?}", counter.inputs, duration);

    assert_eq!(counter.inputs, 100_000);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks moving a full server's worth of entities
#[test]
fn benchmark_entity_movement() {
    let mut entities: Vec<Entity> = (0..255)
        .map(|i| {
            let mut entity = Entity::default();
            entity.respawn(Vec3::new(i as f32, 30.0, 0.0));
            entity.rotation.y = i as f32;
            entity
        })
        .collect();

    let dt = 1.0 / 30.0;
    let steps = 1_000;
    let start = Instant::now();

    for _ in 0..steps {
        for entity in entities.iter_mut() {
            entity.apply_input(InputFlags::FORWARD | InputFlags::LEFT, dt);
        }
    }

    let duration = start.elapsed();
    println!(
        "Entity movement: {} steps of {} entities in {:?}",
        steps,
        entities.len(),
        duration
    );

    assert!(entities.iter().all(|entity| entity.position.is_finite()));
    assert!(duration.as_millis() < 5000);
}
