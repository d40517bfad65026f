//! Performance benchmarks for critical arena systems

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use server::config::{GameConfiguration, ServerConfig};
use server::delta::observer_delta;
use server::external::{MemoryStatisticsSink, ProceduralDistributions};
use server::game::Game;
use server::ids::IdAllocator;
use server::quadtree::{PoolCapacities, QuadTree, QueryBuffer};
use shared::{compress, BotCommand, Color, Rect, Registration, Statistics, Vec2, FIELD_SIZE};
use std::sync::Arc;
use std::time::Instant;

fn random_points(count: usize, seed: u64) -> Vec<Vec2> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| Vec2::new(rng.gen_range(0.0..FIELD_SIZE), rng.gen_range(0.0..FIELD_SIZE)))
        .collect()
}

fn busy_game(bots: u32) -> Game {
    let config = ServerConfig {
        seed: Some(3),
        game: GameConfiguration::preset("feast").unwrap(),
        ..Default::default()
    };
    let ids = Arc::new(IdAllocator::new());
    let mut game = Game::new(
        &config,
        Arc::clone(&ids),
        Arc::new(ProceduralDistributions),
        Arc::new(MemoryStatisticsSink::default()),
    )
    .unwrap();
    game.config.max_bots = bots as usize;
    for i in 0..bots {
        let registration = Registration {
            name: format!("bot{}", i % 4),
            color: Color::new(10, 20, 30),
            image: String::new(),
        };
        game.add_bot(ids.next_bot(), u64::from(i) + 1, &registration, Statistics::default(), false)
            .unwrap();
    }
    game
}

/// Benchmarks rebuilding the food index from scratch
#[test]
fn benchmark_index_rebuild() {
    let points = random_points(2_000, 1);
    let mut tree = QuadTree::new(FIELD_SIZE, PoolCapacities::default());

    let iterations = 200;
    let start = Instant::now();
    for _ in 0..iterations {
        tree.reset();
        for (i, p) in points.iter().enumerate() {
            tree.insert(*p, 10.0, i as u64).unwrap();
        }
    }
    let duration = start.elapsed();
    println!(
        "Index rebuild (2000 items): {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(tree.len(), points.len());
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks window queries the size of a bot's view
#[test]
fn benchmark_index_queries() {
    let points = random_points(2_000, 2);
    let mut tree = QuadTree::new(FIELD_SIZE, PoolCapacities::default());
    for (i, p) in points.iter().enumerate() {
        tree.insert(*p, 10.0, i as u64).unwrap();
    }
    let centres = random_points(1_000, 3);
    let mut out = QueryBuffer::new(4096);

    let iterations = 10;
    let start = Instant::now();
    let mut found = 0;
    for _ in 0..iterations {
        for c in &centres {
            out.clear();
            tree.query(&Rect::around(*c, 200.0), &mut out);
            found += out.len();
        }
    }
    let duration = start.elapsed();
    println!(
        "Index queries: {} in {:?} ({:.2} μs/query)",
        iterations * centres.len(),
        duration,
        duration.as_micros() as f64 / (iterations * centres.len()) as f64
    );

    assert!(found > 0);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks full simulation ticks with a crowded arena
#[test]
fn benchmark_game_step() {
    let mut game = busy_game(50);
    let mut rng = StdRng::seed_from_u64(4);

    let iterations = 300;
    let start = Instant::now();
    for _ in 0..iterations {
        let ids: Vec<u64> = game.world.bots.keys().copied().collect();
        for id in ids {
            game.set_command(
                id,
                BotCommand {
                    target: Vec2::new(rng.gen_range(0.0..FIELD_SIZE), rng.gen_range(0.0..FIELD_SIZE)),
                    ..Default::default()
                },
            );
        }
        game.step(0.03);
        game.clear_transient();
    }
    let duration = start.elapsed();
    println!(
        "Game step (50 bots, {} food): {} ticks in {:?} ({:.2} ms/tick)",
        game.world.foods.len(),
        iterations,
        duration,
        duration.as_secs_f64() * 1000.0 / iterations as f64
    );

    // A 30 ms tick budget with plenty of headroom.
    assert!(duration.as_secs_f64() / (iterations as f64) < 0.03);
}

/// Benchmarks building and compressing observer deltas
#[test]
fn benchmark_observer_delta() {
    let mut game = busy_game(30);
    game.step(0.03);

    let iterations = 100;
    let start = Instant::now();
    let mut full_size = 0;
    for _ in 0..iterations {
        let bytes = compress(&observer_delta(&game, true)).unwrap();
        full_size = bytes.len();
    }
    let duration = start.elapsed();
    println!(
        "Full observer snapshot: {} bytes compressed, {:?} per snapshot",
        full_size,
        duration / iterations
    );

    game.clear_transient();
    game.step(0.03);
    let incremental = compress(&observer_delta(&game, false)).unwrap();
    println!("Incremental delta: {} bytes", incremental.len());

    assert!(incremental.len() < full_size);
    assert!(duration.as_millis() < 2000);
}
