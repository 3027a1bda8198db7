//! End-to-end simulation runs exercising the steering stack, the spatial
//! index, and population control together over many ticks.

use murmur_core::{
    Boid, BoidConfig, Bounds, FlightZone, Simulation, SimulationConfig, Tick, Vec3,
};

fn bounds() -> Bounds {
    Bounds::new(0.0, 0.0, 1200.0, 800.0)
}

fn seeded_config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        rng_seed: Some(seed),
        ..SimulationConfig::default()
    }
}

fn positions(sim: &Simulation) -> Vec<Vec3> {
    sim.boids().map(Boid::position).collect()
}

#[test]
fn identical_seeds_replay_identically() {
    let mut a = Simulation::new(seeded_config(42), bounds()).expect("sim a");
    let mut b = Simulation::new(seeded_config(42), bounds()).expect("sim b");
    let zone = FlightZone::new(bounds(), 100.0);

    a.start(60, BoidConfig::default());
    b.start(60, BoidConfig::default());
    for _ in 0..100 {
        a.update(&zone, 700.0, Some(60.0));
        b.update(&zone, 700.0, Some(60.0));
    }

    assert_eq!(a.tick(), b.tick());
    assert_eq!(positions(&a), positions(&b));
}

#[test]
fn different_seeds_diverge() {
    let mut a = Simulation::new(seeded_config(1), bounds()).expect("sim a");
    let mut b = Simulation::new(seeded_config(2), bounds()).expect("sim b");
    let zone = FlightZone::new(bounds(), 100.0);

    a.start(30, BoidConfig::default());
    b.start(30, BoidConfig::default());
    for _ in 0..5 {
        a.update(&zone, 700.0, None);
        b.update(&zone, 700.0, None);
    }
    assert_ne!(positions(&a), positions(&b));
}

#[test]
fn long_run_keeps_speed_and_index_invariants() {
    let mut sim = Simulation::new(seeded_config(7), bounds()).expect("sim");
    let zone = FlightZone::new(bounds(), 100.0);
    sim.start(80, BoidConfig::default());

    let boid_config = sim.config().boid;
    // Boids past the terrain line get a temporary +1 speed allowance.
    let speed_cap = boid_config.max_speed + 1.0;

    for _ in 0..300 {
        sim.update(&zone, 700.0, None);
        assert_eq!(sim.indexed_count(), sim.agent_count());
    }

    assert_eq!(sim.tick(), Tick(300));
    for boid in sim.boids() {
        let speed = boid.velocity().length();
        assert!(
            speed >= boid_config.min_speed - 1e-4 && speed <= speed_cap + 1e-4,
            "boid {} speed {speed} out of range",
            boid.display_id()
        );
        assert!(boid.position().x.is_finite());
        assert!(boid.position().y.is_finite());
        assert!(boid.position().z.is_finite());
    }
}

#[test]
fn flock_drifts_back_toward_the_zone() {
    let mut sim = Simulation::new(seeded_config(11), bounds()).expect("sim");
    let zone = FlightZone::new(bounds(), 100.0);
    sim.start(50, BoidConfig::default());

    let outside_count = |sim: &Simulation| {
        sim.boids()
            .filter(|boid| zone.is_outside(boid.position()))
            .count()
    };

    // The overscan spawn places a share of the flock outside; after a few
    // hundred ticks the return behavior should have herded most back.
    for _ in 0..400 {
        sim.update(&zone, 700.0, None);
    }
    let outside = outside_count(&sim);
    assert!(
        outside * 4 <= sim.agent_count(),
        "{outside} of {} boids still outside",
        sim.agent_count()
    );
}

#[test]
fn population_recovers_after_slow_spell() {
    let mut sim = Simulation::new(seeded_config(13), bounds()).expect("sim");
    let zone = FlightZone::new(bounds(), 100.0);
    sim.start(40, BoidConfig::default());

    // A sustained slow spell sheds boids one per tick.
    for _ in 0..15 {
        sim.update(&zone, 700.0, Some(30.0));
    }
    assert_eq!(sim.agent_count(), 25);

    // Recovery at the target rate regrows to the target, one per tick.
    for _ in 0..20 {
        sim.update(&zone, 700.0, Some(60.0));
    }
    assert_eq!(sim.agent_count(), 40);
    assert_eq!(sim.agent_count(), sim.target_population());
}

#[test]
fn zone_edits_apply_mid_run() {
    let mut sim = Simulation::new(seeded_config(17), bounds()).expect("sim");
    let mut zone = FlightZone::new(bounds(), 100.0);
    sim.start(30, BoidConfig::default());

    for _ in 0..50 {
        sim.update(&zone, 700.0, None);
    }

    // Shrink the zone to a corner region and keep ticking.
    zone.set_polygon(vec![
        Vec3::new(100.0, 100.0, 0.0),
        Vec3::new(400.0, 100.0, 0.0),
        Vec3::new(400.0, 400.0, 0.0),
        Vec3::new(100.0, 400.0, 0.0),
    ]);
    zone.clear_centroids();
    zone.add_centroid(Vec3::new(250.0, 250.0, 50.0));

    for _ in 0..200 {
        sim.update(&zone, 700.0, None);
    }

    // The flock's center of mass should have migrated toward the new region.
    let count = sim.agent_count() as f32;
    let center = sim
        .boids()
        .fold(Vec3::ZERO, |acc, boid| acc + boid.position());
    let center = Vec3::new(center.x / count, center.y / count, 0.0);
    assert!(
        center.x < 600.0 && center.y < 500.0,
        "flock center {center:?} did not migrate"
    );
}

#[test]
fn resize_keeps_the_run_stable() {
    let mut sim = Simulation::new(seeded_config(19), bounds()).expect("sim");
    let mut zone = FlightZone::new(bounds(), 100.0);
    sim.start(30, BoidConfig::default());

    for _ in 0..20 {
        sim.update(&zone, 700.0, None);
    }

    let new_bounds = Bounds::new(0.0, 0.0, 600.0, 400.0);
    zone.resize(new_bounds);
    sim.resize(new_bounds);

    for _ in 0..50 {
        sim.update(&zone, 350.0, Some(60.0));
        assert_eq!(sim.indexed_count(), sim.agent_count());
    }
    assert!(sim.is_running());
}

#[test]
fn stop_and_restart_produces_a_fresh_flock() {
    let mut sim = Simulation::new(seeded_config(23), bounds()).expect("sim");
    let zone = FlightZone::new(bounds(), 100.0);

    sim.start(20, BoidConfig::default());
    for _ in 0..10 {
        sim.update(&zone, 700.0, None);
    }
    let tick_before = sim.tick();
    sim.stop();
    assert_eq!(sim.agent_count(), 0);
    assert_eq!(sim.update(&zone, 700.0, None).tick, Tick(0));

    sim.start(20, BoidConfig::default());
    assert_eq!(sim.agent_count(), 20);
    let events = sim.update(&zone, 700.0, None);
    // The tick counter survives a stop; only the population resets.
    assert_eq!(events.tick, tick_before.next());
}
