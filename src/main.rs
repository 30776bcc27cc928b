//! Crystal GA CLI - Run a structure search from JSON configuration.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use crystal_ga::{EvolutionController, SearchConfig, compute::evolution::SearchError};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json> [--seed-only]", args[0]);
        eprintln!();
        eprintln!("Run an evolutionary crystal structure search from JSON configuration.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to search configuration file");
        eprintln!("  --seed-only  Relax the starting population and stop");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let seed_only = args[2..].iter().any(|a| a == "--seed-only");

    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let config: SearchConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    println!("Crystal GA Structure Search");
    println!("===========================");
    let composition: Vec<String> = config
        .composition
        .iter()
        .map(|b| format!("{}{}", b.species, b.count))
        .collect();
    println!("Composition: {}", composition.join(" "));
    println!("Pressure: {} GPa", config.evaluator.pressure_gpa);
    println!(
        "Population: {} (seed {})",
        config.population.size, config.population.seed_size
    );
    println!(
        "Stop after {} generations or {} without improvement",
        config.population.max_generations, config.population.max_stagnation
    );
    if let Some(dir) = &config.output_dir {
        println!("Output: {}", dir.display());
    }
    println!();

    if let Err(e) = run(config, seed_only) {
        eprintln!("Search failed: {}", e);
        std::process::exit(1);
    }
}

fn run(config: SearchConfig, seed_only: bool) -> Result<(), SearchError> {
    let mut controller = EvolutionController::from_config(config)?;
    let start = Instant::now();

    if seed_only {
        println!("Relaxing starting population...");
        controller.seed()?;
        let stats = controller.population().stats();
        println!(
            "Seeded {} candidates: best = {:.4}, mean = {:.4}",
            stats.len, stats.best, stats.mean
        );
        return Ok(());
    }

    println!("Running search...");
    let result = controller.run_with_callback(|progress| {
        if progress.generation == 0 {
            return;
        }
        let elapsed = start.elapsed().as_secs_f32();
        println!(
            "  Generation {}/{}: best = {:.4}, mean = {:.4}, stagnation {}, {:.1}s",
            progress.generation,
            progress.max_generations,
            progress.best_ever,
            progress.mean,
            progress.stagnation,
            elapsed
        );
    })?;

    println!();
    println!("Search finished: {:?}", result.stats.stop_reason);
    println!("  Generations: {}", result.stats.generations);
    println!("  Relaxations: {}", result.stats.relaxations);
    println!("  Killed: {}", result.stats.killed);
    println!();
    println!("Best candidate {} ({})", result.best.id, result.best.description);
    if let Some(energy) = result.best.energy {
        println!(
            "  Enthalpy: {:.6} eV ({:.6} eV/atom)",
            energy,
            energy / result.best.structure.len() as f64
        );
    }
    if let Some(spacegroup) = result.best.spacegroup {
        println!("  Space group: {}", spacegroup);
    }
    let [a, b, c] = result.best.structure.lengths();
    let [alpha, beta, gamma] = result.best.structure.angles();
    println!("  Cell: {:.3} {:.3} {:.3} Å, {:.1} {:.1} {:.1}°", a, b, c, alpha, beta, gamma);
    println!("  Volume: {:.3} Å³", result.best.volume());
    println!("Time: {:.2}s", start.elapsed().as_secs_f32());
    Ok(())
}

fn print_example_config() {
    let config = SearchConfig {
        output_dir: Some(PathBuf::from("run")),
        ..Default::default()
    };
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            println!("Example configuration (config.json):");
            println!("{}", json);
        }
        Err(e) => eprintln!("Error serializing config: {}", e),
    }
}
