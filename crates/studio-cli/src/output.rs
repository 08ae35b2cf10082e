//! Terminal and JSON rendering of command results.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;

use studio_control::{
    ExecutionResult, JobRecord, MachineCatalog, MachineSpec, StudioRecord, StudioState,
};

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn message(text: &str, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({ "message": text }));
    }
    println!("{text}");
    Ok(())
}

pub fn lines(items: &[String], json: bool) -> Result<()> {
    if json {
        return print_json(items);
    }
    for item in items {
        println!("{item}");
    }
    Ok(())
}

pub fn state(state: StudioState, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({ "state": state }));
    }
    println!("{state}");
    Ok(())
}

pub fn studio(record: &StudioRecord, json: bool) -> Result<()> {
    if json {
        return print_json(record);
    }
    println!("{}", studio_line(record));
    if let Some(error) = &record.error_message {
        println!("  error: {error}");
    }
    Ok(())
}

pub fn studios(records: &[StudioRecord], json: bool) -> Result<()> {
    if json {
        return print_json(records);
    }
    if records.is_empty() {
        println!("no studios");
    }
    for record in records {
        println!("{}", studio_line(record));
    }
    Ok(())
}

fn studio_line(record: &StudioRecord) -> String {
    let machine = record
        .machine_class
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string);
    format!(
        "{:<40} {:<10} {:<10} updated {}",
        record.identity.to_string(),
        record.state.to_string(),
        machine,
        record.updated_at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn execution(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    Ok(())
}

pub fn job(record: &JobRecord, json: bool) -> Result<()> {
    if json {
        return print_json(record);
    }
    println!("{}", job_line(record));
    for rank in &record.ranks {
        let machine = rank
            .machine_id
            .map_or_else(|| "-".to_string(), |m| m.to_string());
        let status = format!("{:?}", rank.status).to_lowercase();
        println!("  rank {:<3} {status:<10} {machine}", rank.rank);
    }
    if let Some(error) = &record.error_message {
        println!("  error: {error}");
    }
    Ok(())
}

pub fn jobs(records: &[JobRecord], json: bool) -> Result<()> {
    if json {
        return print_json(records);
    }
    if records.is_empty() {
        println!("no jobs");
    }
    for record in records {
        println!("{}", job_line(record));
    }
    Ok(())
}

fn job_line(record: &JobRecord) -> String {
    format!(
        "{} {:<20} {:<10} {} x {}",
        record.job_id,
        record.name,
        record.status.to_string(),
        record.num_machines,
        record.machine_class
    )
}

pub fn machines(catalog: &MachineCatalog, json: bool) -> Result<()> {
    if json {
        let specs: Vec<&MachineSpec> = catalog.iter().collect();
        return print_json(&specs);
    }
    println!(
        "{:<10} {:>5} {:>8} {:>10} {:>10}",
        "CLASS", "CPUS", "MEM(GB)", "GPUS", "$/HOUR"
    );
    for spec in catalog.iter() {
        let gpus = spec
            .gpu_model
            .as_ref()
            .map_or_else(|| "-".to_string(), |model| format!("{}x{model}", spec.gpus));
        println!(
            "{:<10} {:>5} {:>8} {:>10} {:>10}",
            spec.class.as_str(),
            spec.cpus,
            spec.memory_gb,
            gpus,
            format_cents(spec.cost_cents_per_hour)
        );
    }
    Ok(())
}

fn format_cents(cents: u32) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}
