use std::io::Read;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytesize::ByteSize;
use gridstore::{Bucket, GridStorage, Metadata};
use sketches_ddsketch::DDSketch;
use tracing::{debug, info};

use crate::workload::{Action, Payload, Workload};

pub fn perform_stresstest<B: Bucket>(
    storage: &GridStorage<B>,
    workloads: Vec<Workload>,
    duration: Duration,
) -> Result<()> {
    let deadline = Instant::now() + duration;
    info!(workloads = workloads.len(), ?duration, "Running workloads");

    // run the workloads concurrently, each with its own pool of workers
    let finished: Vec<(Workload, DDSketch)> = std::thread::scope(|scope| {
        let tasks: Vec<_> = workloads
            .into_iter()
            .map(|workload| {
                scope.spawn(move || -> Result<(Workload, DDSketch)> {
                    let concurrency = workload.concurrency;
                    let workload = Mutex::new(workload);
                    let task_durations = Mutex::new(DDSketch::default());

                    std::thread::scope(|workers| -> Result<()> {
                        let handles: Vec<_> = (0..concurrency)
                            .map(|_| {
                                workers.spawn(|| -> Result<()> {
                                    while Instant::now() < deadline {
                                        let task_start = Instant::now();
                                        let action = lock(&workload).next_action();
                                        perform_action(storage, &workload, action)?;
                                        lock(&task_durations)
                                            .add(task_start.elapsed().as_secs_f64());
                                    }
                                    Ok(())
                                })
                            })
                            .collect();

                        for handle in handles {
                            join(handle)??;
                        }
                        Ok(())
                    })?;

                    let workload = workload.into_inner().unwrap_or_else(|e| e.into_inner());
                    let task_durations = task_durations
                        .into_inner()
                        .unwrap_or_else(|e| e.into_inner());
                    Ok((workload, task_durations))
                })
            })
            .collect();

        tasks
            .into_iter()
            .map(|task| join(task)?)
            .collect::<Result<Vec<_>>>()
    })?;

    for (i, (workload, task_durations)) in finished.iter().enumerate() {
        report(i, workload, task_durations, duration);
    }

    // leave the bucket as we found it
    let leftovers: Vec<String> = finished
        .iter()
        .flat_map(|(workload, _)| workload.existing_ids())
        .collect();
    info!(blobs = leftovers.len(), "Removing leftover blobs");
    storage.multi_delete(&leftovers)?;

    Ok(())
}

fn perform_action<B: Bucket>(
    storage: &GridStorage<B>,
    workload: &Mutex<Workload>,
    action: Action,
) -> Result<()> {
    match action {
        Action::Upload(internal_id, filename, payload) => {
            let mut metadata = Metadata::new();
            metadata.insert("filename".into(), filename.clone().into());
            let external_id = storage.upload(payload, &filename, metadata)?;
            lock(workload).push_file(internal_id, external_id);
        }
        Action::Read(internal_id, external_id, payload) => {
            let contents = storage.read(&external_id)?;
            verify(&external_id, &contents, payload)?;
            lock(workload).push_file(internal_id, external_id);
        }
        Action::Open(internal_id, external_id, payload) => {
            let mut stream = storage.open(&external_id)?;
            let mut contents = Vec::with_capacity(stream.size() as usize);
            stream.read_to_end(&mut contents)?;
            verify(&external_id, &contents, payload)?;
            lock(workload).push_file(internal_id, external_id);
        }
        Action::Delete(external_id) => {
            storage.delete(&external_id)?;
            debug!(id = %external_id, "Deleted blob");
        }
    }
    Ok(())
}

fn verify(external_id: &str, contents: &[u8], mut payload: Payload) -> Result<()> {
    let mut expected_payload = Vec::new();
    payload.read_to_end(&mut expected_payload)?;

    if contents != expected_payload {
        bail!("readback mismatch for {external_id}");
    }
    Ok(())
}

fn report(i: usize, workload: &Workload, task_durations: &DDSketch, duration: Duration) {
    let ops = task_durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!(
        "# Workload {i} `{}` (concurrency: {})",
        workload.name, workload.concurrency
    );
    println!(
        "  file sizes {}-{}",
        ByteSize::b(workload.p50_size),
        ByteSize::b(workload.p99_size)
    );
    println!("=> {ops} operations, {ops_ps:.2} ops/s");

    if ops == 0 {
        return;
    }
    let quantile = |q| {
        let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs)
    };
    let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
    let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn join<T>(handle: std::thread::ScopedJoinHandle<'_, T>) -> Result<T> {
    match handle.join() {
        Ok(value) => Ok(value),
        Err(_) => bail!("stress test worker panicked"),
    }
}
